use octavr_core::core::arch;
use octavr_core::core::program::Leave;
use octavr_core::core::simulator::Simulator;

mod common;
use common::*;

/// Like `sim_with_words`, but registers function symbols and enables
/// the call graph before the symbol table is finalized.
fn graph_sim(words: &[u16], symbols: &[(&str, u32)], dot: Option<&str>) -> Simulator {
    let mut opts = quiet_options();
    opts.graph = true;
    opts.graph_filename = Some(dot.unwrap_or("-").to_string());
    let mut sim = Simulator::new(*arch::default_arch(), opts);
    for (i, w) in words.iter().enumerate() {
        sim.flash[2 * i] = *w as u8;
        sim.flash[2 * i + 1] = (*w >> 8) as u8;
    }
    sim.program.size = 2 * words.len() as u32;
    sim.program.code_start = 0;
    sim.program.code_end = 2 * words.len() as u32 - 1;
    sim.program.short_name = "graph-test".into();
    sim.decode_flash();
    for (name, pc) in symbols {
        sim.graph.elf_symbol(name, *pc, true);
    }
    sim.graph.finish_symbol_table(0);
    sim.init_logging();
    sim
}

fn straight_line_program() -> (Vec<u16>, Vec<(&'static str, u32)>) {
    // main: rcall f; idle
    // f:    rcall g; ret
    // g:    nop; ret
    let words = vec![
        rcall(1), // 0: main -> f
        rjmp(-1), // 1
        rcall(1), // 2: f -> g
        ret(),    // 3
        nop(),    // 4: g
        ret(),    // 5
    ];
    let symbols = vec![("main", 0), ("f", 2), ("g", 4)];
    (words, symbols)
}

fn edge_by_names<'a>(
    sim: &'a Simulator,
    from: &str,
    to: &str,
) -> Option<&'a octavr_core::trace::graph::Edge> {
    sim.graph.edges.iter().find(|e| {
        sim.graph.symbols[e.from].name == from && sim.graph.symbols[e.to].name == to
    })
}

#[test]
fn straight_line_calls_build_the_expected_edges() {
    let (words, symbols) = straight_line_program();
    let dot = std::env::temp_dir().join(format!("octavr-graph-{}.dot", std::process::id()));
    let mut sim = graph_sim(&words, &symbols, dot.to_str());
    init_stack(&mut sim, 0x10FF);

    let leave = sim.run();
    assert!(matches!(leave, Leave::Exit { value: 0, .. }));

    let entry_main = edge_by_names(&sim, "Entry Point", "main").expect("entry edge");
    assert_eq!(entry_main.n, 0, "the entry edge is synthetic");

    let main_f = edge_by_names(&sim, "main", "f").expect("main->f");
    assert_eq!(main_f.n, 1);
    assert_eq!(main_f.n_call, 1);
    assert_eq!(main_f.n_tail, 0);

    let f_g = edge_by_names(&sim, "f", "g").expect("f->g");
    assert_eq!(f_g.n, 1);
    assert_eq!(f_g.n_call, 1);

    assert!(edge_by_names(&sim, "main", "g").is_none());

    std::fs::remove_file(&dot).ok();
}

#[test]
fn cycles_are_attributed_to_the_innermost_accountable_frame() {
    let (words, symbols) = straight_line_program();
    let dot = std::env::temp_dir().join(format!("octavr-cycles-{}.dot", std::process::id()));
    let mut sim = graph_sim(&words, &symbols, dot.to_str());
    init_stack(&mut sim, 0x10FF);
    sim.run();

    // rcall(3) + rcall(3) + nop(1) + ret(4) + ret(4) + rjmp(2)
    assert_eq!(sim.program.n_cycles, 17);
    assert_eq!(sim.graph.n_cycles, 17, "every cycle lands on a node");

    let own = |name: &str| {
        sim.graph
            .symbols
            .iter()
            .find(|s| s.name == name)
            .map(|s| (s.cycles_own, s.cycles_childs))
            .unwrap()
    };
    let (main_own, main_childs) = own("main");
    let (f_own, f_childs) = own("f");
    let (g_own, g_childs) = own("g");

    assert_eq!(g_own, 5, "nop + ret inside g");
    assert_eq!(f_own, 7, "rcall g, the returning ret and g's pop-back");
    assert_eq!(main_own + f_own + g_own, 17);
    assert_eq!(g_childs, 0);
    assert_eq!(f_childs, g_own);
    assert_eq!(main_childs, f_own + g_own);
    assert!(main_own > 0);

    std::fs::remove_file(&dot).ok();
}

#[test]
fn dot_output_describes_the_run() {
    let (words, symbols) = straight_line_program();
    let dot = std::env::temp_dir().join(format!("octavr-dot-{}.dot", std::process::id()));
    let mut sim = graph_sim(&words, &symbols, dot.to_str());
    init_stack(&mut sim, 0x10FF);
    sim.run();

    let text = std::fs::read_to_string(&dot).expect("dot file written");
    assert!(text.starts_with("digraph \"graph-test\""));
    assert!(text.contains("Entry Point"));
    assert!(text.contains("Program Stop"));
    assert!(text.contains("main"));
    assert!(text.contains("doubleoctagon"), "entry/stop node shape");
    assert!(text.contains("box3d"), "base node shape");
    assert!(text.contains("reason: exit 0"));
    assert!(text.ends_with("}\n"));

    std::fs::remove_file(&dot).ok();
}

#[test]
fn push_push_ret_is_an_indirect_jump_not_a_return() {
    // fn at 2 computes a jump target (word 6) and "returns" into it.
    let words = vec![
        rcall(1),   // 0: -> fn
        rjmp(-1),   // 1
        ldi(16, 7), // 2: fn: target low
        ldi(17, 0), //    target high
        push(16),   // low byte first, like avr-gcc emits it
        push(17),
        ret(),      // pops the cooked-up address
        rjmp(-1),   // 7: the jump target
    ];

    let mut sim = graph_sim(&words, &[("main", 0), ("fn", 2)], Some("-"));
    init_stack(&mut sim, 0x10FF);

    step_n(&mut sim, 6); // up to and including the RET
    assert_eq!(sim.pc, 7, "RET jumped to the pushed address");
    assert_eq!(
        sim.graph.call_depth(),
        1,
        "push/push/ret must not unwind the shadow stack"
    );
}

#[test]
fn longjmp_unwinds_to_the_setjmp_frame_with_a_back_edge() {
    // main calls setjmp (returns), then f -> g -> longjmp; longjmp
    // restores main's SP and jumps back into main.
    let words = vec![
        rcall(2),    // 0: main: call setjmp (@3)
        rcall(2),    // 1: call f (@4)
        rjmp(-1),    // 2: longjmp target, ends the run
        ret(),       // 3: setjmp
        rcall(1),    // 4: f: call g (@6)
        rjmp(-1),    // 5
        rcall(1),    // 6: g: call longjmp (@8)
        rjmp(-1),    // 7
        ldi(16, 0xFF), // 8: longjmp: restore SP
        out(0x5D, 16),
        ldi(16, 0x10),
        out(0x5E, 16),
        ldi(30, 2), // Z = setjmp return point (word 2)
        ldi(31, 0),
        0x9409,     // IJMP
    ];
    let symbols = vec![
        ("main", 0),
        ("setjmp", 3),
        ("f", 4),
        ("g", 6),
        ("longjmp", 8),
    ];
    let dot = std::env::temp_dir().join(format!("octavr-longjmp-{}.dot", std::process::id()));
    let mut sim = graph_sim(&words, &symbols, dot.to_str());
    init_stack(&mut sim, 0x10FF);

    let leave = sim.run();
    assert!(matches!(leave, Leave::Exit { value: 0, .. }));

    // The frames between longjmp and main were popped again.
    assert_eq!(sim.graph.call_depth(), 0);

    let lj_main = edge_by_names(&sim, "longjmp", "main").expect("longjmp back edge");
    assert_ne!(
        lj_main.mark & octavr_core::trace::graph::EM_BACK,
        0,
        "longjmp edge is a back edge"
    );
    // The ordinary call chain is still present.
    assert!(edge_by_names(&sim, "main", "f").is_some());
    assert!(edge_by_names(&sim, "f", "g").is_some());
    assert!(edge_by_names(&sim, "g", "longjmp").is_some());

    std::fs::remove_file(&dot).ok();
}

#[test]
fn timeout_leaves_a_connected_graph() {
    let (words, symbols) = straight_line_program();
    let dot = std::env::temp_dir().join(format!("octavr-timeout-{}.dot", std::process::id()));
    let mut sim = graph_sim(&words, &symbols, dot.to_str());
    init_stack(&mut sim, 0x10FF);
    sim.program.max_insns = 2;

    let leave = sim.run();
    assert_eq!(leave, Leave::Timeout);
    assert_eq!(sim.program.n_insns, 2);

    let text = std::fs::read_to_string(&dot).expect("dot file written");
    assert!(text.contains("reason: timeout"));

    std::fs::remove_file(&dot).ok();
}
