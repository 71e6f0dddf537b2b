use octavr_core::core::arch;
use octavr_core::core::program::Leave;
use octavr_core::cpu::flags::FLAG_Z;

mod common;
use common::*;

#[test]
fn rjmp_self_loop_is_the_clean_exit() {
    let mut sim = sim_with_words(&[rjmp(-1)]);
    let leave = sim.do_step().unwrap_err();
    match leave {
        Leave::Exit { value: 0, reason } => {
            assert!(reason.contains("infinite loop detected"), "{reason}")
        }
        other => panic!("expected clean exit, got {other:?}"),
    }
    // The loop instruction itself was charged.
    assert_eq!(sim.program.n_cycles, 2);
    assert_eq!(sim.program.n_insns, 1);
}

#[test]
fn instruction_budget_times_out() {
    let mut sim = sim_with_words(&[nop(); 8]);
    // Endless NOPs would run off the program; bound the run instead.
    sim.program.max_insns = 5;
    sim.opts.graph = false;
    let leave = sim.run();
    assert_eq!(leave, Leave::Timeout);
    assert_eq!(sim.program.n_insns, 5);
}

#[test]
fn taken_branch_costs_an_extra_cycle() {
    // BREQ .+1 with Z clear (not taken), then with Z set (taken).
    let mut sim = sim_with_words(&[brbs(1, 1), nop(), nop(), rjmp(-1)]);
    sim.do_step().unwrap();
    assert_eq!(sim.pc, 1, "not taken");
    assert_eq!(sim.program.n_cycles, 1);

    let mut sim = sim_with_words(&[brbs(1, 1), nop(), nop(), rjmp(-1)]);
    sim.ram[SREG] = FLAG_Z;
    sim.do_step().unwrap();
    assert_eq!(sim.pc, 2, "taken skips one word");
    assert_eq!(sim.program.n_cycles, 2, "taken charges one extra cycle");
}

#[test]
fn brbc_mirrors_brbs() {
    let mut sim = sim_with_words(&[brbc(1, 2), nop(), nop(), rjmp(-1)]);
    sim.ram[SREG] = FLAG_Z;
    sim.do_step().unwrap();
    assert_eq!(sim.pc, 1, "BRNE with Z set falls through");

    let mut sim = sim_with_words(&[brbc(1, 2), nop(), nop(), rjmp(-1)]);
    sim.do_step().unwrap();
    assert_eq!(sim.pc, 3);
}

#[test]
fn call_ret_restore_sp_and_pc() {
    // CALL 0x100; (idle); at word 0x100: RET.
    let mut words = vec![0u16; 0x101];
    let c = call(0x100);
    words[0] = c[0];
    words[1] = c[1];
    words[2] = rjmp(-1);
    words[0x100] = ret();

    let mut sim = sim_with_words(&words);
    init_stack(&mut sim, 0x10FF);

    sim.do_step().unwrap(); // CALL
    assert_eq!(sim.pc, 0x100);
    assert_eq!(
        u16::from(sim.ram[SPL]) | (u16::from(sim.ram[SPH]) << 8),
        0x10FD,
        "two return-address bytes pushed"
    );
    assert_eq!(sim.program.n_cycles, 4);

    sim.do_step().unwrap(); // RET
    assert_eq!(sim.pc, 2, "back to after the CALL");
    assert_eq!(
        u16::from(sim.ram[SPL]) | (u16::from(sim.ram[SPH]) << 8),
        0x10FF,
        "SP restored"
    );
    assert_eq!(sim.program.n_cycles, 8, "CALL(4) + RET(4)");
}

#[test]
fn call_ret_on_22_bit_parts_push_three_bytes_and_cost_more() {
    let mut words = vec![0u16; 0x101];
    let c = call(0x100);
    words[0] = c[0];
    words[1] = c[1];
    words[2] = rjmp(-1);
    words[0x100] = ret();

    let avr6 = arch::find("avr6").unwrap();
    let mut sim = sim_with_words_on(avr6, quiet_options(), &words);
    init_stack(&mut sim, 0x10FF);

    sim.do_step().unwrap();
    assert_eq!(
        u16::from(sim.ram[SPL]) | (u16::from(sim.ram[SPH]) << 8),
        0x10FC,
        "three return-address bytes pushed"
    );
    sim.do_step().unwrap();
    assert_eq!(sim.pc, 2);
    assert_eq!(
        u16::from(sim.ram[SPL]) | (u16::from(sim.ram[SPH]) << 8),
        0x10FF
    );
    assert_eq!(sim.program.n_cycles, 10, "CALL(4+1) + RET(4+1)");
}

#[test]
fn rcall_is_relative() {
    let mut sim = sim_with_words(&[rcall(2), rjmp(-1), nop(), ret()]);
    init_stack(&mut sim, 0x10FF);
    sim.do_step().unwrap();
    assert_eq!(sim.pc, 3);
    assert_eq!(sim.program.n_cycles, 3);
}

#[test]
fn ijmp_jumps_through_z() {
    // Z = 0x0003 (word address), IJMP.
    let mut sim = sim_with_words(&[ldi(30, 3), ldi(31, 0), 0x9409, rjmp(-1)]);
    step_n(&mut sim, 3);
    assert_eq!(sim.pc, 3);
}

#[test]
fn cpse_skips_one_or_two_words() {
    // Equal registers skip the next (1-word) instruction.
    let mut sim = sim_with_words(&[cpse(1, 2), ldi(16, 1), ldi(17, 2), rjmp(-1)]);
    sim.ram[1] = 7;
    sim.ram[2] = 7;
    sim.do_step().unwrap();
    assert_eq!(sim.pc, 2, "skipped one word");
    assert_eq!(sim.program.n_cycles, 2, "skip charges the skipped word");

    // The next instruction is a 2-word CALL: skip both words.
    let c = call(0x10);
    let mut words = vec![cpse(1, 2), c[0], c[1], ldi(17, 2), rjmp(-1)];
    words.resize(0x11, nop());
    words[0x10] = ret();
    let mut sim = sim_with_words(&words);
    sim.ram[1] = 7;
    sim.ram[2] = 7;
    sim.do_step().unwrap();
    assert_eq!(sim.pc, 3, "skipped two words");
    assert_eq!(sim.program.n_cycles, 3);

    // Unequal registers do not skip.
    let mut sim = sim_with_words(&[cpse(1, 2), ldi(16, 1), rjmp(-1)]);
    sim.ram[1] = 1;
    sim.ram[2] = 2;
    sim.do_step().unwrap();
    assert_eq!(sim.pc, 1);
    assert_eq!(sim.program.n_cycles, 1);
}

#[test]
fn sbrc_sbrs_test_register_bits() {
    let mut sim = sim_with_words(&[sbrc(10, 3), ldi(16, 1), rjmp(-1)]);
    sim.ram[10] = 0x00; // bit 3 clear -> skip
    sim.do_step().unwrap();
    assert_eq!(sim.pc, 2);

    let mut sim = sim_with_words(&[sbrs(10, 3), ldi(16, 1), rjmp(-1)]);
    sim.ram[10] = 0x08; // bit 3 set -> skip
    sim.do_step().unwrap();
    assert_eq!(sim.pc, 2);

    let mut sim = sim_with_words(&[sbrs(10, 3), ldi(16, 1), rjmp(-1)]);
    sim.ram[10] = 0x00;
    sim.do_step().unwrap();
    assert_eq!(sim.pc, 1, "condition false executes the next insn");
}

#[test]
fn pc_leaving_the_program_aborts() {
    let mut sim = sim_with_words(&[nop()]);
    sim.do_step().unwrap();
    let leave = sim.do_step().unwrap_err();
    match leave {
        Leave::Aborted(reason) => assert!(reason.contains("out of program space"), "{reason}"),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn illegal_opcode_aborts_with_the_word() {
    let mut sim = sim_with_words(&[0xFF77]);
    let leave = sim.do_step().unwrap_err();
    match leave {
        Leave::Aborted(reason) => assert!(reason.contains("0xff77"), "{reason}"),
        other => panic!("unexpected {other:?}"),
    }
}
