//! Dynamic call-graph accounting.
//!
//! A shadow call stack mirrors the guest's calls, tail calls, returns
//! and longjmp unwinds.  Cycles accumulate between stack changes and
//! are attributed to the innermost accountable frame; ancestors up to
//! the base collect them as child cycles.  On termination the graph is
//! written as a DOT digraph.
//!
//! Symbols, edges and frames live in arenas and refer to each other by
//! index; edge lookup goes through fixed prime-sized hash buckets keyed
//! on the id pair.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Write};

use crate::core::program::Leave;
use crate::core::simulator::Simulator;
use crate::cpu::{Decoded, Op};
use crate::trace::tracef;

pub type SymbolId = usize;
pub type EdgeId = usize;

/// Edge hash buckets; lookup keys on `(from - to) mod EPRIM`.
const EPRIM: usize = 43;

// Edge mark bits.
pub const EM_TRACE: u32 = 1 << 0;
pub const EM_SHOW: u32 = 1 << 1;
pub const EM_ACCOUNT: u32 = 1 << 2;
pub const EM_MAIN_RET: u32 = 1 << 3;
pub const EM_BACK: u32 = 1 << 4;
pub const EM_DOT_DONE: u32 = 1 << 5;
pub const EM_DOTTED: u32 = 1 << 6;
pub const EM_DASHED: u32 = 1 << 7;

/// What kind of node a symbol is; the "bold" kinds up to `Longjmp`
/// highlight the trace path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymKind {
    Main,
    Exit,
    UnderscoreExit,
    Abort,
    Longjmp,
    Entry,
    Terminate,
    Prologue,
    Epilogue,
    Setjmp,
    Addr,
    None,
}

pub struct GraphSymbol {
    pub name: String,
    /// 1-based display id used in the DOT output.
    pub id: usize,
    /// Word address in flash.
    pub pc: u32,
    pub kind: SymKind,
    pub is_func: bool,
    pub dot_done: bool,
    pub is_base: bool,
    pub is_reserved: bool,
    pub is_reserved_caller: bool,
    pub is_leaf: bool,
    pub is_sub: bool,
    pub is_hidden: bool,
    pub is_skip: bool,
    pub cycles_own: u64,
    pub cycles_childs: u64,
    pub cycles_done: bool,
    pub cycles_account: bool,
}

pub struct Edge {
    pub id: usize,
    pub from: SymbolId,
    pub to: SymbolId,
    /// How often the edge was traversed.
    pub n: u32,
    pub n_tail: u32,
    pub n_call: u32,
    pub n_cycles: u64,
    pub n_sub: u32,
    pub n_leaf: u32,
    pub mark: u32,
    pub s_tail: Option<String>,
    pub s_label: Option<String>,
}

/// One shadow-stack frame: the function we are in, the edge that got
/// us here, the call depth, and the guest SP right after entry.
#[derive(Clone, Copy)]
pub struct Frame {
    pub sym: SymbolId,
    pub edge: EdgeId,
    pub depth: i32,
    pub sp: i32,
    pub is_leaf: bool,
    pub is_sub: bool,
}

// Functions called by inlined standard functions like utoa; remapped
// to their non-inline originator unless that one exists itself.
const NOT_RESERVED: &[(&str, &str)] = &[
    ("__itoa", "itoa"),
    ("__ltoa", "ltoa"),
    ("__utoa", "utoa"),
    ("__ultoa", "ultoa"),
    ("__itoa_ncheck", "itoa"),
    ("__ltoa_ncheck", "ltoa"),
    ("__utoa_ncheck", "utoa"),
    ("__ultoa_ncheck", "ultoa"),
];

const RESERVED_CALLERS: &[&str] = &["__utoa_common", "__ultoa_common"];

pub struct CallGraph {
    pub symbols: Vec<GraphSymbol>,
    pub edges: Vec<Edge>,
    buckets: Vec<Vec<EdgeId>>,
    /// Word address -> symbol at that address.
    pub func_sym: Vec<Option<SymbolId>>,
    /// Shadow call stack; the last element is the current function.
    pub stack: Vec<Frame>,
    /// Most recently popped frame, for the main-return resurrection.
    last_popped: Option<Frame>,
    pub entered: bool,

    entry_point: Option<SymbolId>,
    base: Option<SymbolId>,
    prologue_saves: Option<SymbolId>,
    epilogue_restores: Option<SymbolId>,
    sym_setjmp: Option<SymbolId>,
    sym_longjmp: Option<SymbolId>,
    sym_main: Option<SymbolId>,
    sym_exit: Option<SymbolId>,
    sym_uexit: Option<SymbolId>,
    sym_abort: Option<SymbolId>,

    /// Sum of "own" cycles attributed to nodes.
    pub n_cycles: u64,
    entry_edge: Option<EdgeId>,
    main_return_n_call: i32,
    main_return_pc: u32,
    no_startup_cycles: bool,

    id: Op,
    old_id: Op,
    last_cycle: u64,
    seen_names: HashSet<String>,
    remap: Vec<(SymbolId, &'static str)>,
    pro_ep: Option<SymbolId>,
    s_pe: String,

    // Mirrored -graph-* configuration.
    pub cfg_base: Option<String>,
    pub cfg_reserved: bool,
    pub cfg_all: bool,
    pub cfg_leafs: Vec<String>,
    pub cfg_subs: Vec<String>,
    pub cfg_skips: Vec<String>,
}

impl CallGraph {
    pub fn new() -> Self {
        Self {
            symbols: Vec::new(),
            edges: Vec::new(),
            buckets: vec![Vec::new(); EPRIM],
            func_sym: Vec::new(),
            stack: Vec::new(),
            last_popped: None,
            entered: false,
            entry_point: None,
            base: None,
            prologue_saves: None,
            epilogue_restores: None,
            sym_setjmp: None,
            sym_longjmp: None,
            sym_main: None,
            sym_exit: None,
            sym_uexit: None,
            sym_abort: None,
            n_cycles: 0,
            entry_edge: None,
            main_return_n_call: 0,
            main_return_pc: 0,
            no_startup_cycles: false,
            id: Op::None,
            old_id: Op::None,
            last_cycle: 0,
            seen_names: HashSet::new(),
            remap: Vec::new(),
            pro_ep: None,
            s_pe: String::new(),
            cfg_base: None,
            cfg_reserved: false,
            cfg_all: false,
            cfg_leafs: Vec::new(),
            cfg_subs: Vec::new(),
            cfg_skips: Vec::new(),
        }
    }

    /// Current call depth as shown in the trace.
    pub fn call_depth(&self) -> i32 {
        self.stack.last().map_or(0, |f| f.depth)
    }

    fn is_func_prefix(prefix: &str, fun: &str) -> bool {
        // Also covers cloned functions like "foo.constprop.0".
        fun.strip_prefix(prefix)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'))
    }

    /// Classify a fresh symbol from its name and the -graph options.
    fn classify(&mut self, sym: SymbolId, is_func: bool) {
        let name = self.symbols[sym].name.clone();

        let s = &mut self.symbols[sym];
        s.is_reserved =
            !self.cfg_reserved && name.starts_with("__") && !name.starts_with("__wrap_");
        s.is_reserved_caller = !self.cfg_reserved && RESERVED_CALLERS.contains(&name.as_str());
        s.is_func = is_func;

        let special: &[(&str, SymKind)] = &[
            ("main", SymKind::Main),
            ("exit", SymKind::Exit),
            ("_exit", SymKind::UnderscoreExit),
            ("abort", SymKind::Abort),
            ("setjmp", SymKind::Setjmp),
            ("longjmp", SymKind::Longjmp),
            ("__prologue_saves__", SymKind::Prologue),
            ("__epilogue_restores__", SymKind::Epilogue),
        ];
        for (spec_name, kind) in special {
            if name == *spec_name {
                self.symbols[sym].kind = *kind;
                match kind {
                    SymKind::Main => self.sym_main = Some(sym),
                    SymKind::Exit => self.sym_exit = Some(sym),
                    SymKind::UnderscoreExit => self.sym_uexit = Some(sym),
                    SymKind::Abort => self.sym_abort = Some(sym),
                    SymKind::Setjmp => self.sym_setjmp = Some(sym),
                    SymKind::Longjmp => self.sym_longjmp = Some(sym),
                    SymKind::Prologue => self.prologue_saves = Some(sym),
                    SymKind::Epilogue => self.epilogue_restores = Some(sym),
                    _ => {}
                }
            }
        }

        if let Some(base_name) = &self.cfg_base {
            if !base_name.is_empty() && Self::is_func_prefix(base_name, &name) {
                self.symbols[sym].is_base = true;
                self.base = Some(sym);
            }
        }

        let is_sub = self.cfg_subs.iter().any(|p| Self::is_func_prefix(p, &name));
        let is_leaf = self.cfg_leafs.iter().any(|p| Self::is_func_prefix(p, &name));
        let is_skip = self.cfg_skips.iter().any(|p| Self::is_func_prefix(p, &name));

        let s = &mut self.symbols[sym];
        s.is_sub = is_sub;
        s.is_leaf = is_leaf;
        s.is_skip = is_skip;
        if s.is_base || s.is_leaf || s.is_sub {
            s.is_reserved = false;
            s.is_reserved_caller = false;
        }
    }

    /// Append a symbol; a missing name becomes the address itself.
    pub fn add_symbol(&mut self, name: Option<String>, pc: u32, is_func: bool) -> SymbolId {
        let id = self.symbols.len();
        let (name, kind) = match name {
            Some(n) => (n, SymKind::None),
            None => (format!("0x{:x}", 2 * pc), SymKind::Addr),
        };
        self.symbols.push(GraphSymbol {
            name,
            id: id + 1,
            pc,
            kind,
            is_func: false,
            dot_done: false,
            is_base: false,
            is_reserved: false,
            is_reserved_caller: false,
            is_leaf: false,
            is_sub: false,
            is_hidden: false,
            is_skip: false,
            cycles_own: 0,
            cycles_childs: 0,
            cycles_done: false,
            cycles_account: false,
        });
        self.classify(id, is_func);
        id
    }

    /// Priority when several symbols share an address: `_exit`,
    /// `__init` and `__bad_interrupt` beat other `_`-prefixed names,
    /// which lose against everything else.
    fn rate_symbol(name: &str) -> i32 {
        if matches!(name, "_exit" | "__init" | "__bad_interrupt") {
            2
        } else {
            i32::from(!name.starts_with('_'))
        }
    }

    /// Called by the ELF loader for each function-ish symbol.
    pub fn elf_symbol(&mut self, name: &str, pc: u32, is_func: bool) {
        if self.func_sym.is_empty() {
            self.func_sym = vec![None; crate::core::memory::MAX_FLASH_SIZE / 2];
        }
        self.seen_names.insert(name.to_string());

        if let Some(old) = self.func_sym[pc as usize] {
            if Self::rate_symbol(name) <= Self::rate_symbol(&self.symbols[old].name) {
                return;
            }
        }

        let sym = self.add_symbol(Some(name.to_string()), pc, is_func);

        // Remember names that might be remapped to their non-inline
        // originator; decided once all symbols are known.
        for (reserved, plain) in NOT_RESERVED {
            if name == *reserved {
                self.remap.push((sym, plain));
            }
        }

        self.func_sym[pc as usize] = Some(sym);
    }

    /// Called when the loader finished the symbol pass (also for raw
    /// binaries, with no symbols at all).  Creates the synthetic entry
    /// node and resolves `-graph-base`.
    pub fn finish_symbol_table(&mut self, entry_word: u32) {
        if self.func_sym.is_empty() {
            self.func_sym = vec![None; crate::core::memory::MAX_FLASH_SIZE / 2];
        }

        let remaps = std::mem::take(&mut self.remap);
        for (sym, plain) in remaps {
            if !self.seen_names.contains(plain) {
                let s = &mut self.symbols[sym];
                s.name = plain.to_string();
                s.is_func = true;
                s.is_reserved = false;
            }
        }

        let entry_node = self.add_symbol(Some("Entry Point".into()), entry_word, false);
        self.symbols[entry_node].kind = SymKind::Entry;
        self.entry_point = Some(entry_node);

        let entry = match self.func_sym[entry_word as usize] {
            Some(s) => s,
            None => {
                let s = self.add_symbol(None, entry_word, false);
                self.func_sym[entry_word as usize] = Some(s);
                s
            }
        };

        let e = self.get_edge(entry_node, entry);
        self.entry_edge = Some(e);
        self.stack.push(Frame {
            sym: entry,
            edge: e,
            depth: 0,
            sp: 0,
            is_leaf: false,
            is_sub: false,
        });

        // -graph-base=BASE given but no such function seen: "0" means
        // the entry point, other numbers are byte addresses.
        if let Some(base_name) = self.cfg_base.clone() {
            if self.base.is_none() {
                if base_name == "0" {
                    self.base = Some(entry);
                } else if let Ok(addr) = parse_number(&base_name) {
                    let pc = (addr / 2) as usize;
                    if pc < self.func_sym.len() {
                        let sym = match self.func_sym[pc] {
                            Some(s) => s,
                            None => {
                                let s = self.add_symbol(None, pc as u32, false);
                                self.func_sym[pc] = Some(s);
                                s
                            }
                        };
                        self.base = Some(sym);
                    }
                }
            }
        }

        // Still no base: main, then the program entry.
        let base = self.base.or(self.sym_main).unwrap_or(entry);
        self.base = Some(base);
        let b = &mut self.symbols[base];
        b.is_base = true;
        b.is_reserved = false;
        b.is_reserved_caller = false;

        self.entered = true;
    }

    /// Find or create the edge `from -> to`.
    pub fn get_edge(&mut self, from: SymbolId, to: SymbolId) -> EdgeId {
        let hash = ((from as i32).wrapping_sub(to as i32) as u32 % EPRIM as u32) as usize;
        for &e in &self.buckets[hash] {
            if self.edges[e].from == from && self.edges[e].to == to {
                return e;
            }
        }
        let id = self.edges.len();
        self.edges.push(Edge {
            id: id + 1,
            from,
            to,
            n: 0,
            n_tail: 0,
            n_call: 0,
            n_cycles: 0,
            n_sub: 0,
            n_leaf: 0,
            mark: 0,
            s_tail: None,
            s_label: None,
        });
        self.buckets[hash].push(id);
        id
    }

    fn traverse_edge(&mut self, from: SymbolId, to: SymbolId, delta: i32, back: bool) -> EdgeId {
        let e = self.get_edge(from, to);
        let is_longjmp = self.symbols[from].kind == SymKind::Longjmp
            || self.symbols[to].kind == SymKind::Longjmp;
        let edge = &mut self.edges[e];
        edge.n += 1;
        if delta != 0 {
            edge.n_call += 1;
        } else {
            edge.n_tail += 1;
        }
        if back || is_longjmp {
            edge.mark |= EM_BACK;
        }
        e
    }

    /// Mark the edges of the stack slice `[to_idx ..= from_idx]`,
    /// walking down from `from_idx` (`None` for `to_idx` marks all the
    /// way to the bottom).
    fn mark_edges(&mut self, from_idx: usize, to_idx: Option<usize>, mask: u32) {
        let low = to_idx.unwrap_or(0);
        let mut i = from_idx as i64;
        while i >= low as i64 {
            let e = self.stack[i as usize].edge;
            self.edges[e].mark |= mask;
            i -= 1;
        }
    }

    /// Lowest stack index whose symbol is a base, if any.
    fn find_base(&self) -> Option<usize> {
        self.stack.iter().position(|f| self.symbols[f.sym].is_base)
    }

    /// Deepest frame entered through an edge to a node of `kind`.
    fn find_kind(&self, kind: SymKind) -> Option<usize> {
        self.stack
            .iter()
            .position(|f| self.symbols[self.edges[f.edge].to].kind == kind)
    }

    /// Add `cycles` to the own costs of the frame at `from_idx` and as
    /// child costs to its ancestors down to the base frame.
    fn account(&mut self, from_idx: usize, base_idx: usize, cycles: u64) {
        let mut own = true;
        let mut i = from_idx as i64;
        while i >= 0 {
            let frame = self.stack[i as usize];
            let at_base = i as usize == base_idx;

            if at_base && self.symbols[frame.sym].cycles_done {
                return;
            }
            if self.symbols[frame.sym].cycles_done {
                i -= 1;
                continue;
            }
            self.symbols[frame.sym].cycles_done = true;

            if own {
                let s = &mut self.symbols[frame.sym];
                s.cycles_account = true;
                s.cycles_own += cycles;
                self.n_cycles += cycles;
            } else {
                self.symbols[frame.sym].cycles_childs += cycles;
            }

            if at_base {
                return;
            }

            if own {
                self.edges[frame.edge].n_cycles += cycles;
            }
            self.edges[frame.edge].mark |= EM_ACCOUNT;
            own = false;
            i -= 1;
        }
    }
}

impl Default for CallGraph {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_number(s: &str) -> Result<u64, std::num::ParseIntError> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse()
    }
}

impl Simulator {
    /// Attribute the cycles accumulated since the last stack change to
    /// the innermost accountable frame.
    fn account_cycles(&mut self) {
        let cycles = self.program.n_cycles - self.graph.last_cycle;
        self.graph.last_cycle = self.program.n_cycles;

        let Some(base_idx) = self.graph.find_base() else {
            return;
        };

        let top = self.graph.stack.len() - 1;
        if top == base_idx
            || Some(self.graph.stack[top].sym) == self.graph.sym_main
        {
            self.graph.mark_edges(top, None, EM_TRACE);
        }

        for i in 0..self.graph.stack.len() {
            let sym = self.graph.stack[i].sym;
            self.graph.symbols[sym].cycles_done = false;
        }

        // Climb up the call stack until a node may take the cycles.
        let mut i = top;
        while i > base_idx {
            let frame = self.graph.stack[i];
            let sym = &self.graph.symbols[frame.sym];
            if frame.is_leaf || sym.is_skip {
                i -= 1;
                continue;
            }
            if frame.sym == self.graph.stack[base_idx].sym
                || sym.is_base
                || sym.is_leaf
                || frame.is_sub
                || sym.is_sub
            {
                break;
            }
            let from_reserved_caller =
                self.graph.symbols[self.graph.edges[frame.edge].from].is_reserved_caller;
            if !(sym.is_reserved || from_reserved_caller) {
                break;
            }
            i -= 1;
        }

        self.graph.account(i, base_idx, cycles);
    }

    /// The call stack changed: push, pop or reconcile frames.
    fn update_call_stack(&mut self, sym: Option<SymbolId>, delta: i32, is_longjmp: bool) {
        let sp = i32::from(self.sp());

        self.account_cycles();

        let top = *self.graph.stack.last().expect("shadow stack never empty");
        let top_kind = self.graph.symbols[top.sym].kind;

        // Fix the depth change for the (very) special functions.
        let mut delta = delta;
        let is_longjmp = is_longjmp || top_kind == SymKind::Longjmp;
        if is_longjmp || top_kind == SymKind::Setjmp {
            delta = -1;
        }
        if let Some(s) = sym {
            if self.graph.symbols[s].kind == SymKind::Terminate {
                delta = 0;
            }
        }

        if delta == 0 && sym == Some(top.sym) && sp == top.sp {
            // A node jumping to itself without changing anything; just
            // add the edge.
            let s = sym.unwrap();
            self.graph.traverse_edge(s, s, 0, false);
        } else if delta >= 0 {
            // Tail calls are pushed rather than replacing the top, so
            // that a later failure shows the full path and costs can
            // be promoted from callees to the tail-callee.
            let s = match sym {
                Some(s) => s,
                None => {
                    // Calling a location without a symbol: cook up a
                    // node labelled with the target address.
                    let s = self.graph.add_symbol(None, self.pc, false);
                    self.graph.symbols[s].is_reserved = true;
                    self.graph.func_sym[self.pc as usize] = Some(s);
                    s
                }
            };

            let e = self.graph.traverse_edge(top.sym, s, delta, false);
            let prev = top;
            // Leaf and sub are sticky: callees inherit them.
            let is_leaf = prev.is_leaf || self.graph.symbols[prev.sym].is_leaf;
            let is_sub = (prev.is_sub || self.graph.symbols[prev.sym].is_sub)
                && !self.graph.symbols[prev.sym].is_leaf;

            let frame = Frame {
                sym: s,
                edge: e,
                depth: prev.depth + delta,
                sp,
                is_leaf,
                is_sub,
            };
            self.graph.stack.push(frame);
            self.graph.edges[e].n_leaf += u32::from(frame.is_leaf);
            self.graph.edges[e].n_sub += u32::from(frame.is_sub);
        } else {
            // delta < 0
            let orig_top = top;
            let mut delta = delta;

            if is_longjmp {
                delta = 0;

                // Unwinding to the setjmp point: mark the abandoned
                // part of the stack so the trace stays connected.
                if let Some(s) = sym {
                    let mut target = None;
                    for (i, f) in self.graph.stack.iter().enumerate().rev() {
                        if f.sym == s {
                            target = Some(i);
                            break;
                        }
                    }
                    if let Some(i) = target {
                        let top_idx = self.graph.stack.len() - 1;
                        self.graph.mark_edges(top_idx, Some(i), EM_TRACE);
                        while self.graph.stack.len() - 1 != i {
                            self.graph.last_popped = self.graph.stack.pop();
                        }
                    }
                } else {
                    let top_idx = self.graph.stack.len() - 1;
                    let mut low = None;
                    for (i, f) in self.graph.stack.iter().enumerate().rev() {
                        if f.sp >= sp {
                            low = Some(i + 1);
                            break;
                        }
                    }
                    match low {
                        Some(l) if l <= top_idx => self.graph.mark_edges(top_idx, Some(l), EM_TRACE),
                        // No frame below the unwind target, or every
                        // frame is below it: mark the whole stack.
                        _ => self.graph.mark_edges(top_idx, None, EM_TRACE),
                    }
                }
            }

            // The normal case: pop until the depth is restored, with
            // an SP heuristic for better longjmp recovery.
            while self.graph.stack.len() > 1
                && (delta < 0 || self.graph.stack.last().unwrap().sp < sp)
            {
                let main_returns = delta < 0
                    && Some(self.graph.stack.last().unwrap().sym) == self.graph.sym_main;
                self.graph.last_popped = self.graph.stack.pop();
                if delta < 0 {
                    delta += 1;
                }
                if main_returns {
                    break;
                }
            }

            if is_longjmp {
                let from = orig_top.sym;
                let mut sym2 = from;
                if self.graph.symbols[from].kind != SymKind::Longjmp {
                    // Tedious case, presumably a __builtin_longjmp.
                    let old_pc = self.trace.old_pc;
                    sym2 = match self.graph.func_sym[old_pc as usize] {
                        Some(s) => s,
                        None => {
                            // Hidden node connecting the maybe-longjmp
                            // to its maybe-setjmp.
                            let name =
                                format!("longjmp?\\n{}", self.graph.symbols[from].name);
                            let s = self.graph.add_symbol(Some(name), old_pc, false);
                            self.graph.symbols[s].is_hidden = true;
                            self.graph.func_sym[old_pc as usize] = Some(s);
                            s
                        }
                    };
                    let e = self.graph.traverse_edge(from, sym2, 0, true);
                    self.graph.edges[e].mark |= EM_TRACE;
                }
                let to = self.graph.stack.last().unwrap().sym;
                let e = self.graph.traverse_edge(sym2, to, 0, true);
                self.graph.edges[e].mark |= EM_TRACE;
            }
        }
    }

    /// Track the call depth; called after every instruction when any
    /// consumer (graph, perf, trace) needs it.  Returns the depth.
    pub(crate) fn graph_update_call_depth(&mut self, d: &Decoded) -> i32 {
        self.graph.old_id = self.graph.id;
        let id = d.id;
        self.graph.id = id;

        if !self.trace.need.call_depth || !self.graph.entered {
            return 0;
        }

        let mut call = 0;
        match id {
            Op::Rcall => {
                // "rcall ." allocates stack in avr-gcc; offset 0 is
                // far more likely allocation than a real call.
                call = i32::from(d.op2 != 0);
            }
            Op::Icall | Op::Call | Op::Eicall => call = 1,
            Op::Ret => {
                // push/push/ret is an indirect jump, not a return.
                if self.graph.old_id != Op::Push {
                    call = -1;
                }
            }
            _ => {}
        }

        let mut maybe_longjmp = id == Op::Ret && self.graph.old_id == Op::Push;
        let jump_indirect = id == Op::Ijmp || id == Op::Eijmp;
        let mut fun = self.graph.func_sym[self.pc as usize];
        let cur = self.graph.stack.last().expect("shadow stack never empty").sym;
        let cur_kind = self.graph.symbols[cur].kind;

        // Pretty-print __prologue_saves__ / __epilogue_restores__ in
        // the trace but keep them out of the call tree; too many
        // functions use these libgcc helpers.
        let mut is_proep = 0;
        if self.graph.pro_ep.is_none() && (id == Op::Rjmp || id == Op::Jmp) {
            for cand in [self.graph.prologue_saves, self.graph.epilogue_restores] {
                if let Some(p) = cand {
                    let p_pc = self.graph.symbols[p].pc;
                    if self.pc.wrapping_sub(p_pc) <= 18 {
                        self.graph.pro_ep = Some(p);
                    }
                }
            }
            if let Some(p) = self.graph.pro_ep {
                is_proep = 1;
                let n_regs = self.pc - self.graph.symbols[p].pc;
                self.graph.s_pe = format!(
                    "{} + 0x{:x} ({} regs)",
                    self.graph.symbols[p].name,
                    2 * n_regs,
                    18 - n_regs
                );
            }
        } else if self.graph.pro_ep.is_some() && (jump_indirect || id == Op::Ret) {
            is_proep = 2;
        }

        if is_proep != 0 || fun.map(|f| self.graph.symbols[f].is_hidden) == Some(true) {
            fun = None;
        }
        let mut changed = call != 0 || fun.is_some();

        if cur_kind == SymKind::Setjmp {
            // Leaving setjmp through an indirect jump is a change.
            changed = changed || jump_indirect;
        } else if cur_kind == SymKind::Longjmp {
            maybe_longjmp = jump_indirect;
        } else if maybe_longjmp || jump_indirect {
            let sp = i32::from(self.sp());
            maybe_longjmp = self.graph.stack.last().is_some_and(|top| sp > top.sp);
        }

        // Entering main; main is somewhat special in C programs.
        if let Some(f) = fun {
            if Some(f) == self.graph.sym_main {
                self.graph.main_return_n_call += 1;
                if call == 1 {
                    self.graph.main_return_pc =
                        self.trace.old_pc + u32::from(id.info().words);
                }
                self.graph.no_startup_cycles = self.graph.n_cycles == 0;
            }
        }

        let main_returns = fun.is_some()
            && (fun == self.graph.sym_exit || fun == self.graph.sym_uexit)
            && self.graph.old_id == Op::Ret
            && (id == Op::Jmp || id == Op::Rjmp)
            && self.graph.main_return_n_call == 1
            && self.graph.main_return_pc == self.trace.old_pc
            && self
                .graph
                .last_popped
                .is_some_and(|f| Some(f.sym) == self.graph.sym_main)
            && self.graph.last_popped.is_some_and(|f| {
                self.graph
                    .stack
                    .last()
                    .is_some_and(|top| top.sym == self.graph.edges[f.edge].from)
            });

        if main_returns {
            // Resurrect the call of main.
            let frame = self.graph.last_popped.take().unwrap();
            self.graph.stack.push(frame);
            let top = self.graph.stack.len() - 1;
            self.graph.mark_edges(top, None, EM_TRACE);
        }

        let yold = self.graph.stack.last().copied();

        if changed || maybe_longjmp {
            self.update_call_stack(fun, call, maybe_longjmp);
        }

        if main_returns {
            if let Some(top) = self.graph.stack.last().copied() {
                if Some(top.sym) == self.graph.sym_exit || Some(top.sym) == self.graph.sym_uexit
                {
                    // main returned directly into exit/_exit: label the
                    // edge with the return value.
                    let r24 =
                        i16::from_le_bytes([self.ram[24], self.ram[25]]);
                    self.graph.edges[top.edge].s_label = Some(format!("return {r24}"));
                    self.graph.edges[top.edge].mark |= EM_MAIN_RET | EM_DASHED;
                }
            }
        }

        if !self.trace.unused {
            let s_pe = self.graph.s_pe.clone();
            self.log_transition(yold, self.graph.stack.last().copied(), is_proep, &s_pe);
        }

        if is_proep == 2 {
            self.graph.pro_ep = None;
        }

        self.graph.call_depth()
    }

    /// Log stack transitions, which makes execution logs much easier
    /// to follow.
    fn log_transition(
        &mut self,
        yold: Option<Frame>,
        ynew: Option<Frame>,
        is_proep: i32,
        s_pe: &str,
    ) {
        let name = |g: &CallGraph, f: &Option<Frame>| -> Option<String> {
            f.map(|f| g.symbols[f.sym].name.clone())
        };
        let old_name = name(&self.graph, &yold);
        let new_name = name(&self.graph, &ynew);
        let d_old = yold.map_or(0, |f| f.depth);
        let d_new = ynew.map_or(0, |f| f.depth);
        let d = d_new - d_old;

        if is_proep != 0 {
            let t = &mut self.trace;
            tracef!(t, "{}+++[{}", if d < 0 { "\n" } else { "" }, d_new);
            match (is_proep, d < 0) {
                (1, _) => tracef!(t, "] {} -->", old_name.as_deref().unwrap_or("?")),
                (_, true) => tracef!(
                    t,
                    "<-{}] {} <-- {} <--",
                    d_old,
                    new_name.as_deref().unwrap_or("?"),
                    old_name.as_deref().unwrap_or("?")
                ),
                _ => tracef!(t, "] {} <--", new_name.as_deref().unwrap_or("?")),
            }
            tracef!(t, " {} \n", s_pe);
            return;
        }

        let fun_here = self.graph.func_sym[self.pc as usize];
        match (&old_name, &new_name) {
            (Some(old), Some(new))
                if yold.map(|f| f.sym) != ynew.map(|f| f.sym)
                    || yold.map(|f| f.sym) == fun_here =>
            {
                let old_pc = self.trace.old_pc;
                let hidden = self.graph.func_sym[old_pc as usize]
                    .map(|s| self.graph.symbols[s].is_hidden)
                    == Some(true);
                let s_lj = if hidden { "longjmp? <-- " } else { "" };

                let t = &mut self.trace;
                if d == 0 {
                    tracef!(t, "\n+++[{}] ", d_old);
                } else if d < 0 {
                    tracef!(t, "\n+++[{}<-{}] ", d_new, d_old);
                } else {
                    tracef!(t, "\n+++[{}->{}] ", d_old, d_new);
                }
                if d < 0 || is_proep == 2 {
                    tracef!(t, "{} <-- {}{} \n", new, s_lj, old);
                } else {
                    tracef!(t, "{} --> {} \n", old, new);
                }
            }
            _ if old_name != new_name => {
                let (n, dd) = match (&old_name, &new_name) {
                    (None, Some(n)) => (n.clone(), d_new),
                    (Some(o), _) => (o.clone(), d_old),
                    _ => return,
                };
                let t = &mut self.trace;
                tracef!(t, "\n+++[{}] {} \n", dd, n);
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // DOT emission

    fn dot_filename(&self) -> Option<String> {
        if let Some(name) = &self.opts.graph_filename {
            if name.is_empty() || name == "-" {
                return None;
            }
            return Some(name.clone());
        }
        let name = &self.program.name;
        let stem = match name.rfind('.') {
            Some(i) if !name[i..].contains('/') => &name[..i],
            _ => name.as_str(),
        };
        Some(format!("{stem}.dot"))
    }

    fn write_dot_node(
        &mut self,
        w: &mut dyn Write,
        n: SymbolId,
        extra: Option<&str>,
    ) -> io::Result<()> {
        if self.graph.symbols[n].dot_done {
            return Ok(());
        }
        self.graph.symbols[n].dot_done = true;
        let sym = &self.graph.symbols[n];

        write!(w, "\t{} [label=\"{}", sym.id, sym.name)?;
        if let Some(extra) = extra {
            write!(w, "\\nreason: {extra}")?;
        }
        if sym.kind != SymKind::Addr {
            write!(w, "\\n0x{:x}", 2 * sym.pc)?;
        }
        if sym.kind == SymKind::Terminate {
            write!(w, "\\ncycles:{}", self.program.n_cycles)?;
        } else if sym.cycles_account && sym.cycles_childs != 0 {
            write!(w, "\\nch:{} own:{}", sym.cycles_childs, sym.cycles_own)?;
        } else if sym.cycles_account {
            write!(w, "\\n    own:{}", sym.cycles_own)?;
        }
        write!(w, "\"]")?;

        let shape = if sym.kind == SymKind::Entry || sym.kind == SymKind::Terminate {
            "doubleoctagon"
        } else if sym.is_base {
            "box3d"
        } else if sym.is_func {
            "box"
        } else {
            "ellipse"
        };
        write!(w, "[shape={shape}]")?;

        let per = if self.graph.n_cycles != 0 {
            sym.cycles_own as f64 / self.graph.n_cycles as f64
        } else {
            0.0
        };

        if sym.kind == SymKind::Entry || sym.kind == SymKind::Terminate {
            write!(w, "[style=filled fillcolor=\"0.6 0.3 1\"]")?;
        } else if !sym.cycles_account {
            write!(w, "[color=gray][fontcolor=gray]")?;
        } else {
            write!(
                w,
                "[style=filled fillcolor=\"{:1.3} {:1.3} {:1.3}\"]",
                0.4 * (1.0 - per.powf(0.3)),
                per.powf(0.5),
                1.0
            )?;
        }
        writeln!(w, ";")
    }

    fn write_dot_edge(
        &mut self,
        w: &mut dyn Write,
        e: EdgeId,
        force: bool,
        fat: bool,
    ) -> io::Result<()> {
        let (from, to, mark, n, n_cycles, s_label, s_tail, n_call) = {
            let edge = &self.edges_ref()[e];
            (
                edge.from,
                edge.to,
                edge.mark,
                edge.n,
                edge.n_cycles,
                edge.s_label.clone(),
                edge.s_tail.clone(),
                edge.n_call,
            )
        };
        let synthetic = self.graph.symbols[from].kind == SymKind::Entry
            || self.graph.symbols[to].kind == SymKind::Terminate;
        let show = force || synthetic || mark & (EM_SHOW | EM_ACCOUNT) != 0;
        let back = mark & EM_BACK != 0;
        let nfrom =
            show || self.graph.symbols[from].is_base || self.graph.symbols[from].cycles_account;
        let nto = show || self.graph.symbols[to].is_base || self.graph.symbols[to].cycles_account;

        if self.graph.edges[e].mark & EM_DOT_DONE != 0 {
            return Ok(());
        }
        self.graph.edges[e].mark |= EM_DOT_DONE;

        if nfrom {
            self.write_dot_node(w, from, None)?;
        }
        if nto {
            self.write_dot_node(w, to, None)?;
        }
        if !show || !nfrom || !nto {
            return Ok(());
        }

        let s_color = if back {
            Some(if fat { "0.0 0.6 0.9" } else { "red" })
        } else if fat || mark & EM_TRACE != 0 {
            Some("0.5 0.5 0.7")
        } else if mark & (EM_SHOW | EM_ACCOUNT) != 0 {
            None
        } else {
            Some("gray")
        };

        let (from, to) = if back { (to, from) } else { (from, to) };
        write!(
            w,
            "\t{} -> {} ",
            self.graph.symbols[from].id, self.graph.symbols[to].id
        )?;

        if back {
            write!(w, "[dir=back][fontcolor=red]")?;
        }
        if mark & (EM_ACCOUNT | EM_SHOW) == 0 {
            write!(w, "[fontcolor=gray]")?;
        }
        if let Some(color) = s_color {
            write!(w, "[color=\"{color}\"]")?;
        }

        if !synthetic {
            write!(w, "[label=\"{}", s_label.as_deref().unwrap_or(""))?;
            write!(
                w,
                "{}#{}",
                if s_label.is_some() { "\\n" } else { "" },
                n
            )?;
            if n_cycles != 0 {
                write!(w, "\\n{n_cycles}")?;
            }
            write!(w, "\"]")?;
        }

        if let Some(tail) = &s_tail {
            write!(w, "[taillabel=\"{tail}\"]")?;
        }

        if fat {
            write!(w, "[penwidth=4]")?;
        }
        if mark & EM_DOTTED != 0 {
            write!(w, "[style=dotted]")?;
        } else if mark & EM_DASHED != 0 || (!synthetic && n_call == 0) {
            write!(w, "[style=dashed]")?;
        }
        writeln!(w, ";")
    }

    fn edges_ref(&self) -> &[Edge] {
        &self.graph.edges
    }

    /// Write the call graph after termination: a synthetic "Program
    /// Stop" node, the highlighted trace path, then every visible
    /// node and edge.
    pub fn graph_write_dot(&mut self, leave: &Leave) -> io::Result<()> {
        if !self.graph.entered {
            return Ok(());
        }

        let reason = match leave {
            Leave::Exit { value, .. } => format!("exit {value}"),
            Leave::Aborted(_) => "abort".into(),
            Leave::Timeout => "timeout".into(),
            _ => "unknown".into(),
        };
        let problem = !matches!(leave, Leave::Exit { value: 0, .. });

        // Synthetic node and edge representing program termination.
        let exit_point = self
            .graph
            .add_symbol(Some("Program Stop".into()), self.trace.old_pc, false);
        self.graph.symbols[exit_point].kind = SymKind::Terminate;
        self.graph.symbols[exit_point].is_reserved = true;
        self.update_call_stack(Some(exit_point), 0, false);

        // Mark the way to the termination.
        let top = self.graph.stack.len() - 1;
        self.graph.mark_edges(top, None, EM_TRACE);

        let filename = self.dot_filename();
        let mut file_out;
        let mut stdout_out;
        let w: &mut dyn Write = match &filename {
            Some(name) => {
                file_out = File::create(name).map_err(|e| {
                    io::Error::new(e.kind(), format!("cannot open \"{name}\" for writing: {e}"))
                })?;
                &mut file_out
            }
            None => {
                stdout_out = io::stdout().lock();
                &mut stdout_out
            }
        };

        writeln!(w, "digraph \"{}\"\n{{", self.program.short_name)?;

        let entry_node = self.graph.entry_point.expect("graph entered");
        let entry_edge = self.graph.entry_edge.expect("graph entered");
        let stop_frame = *self.graph.stack.last().expect("stack non-empty");

        self.write_dot_node(w, entry_node, None)?;
        self.write_dot_node(w, stop_frame.sym, Some(&reason))?;
        self.write_dot_edge(w, entry_edge, true, true)?;
        self.write_dot_edge(w, stop_frame.edge, true, true)?;

        // Startup code before main is boring; use a neat shortcut.
        if !self.opts.graph_all && self.graph.no_startup_cycles {
            let bottom_is_entry = self
                .graph
                .stack
                .first()
                .is_some_and(|f| f.edge == entry_edge);
            if bottom_is_entry {
                if let (Some(lmain), Some(main)) =
                    (self.graph.find_kind(SymKind::Main), self.graph.sym_main)
                {
                    self.graph.mark_edges(lmain, None, EM_DOT_DONE);
                    let bottom_sym = self.graph.stack[0].sym;
                    let e = self.graph.traverse_edge(bottom_sym, main, 0, false);
                    let edge = &mut self.graph.edges[e];
                    edge.n -= u32::from(edge.mark & EM_DOT_DONE != 0);
                    edge.mark |= EM_TRACE | EM_DASHED;
                    edge.mark &= !EM_DOT_DONE;
                    edge.s_label = Some(" Startup Code".into());
                }
            }
        }

        for e in 0..self.graph.edges.len() {
            let mark = self.graph.edges[e].mark;
            self.write_dot_edge(
                w,
                e,
                mark & EM_TRACE != 0 || self.opts.graph_all,
                mark & EM_TRACE != 0 && problem,
            )?;
        }

        writeln!(w, "}}")?;
        w.flush()
    }
}
