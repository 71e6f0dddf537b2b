//! Perf meters: seven independent timers driven by guest syscalls.
//!
//! A meter runs in one of two modes.  Start/stop mode brackets rounds
//! of execution and tracks total, mean, standard deviation and
//! min/max of cycles, instructions, call depth and stack pointer.
//! Stat mode collects single values handed over by the guest.  Min and
//! max carry the tag that was live when their round started.

use crate::core::simulator::Simulator;
use crate::cpu::Op;
use crate::host::values::{self, CVal, LogKind, format_e};
use crate::trace::{qprint, tracef};

pub const NUM_PERFS: usize = 8;

// Perf commands (syscall 5, bits 6..4; the 2-bit port protocol carries
// the first four).
pub const PERF_STOP_CMD: u8 = 0;
pub const PERF_START_CMD: u8 = 1;
pub const PERF_STAT_U32_CMD: u8 = 2;
pub const PERF_DUMP_CMD: u8 = 3;
pub const PERF_STAT_S32_CMD: u8 = 4;
pub const PERF_STAT_FLOAT_CMD: u8 = 5;
pub const PERF_START_CALL_CMD: u8 = 6;

// Tag commands (syscall 6, bits 7..4).
pub const PERF_TAG_STR_CMD: u8 = 0;
pub const PERF_TAG_S16_CMD: u8 = 1;
pub const PERF_TAG_S32_CMD: u8 = 2;
pub const PERF_TAG_U16_CMD: u8 = 3;
pub const PERF_TAG_U32_CMD: u8 = 4;
pub const PERF_TAG_FLOAT_CMD: u8 = 5;
pub const PERF_LABEL_CMD: u8 = 6;
pub const PERF_PLABEL_CMD: u8 = 7;
pub const PERF_TAG_FMT_CMD: u8 = 8;
pub const PERF_TAG_PFMT_CMD: u8 = 9;

/// Meter mask meaning "all seven".
pub const PERF_ALL: u32 = 0xFFFE;

const LEN_PERF_TAG_STRING: usize = 50;
const LEN_PERF_TAG_FMT: usize = 200;
const LEN_PERF_LABEL: usize = 100;

/// A tag attached to min/max extrema: string, integer or float, with
/// an optional custom format.
#[derive(Clone, Default)]
pub struct PerfTag {
    pub kind: Option<LogKind>,
    pub val: u32,
    pub dval: f64,
    pub string: String,
    pub fmt: String,
}

impl PerfTag {
    /// Render the tag; returns the printed width for column layout.
    fn print(&self, no_tag: &str, tag_prefix: &str) -> usize {
        let Some(kind) = self.kind else {
            print!("{no_tag}");
            return no_tag.len();
        };

        let fmt = if self.fmt.is_empty() {
            values::layout(kind).fmt
        } else {
            self.fmt.as_str()
        };
        let body = match kind {
            LogKind::Str | LogKind::Pstr => values::format_c(fmt, CVal::S(&self.string)),
            LogKind::Float => values::format_c(fmt, CVal::F(self.dval)),
            k if values::layout(k).signed => {
                values::format_c(fmt, CVal::I(i64::from(self.val as i32)))
            }
            _ => values::format_c(fmt, CVal::U(u64::from(self.val))),
        };
        print!("{tag_prefix}{body}");
        tag_prefix.len() + body.len()
    }
}

/// Extremal values with round numbers, code addresses and tags.
#[derive(Clone)]
pub struct MinMax {
    pub min: i64,
    pub max: i64,
    pub min_at: u32,
    pub max_at: u32,
    pub at_start: i64,
    pub at_end: i64,
    pub tag_min: PerfTag,
    pub tag_max: PerfTag,
    pub dmin: f64,
    pub dmax: f64,
    pub r_min: i32,
    pub r_max: i32,
    pub ev2: f64,
}

impl MinMax {
    fn new(at_start: i64) -> Self {
        Self {
            min: i64::MAX,
            max: i64::MIN,
            min_at: 0,
            max_at: 0,
            at_start,
            at_end: 0,
            tag_min: PerfTag::default(),
            tag_max: PerfTag::default(),
            dmin: f64::INFINITY,
            dmax: f64::NEG_INFINITY,
            r_min: 0,
            r_max: 0,
            ev2: 0.0,
        }
    }

    fn update(&mut self, x: i64, round: i32, at: u32, tag: &PerfTag) {
        if x < self.min {
            if tag.kind.is_some() {
                self.tag_min = tag.clone();
            }
            self.min = x;
            self.min_at = at;
            self.r_min = round;
        }
        if x > self.max {
            if tag.kind.is_some() {
                self.tag_max = tag.clone();
            }
            self.max = x;
            self.max_at = at;
            self.r_max = round;
        }
    }

    fn update_double(&mut self, x: f64, round: i32, at: u32, tag: &PerfTag) {
        if x < self.dmin {
            if tag.kind.is_some() {
                self.tag_min = tag.clone();
            }
            self.dmin = x;
            self.min_at = at;
            self.r_min = round;
        }
        if x > self.dmax {
            if tag.kind.is_some() {
                self.tag_max = tag.clone();
            }
            self.dmax = x;
            self.max_at = at;
            self.r_max = round;
        }
    }
}

impl Default for MinMax {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Which collection mode a meter is in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Mode {
    #[default]
    Unused,
    StartStop,
    Stat,
}

#[derive(Clone, Default)]
pub struct Meter {
    /// Round count (start/stop) or value count (stat).
    pub n: i32,
    pub on: bool,
    pub mode: Mode,
    /// Cumulated ticks and instructions over all rounds.
    pub ticks: u64,
    pub insns: u64,
    /// PC of the first START and the last STOP.
    pub pc_start: u32,
    pub pc_end: u32,
    /// Sum over stat values for the expectation value.
    pub val_ev: f64,
    pub tag: PerfTag,
    pub tag_for_start: PerfTag,
    pub pc: MinMax,
    pub tick: MinMax,
    pub insn: MinMax,
    pub val: MinMax,
    pub sp: MinMax,
    pub calls: MinMax,
    /// PERF_START_CALL: only instructions below this SP count.
    pub call_only_sp: i64,
    pub call_only_ticks: u64,
    pub call_only_insns: u64,
    pub label: String,
}

pub struct Perf {
    /// Whether any meter is currently on.
    pub on: bool,
    /// The current instruction issued PERF_START; log it even though
    /// the meter only turns on below.
    pub will_be_on: bool,
    /// Cycles before the current instruction executed.
    pub tick: u64,
    /// SP before the current instruction executed.
    pub sp: i32,
    pub n_dumps: i32,
    /// Command and meter mask pending from syscall 5.
    pub cmd: u8,
    pub pmask: u32,
    pub pending_tag_fmt: bool,
    pub meters: Vec<Meter>,
}

impl Perf {
    pub fn new() -> Self {
        Self {
            on: false,
            will_be_on: false,
            tick: 0,
            sp: 0,
            n_dumps: 0,
            cmd: 0,
            pmask: 0,
            pending_tag_fmt: false,
            meters: vec![Meter::default(); NUM_PERFS],
        }
    }

    pub fn init(&mut self) {
        for m in &mut self.meters {
            m.tag_for_start.kind = None;
        }
    }
}

impl Default for Perf {
    fn default() -> Self {
        Self::new()
    }
}

fn is_stat_cmd(cmd: u8) -> bool {
    matches!(
        cmd,
        PERF_STAT_U32_CMD | PERF_STAT_S32_CMD | PERF_STAT_FLOAT_CMD
    )
}

impl Simulator {
    /// Syscall 5: queue a perf command; it takes effect after this
    /// instruction completed.
    pub(crate) fn sys_perf_cmd(&mut self, x: u8) {
        let n = u32::from(x & 0x0F);
        let cmd = (x >> 4) & 0x07;

        if !self.trace.unused {
            let s = match cmd {
                PERF_START_CMD => "start",
                PERF_STOP_CMD => "stop",
                PERF_DUMP_CMD => "dump",
                PERF_STAT_U32_CMD => "stat u32",
                PERF_STAT_S32_CMD => "stat s32",
                PERF_STAT_FLOAT_CMD => "stat float",
                PERF_START_CALL_CMD => "start on call",
                _ => "???",
            };
            let t = &mut self.trace;
            if n != 0 {
                tracef!(t, "PERF {n} {s}");
            } else {
                tracef!(t, "PERF all {s}");
            }
        }

        self.perf.pmask = if n != 0 { 1 << n } else { PERF_ALL };
        self.perf.will_be_on = cmd == PERF_START_CMD || cmd == PERF_START_CALL_CMD;
        self.perf.cmd = cmd;
    }

    /// Syscall 6: set a tag, a label or a tag format.
    pub(crate) fn sys_perf_tag_cmd(&mut self, x: u8) {
        let n = usize::from(x & 0x0F);
        let tag_cmd = (x >> 4) & 0x0F;

        let (s, kind) = match tag_cmd {
            PERF_TAG_STR_CMD => ("_TAG string", LogKind::Str),
            PERF_TAG_S16_CMD => ("_TAG s16", LogKind::S16),
            PERF_TAG_S32_CMD => ("_TAG s32", LogKind::S32),
            PERF_TAG_U16_CMD => ("_TAG u16", LogKind::U16),
            PERF_TAG_U32_CMD => ("_TAG u32", LogKind::U32),
            PERF_TAG_FLOAT_CMD => ("_TAG float", LogKind::Float),
            PERF_LABEL_CMD => (" label", LogKind::Str),
            PERF_PLABEL_CMD => (" plabel", LogKind::Pstr),
            PERF_TAG_FMT_CMD => (" fmt", LogKind::Str),
            PERF_TAG_PFMT_CMD => (" pfmt", LogKind::Pstr),
            _ => ("?", LogKind::Str),
        };
        {
            let t = &mut self.trace;
            tracef!(t, "PERF{s} {n}");
        }

        let lay = values::layout(kind);
        let raw = self.get_r20_value(&lay);

        match tag_cmd {
            PERF_TAG_FMT_CMD | PERF_TAG_PFMT_CMD => {
                self.perf.pending_tag_fmt = true;
                let fmt = self.read_guest_string(raw, lay.in_rom, LEN_PERF_TAG_FMT);
                self.perf.meters[0].tag.fmt = fmt;
                return;
            }
            PERF_LABEL_CMD | PERF_PLABEL_CMD => {
                self.perf.meters[n].label = if raw != 0 {
                    self.read_guest_string(raw, lay.in_rom, LEN_PERF_LABEL)
                } else {
                    String::new()
                };
                return;
            }
            _ => {}
        }

        let string = if kind == LogKind::Str {
            self.read_guest_string(raw, false, LEN_PERF_TAG_STRING)
        } else {
            String::new()
        };
        let dval = if kind == LogKind::Float {
            values::decode_avr_float(raw).x
        } else {
            0.0
        };
        let fmt = if self.perf.pending_tag_fmt {
            self.perf.meters[0].tag.fmt.clone()
        } else {
            String::new()
        };
        self.perf.pending_tag_fmt = false;

        self.perf.meters[n].tag_for_start = PerfTag {
            kind: Some(kind),
            val: raw,
            dval,
            string,
            fmt,
        };
    }

    /// Whether the queued start/stat may proceed on meter `i`, with
    /// the explanatory chatter.
    fn perf_may_use(&mut self, i: usize, cmd: u8) -> bool {
        let m = &self.perf.meters[i];
        let (mode, on, n) = (m.mode, m.on, m.n);

        qprint!(self, "\n--- ");
        match mode {
            Mode::Unused => {
                if cmd == PERF_START_CMD {
                    qprint!(self, "Start T{i} (round 1");
                }
            }
            _ if cmd == PERF_START_CMD => {
                if mode == Mode::Stat {
                    qprint!(self, "Start T{i} ignored: T{i} in Stat mode ({n} values)\n");
                } else if on {
                    qprint!(self, "Start T{i} ignored: T{i} already started (round {n})\n");
                } else {
                    qprint!(self, "reStart T{i} (round {}", 1 + n);
                }
            }
            Mode::StartStop => {
                qprint!(
                    self,
                    "Stat T{i} ignored: T{i} is in Start/Stop mode ({} round {n})\n",
                    if on { "in" } else { "after" }
                );
            }
            Mode::Stat => {}
        }

        match mode {
            Mode::Unused => true,
            Mode::Stat => is_stat_cmd(cmd),
            Mode::StartStop => cmd == PERF_START_CMD && !on,
        }
    }

    fn perf_start(&mut self, i: usize, call_depth: i32) {
        let (n_insns, n_cycles) = (self.program.n_insns, self.program.n_cycles);
        let (perf_sp, pc) = (self.perf.sp, self.pc);

        let m = &mut self.perf.meters[i];
        if m.tag_for_start.kind.is_some() {
            m.tag = m.tag_for_start.clone();
        } else {
            m.tag.kind = None;
        }
        m.tag_for_start.kind = None;

        if m.mode == Mode::Unused {
            m.mode = Mode::StartStop;
            m.n = 0;
            m.insns = 0;
            m.ticks = 0;
            m.insn = MinMax::new(n_insns as i64);
            m.tick = MinMax::new(n_cycles as i64);
            m.calls = MinMax::new(i64::from(call_depth));
            m.sp = MinMax::new(i64::from(perf_sp));
            m.pc_start = pc;
            m.pc = MinMax::new(i64::from(pc));
        }

        m.on = true;
        m.call_only_sp = i64::MAX;
        m.call_only_insns = 0;
        m.call_only_ticks = 0;
        m.n += 1;
        m.insn.at_start = n_insns as i64;
        m.tick.at_start = n_cycles as i64;

        if !self.opts.quiet {
            self.perf.meters[i].tag.clone().print("", ", ");
            qprint!(self, ")\n");
        }
    }

    fn perf_stat(&mut self, i: usize, cmd: u8) {
        let m = &mut self.perf.meters[i];
        if m.tag_for_start.kind.is_some() {
            m.tag = m.tag_for_start.clone();
        } else {
            m.tag.kind = None;
        }
        m.tag_for_start.kind = None;

        if m.mode == Mode::Unused {
            m.mode = Mode::Stat;
            m.on = false;
            m.n = 0;
            m.val_ev = 0.0;
            m.val = MinMax::new(0);
        }

        let lay = values::layout(LogKind::S32);
        let sraw = self.get_r20_value(&lay) as i32;
        let uraw = sraw as u32;
        let dval = match cmd {
            PERF_STAT_U32_CMD => f64::from(uraw),
            PERF_STAT_S32_CMD => f64::from(sraw),
            _ => values::decode_avr_float(uraw).x,
        };

        let old_pc = self.trace.old_pc;
        let m = &mut self.perf.meters[i];
        m.n += 1;
        let (n, tag) = (m.n, m.tag.clone());
        m.val.update_double(dval, n, old_pc, &tag);
        m.val.ev2 += dval * dval;
        m.val_ev += dval;

        if !self.opts.quiet {
            qprint!(self, "Stat T{i} (value {n} = {}", format_e(dval));
            tag.print("", ", ");
            qprint!(self, ")\n");
        }
    }

    fn perf_stop(&mut self, i: usize, dump_all: bool, cmd: u8, call_depth: i32, sp: i32) {
        if cmd != PERF_DUMP_CMD {
            let m = &self.perf.meters[i];
            match (m.mode, m.on) {
                (Mode::Unused, _) => {
                    qprint!(self, "\n--- Stop T{i} ignored: -unused-\n");
                    return;
                }
                (Mode::StartStop, false) => {
                    qprint!(
                        self,
                        "\n--- Stop T{i} ignored: T{i} already stopped (after round {})\n",
                        m.n
                    );
                    return;
                }
                (Mode::Stat, _) => {
                    qprint!(
                        self,
                        "\n--- Stop T{i} ignored: T{i} used for Stat ({} Values)\n",
                        m.n
                    );
                    return;
                }
                _ => {}
            }
        }

        let (n_insns, perf_tick) = (self.program.n_insns, self.perf.tick);
        let old_old_pc = self.trace.old_old_pc;

        let m = &mut self.perf.meters[i];
        if m.mode != Mode::StartStop || !m.on {
            return;
        }
        m.on = false;
        m.pc_end = old_old_pc;
        m.pc.at_end = i64::from(old_old_pc);
        m.insn.at_end = n_insns as i64 - 1;
        m.tick.at_end = perf_tick as i64;
        m.calls.at_end = i64::from(call_depth);
        m.sp.at_end = i64::from(sp);

        let (ticks, insns) = if m.call_only_sp == i64::MAX {
            (m.tick.at_end - m.tick.at_start, m.insn.at_end - m.insn.at_start)
        } else {
            (m.call_only_ticks as i64, m.call_only_insns as i64)
        };
        m.tick.ev2 += (ticks * ticks) as f64;
        m.insn.ev2 += (insns * insns) as f64;
        m.ticks += ticks as u64;
        m.insns += insns as u64;
        let (n, tag) = (m.n, m.tag.clone());
        let old_pc = self.trace.old_pc;
        let m = &mut self.perf.meters[i];
        m.insn.update(insns, n, old_pc, &tag);
        m.tick.update(ticks, n, old_pc, &tag);
        let (pc_at_start, pc_at_end) = (m.pc.at_start, m.pc.at_end);

        qprint!(
            self,
            "{}Stop T{i} (round {n}",
            if dump_all { "  " } else { "\n--- " }
        );
        if !self.opts.quiet {
            tag.print("", ", ");
        }
        qprint!(
            self,
            ", {:04x}--{:04x}, {ticks} Ticks)\n",
            2 * pc_at_start,
            2 * pc_at_end
        );
    }

    fn perf_dump(&mut self, i: usize, dump_all: bool) {
        let m = &self.perf.meters[i];
        if m.mode == Mode::Unused {
            if !dump_all {
                print!(" Timer T{i} \"{}\": -unused-\n\n", m.label);
            }
            return;
        }

        let c = m.calls.at_start;
        let s = m.sp.at_start;

        if m.mode == Mode::StartStop {
            print!(
                " Timer T{i} \"{}\" ({} round{}):  {:04x}--{:04x}\n\
                 \x20             Instructions        Ticks\n\
                 \x20   Total:      {:7}         {:7}\n",
                m.label,
                m.n,
                if m.n == 1 { "" } else { "s" },
                2 * m.pc_start,
                2 * m.pc_end,
                m.insns,
                m.ticks
            );

            if m.n > 1 {
                // Var(X) = E(X^2) - E^2(X)
                let n = f64::from(m.n);
                let e_x2 = m.tick.ev2 / n;
                let e_x = m.ticks as f64 / n;
                let tick_sigma = (e_x2 - e_x * e_x).max(0.0).sqrt();
                let e_x2 = m.insn.ev2 / n;
                let e_x = m.insns as f64 / n;
                let insn_sigma = (e_x2 - e_x * e_x).max(0.0).sqrt();

                print!(
                    "    Mean:       {:7}         {:7}\n\
                     \x20   Stand.Dev:  {:7.1}         {:7.1}\n\
                     \x20   Min:        {:7}         {:7}\n\
                     \x20   Max:        {:7}         {:7}\n",
                    m.insns / m.n as u64,
                    m.ticks / m.n as u64,
                    insn_sigma,
                    tick_sigma,
                    m.insn.min,
                    m.tick.min,
                    m.insn.max,
                    m.tick.max
                );
            }

            print!(
                "    Calls (abs) in [{:4},{:4}] was:{:4} now:{:4}\n\
                 \x20   Calls (rel) in [{:4},{:4}] was:{:4} now:{:4}\n\
                 \x20   Stack (abs) in [{:04x},{:04x}] was:{:04x} now:{:04x}\n\
                 \x20   Stack (rel) in [{:4},{:4}] was:{:4} now:{:4}\n",
                m.calls.min,
                m.calls.max,
                c,
                m.calls.at_end,
                m.calls.min - c,
                m.calls.max - c,
                0,
                m.calls.at_end - c,
                m.sp.max,
                m.sp.min,
                s,
                m.sp.at_end,
                s - m.sp.max,
                s - m.sp.min,
                0,
                s - m.sp.at_end
            );

            if m.n > 1 {
                print!(
                    "\n           Min round Max round    Min tag           /   Max tag\n"
                );
                for (mm, text) in [
                    (m.calls.clone(), "    Calls  "),
                    (m.sp.clone(), "    Stack  "),
                    (m.insn.clone(), "    Instr. "),
                    (m.tick.clone(), "    Ticks  "),
                ] {
                    print!("{text}");
                    if mm.r_min == mm.r_max {
                        print!("     -all-same-                          /\n");
                    } else {
                        print!("{:9} {:9}", mm.r_min, mm.r_max);
                        let pos = mm.tag_min.print("    -no-tag-         ", "    ");
                        print!("{:>w$}", " / ", w = 20usize.saturating_sub(pos));
                        mm.tag_max.print("  -no-tag-", "   ");
                        println!();
                    }
                }
            }
        } else {
            let n = f64::from(m.n);
            let e_x2 = m.val.ev2 / n;
            let e_x = m.val_ev / n;
            let val_sigma = (e_x2 - e_x * e_x).max(0.0).sqrt();
            print!(
                " Stat  T{i} \"{}\" ({} Value{})\n",
                m.label,
                m.n,
                if m.n == 1 { "" } else { "s" }
            );
            print!(
                "    Mean:       {}     round    tag\n    Stand.Dev:  {}\n",
                format_e(e_x),
                format_e(val_sigma)
            );
            print!("    Min:        {}  {:8}", format_e(m.val.dmin), m.val.r_min);
            m.val.tag_min.print(" -no-tag-", "    ");
            print!("\n    Max:        {}  {:8}", format_e(m.val.dmax), m.val.r_max);
            m.val.tag_max.print(" -no-tag-", "    ");
            println!();
        }

        println!();

        let m = &mut self.perf.meters[i];
        m.mode = Mode::Unused;
        m.label.clear();
    }

    /// Runs after every instruction while any meter is on or a perf
    /// command is pending.
    pub(crate) fn perf_instruction(&mut self, _id: Op, call_depth: i32) {
        self.perf.will_be_on = false;

        let sp = i32::from(self.nonglitch_sp());

        let pmask = self.perf.pmask;
        if self.perf.on || pmask != 0 {
            self.perf.pmask = 0;
            self.perf.on = false;

            let cmd = self.perf.cmd;
            if cmd == PERF_DUMP_CMD {
                self.perf.n_dumps += 1;
                print!("\n--- Dump # {}:\n", self.perf.n_dumps);
            }
            let dump_all = cmd == PERF_DUMP_CMD && pmask == PERF_ALL;

            for i in 1..NUM_PERFS {
                let imask = (1u32 << i) & pmask;
                let (mut start, mut stat, mut stop, mut dump) = (false, false, false, false);
                if imask != 0 {
                    match cmd {
                        PERF_START_CMD | PERF_START_CALL_CMD => start = true,
                        PERF_STOP_CMD => stop = true,
                        PERF_DUMP_CMD => dump = true,
                        PERF_STAT_U32_CMD | PERF_STAT_S32_CMD | PERF_STAT_FLOAT_CMD => {
                            stat = true
                        }
                        _ => {}
                    }
                }

                // PERF_START_CALL: only account costs (including the
                // CALL and RET) while the call depth is below the
                // starting point.
                {
                    let perf_sp = self.perf.sp;
                    let tick_before = self.perf.tick;
                    let n_cycles = self.program.n_cycles;
                    let m = &mut self.perf.meters[i];
                    if m.on
                        && m.call_only_sp < i64::MAX
                        && (i64::from(sp) < m.call_only_sp
                            || i64::from(perf_sp) < m.call_only_sp)
                    {
                        m.call_only_insns += 1;
                        m.call_only_ticks += n_cycles - tick_before;
                    }
                }

                if stop || dump {
                    self.perf_stop(i, dump_all, cmd, call_depth, sp);
                }
                if dump {
                    self.perf_dump(i, dump_all);
                }

                {
                    let old_pc = self.trace.old_pc;
                    let m = &mut self.perf.meters[i];
                    if m.on {
                        let (n, tag) = (m.n, m.tag.clone());
                        m.sp.update(i64::from(sp), n, old_pc, &tag);
                        m.calls.update(i64::from(call_depth), n, old_pc, &tag);
                    }
                }

                if start && self.perf_may_use(i, PERF_START_CMD) {
                    self.perf_start(i, call_depth);
                    if cmd == PERF_START_CALL_CMD {
                        self.perf.meters[i].call_only_sp = i64::from(sp);
                    }
                } else if stat && self.perf_may_use(i, cmd) {
                    self.perf_stat(i, cmd);
                }

                self.perf.on |= self.perf.meters[i].on;
            }
        }

        // Keep the values from before the next instruction; the log
        // line must flush before these change.
        self.perf.sp = sp;
        self.perf.tick = self.program.n_cycles;
    }
}
