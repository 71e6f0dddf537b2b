//! Guest-driven instruction tracing.
//!
//! Every instruction builds one line (`addr: MNEMO (operand)->value ...`)
//! in a buffer that is flushed after the instruction executed, provided
//! logging is on at that point.  The guest toggles logging through
//! syscalls, so the buffer is filled speculatively whenever a syscall
//! might turn logging on mid-stream.

pub mod graph;
pub mod perf;

use std::fmt;

use crate::core::arch::Arch;
use crate::core::simulator::Simulator;
use crate::cpu::flags::SREG_NAMES;
use crate::cpu::{Decoded, Op};

/// Print unless `-q`; the counterpart of explicitly requested output,
/// which always prints.
macro_rules! qprint {
    ($sim:expr, $($arg:tt)*) => {
        if !$sim.opts.quiet {
            print!($($arg)*);
        }
    };
}
pub(crate) use qprint;

/// Append formatted text to the trace line (no-op while the trace is
/// unused).
macro_rules! tracef {
    ($t:expr, $($arg:tt)*) => {{
        use std::fmt::Write as _;
        let _ = write!($t, $($arg)*);
    }};
}
pub(crate) use tracef;

/// Which subsystems the run needs; everything off means the step loop
/// skips the bookkeeping entirely.
#[derive(Clone, Copy, Debug, Default)]
pub struct Need {
    pub perf: bool,
    pub logging: bool,
    pub graph: bool,
    pub graph_cost: bool,
    pub call_depth: bool,
}

/// Direction tag for operand traces.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum MovDir {
    Read,
    Write,
}

#[derive(Clone, Copy, Default)]
struct LogStackSlot {
    on: bool,
    perf: bool,
    count_val: u32,
    countdown: u32,
}

const LOG_STACK_SLOTS: usize = 100;

pub struct Trace {
    /// Line under construction for the current instruction.
    line: String,
    /// Logging currently on (mutable at runtime via syscalls).
    pub log_on: bool,
    /// Log only while a perf meter is running.
    pub perf_only: bool,
    /// LOG_SET(N): requested count.
    pub count_val: u32,
    /// LOG_SET(N): count down to zero, then stop logging.
    pub countdown: u32,
    /// Whether the previous instruction was logged.
    log_this: bool,
    /// Fill the buffer even though logging is (still) off, because a
    /// syscall may turn it on for this very instruction.
    maybe_log: bool,
    /// Nothing wants this instruction's trace; appends are dropped.
    pub unused: bool,
    pub need: Need,
    /// PC of the current / previous instruction (word addresses).
    pub old_pc: u32,
    pub old_old_pc: u32,
    /// Writes to SPL/SPH leave SP unreliable for a few instructions.
    pub maybe_sp_glitch: u8,
    nonglitch_sp: u16,
    log_stack: Vec<LogStackSlot>,
}

impl Trace {
    pub fn new() -> Self {
        Self {
            line: String::with_capacity(256),
            log_on: false,
            perf_only: false,
            count_val: 0,
            countdown: 0,
            log_this: false,
            maybe_log: true,
            unused: true,
            need: Need::default(),
            old_pc: 0,
            old_old_pc: 0,
            maybe_sp_glitch: 0,
            nonglitch_sp: 0,
            log_stack: Vec::new(),
        }
    }

    fn mask_to_bit(mask: u8) -> Option<u32> {
        (mask.count_ones() == 1).then(|| mask.trailing_zeros())
    }

    fn sreg_letters(value: u8) -> String {
        let mut s = String::new();
        for (bit, name) in SREG_NAMES.iter().enumerate() {
            if value & (1 << bit) != 0 {
                s.push(*name);
            }
        }
        s
    }

    /// Trace one data movement: `(R17)->0a `, `(SPL)<-5d `, ...
    pub fn add_mov(&mut self, arch: &Arch, dir: MovDir, addr: u32, value: u32, width: u8) {
        if self.unused {
            return;
        }
        let arrow = match dir {
            MovDir::Read => "->",
            MovDir::Write => "<-",
        };
        if addr == u32::from(arch.addr_sreg()) && width == 1 {
            tracef!(self, "(SREG){}{} ", arrow, Self::sreg_letters(value as u8));
            return;
        }
        let name = if addr < 32 {
            format!("R{addr}")
        } else if let Some(sfr) = arch.sfr_name(addr) {
            sfr.to_string()
        } else if addr < 256 {
            format!("{addr:02x}")
        } else {
            format!("{addr:04x}")
        };
        if width == 2 {
            tracef!(self, "({name}){arrow}{value:04x} ");
        } else {
            tracef!(self, "({name}){arrow}{value:02x} ");
        }
    }

    /// Trace an SREG update as its set-flag letters.
    pub fn add_sreg_write(&mut self, _arch: &Arch, sreg: u8) {
        if self.unused {
            return;
        }
        tracef!(self, "(SREG)<-{} ", Self::sreg_letters(sreg));
    }

    /// Trace a flag test, e.g. ` Z->1`.
    pub fn add_flag_read(&mut self, mask: u8, value: u8) {
        if self.unused {
            return;
        }
        if let Some(bit) = Self::mask_to_bit(mask) {
            tracef!(self, " {}->{}", SREG_NAMES[bit as usize], u8::from(value != 0));
        }
    }

    /// General-purpose append used by the host bridge and call graph.
    pub fn append(&mut self, s: &str) {
        if !self.unused {
            self.line.push_str(s);
        }
    }

    /// Flush the pending line at termination.
    pub fn flush_last_line(&mut self) {
        if self.log_this && !self.line.is_empty() {
            println!("{}", self.line);
        }
        self.line.clear();
    }

    /// Patch the generic mnemonic into the familiar spelling: bit
    /// numbers for the bit instructions, `BREQ`/`SEI`-style aliases
    /// for branches and SREG set/clear.
    fn patched_mnemonic(d: &Decoded) -> String {
        let base = d.id.info().mnemonic;
        let Some(stem) = base.strip_suffix('.') else {
            return base.to_string();
        };
        match d.id {
            Op::Bld | Op::Bst | Op::Sbi | Op::Cbi | Op::Sbic | Op::Sbic2 | Op::Sbis
            | Op::Sbis2 | Op::Sbrc | Op::Sbrc2 | Op::Sbrs | Op::Sbrs2 => {
                match Self::mask_to_bit(d.op2 as u8) {
                    Some(bit) => format!("{stem}.{bit}"),
                    None => stem.to_string(),
                }
            }
            Op::Brbs | Op::Brbc => {
                let set = d.id == Op::Brbs;
                match Self::mask_to_bit(d.op2 as u8) {
                    Some(1) => (if set { "BREQ" } else { "BRNE" }).to_string(),
                    Some(2) => (if set { "BRMI" } else { "BRPL" }).to_string(),
                    Some(4) => (if set { "BRLT" } else { "BRGE" }).to_string(),
                    Some(bit) => format!(
                        "BR{}{}",
                        SREG_NAMES[bit as usize],
                        if set { 'S' } else { 'C' }
                    ),
                    None => stem.to_string(),
                }
            }
            Op::Bset | Op::Bclr => match Self::mask_to_bit(d.op1) {
                Some(bit) => format!(
                    "{}{}",
                    if d.id == Op::Bset { "SE" } else { "CL" },
                    SREG_NAMES[bit as usize]
                ),
                None => stem.to_string(),
            },
            _ => stem.to_string(),
        }
    }
}

impl Default for Trace {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Write for Trace {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if !self.unused {
            self.line.push_str(s);
        }
        Ok(())
    }
}

impl Simulator {
    /// Decide the need flags from the options and the syscalls the
    /// program actually contains, and seed the host RNG.  Runs once
    /// after decode.
    pub fn init_logging(&mut self) {
        self.perf.init();
        self.host.seed_rng(u64::from(self.program.entry_point));

        let hs = &self.have_syscall;
        let mut need = Need::default();
        need.perf = hs[5] || hs[6];
        need.logging = self.opts.log
            || hs[1]
            || hs[10]
            || hs[11]
            || (hs[2] && need.perf)
            || hs[3];
        need.graph_cost = self.opts.graph;
        need.call_depth = need.graph_cost || need.logging || need.perf;
        need.graph = need.call_depth;

        self.trace.need = need;
        self.trace.log_on = self.opts.log && need.logging;
        self.trace.maybe_log = true;

        // Startup code reads the top RAM byte to detect that it runs
        // under a log-capable simulator (e.g. to request its argv).
        self.ram[0xFFFF] = 1;
    }

    /// SP as the perf subsystem should see it: frozen across the
    /// glitch window after SPL/SPH writes.
    pub fn nonglitch_sp(&mut self) -> u16 {
        if self.trace.maybe_sp_glitch == 0 {
            self.trace.nonglitch_sp = self.sp();
        }
        self.trace.nonglitch_sp
    }

    /// Runs before an instruction executes: advance the PC history,
    /// age the SP glitch window, and open the trace line.
    pub(crate) fn pre_instruction(&mut self, d: &Decoded) {
        self.trace.old_old_pc = self.trace.old_pc;
        self.trace.old_pc = self.pc;

        if self.trace.maybe_sp_glitch > 0 {
            self.trace.maybe_sp_glitch -= 1;
            // These never occur inside an explicit SP adjustment, so
            // they end the window at once: IJMP is from longjmp or
            // __prologue_saves__, RET from __epilogue_restores__.
            if matches!(
                d.id,
                Op::Ret | Op::Ijmp | Op::Eijmp | Op::Rcall | Op::Call | Op::Push | Op::Pop
            ) {
                self.trace.maybe_sp_glitch = 0;
            }
        }

        // Syscalls 0..3, 5 and 10/11 might turn logging on; always
        // buffer those so the enabling command itself shows up.
        const SYSMASK: u32 = 0xF | (1 << 5) | (1 << 10) | (1 << 11);
        let maybe_used = self.trace.maybe_log
            || (d.id == Op::Syscall && d.op1 < 32 && SYSMASK & (1u32 << d.op1) != 0);
        self.trace.unused = !maybe_used || !self.trace.need.logging;
        if self.trace.unused {
            return;
        }

        let pc_strlen = if self.arch.flash_addr_mask > 0xFFFF { 6 } else { 4 };
        if d.id == Op::Undef {
            let t = &mut self.trace;
            tracef!(t, "{:0w$x}: ", 2 * self.pc, w = pc_strlen);
            return;
        }
        let mnemo = Trace::patched_mnemonic(d);
        let t = &mut self.trace;
        tracef!(t, "{:0w$x}: {:<7} ", 2 * self.pc, mnemo, w = pc_strlen);
    }

    /// Runs after an instruction executed: flush the trace line, then
    /// feed the call-graph and perf hooks.
    pub(crate) fn post_instruction(&mut self, d: &Decoded) {
        if self.trace.countdown > 0 {
            self.trace.countdown -= 1;
            if self.trace.countdown == 0 {
                self.trace.log_on = false;
                qprint!(self, "*** done log {}\n", self.trace.count_val);
            }
        }

        let log_this = self.trace.log_on
            || (self.trace.perf_only && (self.perf.on || self.perf.will_be_on));
        if log_this || log_this != self.trace.log_this {
            self.trace.maybe_log = true;
            if !self.trace.line.is_empty() {
                println!("{}", self.trace.line);
            }
        } else {
            self.trace.maybe_log = false;
        }
        self.trace.log_this = log_this;
        self.trace.line.clear();

        let call_depth = if self.trace.need.call_depth {
            self.graph_update_call_depth(d)
        } else {
            0
        };

        if self.trace.need.perf {
            self.perf_instruction(d.id, call_depth);
        }
    }

    /// Set the logging state (syscalls 0..3).
    pub(crate) fn set_logging(&mut self, on: bool, perf_only: bool, countdown: u32) {
        self.trace.log_on = on;
        self.trace.perf_only = perf_only;
        self.trace.countdown = countdown;
    }

    /// Log-state stack (syscalls 9/10/11): push the current state and
    /// force logging off/on, or pop the saved state back.
    pub(crate) fn log_push(&mut self, sysno: u8, on: bool) {
        let t = &mut self.trace;
        tracef!(t, "log push {}", if on { "On" } else { "Off" });
        if self.trace.log_stack.len() < LOG_STACK_SLOTS {
            let slot = LogStackSlot {
                on: self.trace.log_on,
                perf: self.trace.perf_only,
                count_val: self.trace.count_val,
                countdown: self.trace.countdown,
            };
            self.trace.log_stack.push(slot);
            let depth = self.trace.log_stack.len();
            let t = &mut self.trace;
            tracef!(t, " #{depth}");
            if slot.perf {
                tracef!(t, " (perf)");
            }
            if slot.on && slot.countdown != 0 {
                tracef!(t, " ({} / {}) ", slot.countdown, slot.count_val);
            }
            self.set_logging(on, false, 0);
            self.trace.count_val = 0;
        } else {
            let t = &mut self.trace;
            tracef!(t, " (stack #{LOG_STACK_SLOTS} overflow)");
            if !self.trace.log_on {
                qprint!(
                    self,
                    "*** syscall #{} 0x{:04x}: log push (stack #{} overflow)\n",
                    sysno,
                    2 * self.pc,
                    LOG_STACK_SLOTS
                );
            }
        }
    }

    pub(crate) fn log_pop(&mut self, sysno: u8) {
        let t = &mut self.trace;
        tracef!(t, "log pop ");
        match self.trace.log_stack.pop() {
            Some(slot) => {
                let depth = self.trace.log_stack.len() + 1;
                let t = &mut self.trace;
                tracef!(t, "{} #{depth}", if slot.on { "On" } else { "Off" });
                self.trace.count_val = slot.count_val;
                self.set_logging(slot.on, slot.perf, slot.countdown);
                let t = &mut self.trace;
                if slot.perf {
                    tracef!(t, " (perf)");
                }
                if slot.on && slot.countdown != 0 {
                    tracef!(t, " ({} / {})", slot.countdown, slot.count_val);
                }
            }
            None => {
                let t = &mut self.trace;
                tracef!(t, "(stack underflow)");
                if !self.trace.log_on {
                    qprint!(
                        self,
                        "*** syscall #{} 0x{:04x}: log pop (stack underflow)\n",
                        sysno,
                        2 * self.pc
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sreg_letters_render_set_bits() {
        assert_eq!(Trace::sreg_letters(0b0000_0011), "CZ");
        assert_eq!(Trace::sreg_letters(0x80), "I");
        assert_eq!(Trace::sreg_letters(0), "");
    }

    #[test]
    fn mnemonic_patching() {
        let d = Decoded { id: Op::Sbrc, op1: 10, op2: 1 << 3 };
        assert_eq!(Trace::patched_mnemonic(&d), "SBRC.3");
        let d = Decoded { id: Op::Brbs, op1: 0xFE, op2: 1 << 1 };
        assert_eq!(Trace::patched_mnemonic(&d), "BREQ");
        let d = Decoded { id: Op::Brbc, op1: 2, op2: 1 << 0 };
        assert_eq!(Trace::patched_mnemonic(&d), "BRCC");
        let d = Decoded { id: Op::Bset, op1: 0x80, op2: 0 };
        assert_eq!(Trace::patched_mnemonic(&d), "SEI");
        let d = Decoded { id: Op::Bclr, op1: 0x02, op2: 0 };
        assert_eq!(Trace::patched_mnemonic(&d), "CLZ");
        let d = Decoded { id: Op::Add, op1: 0, op2: 1 };
        assert_eq!(Trace::patched_mnemonic(&d), "ADD");
    }
}
