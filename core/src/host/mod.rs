//! The host bridge: magic-port protocols and the in-band syscalls.
//!
//! Guest programs reach the host in two ways.  Byte writes to the LOG
//! and TICKS ports drive small command protocols, and the reserved
//! `CPSE Rd,Rd; .word 0xFFFF` sequence is "syscall Rd", dispatched
//! here with its arguments in the register file.

pub mod fileio;
pub mod values;

use std::io::{Read, Write};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::core::program::Leave;
use crate::core::simulator::Simulator;
use crate::cpu::Step;
use crate::host::values::{CVal, LogKind};
use crate::trace::{qprint, tracef};

const LEN_LOG_STRING: usize = 500;
const LEN_LOG_XFMT: usize = 500;

// TICKS port commands: low bits select what to read, bit 7 resets.
pub const TICKS_GET_CYCLES_CMD: u8 = 0;
pub const TICKS_GET_INSNS_CMD: u8 = 1;
pub const TICKS_GET_PRAND_CMD: u8 = 2;
pub const TICKS_GET_RAND_CMD: u8 = 3;
pub const TICKS_RESET_ALL_CMD: u8 = 0x80;
pub const TICKS_RESET_CYCLES_CMD: u8 = 1;
pub const TICKS_RESET_INSNS_CMD: u8 = 2;
pub const TICKS_RESET_PRAND_CMD: u8 = 4;

// LOG port: bits 7..6 = 3 selects the config commands below (6-bit
// argument); any other value is a perf command.
const LOG_CMD_SHIFT: u8 = 6;
const LOG_CONFIG: u8 = 3;
const LOG_NUM_STOP: u8 = 0;
const LOG_NUM_START: u8 = 0x3F;
const LOG_NUM_PERF: u8 = 0x3E;
const LOG_NUM_GET_ARGS: u8 = 0x3D;

/// 32-bit reads from the TICKS port, latched at command-write time.
pub struct TicksPort {
    base_cycles: u64,
    base_insns: u64,
    pvalue: u32,
    pub latch: [u8; 4],
}

impl TicksPort {
    fn new() -> Self {
        Self {
            base_cycles: 0,
            base_insns: 0,
            pvalue: 0,
            latch: [0; 4],
        }
    }
}

/// LOG_GET_ARGS sends a 2-byte RAM address after the command byte.
enum ArgsPump {
    Idle,
    WaitLo,
    WaitHi(u8),
}

pub struct HostState {
    pub ticks: TicksPort,
    pub files: fileio::FileTable,
    rng: StdRng,
    args_pump: ArgsPump,
    /// Custom format for the next (1), all (-1) or no (0) log values.
    fmt_once: i8,
    xfmt: String,
}

impl HostState {
    pub fn new() -> Self {
        Self {
            ticks: TicksPort::new(),
            files: fileio::FileTable::new(),
            rng: StdRng::seed_from_u64(0),
            args_pump: ArgsPump::Idle,
            fmt_once: 0,
            xfmt: String::new(),
        }
    }

    pub fn seed_rng(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }
}

impl Default for HostState {
    fn default() -> Self {
        Self::new()
    }
}

fn escape_for_display(s: &str) -> String {
    let mut out = String::new();
    for c in s.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    out
}

impl Simulator {
    /// Blocking byte read from host stdin for the STDIN port.
    pub(crate) fn host_stdin_byte(&mut self) -> u8 {
        if !self.opts.stdin_enabled {
            return 0xFF;
        }
        let mut buf = [0u8; 1];
        match std::io::stdin().read(&mut buf) {
            Ok(1) => buf[0],
            _ => 0xFF,
        }
    }

    /// Byte write to host stdout for the STDOUT port.
    pub(crate) fn host_stdout_byte(&mut self, value: u8) {
        let mut out = std::io::stdout();
        let _ = out.write_all(&[value]);
        if self.opts.flush {
            let _ = out.flush();
        }
    }

    /// A command byte written to the TICKS port: latch a 32-bit value
    /// (also mirrored to R22..R25) or reset the counters.
    pub(crate) fn host_ticks_cmd(&mut self, cfg: u8) {
        if cfg & TICKS_RESET_ALL_CMD != 0 {
            {
                let t = &mut self.trace;
                tracef!(t, "ticks reset:");
            }
            if cfg & TICKS_RESET_CYCLES_CMD != 0 {
                let t = &mut self.trace;
                tracef!(t, " cycles");
                self.host.ticks.base_cycles = self.program.n_cycles;
            }
            if cfg & TICKS_RESET_INSNS_CMD != 0 {
                let t = &mut self.trace;
                tracef!(t, " insns");
                self.host.ticks.base_insns = self.program.n_insns;
            }
            if cfg & TICKS_RESET_PRAND_CMD != 0 {
                let t = &mut self.trace;
                tracef!(t, " prand");
                self.host.ticks.pvalue = 0;
            }
            return;
        }

        // Multiplicative generator over the prime field 0xfffffffb
        // with primitive root 0xcafebabe.
        const PRAND_M: u64 = 0xFFFF_FFFB;
        const PRAND_ROOT: u64 = 0xCAFE_BABE;

        let (what, value) = match cfg & 0x03 {
            TICKS_GET_CYCLES_CMD => (
                "cycles",
                (self.program.n_cycles - self.host.ticks.base_cycles) as u32,
            ),
            TICKS_GET_INSNS_CMD => (
                "insn",
                (self.program.n_insns - self.host.ticks.base_insns) as u32,
            ),
            TICKS_GET_PRAND_CMD => {
                let seed = if self.host.ticks.pvalue != 0 {
                    self.host.ticks.pvalue
                } else {
                    1
                };
                let value = ((u64::from(seed) * PRAND_ROOT) % PRAND_M) as u32;
                self.host.ticks.pvalue = value;
                ("prand", value)
            }
            _ => ("rand", self.host.rng.r#gen::<u32>()),
        };

        {
            let t = &mut self.trace;
            tracef!(t, "ticks get {what}: R22<-({value:08x}) = {value}");
        }
        self.host.ticks.latch = value.to_le_bytes();
        self.ram[22..26].copy_from_slice(&value.to_le_bytes());
    }

    /// A byte written to the LOG port.
    pub(crate) fn host_log_port(&mut self, value: u8) -> Result<(), Leave> {
        match self.host.args_pump {
            ArgsPump::WaitLo => {
                self.host.args_pump = ArgsPump::WaitHi(value);
                return Ok(());
            }
            ArgsPump::WaitHi(lo) => {
                self.host.args_pump = ArgsPump::Idle;
                let addr = u16::from(lo) | (u16::from(value) << 8);
                self.put_argv(addr);
                return Ok(());
            }
            ArgsPump::Idle => {}
        }

        if value >> LOG_CMD_SHIFT == LOG_CONFIG {
            match value & 0x3F {
                LOG_NUM_STOP => {
                    let t = &mut self.trace;
                    tracef!(t, "log Off");
                    self.set_logging(false, false, 0);
                }
                LOG_NUM_START => {
                    let t = &mut self.trace;
                    tracef!(t, "log On");
                    self.set_logging(true, false, 0);
                }
                LOG_NUM_PERF => {
                    let t = &mut self.trace;
                    tracef!(t, "performance log");
                    self.set_logging(false, true, 0);
                }
                LOG_NUM_GET_ARGS => {
                    self.host.args_pump = ArgsPump::WaitLo;
                }
                n => {
                    self.trace.count_val = u32::from(n);
                    let t = &mut self.trace;
                    tracef!(t, "start log {n}");
                    self.set_logging(true, false, 1 + u32::from(n));
                }
            }
        } else {
            // Perf commands: 2-bit command in bits 5..4, meter in the
            // low nibble.
            self.sys_perf_cmd(value & 0x3F);
        }
        Ok(())
    }

    /// Dispatch "syscall N" (`CPSE Rd,Rd` over the invalid opcode,
    /// N = Rd).
    pub(crate) fn do_syscall(&mut self, sysno: u8) -> Step {
        let val = u32::from(self.reg(24)) | (u32::from(self.reg(25)) << 8);

        match sysno {
            0 => {
                let t = &mut self.trace;
                tracef!(t, "log Off");
                self.set_logging(false, false, 0);
            }
            1 => {
                let t = &mut self.trace;
                tracef!(t, "log On");
                self.set_logging(true, false, 0);
            }
            2 => {
                let t = &mut self.trace;
                tracef!(t, "performance log");
                self.set_logging(false, true, 0);
            }
            3 => {
                let count = if val != 0 { val } else { 0x10000 };
                self.trace.count_val = count;
                let t = &mut self.trace;
                tracef!(t, "start log {count}");
                self.set_logging(true, false, 1 + count);
            }
            5 => self.sys_perf_cmd(self.reg(24)),
            6 => self.sys_perf_tag_cmd(self.reg(24)),
            7 => self.sys_log_dump(self.reg(24)),
            9 => self.log_push(9, false),
            10 => self.log_push(10, true),
            11 => self.log_pop(11),
            21 => self.sys_misc_arith(),
            24 => {
                if self.opts.stderr_enabled {
                    let mut err = std::io::stderr();
                    let _ = err.write_all(&[self.reg(24)]);
                    if self.opts.flush {
                        let _ = err.flush();
                    }
                }
            }
            26 => self.sys_fileio()?,
            28 => {
                let c: i16 = if self.opts.stdin_enabled {
                    let mut buf = [0u8; 1];
                    match std::io::stdin().read(&mut buf) {
                        Ok(1) => i16::from(buf[0]),
                        _ => -1,
                    }
                } else {
                    -1
                };
                self.ram[24..26].copy_from_slice(&c.to_le_bytes());
            }
            29 => {
                if self.opts.stdout_enabled {
                    let byte = self.reg(24);
                    self.host_stdout_byte(byte);
                }
            }
            _ => {
                let t = &mut self.trace;
                tracef!(t, "void ");
                qprint!(self, "*** syscall #{sysno}: void\n");
            }
        }
        Ok(())
    }

    /// Syscall 7: print one typed value from R20 (R18 for the 8-byte
    /// kinds), honoring a pending custom format.
    fn sys_log_dump(&mut self, what: u8) {
        let Some(kind) = LogKind::from_u8(what) else {
            let t = &mut self.trace;
            tracef!(t, "log: invalid cmd {what}");
            return;
        };

        let lay = values::layout(kind);
        let val = self.get_r20_value(&lay);
        let fmt: String = if self.host.fmt_once != 0 {
            self.host.xfmt.clone()
        } else {
            lay.fmt.to_string()
        };
        if self.host.fmt_once == 1 {
            self.host.fmt_once = 0;
        }

        match kind {
            LogKind::SetFmtOnce | LogKind::SetPfmtOnce => {
                let t = &mut self.trace;
                tracef!(t, "log set format");
                self.host.fmt_once = 1;
                self.host.xfmt = self.read_guest_string(val, lay.in_rom, LEN_LOG_XFMT);
            }
            LogKind::SetFmt | LogKind::SetPfmt => {
                let t = &mut self.trace;
                tracef!(t, "log set format");
                self.host.fmt_once = -1;
                self.host.xfmt = self.read_guest_string(val, lay.in_rom, LEN_LOG_XFMT);
            }
            LogKind::UnsetFmt => {
                let t = &mut self.trace;
                tracef!(t, "log unset format");
                self.host.fmt_once = 0;
            }
            LogKind::Str | LogKind::Pstr => {
                let t = &mut self.trace;
                tracef!(t, "log string");
                let s = self.read_guest_string(val, lay.in_rom, LEN_LOG_STRING);
                print!("{}", values::format_c(&fmt, CVal::S(&s)));
            }
            LogKind::Float => {
                let t = &mut self.trace;
                tracef!(t, "log float");
                let f = values::decode_avr_float(val);
                print!("{}", values::format_c(&fmt, CVal::F(f.x)));
            }
            LogKind::D64 => {
                let t = &mut self.trace;
                tracef!(t, "log double");
                let f = values::decode_avr_double(self.get_r18_value(&lay));
                print!("{}", values::format_c(&fmt, CVal::F(f.x)));
            }
            LogKind::U64 | LogKind::X64 => {
                let t = &mut self.trace;
                tracef!(t, "log {}-byte value", lay.size);
                let v = self.get_r18_value(&lay);
                print!("{}", values::format_c(&fmt, CVal::U(v)));
            }
            LogKind::S64 => {
                let t = &mut self.trace;
                tracef!(t, "log {}-byte value", lay.size);
                let v = self.get_r18_value(&lay) as i64;
                print!("{}", values::format_c(&fmt, CVal::I(v)));
            }
            LogKind::TagFmt | LogKind::TagPfmt => {
                let t = &mut self.trace;
                tracef!(t, "log: invalid cmd {what}");
            }
            _ => {
                let t = &mut self.trace;
                tracef!(t, "log {}-byte value", lay.size);
                if lay.signed {
                    print!("{}", values::format_c(&fmt, CVal::I(i64::from(val as i32))));
                } else {
                    print!("{}", values::format_c(&fmt, CVal::U(u64::from(val))));
                }
            }
        }
    }

    /// Syscall 21: 32/64-bit multiply, divide and modulo with libgcc
    /// corner-case semantics, for arithmetic validation programs.
    /// Selector in R26, operands and result per the avr-gcc call ABI.
    fn sys_misc_arith(&mut self) {
        let op = self.reg(26);
        {
            let t = &mut self.trace;
            tracef!(t, "misc arith #{op}");
        }

        if op < 8 {
            let a = u32::from_le_bytes([self.ram[22], self.ram[23], self.ram[24], self.ram[25]]);
            let b = u32::from_le_bytes([self.ram[18], self.ram[19], self.ram[20], self.ram[21]]);
            let (sa, sb) = (a as i32, b as i32);
            let r = match op {
                0 => a.wrapping_mul(b),
                1 => sa.wrapping_mul(sb) as u32,
                2 => {
                    if b == 0 {
                        u32::MAX
                    } else {
                        a / b
                    }
                }
                3 => {
                    if b == 0 {
                        -1i32 as u32
                    } else {
                        sa.wrapping_div(sb) as u32
                    }
                }
                4 => {
                    if b == 0 {
                        a
                    } else {
                        a % b
                    }
                }
                5 => {
                    if b == 0 {
                        a
                    } else {
                        sa.wrapping_rem(sb) as u32
                    }
                }
                _ => {
                    qprint!(self, "*** syscall #21: unknown op {op}\n");
                    return;
                }
            };
            self.ram[22..26].copy_from_slice(&r.to_le_bytes());
        } else {
            let mut a8 = [0u8; 8];
            let mut b8 = [0u8; 8];
            a8.copy_from_slice(&self.ram[18..26]);
            b8.copy_from_slice(&self.ram[10..18]);
            let a = u64::from_le_bytes(a8);
            let b = u64::from_le_bytes(b8);
            let (sa, sb) = (a as i64, b as i64);
            let r = match op {
                8 => a.wrapping_mul(b),
                9 => sa.wrapping_mul(sb) as u64,
                10 => {
                    if b == 0 {
                        u64::MAX
                    } else {
                        a / b
                    }
                }
                11 => {
                    if b == 0 {
                        -1i64 as u64
                    } else {
                        sa.wrapping_div(sb) as u64
                    }
                }
                12 => {
                    if b == 0 {
                        a
                    } else {
                        a % b
                    }
                }
                13 => {
                    if b == 0 {
                        a
                    } else {
                        sa.wrapping_rem(sb) as u64
                    }
                }
                _ => {
                    qprint!(self, "*** syscall #21: unknown op {op}\n");
                    return;
                }
            };
            self.ram[18..26].copy_from_slice(&r.to_le_bytes());
        }
    }

    /// Materialize the guest's argv at `args_addr`: the strings, the
    /// pointer array, then argc/argv/env in R24/R22/R20 where the
    /// startup code picks them up.
    fn put_argv(&mut self, args_addr: u16) {
        let mut argv: Vec<String> = vec![self.program.short_name.clone()];
        argv.extend(self.opts.guest_args.iter().cloned());
        let argc = argv.len();

        let mut a = u32::from(args_addr);
        let mut string_addrs = Vec::with_capacity(argc);
        for (i, arg) in argv.iter().enumerate() {
            qprint!(
                self,
                "*** ({:04x}) <-- *argv[{}] = \"{}\"\n",
                a,
                i,
                escape_for_display(arg)
            );
            string_addrs.push(a as u16);
            for b in arg.bytes() {
                self.ram[(a & 0xFFFF) as usize] = b;
                a += 1;
            }
            self.ram[(a & 0xFFFF) as usize] = 0;
            a += 1;
        }

        let avr_argv = a as u16;
        for (i, sa) in string_addrs.iter().enumerate() {
            qprint!(self, "*** ({:04x}) <-- argv[{}] = {:04x}\n", a, i, sa);
            self.ram[(a & 0xFFFF) as usize] = *sa as u8;
            self.ram[((a + 1) & 0xFFFF) as usize] = (sa >> 8) as u8;
            a += 2;
        }
        qprint!(self, "*** ({:04x}) <-- argv[{}] = NULL\n", a, argc);
        self.ram[(a & 0xFFFF) as usize] = 0;
        self.ram[((a + 1) & 0xFFFF) as usize] = 0;

        qprint!(
            self,
            "*** -args: at=0x{:04x}, argc=R24={}, argv=R22=0x{:04x}, env=R20=1\n",
            args_addr,
            argc,
            avr_argv
        );

        self.ram[24..26].copy_from_slice(&(argc as u16).to_le_bytes());
        self.ram[22..24].copy_from_slice(&avr_argv.to_le_bytes());
        self.ram[20] = 1;
    }
}
