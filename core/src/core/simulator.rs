//! The owning simulator state and the single-stepping engine.

use crate::core::arch::Arch;
use crate::core::memory::{MAX_EEPROM_SIZE, MAX_FLASH_SIZE, MAX_RAM_SIZE, PC_VALID_MASK};
use crate::core::options::RunOptions;
use crate::core::program::{Leave, Program};
use crate::cpu::{Decoded, OPCODES, Op};
use crate::host::HostState;
use crate::trace::Trace;
use crate::trace::graph::CallGraph;
use crate::trace::perf::Perf;

/// All simulator state: guest memories, the pre-decoded flash, the
/// execution counters, and the bookkeeping subsystems (trace, call
/// graph, perf meters, host bridge).  Opcode handlers are methods on
/// this struct.
pub struct Simulator {
    pub arch: Arch,
    pub opts: RunOptions,
    pub program: Program,

    /// Registers, I/O file and SRAM in one flat data space.
    pub ram: Box<[u8]>,
    pub flash: Box<[u8]>,
    pub eeprom: Box<[u8]>,
    /// One record per flash word; never-decoded slots hold [`Op::None`].
    pub decoded: Box<[Decoded]>,

    /// Program counter as a word address.
    pub pc: u32,
    /// Which in-band syscall numbers occur in the program.
    pub have_syscall: [bool; 32],

    pub trace: Trace,
    pub graph: CallGraph,
    pub perf: Perf,
    pub host: HostState,
}

impl Simulator {
    pub fn new(arch: Arch, opts: RunOptions) -> Self {
        let mut arch = arch;
        if let Some(offset) = opts.flash_pm_offset {
            arch.flash_pm_offset = offset;
        }

        let mut program = Program::new();
        program.max_insns = opts.max_insns;
        program.flash_size = opts
            .flash_size
            .unwrap_or(arch.flash_addr_mask + 1)
            .min(MAX_FLASH_SIZE as u32);
        if let Some(path) = &opts.program_path {
            program.name = path.display().to_string();
            program.short_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| program.name.clone());
        }

        Self {
            arch,
            opts,
            program,
            ram: vec![0u8; MAX_RAM_SIZE].into_boxed_slice(),
            flash: vec![0u8; MAX_FLASH_SIZE].into_boxed_slice(),
            eeprom: vec![0u8; MAX_EEPROM_SIZE].into_boxed_slice(),
            decoded: vec![Decoded::default(); MAX_FLASH_SIZE / 2].into_boxed_slice(),
            pc: 0,
            have_syscall: [false; 32],
            trace: Trace::new(),
            graph: CallGraph::new(),
            perf: Perf::new(),
            host: HostState::new(),
        }
    }

    /// Execute one instruction: fetch the decoded record, advance PC,
    /// charge the static cycle cost, dispatch, then run the trace /
    /// graph / perf hooks.
    pub fn do_step(&mut self) -> Result<(), Leave> {
        let d = self.decoded[(self.pc & PC_VALID_MASK) as usize];
        if d.id == Op::None {
            return Err(Leave::aborted("program counter out of program space"));
        }

        self.pre_instruction(&d);

        let info = &OPCODES[d.id as usize];
        self.pc = (self.pc + u32::from(info.words)) & PC_VALID_MASK;
        self.program.n_cycles += u64::from(info.cycles);
        self.program.n_insns += 1;

        (info.exec)(self, d.op1, d.op2)?;

        self.post_instruction(&d);
        Ok(())
    }

    /// Run until the guest terminates or the instruction budget runs
    /// out, finalize, and return the termination.
    pub fn run(&mut self) -> Leave {
        let leave = loop {
            if self.program.max_insns != 0 && self.program.n_insns >= self.program.max_insns {
                break Leave::Timeout;
            }
            if let Err(leave) = self.do_step() {
                break leave;
            }
        };
        self.finalize(&leave);
        leave
    }

    /// Flush the last trace line, run pending perf commands, emit the
    /// call graph, and print the exit summary.
    pub fn finalize(&mut self, leave: &Leave) {
        self.trace.flush_last_line();

        if self.trace.need.perf {
            let depth = self.graph.call_depth();
            self.perf_instruction(Op::None, depth);
        }

        if self.opts.graph && self.graph.entered {
            if let Err(e) = self.graph_write_dot(leave) {
                eprintln!("octavr: cannot write call graph: {e}");
            }
        }

        if !self.opts.quiet {
            let pc_hex = if self.arch.pc_3bytes {
                format!("{:06x}", 2 * self.pc)
            } else {
                format!("{:04x}", 2 * self.pc)
            };
            print!(
                "\n exit status: {}\n      reason: {}\n     program: {}\nexit address: {}\ntotal cycles: {}\n\n",
                leave.status(),
                leave.reason(),
                self.program.name,
                pc_hex,
                self.program.n_cycles
            );
        }
    }
}
