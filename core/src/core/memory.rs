//! The guest memory model: flat RAM (registers + I/O file + SRAM),
//! flash, EEPROM, and the magic ports that bridge to the host.
//!
//! Reads and writes funnel through `read_byte` / `write_byte`, which
//! add operand traces and dispatch the port side effects.  The `_raw`
//! variants skip the trace, matching how word accesses log one line
//! instead of two.

use crate::core::program::Leave;
use crate::core::simulator::Simulator;
use crate::trace::MovDir;

pub const MAX_RAM_SIZE: usize = 64 * 1024;
pub const MAX_FLASH_SIZE: usize = 256 * 1024;
pub const MAX_EEPROM_SIZE: usize = 16 * 1024;

/// The PC indexes `decoded[]`; bits outside this mask mean something
/// went badly wrong (e.g. a corrupted return address).
pub const PC_VALID_MASK: u32 = (MAX_FLASH_SIZE / 2 - 1) as u32;

impl Simulator {
    // Lowest level accessors: no trace, port side effects included.

    pub fn flash_read_byte(&self, addr: u32) -> u8 {
        self.flash[(addr & (self.program.flash_size - 1)) as usize]
    }

    pub(crate) fn read_byte_raw(&mut self, addr: u32) -> u8 {
        let addr = addr & 0xFFFF;
        if addr == u32::from(self.arch.stdio_port()) {
            return self.host_stdin_byte();
        }
        let ticks = u32::from(self.arch.ticks_port());
        if (ticks..ticks + 4).contains(&addr) {
            return self.host.ticks.latch[(addr - ticks) as usize];
        }
        let pm = self.arch.flash_pm_offset;
        if pm != 0 && addr >= pm {
            return self.flash_read_byte(addr - pm);
        }
        self.ram[addr as usize]
    }

    pub(crate) fn write_byte_raw(&mut self, addr: u32, value: u8) -> Result<(), Leave> {
        let addr = addr & 0xFFFF;
        if addr == u32::from(self.arch.stdio_port()) {
            self.host_stdout_byte(value);
            return Ok(());
        }
        if addr == u32::from(self.arch.exit_port()) {
            return Err(Leave::exit(value));
        }
        if addr == u32::from(self.arch.abort_port()) {
            return Err(Leave::aborted("abort function called"));
        }
        if addr == u32::from(self.arch.log_port()) {
            return self.host_log_port(value);
        }
        if addr == u32::from(self.arch.ticks_port()) {
            self.host_ticks_cmd(value);
            return Ok(());
        }
        if addr == u32::from(self.arch.addr_spl()) || addr == u32::from(self.arch.addr_sph()) {
            // An OUT to SPL/SPH may leave SP half-adjusted, like an IRQ
            // in the middle of the sequence would see it.  Flag the
            // window so perf metering does not latch the glitch.
            self.trace.maybe_sp_glitch = 4;
        }
        self.ram[addr as usize] = value;
        Ok(())
    }

    // Mid-level accessors with operand tracing.

    pub fn read_byte(&mut self, addr: u32) -> u8 {
        let value = self.read_byte_raw(addr);
        self.trace
            .add_mov(&self.arch, MovDir::Read, addr, u32::from(value), 1);
        value
    }

    pub fn write_byte(&mut self, addr: u32, value: u8) -> Result<(), Leave> {
        self.trace
            .add_mov(&self.arch, MovDir::Write, addr, u32::from(value), 1);
        self.write_byte_raw(addr, value)
    }

    pub fn read_word(&mut self, addr: u32) -> u16 {
        let lo = self.read_byte_raw(addr);
        let hi = self.read_byte_raw(addr + 1);
        let value = u16::from(lo) | (u16::from(hi) << 8);
        self.trace
            .add_mov(&self.arch, MovDir::Read, addr, u32::from(value), 2);
        value
    }

    pub fn write_word(&mut self, addr: u32, value: u16) -> Result<(), Leave> {
        self.trace
            .add_mov(&self.arch, MovDir::Write, addr, u32::from(value), 2);
        self.write_byte_raw(addr, value as u8)?;
        self.write_byte_raw(addr + 1, (value >> 8) as u8)
    }

    // Register views.  Addresses below 32 never hit ports, so these go
    // straight to the data array.

    pub fn get_reg(&mut self, r: u8) -> u8 {
        let value = self.ram[r as usize];
        self.trace
            .add_mov(&self.arch, MovDir::Read, u32::from(r), u32::from(value), 1);
        value
    }

    pub fn put_reg(&mut self, r: u8, value: u8) {
        self.trace
            .add_mov(&self.arch, MovDir::Write, u32::from(r), u32::from(value), 1);
        self.ram[r as usize] = value;
    }

    pub fn get_word_reg(&mut self, r: u8) -> u16 {
        let value = u16::from(self.ram[r as usize]) | (u16::from(self.ram[r as usize + 1]) << 8);
        self.trace
            .add_mov(&self.arch, MovDir::Read, u32::from(r), u32::from(value), 2);
        value
    }

    pub fn put_word_reg(&mut self, r: u8, value: u16) {
        self.trace
            .add_mov(&self.arch, MovDir::Write, u32::from(r), u32::from(value), 2);
        self.ram[r as usize] = value as u8;
        self.ram[r as usize + 1] = (value >> 8) as u8;
    }

    /// Plain register read without an operand trace, for host-side
    /// value transfers (syscall arguments and results).
    #[inline]
    pub fn reg(&self, r: u8) -> u8 {
        self.ram[r as usize]
    }

    #[inline]
    pub fn set_reg(&mut self, r: u8, value: u8) {
        self.ram[r as usize] = value;
    }

    // SREG and SP.

    #[inline]
    pub fn sreg(&self) -> u8 {
        self.ram[self.arch.addr_sreg() as usize]
    }

    pub fn update_flags(&mut self, mask: u8, values: u8) {
        let sreg = (self.sreg() & !mask) | values;
        self.trace.add_sreg_write(&self.arch, sreg);
        self.ram[self.arch.addr_sreg() as usize] = sreg;
    }

    #[inline]
    pub fn carry(&self) -> u8 {
        self.sreg() & crate::cpu::flags::FLAG_C
    }

    /// SP as stored, without glitch filtering.
    #[inline]
    pub fn sp(&self) -> u16 {
        u16::from(self.ram[self.arch.addr_spl() as usize])
            | (u16::from(self.ram[self.arch.addr_sph() as usize]) << 8)
    }

    // Stack operations.

    pub fn push_byte(&mut self, value: u8) -> Result<(), Leave> {
        let sp = self.read_word(u32::from(self.arch.addr_spl()));
        if sp < self.arch.sp_reserved_bound() {
            return Err(Leave::aborted("stack pointer overflow"));
        }
        self.write_byte(u32::from(sp), value)?;
        self.write_word(u32::from(self.arch.addr_spl()), sp.wrapping_sub(1))
    }

    pub fn pop_byte(&mut self) -> Result<u8, Leave> {
        let sp = self.read_word(u32::from(self.arch.addr_spl())).wrapping_add(1);
        self.write_word(u32::from(self.arch.addr_spl()), sp)?;
        Ok(self.read_byte(u32::from(sp)))
    }

    pub fn push_pc(&mut self) -> Result<(), Leave> {
        let mut sp = self.read_word(u32::from(self.arch.addr_spl()));
        if sp < self.arch.sp_reserved_bound() {
            return Err(Leave::aborted("stack pointer overflow"));
        }
        self.write_byte(u32::from(sp), self.pc as u8)?;
        sp = sp.wrapping_sub(1);
        self.write_byte(u32::from(sp), (self.pc >> 8) as u8)?;
        sp = sp.wrapping_sub(1);
        if self.arch.pc_3bytes {
            self.write_byte(u32::from(sp), (self.pc >> 16) as u8)?;
            sp = sp.wrapping_sub(1);
        }
        self.write_word(u32::from(self.arch.addr_spl()), sp)
    }

    pub fn pop_pc(&mut self) -> Result<(), Leave> {
        let mut sp = self.read_word(u32::from(self.arch.addr_spl()));
        let mut pc = 0u32;
        if self.arch.pc_3bytes {
            sp = sp.wrapping_add(1);
            pc = u32::from(self.read_byte(u32::from(sp))) << 16;
        }
        sp = sp.wrapping_add(1);
        pc |= u32::from(self.read_byte(u32::from(sp))) << 8;
        sp = sp.wrapping_add(1);
        pc |= u32::from(self.read_byte(u32::from(sp)));
        self.pc = pc & PC_VALID_MASK;
        self.write_word(u32::from(self.arch.addr_spl()), sp)
    }
}
