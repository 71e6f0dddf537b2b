//! Data transfer: immediate and register moves, direct and indirect
//! loads/stores, program-memory loads, and the XMEGA read-modify-write
//! instructions.

use crate::core::program::Leave;
use crate::core::simulator::Simulator;
use crate::cpu::{REGX, REGY, REGZ, Step};

impl Simulator {
    /// Indirect load through a pointer register.  A negative adjust
    /// applies before the access, a positive one after; any adjust is
    /// written back to the pointer.
    fn load_indirect(&mut self, rd: u8, ptr: u8, adjust: i16, displacement: u16) {
        let mut ind = self.get_word_reg(ptr);
        if adjust < 0 {
            ind = ind.wrapping_add(adjust as u16);
        }
        let value = self.read_byte(u32::from(ind.wrapping_add(displacement)));
        self.put_reg(rd, value);
        if adjust > 0 {
            ind = ind.wrapping_add(adjust as u16);
        }
        if adjust != 0 {
            self.put_word_reg(ptr, ind);
        }
    }

    fn store_indirect(&mut self, rd: u8, ptr: u8, adjust: i16, displacement: u16) -> Step {
        let mut ind = self.get_word_reg(ptr);
        if adjust < 0 {
            ind = ind.wrapping_add(adjust as u16);
        }
        let value = self.get_reg(rd);
        self.write_byte(u32::from(ind.wrapping_add(displacement)), value)?;
        if adjust > 0 {
            ind = ind.wrapping_add(adjust as u16);
        }
        if adjust != 0 {
            self.put_word_reg(ptr, ind);
        }
        Ok(())
    }

    /// LPM/ELPM load through Z, optionally with RAMPZ extension and
    /// post-increment.
    fn load_program_memory(&mut self, rd: u8, use_rampz: bool, incr: bool) -> Step {
        let mut address = u32::from(self.get_word_reg(REGZ));
        if use_rampz {
            address |= u32::from(self.read_byte(u32::from(self.arch.addr_rampz()))) << 16;
        }
        let value = self.flash_read_byte(address);
        self.put_reg(rd, value);
        if incr {
            address = address.wrapping_add(1);
            self.put_word_reg(REGZ, address as u16);
            if use_rampz {
                self.write_byte(u32::from(self.arch.addr_rampz()), (address >> 16) as u8)?;
            }
        }
        Ok(())
    }

    /* 1110 KKKK dddd KKKK | LDI, SER */
    pub(crate) fn op_ldi(&mut self, rd: u8, k: u16) -> Step {
        self.put_reg(rd, k as u8);
        Ok(())
    }

    /* 0010 11rd dddd rrrr | MOV */
    pub(crate) fn op_mov(&mut self, rd: u8, rr: u16) -> Step {
        let value = self.get_reg(rr as u8);
        self.put_reg(rd, value);
        Ok(())
    }

    /* 0000 0001 dddd rrrr | MOVW */
    pub(crate) fn op_movw(&mut self, rd: u8, rr: u16) -> Step {
        let value = self.get_word_reg(rr as u8);
        self.put_word_reg(rd, value);
        Ok(())
    }

    /* 1011 0AAd dddd AAAA | IN */
    pub(crate) fn op_in(&mut self, rd: u8, addr: u16) -> Step {
        let value = self.read_byte(u32::from(addr));
        self.put_reg(rd, value);
        Ok(())
    }

    /* 1011 1AAd dddd AAAA | OUT */
    pub(crate) fn op_out(&mut self, rd: u8, addr: u16) -> Step {
        let value = self.get_reg(rd);
        self.write_byte(u32::from(addr), value)
    }

    /* 1001 000d dddd 0000 | LDS */
    pub(crate) fn op_lds(&mut self, rd: u8, addr: u16) -> Step {
        let value = self.read_byte(u32::from(addr));
        self.put_reg(rd, value);
        Ok(())
    }

    /* 1001 001d dddd 0000 | STS */
    pub(crate) fn op_sts(&mut self, rd: u8, addr: u16) -> Step {
        let value = self.get_reg(rd);
        self.write_byte(u32::from(addr), value)
    }

    /* 1001 000d dddd 11xx | LD through X */
    pub(crate) fn op_ld_x(&mut self, rd: u8, _rr: u16) -> Step {
        self.load_indirect(rd, REGX, 0, 0);
        Ok(())
    }

    pub(crate) fn op_ld_x_decr(&mut self, rd: u8, _rr: u16) -> Step {
        self.load_indirect(rd, REGX, -1, 0);
        Ok(())
    }

    pub(crate) fn op_ld_x_incr(&mut self, rd: u8, _rr: u16) -> Step {
        self.load_indirect(rd, REGX, 1, 0);
        Ok(())
    }

    pub(crate) fn op_ld_y_decr(&mut self, rd: u8, _rr: u16) -> Step {
        self.load_indirect(rd, REGY, -1, 0);
        Ok(())
    }

    pub(crate) fn op_ld_y_incr(&mut self, rd: u8, _rr: u16) -> Step {
        self.load_indirect(rd, REGY, 1, 0);
        Ok(())
    }

    pub(crate) fn op_ld_z_decr(&mut self, rd: u8, _rr: u16) -> Step {
        self.load_indirect(rd, REGZ, -1, 0);
        Ok(())
    }

    pub(crate) fn op_ld_z_incr(&mut self, rd: u8, _rr: u16) -> Step {
        self.load_indirect(rd, REGZ, 1, 0);
        Ok(())
    }

    /* 10q0 qq0d dddd 1qqq | LDD Y+q (q = 0 is LD Y) */
    pub(crate) fn op_ldd_y(&mut self, rd: u8, q: u16) -> Step {
        self.load_indirect(rd, REGY, 0, q);
        Ok(())
    }

    /* 10q0 qq0d dddd 0qqq | LDD Z+q */
    pub(crate) fn op_ldd_z(&mut self, rd: u8, q: u16) -> Step {
        self.load_indirect(rd, REGZ, 0, q);
        Ok(())
    }

    /* 1001 001d dddd 11xx | ST through X */
    pub(crate) fn op_st_x(&mut self, rd: u8, _rr: u16) -> Step {
        self.store_indirect(rd, REGX, 0, 0)
    }

    pub(crate) fn op_st_x_decr(&mut self, rd: u8, _rr: u16) -> Step {
        self.store_indirect(rd, REGX, -1, 0)
    }

    pub(crate) fn op_st_x_incr(&mut self, rd: u8, _rr: u16) -> Step {
        self.store_indirect(rd, REGX, 1, 0)
    }

    pub(crate) fn op_st_y_decr(&mut self, rd: u8, _rr: u16) -> Step {
        self.store_indirect(rd, REGY, -1, 0)
    }

    pub(crate) fn op_st_y_incr(&mut self, rd: u8, _rr: u16) -> Step {
        self.store_indirect(rd, REGY, 1, 0)
    }

    pub(crate) fn op_st_z_decr(&mut self, rd: u8, _rr: u16) -> Step {
        self.store_indirect(rd, REGZ, -1, 0)
    }

    pub(crate) fn op_st_z_incr(&mut self, rd: u8, _rr: u16) -> Step {
        self.store_indirect(rd, REGZ, 1, 0)
    }

    /* 10q0 qq1d dddd 1qqq | STD Y+q */
    pub(crate) fn op_std_y(&mut self, rd: u8, q: u16) -> Step {
        self.store_indirect(rd, REGY, 0, q)
    }

    /* 10q0 qq1d dddd 0qqq | STD Z+q */
    pub(crate) fn op_std_z(&mut self, rd: u8, q: u16) -> Step {
        self.store_indirect(rd, REGZ, 0, q)
    }

    /* 1001 0101 1100 1000 | LPM (into R0) */
    pub(crate) fn op_lpm(&mut self, _rd: u8, _rr: u16) -> Step {
        self.load_program_memory(0, false, false)
    }

    /* 1001 000d dddd 0100 | LPM Rd,Z */
    pub(crate) fn op_lpm_z(&mut self, rd: u8, _rr: u16) -> Step {
        self.load_program_memory(rd, false, false)
    }

    /* 1001 000d dddd 0101 | LPM Rd,Z+ */
    pub(crate) fn op_lpm_z_incr(&mut self, rd: u8, _rr: u16) -> Step {
        self.load_program_memory(rd, false, true)
    }

    /* 1001 0101 1101 1000 | ELPM (into R0) */
    pub(crate) fn op_elpm(&mut self, _rd: u8, _rr: u16) -> Step {
        self.load_program_memory(0, true, false)
    }

    /* 1001 000d dddd 0110 | ELPM Rd,Z */
    pub(crate) fn op_elpm_z(&mut self, rd: u8, _rr: u16) -> Step {
        self.load_program_memory(rd, true, false)
    }

    /* 1001 000d dddd 0111 | ELPM Rd,Z+ */
    pub(crate) fn op_elpm_z_incr(&mut self, rd: u8, _rr: u16) -> Step {
        self.load_program_memory(rd, true, true)
    }

    // XMEGA read-modify-write through Z.  The old memory content lands
    // in Rd in all four cases.

    /* 1001 001d dddd 0100 | XCH */
    pub(crate) fn op_xch(&mut self, rd: u8, _rr: u16) -> Step {
        let z = u32::from(self.get_word_reg(REGZ));
        let old = self.read_byte(z);
        let value = self.get_reg(rd);
        self.write_byte(z, value)?;
        self.put_reg(rd, old);
        Ok(())
    }

    /* 1001 001d dddd 0101 | LAS */
    pub(crate) fn op_las(&mut self, rd: u8, _rr: u16) -> Step {
        let z = u32::from(self.get_word_reg(REGZ));
        let old = self.read_byte(z);
        let value = self.get_reg(rd);
        self.write_byte(z, old | value)?;
        self.put_reg(rd, old);
        Ok(())
    }

    /* 1001 001d dddd 0110 | LAC */
    pub(crate) fn op_lac(&mut self, rd: u8, _rr: u16) -> Step {
        let z = u32::from(self.get_word_reg(REGZ));
        let old = self.read_byte(z);
        let value = self.get_reg(rd);
        self.write_byte(z, old & !value)?;
        self.put_reg(rd, old);
        Ok(())
    }

    /* 1001 001d dddd 0111 | LAT */
    pub(crate) fn op_lat(&mut self, rd: u8, _rr: u16) -> Step {
        let z = u32::from(self.get_word_reg(REGZ));
        let old = self.read_byte(z);
        let value = self.get_reg(rd);
        self.write_byte(z, old ^ value)?;
        self.put_reg(rd, old);
        Ok(())
    }

    // Stubs that decode but cannot run in this core.

    /* 1001 0101 1110 1000 | SPM */
    pub(crate) fn op_spm(&mut self, _rd: u8, _rr: u16) -> Step {
        Err(Leave::aborted("unimplemented opcode 0x95e8 (SPM)"))
    }

    /* 1001 0101 1111 1000 | ESPM */
    pub(crate) fn op_espm(&mut self, _rd: u8, _rr: u16) -> Step {
        Err(Leave::aborted("unimplemented opcode 0x95f8 (ESPM)"))
    }
}
