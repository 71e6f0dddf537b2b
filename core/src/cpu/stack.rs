//! Stack operations, calls and returns.

use crate::core::memory::PC_VALID_MASK;
use crate::core::simulator::Simulator;
use crate::cpu::flags::FLAG_I;
use crate::cpu::{REGZ, Step};

impl Simulator {
    /* 1001 001d dddd 1111 | PUSH */
    pub(crate) fn op_push(&mut self, rd: u8, _rr: u16) -> Step {
        let value = self.get_reg(rd);
        self.push_byte(value)
    }

    /* 1001 000d dddd 1111 | POP */
    pub(crate) fn op_pop(&mut self, rd: u8, _rr: u16) -> Step {
        let value = self.pop_byte()?;
        self.put_reg(rd, value);
        Ok(())
    }

    /* 1001 010k kkkk 111k | CALL */
    pub(crate) fn op_call(&mut self, k_hi: u8, k_lo: u16) -> Step {
        self.push_pc()?;
        self.pc = (u32::from(k_lo) | (u32::from(k_hi) << 16)) & PC_VALID_MASK;
        if self.arch.pc_3bytes {
            self.program.n_cycles += 1;
        }
        Ok(())
    }

    /* 1101 kkkk kkkk kkkk | RCALL */
    pub(crate) fn op_rcall(&mut self, _rd: u8, delta: u16) -> Step {
        let delta = i32::from(delta as i16);
        self.push_pc()?;
        self.pc = self.pc.wrapping_add(delta as u32) & PC_VALID_MASK;
        if self.arch.pc_3bytes {
            self.program.n_cycles += 1;
        }
        Ok(())
    }

    /* 1001 0101 0000 1001 | ICALL */
    pub(crate) fn op_icall(&mut self, _rd: u8, _rr: u16) -> Step {
        self.push_pc()?;
        self.pc = u32::from(self.get_word_reg(REGZ));
        if self.arch.pc_3bytes {
            self.program.n_cycles += 1;
        }
        Ok(())
    }

    /* 1001 0101 0001 1001 | EICALL */
    pub(crate) fn op_eicall(&mut self, _rd: u8, _rr: u16) -> Step {
        self.push_pc()?;
        let eind = self.read_byte(u32::from(self.arch.addr_eind()));
        self.pc =
            (u32::from(self.get_word_reg(REGZ)) | (u32::from(eind) << 16)) & PC_VALID_MASK;
        if self.arch.pc_3bytes {
            self.program.n_cycles += 1;
        }
        Ok(())
    }

    /* 1001 0101 0000 1000 | RET */
    pub(crate) fn op_ret(&mut self, _rd: u8, _rr: u16) -> Step {
        self.pop_pc()?;
        if self.arch.pc_3bytes {
            self.program.n_cycles += 1;
        }
        Ok(())
    }

    /* 1001 0101 0001 1000 | RETI */
    pub(crate) fn op_reti(&mut self, rd: u8, rr: u16) -> Step {
        self.op_ret(rd, rr)?;
        self.update_flags(FLAG_I, FLAG_I);
        Ok(())
    }
}
