//! Jumps, conditional branches and the skip instructions.

use crate::core::memory::PC_VALID_MASK;
use crate::core::program::Leave;
use crate::core::simulator::Simulator;
use crate::cpu::{REGZ, Step};

impl Simulator {
    fn branch_on_flag(&mut self, offset: u8, mask: u16, want_set: bool) {
        let value = self.read_byte(u32::from(self.arch.addr_sreg())) & mask as u8;
        self.trace.add_flag_read(mask as u8, value);
        if (value != 0) == want_set {
            let delta = i32::from(offset as i8);
            self.pc = self.pc.wrapping_add(delta as u32) & PC_VALID_MASK;
            self.program.n_cycles += 1;
        }
    }

    /// Step over the next instruction when `cond` holds; the decoder
    /// recorded its width in the skip variant.
    fn skip_if(&mut self, cond: bool, words: u32) {
        if cond {
            self.pc = self.pc.wrapping_add(words) & PC_VALID_MASK;
            self.program.n_cycles += u64::from(words);
        }
    }

    /* 1111 00kk kkkk kbbb | BRBS; BREQ, BRMI, ... */
    pub(crate) fn op_brbs(&mut self, offset: u8, mask: u16) -> Step {
        self.branch_on_flag(offset, mask, true);
        Ok(())
    }

    /* 1111 01kk kkkk kbbb | BRBC; BRNE, BRPL, ... */
    pub(crate) fn op_brbc(&mut self, offset: u8, mask: u16) -> Step {
        self.branch_on_flag(offset, mask, false);
        Ok(())
    }

    /* 1100 kkkk kkkk kkkk | RJMP */
    pub(crate) fn op_rjmp(&mut self, _rd: u8, delta: u16) -> Step {
        let delta = i32::from(delta as i16);
        // An endless loop is the conventional "program done" signal
        // when no exit port gets written.
        if delta == -1 {
            return Err(Leave::Exit {
                value: 0,
                reason: "infinite loop detected (normal exit)".into(),
            });
        }
        self.pc = self.pc.wrapping_add(delta as u32) & PC_VALID_MASK;
        Ok(())
    }

    /* 1001 0100 0000 1001 | IJMP */
    pub(crate) fn op_ijmp(&mut self, _rd: u8, _rr: u16) -> Step {
        self.pc = u32::from(self.get_word_reg(REGZ));
        Ok(())
    }

    /* 1001 0100 0001 1001 | EIJMP */
    pub(crate) fn op_eijmp(&mut self, _rd: u8, _rr: u16) -> Step {
        let eind = self.read_byte(u32::from(self.arch.addr_eind()));
        self.pc =
            (u32::from(self.get_word_reg(REGZ)) | (u32::from(eind) << 16)) & PC_VALID_MASK;
        Ok(())
    }

    /* 1001 010k kkkk 110k | JMP */
    pub(crate) fn op_jmp(&mut self, k_hi: u8, k_lo: u16) -> Step {
        self.pc = (u32::from(k_lo) | (u32::from(k_hi) << 16)) & PC_VALID_MASK;
        Ok(())
    }

    /* 0001 00rd dddd rrrr | CPSE */
    pub(crate) fn op_cpse(&mut self, rd: u8, rr: u16) -> Step {
        let cond = self.get_reg(rd) == self.get_reg(rr as u8);
        self.skip_if(cond, 1);
        Ok(())
    }

    pub(crate) fn op_cpse2(&mut self, rd: u8, rr: u16) -> Step {
        let cond = self.get_reg(rd) == self.get_reg(rr as u8);
        self.skip_if(cond, 2);
        Ok(())
    }

    /* 1111 110d dddd 0bbb | SBRC */
    pub(crate) fn op_sbrc(&mut self, rd: u8, mask: u16) -> Step {
        let cond = self.get_reg(rd) & mask as u8 == 0;
        self.skip_if(cond, 1);
        Ok(())
    }

    pub(crate) fn op_sbrc2(&mut self, rd: u8, mask: u16) -> Step {
        let cond = self.get_reg(rd) & mask as u8 == 0;
        self.skip_if(cond, 2);
        Ok(())
    }

    /* 1111 111d dddd 0bbb | SBRS */
    pub(crate) fn op_sbrs(&mut self, rd: u8, mask: u16) -> Step {
        let cond = self.get_reg(rd) & mask as u8 != 0;
        self.skip_if(cond, 1);
        Ok(())
    }

    pub(crate) fn op_sbrs2(&mut self, rd: u8, mask: u16) -> Step {
        let cond = self.get_reg(rd) & mask as u8 != 0;
        self.skip_if(cond, 2);
        Ok(())
    }

    /* 1001 1001 AAAA Abbb | SBIC */
    pub(crate) fn op_sbic(&mut self, addr: u8, mask: u16) -> Step {
        let cond = self.read_byte(u32::from(addr)) & mask as u8 == 0;
        self.skip_if(cond, 1);
        Ok(())
    }

    pub(crate) fn op_sbic2(&mut self, addr: u8, mask: u16) -> Step {
        let cond = self.read_byte(u32::from(addr)) & mask as u8 == 0;
        self.skip_if(cond, 2);
        Ok(())
    }

    /* 1001 1011 AAAA Abbb | SBIS */
    pub(crate) fn op_sbis(&mut self, addr: u8, mask: u16) -> Step {
        let cond = self.read_byte(u32::from(addr)) & mask as u8 != 0;
        self.skip_if(cond, 1);
        Ok(())
    }

    pub(crate) fn op_sbis2(&mut self, addr: u8, mask: u16) -> Step {
        let cond = self.read_byte(u32::from(addr)) & mask as u8 != 0;
        self.skip_if(cond, 2);
        Ok(())
    }
}
