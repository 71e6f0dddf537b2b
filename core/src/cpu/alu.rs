//! Arithmetic, logic, shift and rotate handlers.  All flag outcomes
//! come from the tables in [`crate::cpu::flags`].

use crate::core::simulator::Simulator;
use crate::cpu::Step;
use crate::cpu::flags::*;

const MASK_ARITH: u8 = FLAG_H | FLAG_S | FLAG_V | FLAG_N | FLAG_Z | FLAG_C;
const MASK_LOGICAL: u8 = FLAG_S | FLAG_V | FLAG_N | FLAG_Z;
const MASK_SHIFT: u8 = FLAG_S | FLAG_V | FLAG_N | FLAG_Z | FLAG_C;

impl Simulator {
    fn do_add8(&mut self, rd: u8, rr: u8, carry: u8) {
        let v1 = self.get_reg(rd);
        let v2 = self.get_reg(rr);
        let result = u32::from(v1) + u32::from(v2) + u32::from(carry);
        let sreg = ADD8_FLAGS[add_sub_index(v1, v2, result)];
        self.update_flags(MASK_ARITH, sreg);
        self.put_reg(rd, result as u8);
    }

    /// Subtract and set flags.  With `use_carry`, Z stays set only if
    /// it was already set, which makes multi-byte compares come out
    /// right (CPC/SBC/SBCI).
    fn do_sub8(&mut self, v1: u8, v2: u8, carry: u8, use_carry: bool) -> u8 {
        let result = i32::from(v1) - i32::from(v2) - i32::from(carry);
        let mut sreg = SUB8_FLAGS[add_sub_index(v1, v2, result as u32)];
        if use_carry && self.sreg() & FLAG_Z == 0 {
            sreg &= !FLAG_Z;
        }
        self.update_flags(MASK_ARITH, sreg);
        result as u8
    }

    fn store_logical(&mut self, rd: u8, result: u8) {
        self.put_reg(rd, result);
        self.update_flags(MASK_LOGICAL, LOGICAL_FLAGS[result as usize]);
    }

    /// Shift right with `top` injected at bit 7: ASR passes the sign
    /// bit, ROR the carry, LSR zero.
    fn rotate_right(&mut self, rd: u8, value: u8, top: bool) {
        let key = usize::from(value) | (usize::from(top) << 8);
        self.put_reg(rd, (key >> 1) as u8);
        self.update_flags(MASK_SHIFT, ROR8_FLAGS[key]);
    }

    // -- Add family --------------------------------------------------

    /* 0000 11rd dddd rrrr | ADD, LSL */
    pub(crate) fn op_add(&mut self, rd: u8, rr: u16) -> Step {
        self.do_add8(rd, rr as u8, 0);
        Ok(())
    }

    /* 0001 11rd dddd rrrr | ADC, ROL */
    pub(crate) fn op_adc(&mut self, rd: u8, rr: u16) -> Step {
        let carry = self.carry();
        self.do_add8(rd, rr as u8, carry);
        Ok(())
    }

    /* 1001 0110 KKdd KKKK | ADIW */
    pub(crate) fn op_adiw(&mut self, rd: u8, k: u16) -> Step {
        let value = self.get_word_reg(rd);
        let result = u32::from(value) + u32::from(k);
        self.put_word_reg(rd, result as u16);

        let mut sreg = ADD8_FLAGS[add_sub16_index(value, result)];
        sreg &= !FLAG_H;
        if result & 0xFFFF != 0 {
            sreg &= !FLAG_Z;
        }
        self.update_flags(MASK_SHIFT, sreg);
        Ok(())
    }

    // -- Subtract family ---------------------------------------------

    /* 0001 10rd dddd rrrr | SUB */
    pub(crate) fn op_sub(&mut self, rd: u8, rr: u16) -> Step {
        let v1 = self.get_reg(rd);
        let v2 = self.get_reg(rr as u8);
        let result = self.do_sub8(v1, v2, 0, false);
        self.put_reg(rd, result);
        Ok(())
    }

    /* 0101 KKKK dddd KKKK | SUBI */
    pub(crate) fn op_subi(&mut self, rd: u8, k: u16) -> Step {
        let v1 = self.get_reg(rd);
        let result = self.do_sub8(v1, k as u8, 0, false);
        self.put_reg(rd, result);
        Ok(())
    }

    /* 0000 10rd dddd rrrr | SBC */
    pub(crate) fn op_sbc(&mut self, rd: u8, rr: u16) -> Step {
        let v1 = self.get_reg(rd);
        let v2 = self.get_reg(rr as u8);
        let carry = self.carry();
        let result = self.do_sub8(v1, v2, carry, true);
        self.put_reg(rd, result);
        Ok(())
    }

    /* 0100 KKKK dddd KKKK | SBCI */
    pub(crate) fn op_sbci(&mut self, rd: u8, k: u16) -> Step {
        let v1 = self.get_reg(rd);
        let carry = self.carry();
        let result = self.do_sub8(v1, k as u8, carry, true);
        self.put_reg(rd, result);
        Ok(())
    }

    /* 1001 0111 KKdd KKKK | SBIW */
    pub(crate) fn op_sbiw(&mut self, rd: u8, k: u16) -> Step {
        let value = self.get_word_reg(rd);
        let result = i32::from(value) - i32::from(k);
        self.put_word_reg(rd, result as u16);

        let mut sreg = SUB8_FLAGS[add_sub16_index(value, result as u32)];
        sreg &= !FLAG_H;
        if result & 0xFFFF != 0 {
            sreg &= !FLAG_Z;
        }
        self.update_flags(MASK_SHIFT, sreg);
        Ok(())
    }

    /* 0001 01rd dddd rrrr | CP */
    pub(crate) fn op_cp(&mut self, rd: u8, rr: u16) -> Step {
        let v1 = self.get_reg(rd);
        let v2 = self.get_reg(rr as u8);
        self.do_sub8(v1, v2, 0, false);
        Ok(())
    }

    /* 0000 01rd dddd rrrr | CPC */
    pub(crate) fn op_cpc(&mut self, rd: u8, rr: u16) -> Step {
        let v1 = self.get_reg(rd);
        let v2 = self.get_reg(rr as u8);
        let carry = self.carry();
        self.do_sub8(v1, v2, carry, true);
        Ok(())
    }

    /* 0011 KKKK dddd KKKK | CPI */
    pub(crate) fn op_cpi(&mut self, rd: u8, k: u16) -> Step {
        let v1 = self.get_reg(rd);
        self.do_sub8(v1, k as u8, 0, false);
        Ok(())
    }

    /* 1001 010d dddd 0001 | NEG */
    pub(crate) fn op_neg(&mut self, rd: u8, _rr: u16) -> Step {
        let value = self.get_reg(rd);
        let result = self.do_sub8(0, value, 0, false);
        self.put_reg(rd, result);
        Ok(())
    }

    // -- Logical family ----------------------------------------------

    /* 0010 00rd dddd rrrr | AND, TST */
    pub(crate) fn op_and(&mut self, rd: u8, rr: u16) -> Step {
        let result = self.get_reg(rd) & self.get_reg(rr as u8);
        self.store_logical(rd, result);
        Ok(())
    }

    /* 0111 KKKK dddd KKKK | ANDI, CBR */
    pub(crate) fn op_andi(&mut self, rd: u8, k: u16) -> Step {
        let result = self.get_reg(rd) & k as u8;
        self.store_logical(rd, result);
        Ok(())
    }

    /* 0010 10rd dddd rrrr | OR */
    pub(crate) fn op_or(&mut self, rd: u8, rr: u16) -> Step {
        let result = self.get_reg(rd) | self.get_reg(rr as u8);
        self.store_logical(rd, result);
        Ok(())
    }

    /* 0110 KKKK dddd KKKK | ORI, SBR */
    pub(crate) fn op_ori(&mut self, rd: u8, k: u16) -> Step {
        let result = self.get_reg(rd) | k as u8;
        self.store_logical(rd, result);
        Ok(())
    }

    /* 0010 01rd dddd rrrr | EOR, CLR */
    pub(crate) fn op_eor(&mut self, rd: u8, rr: u16) -> Step {
        let result = self.get_reg(rd) ^ self.get_reg(rr as u8);
        self.store_logical(rd, result);
        Ok(())
    }

    /* 1001 010d dddd 0000 | COM */
    pub(crate) fn op_com(&mut self, rd: u8, _rr: u16) -> Step {
        let result = !self.get_reg(rd);
        self.put_reg(rd, result);
        self.update_flags(MASK_SHIFT, LOGICAL_FLAGS[result as usize] | FLAG_C);
        Ok(())
    }

    // -- Shift / rotate ----------------------------------------------

    /* 1001 010d dddd 0101 | ASR */
    pub(crate) fn op_asr(&mut self, rd: u8, _rr: u16) -> Step {
        let value = self.get_reg(rd);
        self.rotate_right(rd, value, value & 0x80 != 0);
        Ok(())
    }

    /* 1001 010d dddd 0110 | LSR */
    pub(crate) fn op_lsr(&mut self, rd: u8, _rr: u16) -> Step {
        let value = self.get_reg(rd);
        self.rotate_right(rd, value, false);
        Ok(())
    }

    /* 1001 010d dddd 0111 | ROR */
    pub(crate) fn op_ror(&mut self, rd: u8, _rr: u16) -> Step {
        let value = self.get_reg(rd);
        let carry = self.carry() != 0;
        self.rotate_right(rd, value, carry);
        Ok(())
    }

    // -- Increment / decrement ---------------------------------------

    /* 1001 010d dddd 0011 | INC */
    pub(crate) fn op_inc(&mut self, rd: u8, _rr: u16) -> Step {
        let result = self.get_reg(rd).wrapping_add(1);
        self.put_reg(rd, result);
        self.update_flags(MASK_LOGICAL, INC_FLAGS[result as usize]);
        Ok(())
    }

    /* 1001 010d dddd 1010 | DEC */
    pub(crate) fn op_dec(&mut self, rd: u8, _rr: u16) -> Step {
        let result = self.get_reg(rd).wrapping_sub(1);
        self.put_reg(rd, result);
        self.update_flags(MASK_LOGICAL, DEC_FLAGS[result as usize]);
        Ok(())
    }

    /* 1001 010d dddd 0010 | SWAP */
    pub(crate) fn op_swap(&mut self, rd: u8, _rr: u16) -> Step {
        let value = self.get_reg(rd);
        self.put_reg(rd, value.rotate_left(4));
        Ok(())
    }
}
