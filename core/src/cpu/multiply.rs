//! The multiply family, plus the miscellaneous no-ops, stubs and the
//! illegal / syscall entry points.

use crate::core::program::Leave;
use crate::core::simulator::Simulator;
use crate::cpu::flags::{FLAG_C, FLAG_Z};
use crate::cpu::{ILL_ARCH, Step};

impl Simulator {
    /// All six multiply variants: sign-extension per operand, optional
    /// left shift for the FMUL fractional forms, result to R1:R0.
    /// C is the raw product's bit 15, Z reflects the stored result.
    fn do_multiply(&mut self, rd: u8, rr: u8, signed1: bool, signed2: bool, shift: bool) {
        let v1 = self.get_reg(rd);
        let v2 = self.get_reg(rr);
        let v1 = if signed1 { i32::from(v1 as i8) } else { i32::from(v1) };
        let v2 = if signed2 { i32::from(v2 as i8) } else { i32::from(v2) };
        let product = (v1 * v2) as u32 & 0xFFFF;

        let mut sreg = 0u8;
        if product & 0x8000 != 0 {
            sreg |= FLAG_C;
        }
        let result = if shift { (product << 1) & 0xFFFF } else { product };
        if result == 0 {
            sreg |= FLAG_Z;
        }
        self.update_flags(FLAG_Z | FLAG_C, sreg);
        self.put_word_reg(0, result as u16);
    }

    /* 1001 11rd dddd rrrr | MUL */
    pub(crate) fn op_mul(&mut self, rd: u8, rr: u16) -> Step {
        self.do_multiply(rd, rr as u8, false, false, false);
        Ok(())
    }

    /* 0000 0010 dddd rrrr | MULS */
    pub(crate) fn op_muls(&mut self, rd: u8, rr: u16) -> Step {
        self.do_multiply(rd, rr as u8, true, true, false);
        Ok(())
    }

    /* 0000 0011 0ddd 0rrr | MULSU */
    pub(crate) fn op_mulsu(&mut self, rd: u8, rr: u16) -> Step {
        self.do_multiply(rd, rr as u8, true, false, false);
        Ok(())
    }

    /* 0000 0011 0ddd 1rrr | FMUL */
    pub(crate) fn op_fmul(&mut self, rd: u8, rr: u16) -> Step {
        self.do_multiply(rd, rr as u8, false, false, true);
        Ok(())
    }

    /* 0000 0011 1ddd 0rrr | FMULS */
    pub(crate) fn op_fmuls(&mut self, rd: u8, rr: u16) -> Step {
        self.do_multiply(rd, rr as u8, true, true, true);
        Ok(())
    }

    /* 0000 0011 1ddd 1rrr | FMULSU */
    pub(crate) fn op_fmulsu(&mut self, rd: u8, rr: u16) -> Step {
        self.do_multiply(rd, rr as u8, true, false, true);
        Ok(())
    }

    // -- Miscellaneous -----------------------------------------------

    /* 0000 0000 0000 0000 | NOP */
    pub(crate) fn op_nop(&mut self, _rd: u8, _rr: u16) -> Step {
        Ok(())
    }

    /* 1001 0101 1000 1000 | SLEEP */
    pub(crate) fn op_sleep(&mut self, _rd: u8, _rr: u16) -> Step {
        // Nothing can wake us, so pretend we wake up immediately.
        Ok(())
    }

    /* 1001 0101 1010 1000 | WDR */
    pub(crate) fn op_wdr(&mut self, _rd: u8, _rr: u16) -> Step {
        // No watchdog in this core.
        Ok(())
    }

    /* 1001 0101 1001 1000 | BREAK */
    pub(crate) fn op_break(&mut self, _rd: u8, _rr: u16) -> Step {
        Err(Leave::aborted("unimplemented opcode 0x9598 (BREAK)"))
    }

    /* 1001 0100 KKKK 1011 | DES */
    pub(crate) fn op_des(&mut self, round: u8, _rr: u16) -> Step {
        Err(Leave::aborted(format!(
            "unimplemented opcode DES round {round}"
        )))
    }

    /// Records that decode to nothing at all.
    pub(crate) fn op_illegal(&mut self, class: u8, word: u16) -> Step {
        if class == ILL_ARCH {
            Err(Leave::aborted(format!(
                "opcode 0x{word:04x} is not available on {}",
                self.arch.name
            )))
        } else {
            Err(Leave::aborted(format!("illegal opcode 0x{word:04x}")))
        }
    }

    /// A pointer pre/post-modify that overlaps its own pointer.
    pub(crate) fn op_undef(&mut self, _id: u8, word: u16) -> Step {
        Err(Leave::aborted(format!(
            "undefined behavior in opcode 0x{word:04x}"
        )))
    }

    /// Slot the decoder never touched: the PC escaped the program.
    pub(crate) fn op_none(&mut self, _rd: u8, _rr: u16) -> Step {
        Err(Leave::Fatal("dispatch on an undecoded slot".into()))
    }

    /* CPSE Rd,Rd over the invalid word | SYSCALL Rd */
    pub(crate) fn op_syscall(&mut self, sysno: u8, _rr: u16) -> Step {
        self.do_syscall(sysno)
    }
}
