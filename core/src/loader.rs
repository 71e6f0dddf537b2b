//! Program loading: ELF32 AVR executables and raw binary images.
//!
//! ELF placement follows the avr-gcc address-space convention: flash
//! lives below 0x800000, `.data`-like segments carry a virtual address
//! in 0x800000..=0x80FFFF (optionally mirrored into SRAM), EEPROM in
//! 0x810000..=0x81FFFF, and everything above (.fuse, .lock, notes) is
//! skipped.  The symbol pass hands every function-ish symbol to the
//! call-graph module.

use object::elf::{self, EM_AVR, PF_R, PF_W, PF_X, PT_LOAD};
use object::read::elf::{ElfFile32, FileHeader, ProgramHeader};
use object::{LittleEndian, Object, ObjectSection, ObjectSymbol, SectionKind, SymbolKind};

use crate::core::memory::{MAX_EEPROM_SIZE, MAX_FLASH_SIZE};
use crate::core::program::Leave;
use crate::core::simulator::Simulator;

const DATA_VADDR: u32 = 0x80_0000;
const DATA_VADDR_END: u32 = 0x80_FFFF;
const EEPROM_VADDR: u32 = 0x81_0000;
const EEPROM_VADDR_END: u32 = 0x81_FFFF;

fn file_err(what: &str) -> Leave {
    Leave::File(what.to_string())
}

impl Simulator {
    /// Load the program file, run the decoder and wire up the
    /// bookkeeping.  This is the one-stop setup entry for the front
    /// end and the tests.
    pub fn prepare(&mut self) -> Result<(), Leave> {
        self.graph.cfg_base = self.opts.graph_base.clone();
        self.graph.cfg_reserved = self.opts.graph_reserved;
        self.graph.cfg_all = self.opts.graph_all;
        self.graph.cfg_leafs = self.opts.graph_leaf.clone();
        self.graph.cfg_subs = self.opts.graph_sub.clone();
        self.graph.cfg_skips = self.opts.graph_skip.clone();

        self.load_to_flash()?;
        self.decode_flash();
        self.graph.finish_symbol_table(self.pc);
        self.init_logging();
        Ok(())
    }

    /// Read the program file into flash (and RAM/EEPROM for ELF) and
    /// establish the entry point.
    pub fn load_to_flash(&mut self) -> Result<(), Leave> {
        let path = self
            .opts
            .program_path
            .clone()
            .ok_or_else(|| Leave::Usage("missing program name".into()))?;
        let data = std::fs::read(&path)
            .map_err(|e| Leave::File(format!("can't find or read program file: {e}")))?;

        if data.starts_with(b"\x7fELF") {
            self.load_elf(&data)?;
        } else {
            let n = data.len().min(MAX_FLASH_SIZE);
            self.flash[..n].copy_from_slice(&data[..n]);
            self.program.size = n as u32;
            self.program.n_bytes = n as u32;
            self.program.code_start = 0;
            self.program.code_end = (n as u32).saturating_sub(1);
            if self.opts.entry_point.is_none() {
                self.program.entry_point = 0;
            }
        }

        if let Some(entry) = self.opts.entry_point {
            self.program.entry_point = entry;
        }
        let entry = self.program.entry_point;
        if entry % 2 != 0 {
            return Err(file_err(&format!("entry-point 0x{entry:x} is odd")));
        }
        if entry >= MAX_FLASH_SIZE as u32 {
            return Err(file_err(&format!("entry-point 0x{entry:x} is too big")));
        }
        self.pc = entry / 2;

        if self.program.size > self.program.flash_size {
            return Err(Leave::File(format!(
                "program is too large (size: {}, max: {})",
                self.program.size, self.program.flash_size
            )));
        }
        Ok(())
    }

    fn load_elf(&mut self, data: &[u8]) -> Result<(), Leave> {
        let endian = LittleEndian;
        let header = elf::FileHeader32::<LittleEndian>::parse(data)
            .map_err(|_| file_err("bad ELF header"))?;

        if header.e_machine.get(endian) != EM_AVR || header.e_type.get(endian) != elf::ET_EXEC {
            return Err(file_err("ELF file is not an AVR executable"));
        }

        let phdrs = header
            .program_headers(endian, data)
            .map_err(|_| file_err("can't read PHDRs of ELF file"))?;

        for ph in phdrs {
            if ph.p_type(endian) != PT_LOAD {
                continue;
            }
            let filesz = ph.p_filesz(endian);
            if filesz == 0 {
                continue;
            }
            let addr = ph.p_paddr(endian);
            let vaddr = ph.p_vaddr(endian);
            let memsz = ph.p_memsz(endian);
            let flags = ph.p_flags(endian);

            log::debug!(
                "load PHDR 0x{:06x} -- 0x{:06x} (vaddr = 0x{:06x}) \"{}{}{}\"",
                addr,
                addr + memsz - 1,
                vaddr,
                if flags & PF_R != 0 { "r" } else { "" },
                if flags & PF_W != 0 { "w" } else { "" },
                if flags & PF_X != 0 { "x" } else { "" },
            );

            // Skip special sections like .fuse, .lock, .signature.
            if vaddr > EEPROM_VADDR_END {
                continue;
            }

            if addr + memsz > MAX_FLASH_SIZE as u32 && vaddr <= DATA_VADDR_END {
                return Err(file_err("program too big to fit in flash"));
            }

            let segment = ph
                .data(endian, data)
                .map_err(|()| file_err("ELF file truncated"))?;
            self.program.n_bytes += filesz;

            if vaddr >= EEPROM_VADDR {
                let offset = (addr - EEPROM_VADDR) as usize;
                if offset + segment.len() > MAX_EEPROM_SIZE {
                    return Err(file_err(".eeprom too big to fit in memory"));
                }
                self.eeprom[offset..offset + segment.len()].copy_from_slice(segment);
                continue;
            }

            self.flash[addr as usize..addr as usize + segment.len()].copy_from_slice(segment);

            // Also copy .data-like segments into SRAM.
            if self.opts.init_sram
                && vaddr >= DATA_VADDR
                && vaddr + filesz - 1 <= DATA_VADDR_END
            {
                let ram_addr = (vaddr - DATA_VADDR) as usize;
                self.ram[ram_addr..ram_addr + segment.len()].copy_from_slice(segment);
            }

            if addr + memsz > self.program.size {
                self.program.size = addr + memsz;
            }
            if flags & PF_X != 0 {
                if addr < self.program.code_start {
                    self.program.code_start = addr;
                }
                if addr + memsz - 1 > self.program.code_end {
                    self.program.code_end = addr + memsz - 1;
                }
            }
        }

        if self.opts.entry_point.is_none() {
            let entry = header.e_entry.get(endian);
            if entry >= MAX_FLASH_SIZE as u32 {
                return Err(file_err(&format!("ELF entry-point 0x{entry:x} is too big")));
            }
            if entry % 2 != 0 {
                return Err(file_err(&format!("ELF entry-point 0x{entry:x} is odd")));
            }
            self.program.entry_point = entry;
        }

        self.load_symbols(data)
    }

    /// Hand every STT_FUNC symbol, and every symbol living in an
    /// executable section, to the call graph.
    fn load_symbols(&mut self, data: &[u8]) -> Result<(), Leave> {
        let file = ElfFile32::<LittleEndian>::parse(data)
            .map_err(|_| file_err("ELF section headers invalid"))?;

        let mut n_syms = 0u32;
        let mut n_funcs = 0u32;
        let mut n_bad = 0u32;

        for sym in file.symbols() {
            let name = match sym.name() {
                Ok(n) if !n.is_empty() => n,
                _ => continue,
            };
            let is_func = sym.kind() == SymbolKind::Text;
            let in_exec_section = sym
                .section_index()
                .and_then(|idx| file.section_by_index(idx).ok())
                .is_some_and(|s| s.kind() == SectionKind::Text);
            if !is_func && !in_exec_section {
                continue;
            }

            let addr = sym.address() as u32;

            // Newer GAS versions cook up local labels with unprintable
            // characters after "RCALL .+0"; ignore them, along with
            // internal dot-labels and anything outside flash.
            let bytes = name.as_bytes();
            let nonprint = bytes.len() >= 3 && bytes[2] < 0x20;
            if addr % 2 != 0 || addr >= MAX_FLASH_SIZE as u32 || name.starts_with('.') || nonprint
            {
                n_bad += 1;
                continue;
            }

            self.graph.elf_symbol(name, addr / 2, is_func);
            n_syms += 1;
            n_funcs += u32::from(is_func);
        }

        log::debug!("symtab: {n_syms} usable, {n_funcs} functions, {n_bad} bad");
        Ok(())
    }
}
