use std::fs;
use std::path::PathBuf;

use octavr_core::core::arch;
use octavr_core::core::options::RunOptions;
use octavr_core::core::program::Leave;
use octavr_core::core::simulator::Simulator;

mod common;
use common::*;

fn temp_file(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("octavr-{tag}-{}", std::process::id()))
}

fn words_to_bytes(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// A minimal ELF32-LSB AVR executable: header plus PT_LOAD program
/// headers, no section table.
fn elf_bytes(entry: u32, segments: &[(u32, u32, u32, &[u8])]) -> Vec<u8> {
    let phoff = 52u32;
    let phentsize = 32u32;
    let data_off = phoff + phentsize * segments.len() as u32;

    let mut v = vec![0u8; data_off as usize];
    v[0..4].copy_from_slice(b"\x7fELF");
    v[4] = 1; // ELFCLASS32
    v[5] = 1; // ELFDATA2LSB
    v[6] = 1; // EV_CURRENT
    v[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    v[18..20].copy_from_slice(&0x53u16.to_le_bytes()); // EM_AVR
    v[20..24].copy_from_slice(&1u32.to_le_bytes()); // e_version
    v[24..28].copy_from_slice(&entry.to_le_bytes());
    v[28..32].copy_from_slice(&phoff.to_le_bytes());
    v[40..42].copy_from_slice(&52u16.to_le_bytes()); // e_ehsize
    v[42..44].copy_from_slice(&(phentsize as u16).to_le_bytes());
    v[44..46].copy_from_slice(&(segments.len() as u16).to_le_bytes());
    v[46..48].copy_from_slice(&40u16.to_le_bytes()); // e_shentsize

    let mut offset = data_off;
    for (i, (paddr, vaddr, flags, data)) in segments.iter().enumerate() {
        let p = (phoff + phentsize * i as u32) as usize;
        v[p..p + 4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        v[p + 4..p + 8].copy_from_slice(&offset.to_le_bytes());
        v[p + 8..p + 12].copy_from_slice(&vaddr.to_le_bytes());
        v[p + 12..p + 16].copy_from_slice(&paddr.to_le_bytes());
        v[p + 16..p + 20].copy_from_slice(&(data.len() as u32).to_le_bytes());
        v[p + 20..p + 24].copy_from_slice(&(data.len() as u32).to_le_bytes());
        v[p + 24..p + 28].copy_from_slice(&flags.to_le_bytes());
        v[p + 28..p + 32].copy_from_slice(&2u32.to_le_bytes());
        offset += data.len() as u32;
    }
    for (_, _, _, data) in segments {
        v.extend_from_slice(data);
    }
    v
}

fn run_file(path: &PathBuf, extra: impl FnOnce(&mut RunOptions)) -> (Simulator, Leave) {
    let mut opts = quiet_options();
    opts.program_path = Some(path.clone());
    extra(&mut opts);
    let mut sim = Simulator::new(*arch::default_arch(), opts);
    let leave = match sim.prepare() {
        Ok(()) => sim.run(),
        Err(leave) => leave,
    };
    (sim, leave)
}

#[test]
fn raw_binary_loads_at_address_zero() {
    // LDI R16,7; OUT EXIT_PORT,R16
    let path = temp_file("raw.bin");
    fs::write(&path, words_to_bytes(&[ldi(16, 7), out(0x4F, 16)])).unwrap();

    let (sim, leave) = run_file(&path, |_| {});
    assert_eq!(
        leave,
        Leave::Exit {
            value: 7,
            reason: "exit function called".into()
        }
    );
    assert_eq!(sim.program.n_bytes, 4);
    assert_eq!(sim.program.code_start, 0);
    assert_eq!(sim.program.code_end, 3);

    fs::remove_file(&path).ok();
}

#[test]
fn elf_text_segment_runs_from_its_entry() {
    // Entry at byte 4; two NOPs precede the real code.
    let code = words_to_bytes(&[nop(), nop(), ldi(16, 3), out(0x4F, 16)]);
    let path = temp_file("prog.elf");
    fs::write(&path, elf_bytes(4, &[(0, 0, 0x5, &code)])).unwrap();

    let (sim, leave) = run_file(&path, |_| {});
    assert!(matches!(leave, Leave::Exit { value: 3, .. }));
    assert_eq!(sim.program.entry_point, 4);
    assert_eq!(sim.program.n_insns, 2, "execution starts at the entry");

    fs::remove_file(&path).ok();
}

#[test]
fn data_segment_mirrors_into_sram_with_option_d() {
    let code = words_to_bytes(&[rjmp(-1)]);
    let data = [0xDE, 0xAD, 0xBE, 0xEF];
    let image = elf_bytes(
        0,
        &[
            (0, 0, 0x5, &code),
            // .data: load address after the text, runs at 0x800100.
            (code.len() as u32, 0x80_0100, 0x6, &data),
        ],
    );
    let path = temp_file("data.elf");
    fs::write(&path, image).unwrap();

    // Without -d only flash carries the data.
    let (sim, _) = run_file(&path, |_| {});
    assert_eq!(&sim.flash[2..6], &data);
    assert_eq!(&sim.ram[0x100..0x104], &[0, 0, 0, 0]);

    let (sim, _) = run_file(&path, |opts| opts.init_sram = true);
    assert_eq!(&sim.ram[0x100..0x104], &data);

    fs::remove_file(&path).ok();
}

#[test]
fn eeprom_segment_lands_in_the_eeprom_image() {
    let code = words_to_bytes(&[rjmp(-1)]);
    let eep = [1, 2, 3];
    let image = elf_bytes(
        0,
        &[
            (0, 0, 0x5, &code),
            (0x81_0010, 0x81_0010, 0x6, &eep),
        ],
    );
    let path = temp_file("eep.elf");
    fs::write(&path, image).unwrap();

    let (sim, _) = run_file(&path, |_| {});
    assert_eq!(&sim.eeprom[0x10..0x13], &eep);
    // Nothing of it in flash.
    assert_eq!(sim.program.size, code.len() as u32);

    fs::remove_file(&path).ok();
}

#[test]
fn segments_above_eeprom_are_ignored() {
    let code = words_to_bytes(&[rjmp(-1)]);
    let fuse = [0xFF];
    let image = elf_bytes(
        0,
        &[(0, 0, 0x5, &code), (0x82_0000, 0x82_0000, 0x4, &fuse)],
    );
    let path = temp_file("fuse.elf");
    fs::write(&path, image).unwrap();

    let (_, leave) = run_file(&path, |_| {});
    assert!(matches!(leave, Leave::Exit { .. }), "fuse bytes are skipped");

    fs::remove_file(&path).ok();
}

#[test]
fn odd_entry_point_is_a_file_error() {
    let code = words_to_bytes(&[nop(), rjmp(-1)]);
    let path = temp_file("odd.elf");
    fs::write(&path, elf_bytes(1, &[(0, 0, 0x5, &code)])).unwrap();

    let (_, leave) = run_file(&path, |_| {});
    assert_eq!(leave.status(), "FILE");

    fs::remove_file(&path).ok();
}

#[test]
fn entry_override_wins_over_the_elf_header() {
    let code = words_to_bytes(&[ldi(16, 1), out(0x4F, 16), ldi(16, 9), out(0x4F, 16)]);
    let path = temp_file("entry.elf");
    fs::write(&path, elf_bytes(0, &[(0, 0, 0x5, &code)])).unwrap();

    let (_, leave) = run_file(&path, |opts| opts.entry_point = Some(4));
    assert!(matches!(leave, Leave::Exit { value: 9, .. }));

    fs::remove_file(&path).ok();
}

#[test]
fn missing_file_is_reported() {
    let path = temp_file("nonexistent.elf");
    let (_, leave) = run_file(&path, |_| {});
    assert_eq!(leave.status(), "FILE");
}

#[test]
fn oversized_program_is_rejected() {
    let path = temp_file("big.bin");
    fs::write(&path, vec![0u8; 4096]).unwrap();

    let (_, leave) = run_file(&path, |opts| opts.flash_size = Some(2048));
    assert_eq!(leave.status(), "FILE");

    fs::remove_file(&path).ok();
}
