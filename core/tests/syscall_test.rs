use std::fs;

mod common;
use common::*;

const LOG_PORT: u16 = 0x4A;

fn words_with(parts: &[&[u16]]) -> Vec<u16> {
    let mut v = Vec::new();
    for p in parts {
        v.extend_from_slice(p);
    }
    v
}

#[test]
fn syscalls_are_detected_at_decode_time() {
    let sim = sim_with_words(&words_with(&[&syscall(5), &syscall(21), &[rjmp(-1)]]));
    assert!(sim.have_syscall[5]);
    assert!(sim.have_syscall[21]);
    assert!(!sim.have_syscall[7]);
}

#[test]
fn syscall_is_two_words_and_free() {
    let mut sim = sim_with_words(&words_with(&[&[ldi(24, 0)], &syscall(0), &[rjmp(-1)]]));
    step_n(&mut sim, 2);
    assert_eq!(sim.pc, 3);
    assert_eq!(sim.program.n_cycles, 1, "only the LDI costs a cycle");
}

#[test]
fn log_syscalls_toggle_the_trace_state() {
    // syscall 1 = log on, syscall 0 = log off.
    let mut sim = sim_with_words(&words_with(&[&syscall(1), &syscall(0), &[rjmp(-1)]]));
    assert!(sim.trace.need.logging, "log syscalls imply the need");
    assert!(!sim.trace.log_on);
    sim.do_step().unwrap();
    assert!(sim.trace.log_on);
    sim.do_step().unwrap();
    assert!(!sim.trace.log_on);
}

#[test]
fn misc_arith_divides_like_libgcc() {
    // syscall 21, selector in R26: 2 = divu32.
    let mut sim = sim_with_words(&words_with(&[&syscall(21), &[rjmp(-1)]]));
    sim.ram[26] = 2;
    sim.ram[22..26].copy_from_slice(&100u32.to_le_bytes());
    sim.ram[18..22].copy_from_slice(&7u32.to_le_bytes());
    sim.do_step().unwrap();
    assert_eq!(
        u32::from_le_bytes([sim.ram[22], sim.ram[23], sim.ram[24], sim.ram[25]]),
        14
    );

    // Division by zero yields all-ones.
    let mut sim = sim_with_words(&words_with(&[&syscall(21), &[rjmp(-1)]]));
    sim.ram[26] = 2;
    sim.ram[22..26].copy_from_slice(&100u32.to_le_bytes());
    sim.ram[18..22].copy_from_slice(&0u32.to_le_bytes());
    sim.do_step().unwrap();
    assert_eq!(
        u32::from_le_bytes([sim.ram[22], sim.ram[23], sim.ram[24], sim.ram[25]]),
        u32::MAX
    );
}

#[test]
fn misc_arith_signed_modulo() {
    // 5 = mods32: -7 % 3 = -1.
    let mut sim = sim_with_words(&words_with(&[&syscall(21), &[rjmp(-1)]]));
    sim.ram[26] = 5;
    sim.ram[22..26].copy_from_slice(&(-7i32).to_le_bytes());
    sim.ram[18..22].copy_from_slice(&3i32.to_le_bytes());
    sim.do_step().unwrap();
    let r = i32::from_le_bytes([sim.ram[22], sim.ram[23], sim.ram[24], sim.ram[25]]);
    assert_eq!(r, -1);
}

#[test]
fn misc_arith_64_bit_multiply() {
    // 8 = mulu64: a in R18..R25, b in R10..R17.
    let mut sim = sim_with_words(&words_with(&[&syscall(21), &[rjmp(-1)]]));
    sim.ram[26] = 8;
    sim.ram[18..26].copy_from_slice(&0x1_0000_0001u64.to_le_bytes());
    sim.ram[10..18].copy_from_slice(&3u64.to_le_bytes());
    sim.do_step().unwrap();
    let mut r = [0u8; 8];
    r.copy_from_slice(&sim.ram[18..26]);
    assert_eq!(u64::from_le_bytes(r), 0x3_0000_0003);
}

#[test]
fn get_args_pumps_argv_into_ram() {
    // LOG_PORT <- GET_ARGS, then the address 0xF000 byte by byte.
    let mut opts = quiet_options();
    opts.guest_args = vec!["alpha".into(), "-x".into()];
    let words = [
        ldi(16, 0xFD), // LOG config: get-args
        out(LOG_PORT, 16),
        ldi(16, 0x00),
        out(LOG_PORT, 16),
        ldi(16, 0xF0),
        out(LOG_PORT, 16),
        rjmp(-1),
    ];
    let mut sim = sim_with_words_on(octavr_core::core::arch::default_arch(), opts, &words);
    sim.program.short_name = "prog.elf".into();
    step_n(&mut sim, 6);

    // argv[0] is the program name, then the -args tail.
    let argc = u16::from(sim.ram[24]) | (u16::from(sim.ram[25]) << 8);
    assert_eq!(argc, 3);
    let argv = usize::from(u16::from(sim.ram[22]) | (u16::from(sim.ram[23]) << 8));

    let mut strings = Vec::new();
    for i in 0..argc as usize {
        let p = usize::from(u16::from(sim.ram[argv + 2 * i]) | (u16::from(sim.ram[argv + 2 * i + 1]) << 8));
        let end = (p..).find(|&j| sim.ram[j] == 0).unwrap();
        strings.push(String::from_utf8_lossy(&sim.ram[p..end]).into_owned());
    }
    assert_eq!(strings, ["prog.elf", "alpha", "-x"]);
    // NULL terminator after the pointers.
    assert_eq!(sim.ram[argv + 2 * argc as usize], 0);
    assert_eq!(sim.ram[argv + 2 * argc as usize + 1], 0);
    // R20 tells the startup code it runs under a log-capable simulator.
    assert_eq!(sim.ram[20], 1);
    assert_eq!(sim.ram[0xFFFF], 1);
}

#[test]
fn fileio_writes_into_the_sandbox() {
    let sandbox = std::env::temp_dir().join(format!("octavr-sbox-{}", std::process::id()));
    fs::create_dir_all(&sandbox).unwrap();

    let mut opts = quiet_options();
    opts.sandbox = Some(sandbox.clone());

    // fopen("out.txt", "w"); fputc('A'); fclose
    let words = words_with(&[
        &syscall(26), // fopen
        &syscall(26), // fputc
        &syscall(26), // fclose
        &[rjmp(-1)],
    ]);
    let mut sim = sim_with_words_on(octavr_core::core::arch::default_arch(), opts, &words);

    // Stage the strings in guest RAM.
    let name = b"out.txt\0";
    let mode = b"w\0";
    sim.ram[0x200..0x200 + name.len()].copy_from_slice(name);
    sim.ram[0x210..0x210 + mode.len()].copy_from_slice(mode);

    // fopen: R24 = 0, args = name_ptr | mode_ptr << 16.
    sim.ram[24] = 0;
    sim.ram[20..22].copy_from_slice(&0x0200u16.to_le_bytes());
    sim.ram[22..24].copy_from_slice(&0x0210u16.to_le_bytes());
    sim.do_step().unwrap();
    let handle = sim.ram[22];
    assert_eq!(handle, 1, "first free handle");

    // fputc: R24 = 3, args = 'A' | handle << 8.
    sim.ram[24] = 3;
    let args = u32::from(b'A') | (u32::from(handle) << 8);
    sim.ram[20..24].copy_from_slice(&args.to_le_bytes());
    sim.do_step().unwrap();

    // fclose: R24 = 1, args = handle.
    sim.ram[24] = 1;
    sim.ram[20..24].copy_from_slice(&u32::from(handle).to_le_bytes());
    sim.do_step().unwrap();

    let written = fs::read_to_string(sandbox.join("out.txt")).unwrap();
    assert_eq!(written, "A");

    fs::remove_dir_all(&sandbox).ok();
}

#[test]
fn fileio_rejects_path_escapes() {
    let sandbox = std::env::temp_dir().join(format!("octavr-sbox-esc-{}", std::process::id()));
    fs::create_dir_all(&sandbox).unwrap();

    let mut opts = quiet_options();
    opts.sandbox = Some(sandbox.clone());
    let words = words_with(&[&syscall(26), &[rjmp(-1)]]);
    let mut sim = sim_with_words_on(octavr_core::core::arch::default_arch(), opts, &words);

    let name = b"../etc/x\0";
    sim.ram[0x200..0x200 + name.len()].copy_from_slice(name);
    let mode = b"w\0";
    sim.ram[0x210..0x210 + mode.len()].copy_from_slice(mode);
    sim.ram[24] = 0;
    sim.ram[20..22].copy_from_slice(&0x0200u16.to_le_bytes());
    sim.ram[22..24].copy_from_slice(&0x0210u16.to_le_bytes());

    let leave = sim.do_step().unwrap_err();
    assert_eq!(leave.status(), "HOSTIO");
    fs::remove_dir_all(&sandbox).ok();
}

#[test]
fn fileio_without_sandbox_is_a_usage_error() {
    let words = words_with(&[&syscall(26), &[rjmp(-1)]]);
    let mut sim = sim_with_words(&words);
    let name = b"x\0";
    sim.ram[0x200..0x200 + name.len()].copy_from_slice(name);
    let mode = b"r\0";
    sim.ram[0x210..0x210 + mode.len()].copy_from_slice(mode);
    sim.ram[24] = 0;
    sim.ram[20..22].copy_from_slice(&0x0200u16.to_le_bytes());
    sim.ram[22..24].copy_from_slice(&0x0210u16.to_le_bytes());
    let leave = sim.do_step().unwrap_err();
    assert_eq!(leave.status(), "USAGE");
}
