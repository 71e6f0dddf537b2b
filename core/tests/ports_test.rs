use octavr_core::core::program::Leave;

mod common;
use common::*;

const EXIT_PORT: u16 = 0x4F;
const ABORT_PORT: u16 = 0x49;
const TICKS_PORT: u16 = 0x44;

#[test]
fn exit_port_carries_the_exit_value() {
    // LDI R16,7; OUT EXIT_PORT,R16
    let mut sim = sim_with_words(&[ldi(16, 7), out(EXIT_PORT, 16)]);
    sim.do_step().unwrap();
    let leave = sim.do_step().unwrap_err();
    assert_eq!(
        leave,
        Leave::Exit {
            value: 7,
            reason: "exit function called".into()
        }
    );
    assert_eq!(leave.exit_code(), 7);
    assert_eq!(sim.program.n_cycles, 2);
    assert_eq!(sim.program.n_insns, 2);
}

#[test]
fn exit_port_zero_is_a_clean_exit() {
    let mut sim = sim_with_words(&[ldi(16, 0), out(EXIT_PORT, 16)]);
    sim.do_step().unwrap();
    let leave = sim.do_step().unwrap_err();
    assert!(matches!(leave, Leave::Exit { value: 0, .. }));
    assert_eq!(leave.exit_code(), 0);
}

#[test]
fn abort_port_aborts_regardless_of_value() {
    let mut sim = sim_with_words(&[ldi(16, 0), out(ABORT_PORT, 16)]);
    sim.do_step().unwrap();
    let leave = sim.do_step().unwrap_err();
    assert_eq!(leave, Leave::Aborted("abort function called".into()));
    assert_eq!(leave.exit_code(), 1);
}

#[test]
fn stack_overflow_below_reserved_registers_aborts() {
    let mut sim = sim_with_words(&[push(16), rjmp(-1)]);
    init_stack(&mut sim, 0x005F);
    let leave = sim.do_step().unwrap_err();
    assert_eq!(leave, Leave::Aborted("stack pointer overflow".into()));

    // 0x60 is still fine on classic parts.
    let mut sim = sim_with_words(&[push(16), rjmp(-1)]);
    init_stack(&mut sim, 0x0060);
    sim.do_step().unwrap();
}

#[test]
fn ticks_port_latches_the_cycle_count() {
    // 3 NOPs, then OUT TICKS,R16 (R16 = 0: get cycles),
    // then IN R20..R23 from TICKS..TICKS+3.
    let mut sim = sim_with_words(&[
        ldi(16, 0),
        nop(),
        nop(),
        nop(),
        out(TICKS_PORT, 16),
        in_(20, TICKS_PORT),
        in_(21, TICKS_PORT + 1),
        in_(22, TICKS_PORT + 2),
        in_(23, TICKS_PORT + 3),
        rjmp(-1),
    ]);
    step_n(&mut sim, 9);
    let ticks = u32::from_le_bytes([sim.ram[20], sim.ram[21], sim.ram[22], sim.ram[23]]);
    // LDI + 3 NOPs + the OUT itself.
    assert_eq!(ticks, 5);
    // The value is also mirrored into R22..R25 at command time, but
    // the later INs overwrote R22/R23; the low half survives in the
    // latch reads above.
}

#[test]
fn ticks_port_reset_rebases_the_counter() {
    let mut sim = sim_with_words(&[
        ldi(16, 0x81), // reset cycles
        out(TICKS_PORT, 16),
        ldi(16, 0),
        out(TICKS_PORT, 16), // get cycles since reset
        in_(20, TICKS_PORT),
        rjmp(-1),
    ]);
    step_n(&mut sim, 5);
    // Since the reset: LDI + OUT = 2 cycles.
    assert_eq!(sim.ram[20], 2);
}

#[test]
fn ticks_prand_is_deterministic_and_nonzero() {
    let mut sim = sim_with_words(&[
        ldi(16, 2),
        out(TICKS_PORT, 16),
        in_(20, TICKS_PORT),
        out(TICKS_PORT, 16),
        in_(21, TICKS_PORT),
        rjmp(-1),
    ]);
    step_n(&mut sim, 5);
    // Multiplicative generator: x' = x * 0xcafebabe mod 0xfffffffb,
    // seeded with 1 on first use.
    let v1 = 0xCAFE_BABEu64 % 0xFFFF_FFFB;
    let v2 = (v1 * 0xCAFE_BABE) % 0xFFFF_FFFB;
    assert_eq!(sim.ram[20], v1 as u8);
    assert_eq!(sim.ram[21], v2 as u8);
}
