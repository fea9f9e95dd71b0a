use super::*;
use crate::bus::Bus;

fn machine(program: &[u8]) -> (Z80, Bus) {
    let mut bus = Bus::new();
    bus.load_code_roms(program, &[], &[]);
    let mut cpu = Z80::new(CpuId::Cpu1);
    cpu.regs.sp = 0x9C00; // stack grows down into shared RAM #3
    (cpu, bus)
}

fn step(cpu: &mut Z80, bus: &mut Bus) -> u32 {
    let mut handle = BusHandle::new(bus, CpuId::Cpu1);
    cpu.step(&mut handle).unwrap()
}

#[test]
fn loads_and_adds_through_memory() {
    // LD A,0x0F; LD B,0x01; ADD A,B; LD (0x8800),A
    let (mut cpu, mut bus) = machine(&[0x3E, 0x0F, 0x06, 0x01, 0x80, 0x32, 0x00, 0x88]);
    for _ in 0..4 {
        step(&mut cpu, &mut bus);
    }
    assert_eq!(cpu.regs.a, 0x10);
    assert_eq!(bus.read8(CpuId::Cpu1, 0x8800).unwrap(), 0x10);
    assert!(!cpu.flag(FLAG_ZERO));
    assert!(cpu.flag(FLAG_HALF));
    assert!(!cpu.flag(FLAG_CARRY));
}

#[test]
fn compare_sets_zero_without_clobbering_a() {
    // LD A,0x42; CP 0x42; CP 0x50
    let (mut cpu, mut bus) = machine(&[0x3E, 0x42, 0xFE, 0x42, 0xFE, 0x50]);
    step(&mut cpu, &mut bus);
    step(&mut cpu, &mut bus);
    assert!(cpu.flag(FLAG_ZERO));
    assert_eq!(cpu.regs.a, 0x42);
    step(&mut cpu, &mut bus);
    assert!(cpu.flag(FLAG_CARRY));
    assert!(!cpu.flag(FLAG_ZERO));
}

#[test]
fn call_and_ret_use_the_stack() {
    // 0000: CALL 0x0008; LD (0x8801),A; HALT
    // 0008: LD A,0x77; RET
    let mut program = vec![0xCD, 0x08, 0x00, 0x32, 0x01, 0x88, 0x76, 0x00];
    program.extend_from_slice(&[0x3E, 0x77, 0xC9]);
    let (mut cpu, mut bus) = machine(&program);
    let cycles = step(&mut cpu, &mut bus);
    assert_eq!(cycles, 17);
    assert_eq!(cpu.regs.pc, 0x0008);
    // Return address on the stack, little-endian.
    assert_eq!(bus.read16(CpuId::Cpu1, 0x9BFE).unwrap(), 0x0003);
    step(&mut cpu, &mut bus);
    step(&mut cpu, &mut bus);
    assert_eq!(cpu.regs.pc, 0x0003);
    step(&mut cpu, &mut bus);
    assert_eq!(bus.read8(CpuId::Cpu1, 0x8801).unwrap(), 0x77);
}

#[test]
fn djnz_counts_b_down() {
    // LD B,3; loop: DJNZ loop; HALT
    let (mut cpu, mut bus) = machine(&[0x06, 0x03, 0x10, 0xFE, 0x76]);
    step(&mut cpu, &mut bus);
    assert_eq!(step(&mut cpu, &mut bus), 13);
    assert_eq!(cpu.regs.pc, 0x0002);
    assert_eq!(step(&mut cpu, &mut bus), 13);
    assert_eq!(step(&mut cpu, &mut bus), 8);
    assert_eq!(cpu.regs.b, 0);
    assert_eq!(cpu.regs.pc, 0x0004);
}

#[test]
fn out_port_zero_reaches_the_board_latch() {
    // LD A,0xB7; OUT (0),A
    let (mut cpu, mut bus) = machine(&[0x3E, 0xB7, 0xD3, 0x00]);
    step(&mut cpu, &mut bus);
    step(&mut cpu, &mut bus);
    assert_eq!(bus.port0_last_write(), 0xB7);
}

#[test]
fn im2_interrupt_vectors_through_the_table() {
    // LD A,0x88; LD I,A; IM 2; EI; then NOPs.
    let (mut cpu, mut bus) = machine(&[0x3E, 0x88, 0xED, 0x47, 0xED, 0x5E, 0xFB, 0x00, 0x00]);
    bus.write16(CpuId::Cpu1, 0x8810, 0x0234).unwrap();
    cpu.inject_maskable(0x10);

    for _ in 0..4 {
        step(&mut cpu, &mut bus);
    }
    assert_eq!(cpu.im, 2);
    assert!(cpu.iff1);
    // EI shadows the very next instruction; the NOP runs first.
    step(&mut cpu, &mut bus);
    assert_eq!(cpu.regs.pc, 0x0008);
    let cycles = step(&mut cpu, &mut bus);
    assert_eq!(cycles, 19);
    assert_eq!(cpu.regs.pc, 0x0234);
    assert!(!cpu.iff1);
    // The interrupted PC was pushed.
    assert_eq!(bus.read16(CpuId::Cpu1, 0x9BFE).unwrap(), 0x0008);
}

#[test]
fn halt_spins_until_nmi() {
    let (mut cpu, mut bus) = machine(&[0x76]);
    step(&mut cpu, &mut bus);
    assert!(cpu.halted());
    assert_eq!(step(&mut cpu, &mut bus), 4);
    assert_eq!(cpu.regs.pc, 0x0001);

    cpu.inject_nmi();
    let cycles = step(&mut cpu, &mut bus);
    assert_eq!(cycles, 11);
    assert!(!cpu.halted());
    assert_eq!(cpu.regs.pc, 0x0066);
    assert_eq!(bus.read16(CpuId::Cpu1, 0x9BFE).unwrap(), 0x0001);
    // NMI preserved IFF1 into IFF2.
    assert!(!cpu.iff2);
}

#[test]
fn maskable_injection_waits_for_ei() {
    let (mut cpu, mut bus) = machine(&[0x00, 0x00, 0x00]);
    cpu.inject_maskable(0x00);
    step(&mut cpu, &mut bus);
    // IFF1 clear: the request stays pending.
    assert_eq!(cpu.regs.pc, 0x0001);
    assert!(cpu.irq_pending);
}

#[test]
fn indexed_addressing_applies_displacement() {
    // LD IX,0x8800; LD (IX+5),0x42; LD A,(IX+5)
    let (mut cpu, mut bus) = machine(&[
        0xDD, 0x21, 0x00, 0x88, // LD IX,0x8800
        0xDD, 0x36, 0x05, 0x42, // LD (IX+5),0x42
        0xDD, 0x7E, 0x05, // LD A,(IX+5)
    ]);
    step(&mut cpu, &mut bus);
    assert_eq!(cpu.regs.ix, 0x8800);
    step(&mut cpu, &mut bus);
    assert_eq!(bus.read8(CpuId::Cpu1, 0x8805).unwrap(), 0x42);
    step(&mut cpu, &mut bus);
    assert_eq!(cpu.regs.a, 0x42);
}

#[test]
fn cb_bit_ops_set_and_test() {
    // LD A,0x00; SET 3,A; BIT 3,A; RES 3,A; BIT 3,A
    let (mut cpu, mut bus) = machine(&[
        0x3E, 0x00, 0xCB, 0xDF, 0xCB, 0x5F, 0xCB, 0x9F, 0xCB, 0x5F,
    ]);
    step(&mut cpu, &mut bus);
    step(&mut cpu, &mut bus);
    assert_eq!(cpu.regs.a, 0x08);
    step(&mut cpu, &mut bus);
    assert!(!cpu.flag(FLAG_ZERO));
    step(&mut cpu, &mut bus);
    assert_eq!(cpu.regs.a, 0x00);
    step(&mut cpu, &mut bus);
    assert!(cpu.flag(FLAG_ZERO));
}

#[test]
fn ldir_copies_and_rewinds_pc() {
    let (mut cpu, mut bus) = machine(&[0xED, 0xB0]);
    for (i, value) in [0x11u8, 0x22, 0x33].into_iter().enumerate() {
        bus.write8(CpuId::Cpu1, 0x8800 + i as u16, value).unwrap();
    }
    cpu.set_hl(Index::Hl, 0x8800);
    cpu.set_de(0x9000);
    cpu.set_bc(3);

    assert_eq!(step(&mut cpu, &mut bus), 21);
    assert_eq!(cpu.regs.pc, 0x0000);
    assert_eq!(step(&mut cpu, &mut bus), 21);
    assert_eq!(step(&mut cpu, &mut bus), 16);
    assert_eq!(cpu.regs.pc, 0x0002);
    assert_eq!(cpu.bc(), 0);
    for (i, value) in [0x11u8, 0x22, 0x33].into_iter().enumerate() {
        assert_eq!(bus.read8(CpuId::Cpu1, 0x9000 + i as u16).unwrap(), value);
    }
    assert!(!cpu.flag(FLAG_PARITY));
}

#[test]
fn sixteen_bit_arithmetic_flags() {
    // LD HL,0x0FFF; LD BC,0x0001; ADD HL,BC
    let (mut cpu, mut bus) = machine(&[0x21, 0xFF, 0x0F, 0x01, 0x01, 0x00, 0x09]);
    step(&mut cpu, &mut bus);
    step(&mut cpu, &mut bus);
    step(&mut cpu, &mut bus);
    assert_eq!(cpu.hl(Index::Hl), 0x1000);
    assert!(cpu.flag(FLAG_HALF));
    assert!(!cpu.flag(FLAG_CARRY));
}

#[test]
fn state_round_trip_preserves_execution() {
    let (mut cpu, mut bus) = machine(&[0x3E, 0x12, 0x06, 0x34, 0x76]);
    step(&mut cpu, &mut bus);
    let saved = cpu.state();

    step(&mut cpu, &mut bus);
    step(&mut cpu, &mut bus);
    assert!(cpu.halted());

    cpu.restore(&saved);
    assert_eq!(cpu.regs.a, 0x12);
    assert_eq!(cpu.regs.pc, 0x0002);
    assert!(!cpu.halted());
    step(&mut cpu, &mut bus);
    assert_eq!(cpu.regs.b, 0x34);
}

#[test]
fn rst_pushes_and_jumps_to_fixed_vector() {
    let (mut cpu, mut bus) = machine(&[0xEF]); // RST 0x28
    let cycles = step(&mut cpu, &mut bus);
    assert_eq!(cycles, 11);
    assert_eq!(cpu.regs.pc, 0x0028);
    assert_eq!(bus.read16(CpuId::Cpu1, 0x9BFE).unwrap(), 0x0001);
}

#[test]
fn exchange_and_shadow_sets() {
    // LD A,1; EX AF,AF'; LD A,2; EX AF,AF'
    let (mut cpu, mut bus) = machine(&[0x3E, 0x01, 0x08, 0x3E, 0x02, 0x08]);
    for _ in 0..6 {
        step(&mut cpu, &mut bus);
    }
    assert_eq!(cpu.regs.a, 0x01);
    assert_eq!(cpu.regs.alt_a, 0x02);
}
