use super::*;

fn bus_with_ff_roms() -> Bus {
    let mut bus = Bus::new();
    bus.load_code_roms(
        &[0xFF; CPU1_ROM_SIZE],
        &[0xFF; SUB_ROM_SIZE],
        &[0xFF; SUB_ROM_SIZE],
    );
    bus
}

#[test]
fn shared_ram_visible_to_all_three_cpus() {
    let mut bus = bus_with_ff_roms();
    bus.write8(CpuId::Cpu1, 0x8800, 0xAB).unwrap();
    for cpu in CpuId::ALL {
        assert_eq!(bus.read8(cpu, 0x8800).unwrap(), 0xAB);
    }
}

#[test]
fn ram_round_trips_in_every_mapped_range() {
    let mut bus = Bus::new();
    for (i, addr) in [0x8000u16, 0x83FF, 0x8400, 0x87FF, 0x8800, 0x9000, 0x93FF, 0x9800, 0x9BFF]
        .into_iter()
        .enumerate()
    {
        let value = 0xA0 | i as u8;
        for cpu in CpuId::ALL {
            bus.write8(cpu, addr, value).unwrap();
            assert_eq!(bus.read8(cpu, addr).unwrap(), value, "{cpu} {addr:#06X}");
        }
    }
}

#[test]
fn word_access_is_little_endian() {
    let mut bus = Bus::new();
    bus.write16(CpuId::Cpu1, 0x9000, 0xBEEF).unwrap();
    assert_eq!(bus.read8(CpuId::Cpu1, 0x9000).unwrap(), 0xEF);
    assert_eq!(bus.read8(CpuId::Cpu1, 0x9001).unwrap(), 0xBE);
    assert_eq!(bus.read16(CpuId::Cpu1, 0x9000).unwrap(), 0xBEEF);
}

#[test]
fn rom_reads_dispatch_per_cpu() {
    let mut bus = Bus::new();
    let mut cpu1 = vec![0u8; CPU1_ROM_SIZE];
    cpu1[0x3FFF] = 0x11;
    let mut cpu2 = vec![0u8; SUB_ROM_SIZE];
    cpu2[0x0123] = 0x22;
    let mut cpu3 = vec![0u8; SUB_ROM_SIZE];
    cpu3[0x0FFF] = 0x33;
    bus.load_code_roms(&cpu1, &cpu2, &cpu3);

    assert_eq!(bus.read8(CpuId::Cpu1, 0x3FFF).unwrap(), 0x11);
    assert_eq!(bus.read8(CpuId::Cpu2, 0x0123).unwrap(), 0x22);
    assert_eq!(bus.read8(CpuId::Cpu3, 0x0FFF).unwrap(), 0x33);
}

#[test]
fn cpu2_above_its_rom_floats_low_but_cpu3_faults() {
    let bus = bus_with_ff_roms();
    assert_eq!(bus.read8(CpuId::Cpu2, 0x1000).unwrap(), 0x00);
    assert_eq!(bus.read8(CpuId::Cpu2, 0x3FFF).unwrap(), 0x00);
    assert_eq!(
        bus.read8(CpuId::Cpu3, 0x1000),
        Err(BusFault::UnmappedAddress {
            cpu: CpuId::Cpu3,
            addr: 0x1000,
            op: Access::Read,
        })
    );
}

#[test]
fn rom_writes_are_rejected_without_override() {
    let mut bus = Bus::new();
    assert_eq!(
        bus.write8(CpuId::Cpu1, 0x0000, 0x00),
        Err(BusFault::ReadOnlyWrite {
            cpu: CpuId::Cpu1,
            addr: 0x0000,
        })
    );

    bus.set_writable_rom(true);
    bus.write8(CpuId::Cpu1, 0x0000, 0x5A).unwrap();
    assert_eq!(bus.read8(CpuId::Cpu1, 0x0000).unwrap(), 0x5A);
    bus.write8(CpuId::Cpu3, 0x0800, 0xC3).unwrap();
    assert_eq!(bus.read8(CpuId::Cpu3, 0x0800).unwrap(), 0xC3);
}

#[test]
fn reset_latch_holds_then_releases_the_sub_cpus() {
    let mut bus = Bus::new();
    assert!(bus.halt_cpu2() && bus.halt_cpu3());

    bus.write8(CpuId::Cpu1, 0x6823, 0).unwrap();
    assert!(bus.halt_cpu2() && bus.halt_cpu3());

    bus.write8(CpuId::Cpu1, 0x6823, 1).unwrap();
    assert!(!bus.halt_cpu2());
    assert!(!bus.halt_cpu3());
}

#[test]
fn irq_enable_latches_follow_written_value() {
    let mut bus = Bus::new();
    bus.write8(CpuId::Cpu1, 0x6820, 0x01).unwrap();
    bus.write8(CpuId::Cpu2, 0x6821, 0xFF).unwrap();
    assert!(bus.irq1_enabled);
    assert!(bus.irq2_enabled);
    bus.write8(CpuId::Cpu1, 0x6820, 0x00).unwrap();
    assert!(!bus.irq1_enabled);
}

#[test]
fn nmi_enable_latch_is_inverted() {
    let mut bus = Bus::new();
    bus.write8(CpuId::Cpu3, 0x6822, 0).unwrap();
    assert!(bus.nmi3_enabled);
    bus.write8(CpuId::Cpu3, 0x6822, 1).unwrap();
    assert!(!bus.nmi3_enabled);
}

#[test]
fn dip_bank_reads_pair_the_two_switches() {
    let bus = Bus::new();
    // Factory default: only 0x6804 reads freeze-off (switch A bit 4).
    for addr in 0x6800..=0x6807u16 {
        let expected = if addr == 0x6804 { 0b10 } else { 0 };
        assert_eq!(bus.read8(CpuId::Cpu1, addr).unwrap(), expected);
    }

    let mut bus = Bus::new();
    bus.set_dips(DipSwitches {
        switch_a: 0b0000_0101,
        switch_b: 0b0000_0011,
    });
    assert_eq!(bus.read8(CpuId::Cpu1, 0x6800).unwrap(), 0b11);
    assert_eq!(bus.read8(CpuId::Cpu1, 0x6801).unwrap(), 0b01);
    assert_eq!(bus.read8(CpuId::Cpu1, 0x6802).unwrap(), 0b10);
    assert_eq!(bus.read8(CpuId::Cpu1, 0x6803).unwrap(), 0b00);
}

#[test]
fn custom_io_bus_reads_ready() {
    let mut bus = Bus::new();
    for addr in [0x7000u16, 0x7050, 0x7100] {
        assert_eq!(bus.read8(CpuId::Cpu1, addr).unwrap(), 0x10);
        bus.write8(CpuId::Cpu1, addr, 0xE1).unwrap();
        // Writes are sunk; the stub keeps answering ready.
        assert_eq!(bus.read8(CpuId::Cpu1, addr).unwrap(), 0x10);
    }
}

#[test]
fn sound_watchdog_starfield_and_flip_are_write_sinks() {
    let mut bus = Bus::new();
    bus.write8(CpuId::Cpu2, 0x6800, 0x0F).unwrap();
    bus.write8(CpuId::Cpu2, 0x681F, 0x0F).unwrap();
    bus.write8(CpuId::Cpu1, 0x6830, 0xAA).unwrap();
    bus.write8(CpuId::Cpu1, 0xA000, 0x01).unwrap();
    bus.write8(CpuId::Cpu1, 0xA005, 0x01).unwrap();

    assert!(!bus.flip_screen());
    bus.write8(CpuId::Cpu1, 0xA007, 0x01).unwrap();
    assert!(bus.flip_screen());
    bus.write8(CpuId::Cpu1, 0xA007, 0x00).unwrap();
    assert!(!bus.flip_screen());
}

#[test]
fn unimplemented_latches_log_and_continue() {
    let mut bus = Bus::new();
    for addr in 0x6824..=0x6827u16 {
        bus.write8(CpuId::Cpu1, addr, 0x01).unwrap();
    }
}

#[test]
fn decoder_is_fail_closed() {
    let mut bus = Bus::new();
    for addr in [0x4000u16, 0x5FFF, 0x6808, 0x68FF, 0x8C00, 0x9400, 0x9C00, 0xA008, 0xFFFF] {
        assert!(bus.read8(CpuId::Cpu1, addr).is_err(), "read {addr:#06X}");
    }
    for addr in [0x4000u16, 0x6831, 0xA006, 0xC000] {
        assert!(
            bus.write8(CpuId::Cpu1, addr, 0).is_err(),
            "write {addr:#06X}"
        );
    }
}

#[test]
fn port0_write_latches_only_for_cpu1() {
    let mut bus = Bus::new();
    bus.device_write(CpuId::Cpu2, 0, 0x55);
    assert_eq!(bus.port0_last_write(), 0x00);
    bus.device_write(CpuId::Cpu1, 1, 0x66);
    assert_eq!(bus.port0_last_write(), 0x00);
    bus.device_write(CpuId::Cpu1, 0, 0x77);
    assert_eq!(bus.port0_last_write(), 0x77);
    assert_eq!(bus.device_read(CpuId::Cpu1, 0x42), 0);
}
