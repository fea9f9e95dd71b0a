//! The shared memory bus and its address decoder.
//!
//! All three CPUs see the same map; the decoder is parameterised by the
//! CPU identifier so one bus object serves the whole board. The bus is
//! the sole owner of the code ROMs, the 64 KiB shared RAM/VRAM array and
//! the MMIO latch state; the hardware loop steps the CPUs sequentially,
//! so there is no concurrent access to model.

use log::{debug, trace, warn};
use thiserror::Error;

mod dips;

pub use dips::{DipError, DipSwitches};

/// CPU1 code window, four concatenated 4 KiB blocks.
pub const CPU1_ROM_SIZE: usize = 0x4000;

/// CPU2/CPU3 code windows, one 4 KiB block each.
pub const SUB_ROM_SIZE: usize = 0x1000;

const MEMORY_SIZE: usize = 0x1_0000;

const ROM_END: u16 = 0x3FFF;
pub(crate) const DIP_BASE: u16 = 0x6800;
const DIP_END: u16 = 0x6807;
const SOUND_END: u16 = 0x681F;
const LATCH_IRQ1: u16 = 0x6820;
const LATCH_IRQ2: u16 = 0x6821;
const LATCH_NMI3: u16 = 0x6822;
const LATCH_RESET: u16 = 0x6823;
const LATCH_END: u16 = 0x6827;
const WATCHDOG: u16 = 0x6830;
const IOBUS_BASE: u16 = 0x7000;
const IOBUS_END: u16 = 0x7100;

/// Tile codes live at 0x8000+i, the matching attribute at 0x8400+i.
pub const VRAM_CODE_BASE: u16 = 0x8000;
pub const VRAM_ATTR_BASE: u16 = 0x8400;
const VRAM_END: u16 = 0x87FF;

const RAM1_BASE: u16 = 0x8800;
const RAM1_END: u16 = 0x8BFF;
const RAM2_BASE: u16 = 0x9000;
const RAM2_END: u16 = 0x93FF;
const RAM3_BASE: u16 = 0x9800;
const RAM3_END: u16 = 0x9BFF;

const STARFIELD_BASE: u16 = 0xA000;
const STARFIELD_END: u16 = 0xA005;
const FLIP_SCREEN: u16 = 0xA007;

// The 06XX interface to the 51XX/54XX MCUs is stubbed; reads answer
// "ready" so CPU1's I/O wait loop makes progress.
const IOBUS_READY: u8 = 0x10;

/// Which CPU an access came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CpuId {
    Cpu1,
    Cpu2,
    Cpu3,
}

impl CpuId {
    pub const ALL: [CpuId; 3] = [CpuId::Cpu1, CpuId::Cpu2, CpuId::Cpu3];

    #[inline]
    pub fn index(self) -> usize {
        match self {
            CpuId::Cpu1 => 0,
            CpuId::Cpu2 => 1,
            CpuId::Cpu3 => 2,
        }
    }
}

impl std::fmt::Display for CpuId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CpuId::Cpu1 => write!(f, "CPU1"),
            CpuId::Cpu2 => write!(f, "CPU2"),
            CpuId::Cpu3 => write!(f, "CPU3"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

impl std::fmt::Display for Access {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Access::Read => write!(f, "read"),
            Access::Write => write!(f, "write"),
        }
    }
}

/// Fatal bus decode failures. The decoder is fail-closed: anything
/// outside the documented map halts the board with a dump.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusFault {
    #[error("{cpu}: {op} of unmapped address {addr:#06X}")]
    UnmappedAddress { cpu: CpuId, addr: u16, op: Access },
    #[error("{cpu}: write to ROM address {addr:#06X}")]
    ReadOnlyWrite { cpu: CpuId, addr: u16 },
}

pub struct Bus {
    cpu1_rom: Vec<u8>,
    cpu2_rom: Vec<u8>,
    cpu3_rom: Vec<u8>,
    memory: Vec<u8>,
    dips: DipSwitches,
    writable_rom: bool,

    // 0x6820-0x6823 latch bank.
    pub(crate) irq1_enabled: bool,
    pub(crate) irq2_enabled: bool,
    pub(crate) nmi3_enabled: bool,
    pub(crate) halt_cpu2: bool,
    pub(crate) halt_cpu3: bool,

    // CPU1 device port 0 latch; becomes the IM2 vector low byte.
    pub(crate) port0_last_write: u8,

    sound_regs: [u8; 0x20],
    starfield: [u8; 6],
    flip_screen: bool,
}

impl Bus {
    /// Bus with zeroed ROMs and RAM. CPU2/CPU3 power up held in reset.
    pub fn new() -> Self {
        Self {
            cpu1_rom: vec![0; CPU1_ROM_SIZE],
            cpu2_rom: vec![0; SUB_ROM_SIZE],
            cpu3_rom: vec![0; SUB_ROM_SIZE],
            memory: vec![0; MEMORY_SIZE],
            dips: DipSwitches::default(),
            writable_rom: false,
            irq1_enabled: false,
            irq2_enabled: false,
            nmi3_enabled: false,
            halt_cpu2: true,
            halt_cpu3: true,
            port0_last_write: 0,
            sound_regs: [0; 0x20],
            starfield: [0; 6],
            flip_screen: false,
        }
    }

    /// Install the three code images. Slices shorter than the window are
    /// zero-padded, longer ones truncated.
    pub fn load_code_roms(&mut self, cpu1: &[u8], cpu2: &[u8], cpu3: &[u8]) {
        fill_rom(&mut self.cpu1_rom, cpu1);
        fill_rom(&mut self.cpu2_rom, cpu2);
        fill_rom(&mut self.cpu3_rom, cpu3);
    }

    pub fn set_dips(&mut self, dips: DipSwitches) {
        self.dips = dips;
    }

    pub fn set_writable_rom(&mut self, writable: bool) {
        self.writable_rom = writable;
    }

    pub fn halt_cpu2(&self) -> bool {
        self.halt_cpu2
    }

    pub fn halt_cpu3(&self) -> bool {
        self.halt_cpu3
    }

    pub fn port0_last_write(&self) -> u8 {
        self.port0_last_write
    }

    pub fn flip_screen(&self) -> bool {
        self.flip_screen
    }

    #[inline]
    pub fn read8(&self, cpu: CpuId, addr: u16) -> Result<u8, BusFault> {
        match addr {
            0x0000..=ROM_END => self.read_rom(cpu, addr),
            DIP_BASE..=DIP_END => Ok(self.dips.read(addr)),
            IOBUS_BASE..=IOBUS_END => Ok(IOBUS_READY),
            VRAM_CODE_BASE..=VRAM_END
            | RAM1_BASE..=RAM1_END
            | RAM2_BASE..=RAM2_END
            | RAM3_BASE..=RAM3_END => Ok(self.memory[addr as usize]),
            _ => Err(BusFault::UnmappedAddress {
                cpu,
                addr,
                op: Access::Read,
            }),
        }
    }

    #[inline]
    pub fn write8(&mut self, cpu: CpuId, addr: u16, value: u8) -> Result<(), BusFault> {
        match addr {
            0x0000..=ROM_END => self.write_rom(cpu, addr, value),
            // Waveform sound generator registers. Audio synthesis is not
            // modelled; the values are latched so ROM code runs.
            DIP_BASE..=SOUND_END => {
                self.sound_regs[(addr - DIP_BASE) as usize] = value;
                trace!("{cpu}: sound reg {addr:#06X} <= {value:#04X}");
                Ok(())
            }
            LATCH_IRQ1 => {
                self.irq1_enabled = value != 0;
                Ok(())
            }
            LATCH_IRQ2 => {
                self.irq2_enabled = value != 0;
                Ok(())
            }
            // Inverted: writing 0 arms the sound CPU's NMI.
            LATCH_NMI3 => {
                self.nmi3_enabled = value == 0;
                Ok(())
            }
            // 0 holds the sub and sound CPUs in reset, non-zero releases.
            LATCH_RESET => {
                let halt = value == 0;
                self.halt_cpu2 = halt;
                self.halt_cpu3 = halt;
                Ok(())
            }
            0x6824..=LATCH_END => {
                warn!("{cpu}: unimplemented latch {addr:#06X} <= {value:#04X}");
                Ok(())
            }
            WATCHDOG => Ok(()),
            IOBUS_BASE..=IOBUS_END => {
                trace!("{cpu}: 06XX {addr:#06X} <= {value:#04X} (stubbed)");
                Ok(())
            }
            VRAM_CODE_BASE..=VRAM_END
            | RAM1_BASE..=RAM1_END
            | RAM2_BASE..=RAM2_END
            | RAM3_BASE..=RAM3_END => {
                self.memory[addr as usize] = value;
                Ok(())
            }
            STARFIELD_BASE..=STARFIELD_END => {
                self.starfield[(addr - STARFIELD_BASE) as usize] = value;
                trace!("{cpu}: starfield {addr:#06X} <= {value:#04X}");
                Ok(())
            }
            FLIP_SCREEN => {
                self.flip_screen = value & 1 != 0;
                Ok(())
            }
            _ => Err(BusFault::UnmappedAddress {
                cpu,
                addr,
                op: Access::Write,
            }),
        }
    }

    #[inline]
    pub fn read16(&self, cpu: CpuId, addr: u16) -> Result<u16, BusFault> {
        let lo = self.read8(cpu, addr)? as u16;
        let hi = self.read8(cpu, addr.wrapping_add(1))? as u16;
        Ok((hi << 8) | lo)
    }

    #[inline]
    pub fn write16(&mut self, cpu: CpuId, addr: u16, value: u16) -> Result<(), BusFault> {
        self.write8(cpu, addr, (value & 0x00FF) as u8)?;
        self.write8(cpu, addr.wrapping_add(1), (value >> 8) as u8)
    }

    fn read_rom(&self, cpu: CpuId, addr: u16) -> Result<u8, BusFault> {
        match cpu {
            CpuId::Cpu1 => Ok(self.cpu1_rom[addr as usize]),
            CpuId::Cpu2 => {
                if (addr as usize) < SUB_ROM_SIZE {
                    Ok(self.cpu2_rom[addr as usize])
                } else {
                    // The sub CPU has nothing above its single 4 KiB chip;
                    // the bus floats low there.
                    debug!("CPU2: read above code ROM at {addr:#06X}");
                    Ok(0x00)
                }
            }
            CpuId::Cpu3 => {
                if (addr as usize) < SUB_ROM_SIZE {
                    Ok(self.cpu3_rom[addr as usize])
                } else {
                    Err(BusFault::UnmappedAddress {
                        cpu,
                        addr,
                        op: Access::Read,
                    })
                }
            }
        }
    }

    fn write_rom(&mut self, cpu: CpuId, addr: u16, value: u8) -> Result<(), BusFault> {
        if !self.writable_rom {
            return Err(BusFault::ReadOnlyWrite { cpu, addr });
        }
        let rom = match cpu {
            CpuId::Cpu1 => &mut self.cpu1_rom,
            CpuId::Cpu2 => &mut self.cpu2_rom,
            CpuId::Cpu3 => &mut self.cpu3_rom,
        };
        match rom.get_mut(addr as usize) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(BusFault::ReadOnlyWrite { cpu, addr }),
        }
    }

    /// Device-port read hook from the stepping engines. No input port is
    /// modelled; everything logs and reads 0.
    pub fn device_read(&self, cpu: CpuId, port: u8) -> u8 {
        debug!("{cpu}: in port {port:#04X} (unimplemented)");
        0
    }

    /// Device-port write hook. CPU1 port 0 latches the IM2 vector low
    /// byte; everything else is logged and dropped.
    pub fn device_write(&mut self, cpu: CpuId, port: u8, value: u8) {
        if cpu == CpuId::Cpu1 && port == 0 {
            self.port0_last_write = value;
        } else {
            debug!("{cpu}: out port {port:#04X} <= {value:#04X} (unimplemented)");
        }
    }

    /// Raw view of the 64 KiB shared array, for snapshots.
    pub(crate) fn memory_image(&self) -> &[u8] {
        &self.memory
    }

    pub(crate) fn restore_memory_image(&mut self, image: &[u8]) {
        self.memory.copy_from_slice(image);
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

fn fill_rom(rom: &mut [u8], data: &[u8]) {
    let len = data.len().min(rom.len());
    rom[..len].copy_from_slice(&data[..len]);
    rom[len..].fill(0);
}

#[cfg(test)]
mod tests;
