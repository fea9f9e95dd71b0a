//! Emulation core for the 1981 Namco Galaga arcade PCB.
//!
//! The board couples three Z80s to a shared memory bus, a PROM-driven
//! tile video pipeline and a 60 Hz interrupt loop. This crate contains the
//! platform-agnostic machine: the bus and its address decoder, the palette
//! and tile tables, the frame composer, and the hardware loop that steps
//! the CPUs and delivers frames to a host sink. Windowing, input and audio
//! output are the host's problem; it talks to the machine through the
//! handles in [`emulator`].

pub mod bmp;
pub mod bus;
pub mod cpu;
pub mod emulator;
pub mod palette;
pub mod roms;
pub mod snapshot;
pub mod tiles;
pub mod video;
pub mod z80;

pub use bus::{Bus, BusFault, CpuId};
pub use emulator::{Emulator, EmulatorHandle};
pub use roms::{RomError, RomSet, RomSetKind};

/// Master CPU clock. All three Z80s run at 18.432 MHz / 6.
pub const CPU_HZ: u32 = 3_072_000;

/// CPU1 cycles per VBLANK interval (CPU_HZ / 60).
pub const CYCLES_PER_VBLANK: u32 = CPU_HZ / 60;
