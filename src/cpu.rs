//! The stepping-engine contract between the board and its CPUs.
//!
//! The hardware loop drives each CPU through [`CpuCore`]: execute one
//! instruction, report cycles, accept interrupt injection, expose state
//! for snapshots. The shipped implementation is [`crate::z80::Z80`]; the
//! loop tests drive the same seam with a scripted double.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bus::{Bus, BusFault, CpuId};

/// Z80 register file. Shadow registers carry the `alt_` prefix.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registers {
    pub a: u8,
    pub f: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub h: u8,
    pub l: u8,
    pub alt_a: u8,
    pub alt_f: u8,
    pub alt_b: u8,
    pub alt_c: u8,
    pub alt_d: u8,
    pub alt_e: u8,
    pub alt_h: u8,
    pub alt_l: u8,
    pub ix: u16,
    pub iy: u16,
    pub sp: u16,
    pub pc: u16,
    pub i: u8,
    pub r: u8,
}

/// Everything the snapshot record keeps per CPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuState {
    pub registers: Registers,
    pub halted: bool,
    /// Interrupt enable flip-flop.
    pub iff1: bool,
    /// Its pre-interrupt shadow, restored by RETN.
    pub iff2: bool,
    /// Interrupt mode 0, 1 or 2.
    pub im: u8,
}

/// Faults raised while stepping a CPU: either a bus decode failure or an
/// internal invariant violation in the engine itself. Both are fatal to
/// the hardware loop.
#[derive(Debug, Error)]
pub enum StepFault {
    #[error(transparent)]
    Bus(#[from] BusFault),
    #[error("{cpu}: device fault: {reason}")]
    Device { cpu: CpuId, reason: String },
}

/// The bus as seen by one CPU: plain reads and writes carry the CPU
/// identifier into the decoder, and device-port I/O lands in the board's
/// port hooks.
pub struct BusHandle<'a> {
    bus: &'a mut Bus,
    cpu: CpuId,
}

impl<'a> BusHandle<'a> {
    pub fn new(bus: &'a mut Bus, cpu: CpuId) -> Self {
        Self { bus, cpu }
    }

    #[inline]
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    #[inline]
    pub fn read8(&self, addr: u16) -> Result<u8, BusFault> {
        self.bus.read8(self.cpu, addr)
    }

    #[inline]
    pub fn write8(&mut self, addr: u16, value: u8) -> Result<(), BusFault> {
        self.bus.write8(self.cpu, addr, value)
    }

    #[inline]
    pub fn read16(&self, addr: u16) -> Result<u16, BusFault> {
        self.bus.read16(self.cpu, addr)
    }

    #[inline]
    pub fn write16(&mut self, addr: u16, value: u16) -> Result<(), BusFault> {
        self.bus.write16(self.cpu, addr, value)
    }

    #[inline]
    pub fn device_read(&self, port: u8) -> u8 {
        self.bus.device_read(self.cpu, port)
    }

    #[inline]
    pub fn device_write(&mut self, port: u8, value: u8) {
        self.bus.device_write(self.cpu, port, value);
    }
}

/// One instruction-stepping engine.
pub trait CpuCore: Send {
    /// Execute one instruction (or service a pending interrupt) and
    /// return the cycles consumed.
    fn step(&mut self, bus: &mut BusHandle<'_>) -> Result<u32, StepFault>;

    /// Queue a maskable interrupt; `vector_low` becomes the low byte of
    /// the IM2 vector (the high byte is the engine's I register).
    fn inject_maskable(&mut self, vector_low: u8);

    /// Queue a non-maskable interrupt.
    fn inject_nmi(&mut self);

    /// Engine-side interrupt enable (IFF1).
    fn interrupts_enabled(&self) -> bool;

    fn pc(&self) -> u16;

    fn halted(&self) -> bool;

    fn state(&self) -> CpuState;

    fn restore(&mut self, state: &CpuState);
}
