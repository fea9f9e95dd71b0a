//! Save-state records.
//!
//! A snapshot is a self-describing JSON document: the per-CPU state,
//! the bus latches, the cycle counters, and the 64 KiB shared memory
//! image carried as base64. Code and graphics ROMs are immutable inputs
//! and stay out of the file.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cpu::CpuState;

const MEMORY_SIZE: usize = 0x1_0000;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("snapshot version {0} is not supported (expected 1)")]
    Version(u32),
    #[error("snapshot memory image is damaged: {0}")]
    Memory(String),
}

/// The bus-owned latch state that must survive a save/load.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusLatches {
    pub irq1_enabled: bool,
    pub irq2_enabled: bool,
    pub nmi3_enabled: bool,
    pub halt_cpu2: bool,
    pub halt_cpu3: bool,
    pub port0_last_write: u8,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub cpus: [CpuState; 3],
    pub bus: BusLatches,
    /// Base64 of the 64 KiB shared RAM/VRAM array.
    pub memory: String,
    pub total_cycles: u64,
    pub total_opcodes: u64,
    pub cycles_since_interrupt: u32,
}

impl Snapshot {
    pub const VERSION: u32 = 1;

    pub fn encode_memory(image: &[u8]) -> String {
        BASE64.encode(image)
    }

    pub fn decode_memory(&self) -> Result<Vec<u8>, SnapshotError> {
        let image = BASE64
            .decode(&self.memory)
            .map_err(|err| SnapshotError::Memory(err.to_string()))?;
        if image.len() != MEMORY_SIZE {
            return Err(SnapshotError::Memory(format!(
                "expected {MEMORY_SIZE} bytes, got {}",
                image.len()
            )));
        }
        Ok(image)
    }

    pub fn to_file(&self, path: &Path) -> Result<(), SnapshotError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn from_file(path: &Path) -> Result<Self, SnapshotError> {
        let text = std::fs::read_to_string(path)?;
        let snapshot: Snapshot = serde_json::from_str(&text)?;
        if snapshot.version != Self::VERSION {
            return Err(SnapshotError::Version(snapshot.version));
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::Registers;

    fn sample() -> Snapshot {
        let mut cpu1 = CpuState {
            registers: Registers {
                a: 0x12,
                pc: 0x0456,
                sp: 0x9B00,
                i: 0x88,
                ..Registers::default()
            },
            halted: false,
            iff1: true,
            iff2: true,
            im: 2,
        };
        cpu1.registers.f = 0x55;
        Snapshot {
            version: Snapshot::VERSION,
            cpus: [cpu1, CpuState::default(), CpuState::default()],
            bus: BusLatches {
                halt_cpu2: true,
                halt_cpu3: true,
                port0_last_write: 0x42,
                ..BusLatches::default()
            },
            memory: Snapshot::encode_memory(&vec![0xA5; MEMORY_SIZE]),
            total_cycles: 123_456,
            total_opcodes: 7_890,
            cycles_since_interrupt: 100,
        }
    }

    #[test]
    fn file_round_trip_preserves_the_record() {
        let dir = std::env::temp_dir().join(format!("galaga-snap-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("state.json");

        let snapshot = sample();
        snapshot.to_file(&path).unwrap();
        let loaded = Snapshot::from_file(&path).unwrap();

        assert_eq!(loaded.cpus[0], snapshot.cpus[0]);
        assert_eq!(loaded.bus, snapshot.bus);
        assert_eq!(loaded.total_cycles, 123_456);
        assert_eq!(loaded.decode_memory().unwrap(), vec![0xA5; MEMORY_SIZE]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let dir = std::env::temp_dir().join(format!("galaga-snapv-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("state.json");

        let mut snapshot = sample();
        snapshot.version = 99;
        snapshot.to_file(&path).unwrap();
        assert!(matches!(
            Snapshot::from_file(&path),
            Err(SnapshotError::Version(99))
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn truncated_memory_image_is_rejected() {
        let mut snapshot = sample();
        snapshot.memory = Snapshot::encode_memory(&[0u8; 16]);
        assert!(matches!(
            snapshot.decode_memory(),
            Err(SnapshotError::Memory(_))
        ));
    }
}
