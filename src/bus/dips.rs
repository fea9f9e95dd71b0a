use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::bus::DIP_BASE;

/// The two 8-position DIP switch banks on the board edge.
///
/// CPU code reads them one position per address: 0x6800+n returns switch
/// B position n in bit 0 and switch A position n in bit 1. Positions are
/// stored here as packed bytes, bit n = position n closed.
///
/// Switch A: bits 0-2 coinage, 3-4 bonus life, 5 freeze (off = 1 on the
/// stock board), 6-7 unused. Switch B: bits 0-1 difficulty, 2-3 lives,
/// 4 cabinet, 5-6 coinage B, 7 rack test.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DipSwitches {
    #[serde(default = "default_switch_a")]
    pub switch_a: u8,
    #[serde(default)]
    pub switch_b: u8,
}

// Position A4 closed: "Freeze = Off", the only non-zero factory default.
fn default_switch_a() -> u8 {
    0x10
}

impl Default for DipSwitches {
    fn default() -> Self {
        Self {
            switch_a: default_switch_a(),
            switch_b: 0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DipError {
    #[error("failed to read DIP switch file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse DIP switch file: {0}")]
    Parse(#[from] serde_json::Error),
}

impl DipSwitches {
    /// Value returned for a read in the 0x6800-0x6807 bank.
    #[inline]
    pub fn read(&self, addr: u16) -> u8 {
        let position = (addr - DIP_BASE) & 0x07;
        let b = (self.switch_b >> position) & 1;
        let a = (self.switch_a >> position) & 1;
        (a << 1) | b
    }

    pub fn from_file(path: &Path) -> Result<Self, DipError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}
