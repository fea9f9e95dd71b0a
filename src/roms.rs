//! ROM set definitions and the directory loader.
//!
//! Sets are keyed by MAME ROM names so a stock romset directory drops in
//! unchanged. Every entry carries its expected size and CRC32; loading
//! tries the primary filename then the alternate, insists on the size,
//! and verifies the checksum unless the caller downgraded mismatches to
//! warnings.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::warn;
use thiserror::Error;

use crate::bus::{CPU1_ROM_SIZE, SUB_ROM_SIZE};

pub const TILE_ROM_SIZE: usize = 0x1000;
pub const SPRITE_ROM_SIZE: usize = 0x2000;
pub const COLOR_PROM_SIZE: usize = 0x20;
pub const LOOKUP_PROM_SIZE: usize = 0x100;
pub const MCU_ROM_SIZE: usize = 0x400;

#[derive(Debug, Error)]
pub enum RomError {
    #[error("unknown ROM set '{0}' (expected galaga, galagao, galagamw or galagamk)")]
    UnknownSet(String),
    #[error("ROM '{name}' ({description}) not found in {dir}")]
    Missing {
        name: &'static str,
        description: &'static str,
        dir: PathBuf,
    },
    #[error("ROM '{name}': expected {expected} bytes, file has {actual}")]
    SizeMismatch {
        name: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("ROM '{name}': CRC32 {actual:08x}, expected {expected:08x}")]
    ChecksumMismatch {
        name: &'static str,
        expected: u32,
        actual: u32,
    },
    #[error("failed to read ROM '{name}': {source}")]
    Io {
        name: &'static str,
        source: std::io::Error,
    },
}

/// One physical chip in a set.
struct RomEntry {
    name: &'static str,
    alt: Option<&'static str>,
    size: usize,
    crc32: u32,
    description: &'static str,
}

impl RomEntry {
    fn load(&self, dir: &Path, skip_checksums: bool) -> Result<Vec<u8>, RomError> {
        let mut path = dir.join(self.name);
        if !path.exists() {
            if let Some(alt) = self.alt {
                let alt_path = dir.join(alt);
                if alt_path.exists() {
                    path = alt_path;
                }
            }
        }
        if !path.exists() {
            return Err(RomError::Missing {
                name: self.name,
                description: self.description,
                dir: dir.to_path_buf(),
            });
        }

        let data = std::fs::read(&path).map_err(|source| RomError::Io {
            name: self.name,
            source,
        })?;
        if data.len() != self.size {
            return Err(RomError::SizeMismatch {
                name: self.name,
                expected: self.size,
                actual: data.len(),
            });
        }

        let actual = crc32fast::hash(&data);
        if actual != self.crc32 {
            if skip_checksums {
                warn!(
                    "ROM '{}': CRC32 {actual:08x} does not match expected {:08x} (ignored)",
                    self.name, self.crc32
                );
            } else {
                return Err(RomError::ChecksumMismatch {
                    name: self.name,
                    expected: self.crc32,
                    actual,
                });
            }
        }
        Ok(data)
    }
}

struct SetDef {
    cpu1: [RomEntry; 4],
    cpu2: RomEntry,
    cpu3: RomEntry,
    tiles: RomEntry,
    sprites: [RomEntry; 2],
    color_prom: RomEntry,
    char_lookup: RomEntry,
    sprite_lookup: RomEntry,
    control_proms: [RomEntry; 2],
    mcus: [RomEntry; 2],
}

macro_rules! rom {
    ($name:literal, $size:expr, $crc:literal, $desc:literal) => {
        RomEntry {
            name: $name,
            alt: None,
            size: $size,
            crc32: $crc,
            description: $desc,
        }
    };
    ($name:literal / $alt:literal, $size:expr, $crc:literal, $desc:literal) => {
        RomEntry {
            name: $name,
            alt: Some($alt),
            size: $size,
            crc32: $crc,
            description: $desc,
        }
    };
}

const PROMS_COMMON: ([RomEntry; 2], RomEntry, RomEntry, RomEntry) = (
    [
        rom!("prom-1.1d", LOOKUP_PROM_SIZE, 0x7a2815b4, "video timing PROM"),
        rom!("prom-2.5c", LOOKUP_PROM_SIZE, 0x77245b66, "sound waveform PROM"),
    ],
    rom!("prom-5.5n", COLOR_PROM_SIZE, 0x54603c6b, "color PROM"),
    rom!("prom-4.2n", LOOKUP_PROM_SIZE, 0x59b6edab, "char lookup PROM"),
    rom!("prom-3.1c", LOOKUP_PROM_SIZE, 0x4a04bb24, "sprite lookup PROM"),
);

const MCUS_COMMON: [RomEntry; 2] = [
    rom!("51xx.bin", MCU_ROM_SIZE, 0xc2f57ef8, "Namco 51XX I/O MCU"),
    rom!("54xx.bin", MCU_ROM_SIZE, 0xee7357e0, "Namco 54XX noise MCU"),
];

static GALAGA: SetDef = SetDef {
    cpu1: [
        rom!("gg1_1b.3p" / "gg1-1b.3p", 0x1000, 0xab036c9f, "CPU1 code 0000-0FFF"),
        rom!("gg1_2b.3m" / "gg1-2b.3m", 0x1000, 0xd9232240, "CPU1 code 1000-1FFF"),
        rom!("gg1_3.2m" / "gg1-3.2m", 0x1000, 0x753ce503, "CPU1 code 2000-2FFF"),
        rom!("gg1_4b.2l" / "gg1-4b.2l", 0x1000, 0x499fcc76, "CPU1 code 3000-3FFF"),
    ],
    cpu2: rom!("gg1_5b.3f" / "gg1-5b.3f", 0x1000, 0xbb5caae3, "CPU2 code"),
    cpu3: rom!("gg1_7b.2c" / "gg1-7b.2c", 0x1000, 0xd016686b, "CPU3 code"),
    tiles: rom!("gg1_9.4l" / "gg1-9.4l", TILE_ROM_SIZE, 0x58b2f47c, "char tiles"),
    sprites: [
        rom!("gg1_11.4d" / "gg1-11.4d", 0x1000, 0xad447c80, "sprites low"),
        rom!("gg1_10.4f" / "gg1-10.4f", 0x1000, 0xdd6f1afc, "sprites high"),
    ],
    color_prom: PROMS_COMMON.1,
    char_lookup: PROMS_COMMON.2,
    sprite_lookup: PROMS_COMMON.3,
    control_proms: PROMS_COMMON.0,
    mcus: MCUS_COMMON,
};

static GALAGAO: SetDef = SetDef {
    cpu1: [
        rom!("gg1-1.3p", 0x1000, 0xa3a0f743, "CPU1 code 0000-0FFF"),
        rom!("gg1-2.3m", 0x1000, 0x43bb0d5c, "CPU1 code 1000-1FFF"),
        rom!("gg1-3.2m", 0x1000, 0x753ce503, "CPU1 code 2000-2FFF"),
        rom!("gg1-4.2l", 0x1000, 0x83874442, "CPU1 code 3000-3FFF"),
    ],
    cpu2: rom!("gg1-5.3f", 0x1000, 0x3102fccd, "CPU2 code"),
    cpu3: rom!("gg1-7.2c", 0x1000, 0x8995088d, "CPU3 code"),
    tiles: rom!("gg1-9.4l", TILE_ROM_SIZE, 0x58b2f47c, "char tiles"),
    sprites: [
        rom!("gg1-11.4d", 0x1000, 0xad447c80, "sprites low"),
        rom!("gg1-10.4f", 0x1000, 0xdd6f1afc, "sprites high"),
    ],
    color_prom: PROMS_COMMON.1,
    char_lookup: PROMS_COMMON.2,
    sprite_lookup: PROMS_COMMON.3,
    control_proms: PROMS_COMMON.0,
    mcus: MCUS_COMMON,
};

static GALAGAMW: SetDef = SetDef {
    cpu1: [
        rom!("3200a.bin", 0x1000, 0x3ef0b053, "CPU1 code 0000-0FFF"),
        rom!("3300b.bin", 0x1000, 0x1b280831, "CPU1 code 1000-1FFF"),
        rom!("3400c.bin", 0x1000, 0x16233d33, "CPU1 code 2000-2FFF"),
        rom!("3500d.bin", 0x1000, 0x0aaf5c23, "CPU1 code 3000-3FFF"),
    ],
    cpu2: rom!("3600e.bin", 0x1000, 0xbc556e76, "CPU2 code"),
    cpu3: rom!("3700g.bin", 0x1000, 0xb07f0aa4, "CPU3 code"),
    tiles: rom!("2600j.bin", TILE_ROM_SIZE, 0x58b2f47c, "char tiles"),
    sprites: [
        rom!("2800l.bin", 0x1000, 0xad447c80, "sprites low"),
        rom!("2700k.bin", 0x1000, 0xdd6f1afc, "sprites high"),
    ],
    color_prom: PROMS_COMMON.1,
    char_lookup: PROMS_COMMON.2,
    sprite_lookup: PROMS_COMMON.3,
    control_proms: PROMS_COMMON.0,
    mcus: MCUS_COMMON,
};

static GALAGAMK: SetDef = SetDef {
    cpu1: [
        rom!("mk2-1", 0x1000, 0x23cea1e2, "CPU1 code 0000-0FFF"),
        rom!("mk2-2", 0x1000, 0x89695b1a, "CPU1 code 1000-1FFF"),
        rom!("gg1_3s.2m" / "gg1-3.2m", 0x1000, 0x753ce503, "CPU1 code 2000-2FFF"),
        rom!("mk2-4", 0x1000, 0x24b767f5, "CPU1 code 3000-3FFF"),
    ],
    cpu2: rom!("gg1-5.3f", 0x1000, 0x3102fccd, "CPU2 code"),
    cpu3: rom!("gg1-7b.2c", 0x1000, 0xd016686b, "CPU3 code"),
    tiles: rom!("gg1-9.4l", TILE_ROM_SIZE, 0x58b2f47c, "char tiles"),
    sprites: [
        rom!("gg1-11.4d", 0x1000, 0xad447c80, "sprites low"),
        rom!("gg1-10.4f", 0x1000, 0xdd6f1afc, "sprites high"),
    ],
    color_prom: PROMS_COMMON.1,
    char_lookup: PROMS_COMMON.2,
    sprite_lookup: PROMS_COMMON.3,
    control_proms: PROMS_COMMON.0,
    mcus: MCUS_COMMON,
};

/// The recognised ROM sets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RomSetKind {
    #[default]
    Galaga,
    Galagao,
    Galagamw,
    Galagamk,
}

impl RomSetKind {
    fn definition(self) -> &'static SetDef {
        match self {
            RomSetKind::Galaga => &GALAGA,
            RomSetKind::Galagao => &GALAGAO,
            RomSetKind::Galagamw => &GALAGAMW,
            RomSetKind::Galagamk => &GALAGAMK,
        }
    }
}

impl FromStr for RomSetKind {
    type Err = RomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "galaga" => Ok(RomSetKind::Galaga),
            "galagao" => Ok(RomSetKind::Galagao),
            "galagamw" => Ok(RomSetKind::Galagamw),
            "galagamk" => Ok(RomSetKind::Galagamk),
            other => Err(RomError::UnknownSet(other.to_string())),
        }
    }
}

impl fmt::Display for RomSetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RomSetKind::Galaga => write!(f, "galaga"),
            RomSetKind::Galagao => write!(f, "galagao"),
            RomSetKind::Galagamw => write!(f, "galagamw"),
            RomSetKind::Galagamk => write!(f, "galagamk"),
        }
    }
}

/// Every byte array the board needs, loaded and verified.
#[derive(Debug)]
pub struct RomSet {
    pub cpu1: Vec<u8>,
    pub cpu2: Vec<u8>,
    pub cpu3: Vec<u8>,
    pub tiles: Vec<u8>,
    pub sprites: Vec<u8>,
    pub color_prom: [u8; COLOR_PROM_SIZE],
    pub char_lookup: [u8; LOOKUP_PROM_SIZE],
    pub sprite_lookup: [u8; LOOKUP_PROM_SIZE],
    pub control_proms: [Vec<u8>; 2],
    pub mcus: [Vec<u8>; 2],
}

impl RomSet {
    /// Load and verify a set from a flat directory of MAME-named files.
    pub fn load(kind: RomSetKind, dir: &Path, skip_checksums: bool) -> Result<Self, RomError> {
        let def = kind.definition();

        let mut cpu1 = Vec::with_capacity(CPU1_ROM_SIZE);
        for entry in &def.cpu1 {
            cpu1.extend_from_slice(&entry.load(dir, skip_checksums)?);
        }
        let cpu2 = def.cpu2.load(dir, skip_checksums)?;
        let cpu3 = def.cpu3.load(dir, skip_checksums)?;
        let tiles = def.tiles.load(dir, skip_checksums)?;
        let mut sprites = Vec::with_capacity(SPRITE_ROM_SIZE);
        for entry in &def.sprites {
            sprites.extend_from_slice(&entry.load(dir, skip_checksums)?);
        }

        let mut color_prom = [0u8; COLOR_PROM_SIZE];
        color_prom.copy_from_slice(&def.color_prom.load(dir, skip_checksums)?);
        let mut char_lookup = [0u8; LOOKUP_PROM_SIZE];
        char_lookup.copy_from_slice(&def.char_lookup.load(dir, skip_checksums)?);
        let mut sprite_lookup = [0u8; LOOKUP_PROM_SIZE];
        sprite_lookup.copy_from_slice(&def.sprite_lookup.load(dir, skip_checksums)?);

        let control_proms = [
            def.control_proms[0].load(dir, skip_checksums)?,
            def.control_proms[1].load(dir, skip_checksums)?,
        ];
        let mcus = [
            def.mcus[0].load(dir, skip_checksums)?,
            def.mcus[1].load(dir, skip_checksums)?,
        ];

        debug_assert_eq!(cpu1.len(), CPU1_ROM_SIZE);
        debug_assert_eq!(cpu2.len(), SUB_ROM_SIZE);
        debug_assert_eq!(cpu3.len(), SUB_ROM_SIZE);

        Ok(Self {
            cpu1,
            cpu2,
            cpu3,
            tiles,
            sprites,
            color_prom,
            char_lookup,
            sprite_lookup,
            control_proms,
            mcus,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_set(dir: &Path, kind: RomSetKind, corrupt: Option<&'static str>) {
        let def = kind.definition();
        let mut entries: Vec<&RomEntry> = Vec::new();
        entries.extend(def.cpu1.iter());
        entries.push(&def.cpu2);
        entries.push(&def.cpu3);
        entries.push(&def.tiles);
        entries.extend(def.sprites.iter());
        entries.push(&def.color_prom);
        entries.push(&def.char_lookup);
        entries.push(&def.sprite_lookup);
        entries.extend(def.control_proms.iter());
        entries.extend(def.mcus.iter());
        for entry in entries {
            let size = if corrupt == Some(entry.name) {
                entry.size / 2
            } else {
                entry.size
            };
            std::fs::write(dir.join(entry.name), vec![0u8; size]).unwrap();
        }
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("galaga-roms-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn unknown_set_name_is_rejected() {
        assert!(matches!(
            "galaxian".parse::<RomSetKind>(),
            Err(RomError::UnknownSet(_))
        ));
        assert_eq!("galagamw".parse::<RomSetKind>().unwrap(), RomSetKind::Galagamw);
    }

    #[test]
    fn missing_rom_is_reported_by_name() {
        let dir = temp_dir("missing");
        let err = RomSet::load(RomSetKind::Galaga, &dir, true).unwrap_err();
        assert!(matches!(err, RomError::Missing { name, .. } if name == "gg1_1b.3p"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn size_mismatch_is_fatal_even_with_skipped_checksums() {
        let dir = temp_dir("size");
        write_set(&dir, RomSetKind::Galaga, Some("gg1_5b.3f"));
        let err = RomSet::load(RomSetKind::Galaga, &dir, true).unwrap_err();
        assert!(matches!(
            err,
            RomError::SizeMismatch { name: "gg1_5b.3f", .. }
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn checksum_mismatch_downgrades_to_warning_when_skipped() {
        let dir = temp_dir("crc");
        write_set(&dir, RomSetKind::Galaga, None);

        // All-zero payloads cannot match the factory CRCs.
        let err = RomSet::load(RomSetKind::Galaga, &dir, false).unwrap_err();
        assert!(matches!(err, RomError::ChecksumMismatch { .. }));

        let set = RomSet::load(RomSetKind::Galaga, &dir, true).unwrap();
        assert_eq!(set.cpu1.len(), CPU1_ROM_SIZE);
        assert_eq!(set.cpu2.len(), SUB_ROM_SIZE);
        assert_eq!(set.tiles.len(), TILE_ROM_SIZE);
        assert_eq!(set.sprites.len(), SPRITE_ROM_SIZE);
        assert_eq!(set.mcus[0].len(), MCU_ROM_SIZE);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn alternate_filenames_are_tried() {
        let dir = temp_dir("alt");
        write_set(&dir, RomSetKind::Galaga, None);
        // Rename the primary CPU1 chip to its dash-styled alternate.
        std::fs::rename(dir.join("gg1_1b.3p"), dir.join("gg1-1b.3p")).unwrap();
        let set = RomSet::load(RomSetKind::Galaga, &dir, true).unwrap();
        assert_eq!(set.cpu1.len(), CPU1_ROM_SIZE);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
