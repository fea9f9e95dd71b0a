//! Color PROM and char-lookup PROM decoding.
//!
//! The board derives every display color from a 32-byte color PROM; tiles
//! pick one of 64 four-color palettes through a 256-byte lookup PROM.
//! Both tables are built once at startup and are immutable afterwards.

use thiserror::Error;

/// Number of entries in the color PROM.
pub const COLOR_COUNT: usize = 32;

/// Colors per char palette (2 bits per pixel).
pub const PALETTE_SIZE: usize = 4;

#[derive(Debug, Error)]
pub enum PaletteError {
    #[error("char lookup PROM length {0} is not a multiple of 4")]
    LookupLength(usize),
}

/// One sRGB color as produced by the PROM DAC.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    #[inline]
    pub const fn rgba(self) -> [u8; 4] {
        [self.r, self.g, self.b, 0xFF]
    }
}

/// Decode one color PROM byte.
///
/// Bits 0-2 drive red, 3-5 green, 6-7 blue through weighted resistor
/// ladders; the weights below are the ladder contributions scaled to
/// 0-255 (they sum to 0xFF per channel).
pub fn decode_color(byte: u8) -> Color {
    const LADDER3: [u8; 3] = [0x21, 0x47, 0x97];
    const LADDER2: [u8; 2] = [0x51, 0xAE];

    let weigh3 = |bits: u8| -> u8 {
        let mut value = 0u8;
        for (bit, weight) in LADDER3.iter().enumerate() {
            if bits & (1 << bit) != 0 {
                value += weight;
            }
        }
        value
    };

    let r = weigh3(byte & 0x07);
    let g = weigh3((byte >> 3) & 0x07);
    let mut b = 0u8;
    for (bit, weight) in LADDER2.iter().enumerate() {
        if (byte >> 6) & (1 << bit) != 0 {
            b += weight;
        }
    }
    Color::rgb(r, g, b)
}

/// Decode the full 32-entry color PROM.
pub fn build_colors(color_prom: &[u8; COLOR_COUNT]) -> [Color; COLOR_COUNT] {
    let mut colors = [Color::default(); COLOR_COUNT];
    for (slot, &byte) in colors.iter_mut().zip(color_prom.iter()) {
        *slot = decode_color(byte);
    }
    colors
}

/// Build the char palette table from the lookup PROM.
///
/// Four consecutive PROM bytes form one palette; each byte addresses the
/// 32-entry color table. The stock PROM is 256 bytes, giving 64 palettes.
pub fn build_palettes(
    lookup_prom: &[u8],
    colors: &[Color; COLOR_COUNT],
) -> Result<Vec<[Color; PALETTE_SIZE]>, PaletteError> {
    if lookup_prom.len() % PALETTE_SIZE != 0 {
        return Err(PaletteError::LookupLength(lookup_prom.len()));
    }
    let palettes = lookup_prom
        .chunks_exact(PALETTE_SIZE)
        .map(|chunk| {
            let mut palette = [Color::default(); PALETTE_SIZE];
            for (slot, &byte) in palette.iter_mut().zip(chunk.iter()) {
                *slot = colors[(byte as usize) % COLOR_COUNT];
            }
            palette
        })
        .collect();
    Ok(palettes)
}
