//! Frame composition from VRAM.
//!
//! Every VBLANK the composer walks the tile map through the bus (CPU1's
//! view; the implemented ranges look identical to all three CPUs) and
//! blits pre-rendered 8x8 tiles into a reusable 288x224 RGBA buffer.
//! Nothing is cleared between frames: the walk covers every on-screen
//! pixel.

use crate::bmp;
use crate::bus::{Bus, BusFault, CpuId, VRAM_ATTR_BASE, VRAM_CODE_BASE};
use crate::palette::{build_colors, build_palettes, PaletteError};
use crate::roms::RomSet;
use crate::tiles::{TileRenderer, TILE_DIM};

pub const FRAME_WIDTH: usize = 288;
pub const FRAME_HEIGHT: usize = 224;

const TILE_COLS: usize = FRAME_WIDTH / TILE_DIM; // 36
const TILE_ROWS: usize = FRAME_HEIGHT / TILE_DIM; // 28

/// Map a screen tile position to its VRAM slot.
///
/// The central 32 columns are row-major out of 0x040-0x3BF; the two
/// column pairs at each edge come from the four 32-entry strips at
/// 0x3C0-0x3FF and 0x000-0x03F, indexed by screen row (the strips'
/// first and last two entries are overscan and never shown).
pub fn tilemap_offset(col: usize, row: usize) -> u16 {
    let row = row as isize + 2;
    let col = col as isize - 2;
    if col & 0x20 != 0 {
        (row + ((col & 0x1F) << 5)) as u16
    } else {
        (col + (row << 5)) as u16
    }
}

/// Owns the PROM-derived tables and the frame buffer.
pub struct VideoHardware {
    tiles: TileRenderer,
    frame: Vec<u8>,
}

impl VideoHardware {
    pub fn new(
        tile_rom: &[u8],
        color_prom: &[u8; 32],
        char_lookup: &[u8],
    ) -> Result<Self, PaletteError> {
        let colors = build_colors(color_prom);
        let palettes = build_palettes(char_lookup, &colors)?;
        Ok(Self {
            tiles: TileRenderer::new(tile_rom, &palettes),
            frame: vec![0; FRAME_WIDTH * FRAME_HEIGHT * 4],
        })
    }

    pub fn from_rom_set(set: &RomSet) -> Result<Self, PaletteError> {
        Self::new(&set.tiles, &set.color_prom, &set.char_lookup)
    }

    pub fn renderer(&self) -> &TileRenderer {
        &self.tiles
    }

    /// Compose one frame from VRAM. The returned slice is valid until
    /// the next compose.
    pub fn compose(&mut self, bus: &Bus) -> Result<&[u8], BusFault> {
        for row in 0..TILE_ROWS {
            for col in 0..TILE_COLS {
                let offset = tilemap_offset(col, row);
                let code = bus.read8(CpuId::Cpu1, VRAM_CODE_BASE + offset)? & 0x7F;
                let attr = bus.read8(CpuId::Cpu1, VRAM_ATTR_BASE + offset)? & 0x3F;
                self.blit(col * TILE_DIM, row * TILE_DIM, code as usize, attr as usize);
            }
        }
        Ok(&self.frame)
    }

    fn blit(&mut self, x: usize, y: usize, code: usize, palette: usize) {
        let pixels = self.tiles.tile(code, palette);
        for ty in 0..TILE_DIM {
            let src = &pixels[ty * TILE_DIM * 4..(ty + 1) * TILE_DIM * 4];
            let dst = ((y + ty) * FRAME_WIDTH + x) * 4;
            self.frame[dst..dst + TILE_DIM * 4].copy_from_slice(src);
        }
    }

    /// Last composed frame, RGBA row-major.
    pub fn frame(&self) -> &[u8] {
        &self.frame
    }

    /// Last composed frame in the host wire format.
    pub fn encode_frame(&self) -> Vec<u8> {
        bmp::encode(FRAME_WIDTH, FRAME_HEIGHT, &self.frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiles::TILE_BYTES;

    fn test_video() -> VideoHardware {
        let mut tile_rom = vec![0u8; 0x1000];
        for (i, byte) in tile_rom.iter_mut().enumerate() {
            *byte = (i as u8).wrapping_mul(13).wrapping_add(5);
        }
        let mut color_prom = [0u8; 32];
        for (i, slot) in color_prom.iter_mut().enumerate() {
            *slot = (i as u8).wrapping_mul(9);
        }
        let mut char_lookup = [0u8; 256];
        for (i, slot) in char_lookup.iter_mut().enumerate() {
            *slot = ((i * 3) % 32) as u8;
        }
        VideoHardware::new(&tile_rom, &color_prom, &char_lookup).unwrap()
    }

    fn frame_tile(frame: &[u8], col: usize, row: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(TILE_BYTES);
        for ty in 0..TILE_DIM {
            let start = ((row * TILE_DIM + ty) * FRAME_WIDTH + col * TILE_DIM) * 4;
            out.extend_from_slice(&frame[start..start + TILE_DIM * 4]);
        }
        out
    }

    #[test]
    fn playfield_addresses_are_row_major_from_column_two() {
        assert_eq!(tilemap_offset(2, 0), 0x040);
        assert_eq!(tilemap_offset(3, 0), 0x041);
        assert_eq!(tilemap_offset(2, 1), 0x060);
        assert_eq!(tilemap_offset(33, 27), 0x3BF);
    }

    #[test]
    fn edge_columns_come_from_the_strips() {
        assert_eq!(tilemap_offset(0, 0), 0x3C2);
        assert_eq!(tilemap_offset(1, 0), 0x3E2);
        assert_eq!(tilemap_offset(0, 27), 0x3DD);
        assert_eq!(tilemap_offset(34, 0), 0x002);
        assert_eq!(tilemap_offset(35, 27), 0x03D);
    }

    #[test]
    fn first_playfield_slots_render_requested_tiles() {
        let mut video = test_video();
        let mut bus = Bus::new();
        for (i, code) in [0x01u8, 0x02, 0x03, 0x04].into_iter().enumerate() {
            bus.write8(CpuId::Cpu1, 0x8040 + i as u16, code).unwrap();
            bus.write8(CpuId::Cpu1, 0x8440 + i as u16, 0x00).unwrap();
        }
        video.compose(&bus).unwrap();

        let frame = video.frame().to_vec();
        for (i, code) in [1usize, 2, 3, 4].into_iter().enumerate() {
            let expected = video.renderer().tile(code, 0).to_vec();
            assert_eq!(frame_tile(&frame, 2 + i, 0), expected, "slot {i}");
        }
    }

    #[test]
    fn strip_slot_lands_in_the_left_column() {
        let mut video = test_video();
        let mut bus = Bus::new();
        bus.write8(CpuId::Cpu1, 0x8000 + 0x3C2, 0x21).unwrap();
        bus.write8(CpuId::Cpu1, 0x8400 + 0x3C2, 0x05).unwrap();
        video.compose(&bus).unwrap();

        let frame = video.frame().to_vec();
        let expected = video.renderer().tile(0x21, 5).to_vec();
        assert_eq!(frame_tile(&frame, 0, 0), expected);
    }

    #[test]
    fn code_and_attribute_high_bits_are_masked() {
        let mut video = test_video();
        let mut bus = Bus::new();
        bus.write8(CpuId::Cpu1, 0x8040, 0x81).unwrap(); // -> tile 0x01
        bus.write8(CpuId::Cpu1, 0x8440, 0x45).unwrap(); // -> palette 0x05
        video.compose(&bus).unwrap();

        let frame = video.frame().to_vec();
        let expected = video.renderer().tile(0x01, 0x05).to_vec();
        assert_eq!(frame_tile(&frame, 2, 0), expected);
    }

    #[test]
    fn every_pixel_is_overwritten_without_clearing() {
        let mut video = test_video();
        video.frame.fill(0xEE);
        let bus = Bus::new();
        video.compose(&bus).unwrap();

        // Zeroed VRAM renders tile 0 palette 0 everywhere; the poison
        // pattern must be gone, including alpha.
        let tile0 = video.renderer().tile(0, 0).to_vec();
        let frame = video.frame();
        assert_eq!(frame_tile(frame, 0, 0), tile0);
        assert_eq!(frame_tile(frame, 35, 27), tile0);
        assert!(frame.chunks_exact(4).all(|px| px[3] == 0xFF));
    }

    #[test]
    fn encoded_frame_is_a_full_bitmap() {
        let mut video = test_video();
        let bus = Bus::new();
        video.compose(&bus).unwrap();
        let bmp = video.encode_frame();
        assert_eq!(&bmp[0..2], b"BM");
        // 288*3 per row needs no padding.
        assert_eq!(bmp.len(), 54 + FRAME_WIDTH * 3 * FRAME_HEIGHT);
    }
}
