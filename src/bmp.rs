//! Minimal BMP writer.
//!
//! Frames cross the host boundary as ready-to-save bitmap bytes, so the
//! sink never needs to know the machine's pixel layout. Classic 54-byte
//! header, 24-bit BI_RGB, rows bottom-up and padded to 4 bytes.

const FILE_HEADER_SIZE: u32 = 14;
const INFO_HEADER_SIZE: u32 = 40;

/// Encode an RGBA pixel buffer (row-major, top-down) as a BMP file image.
///
/// The alpha channel is dropped; `rgba` must hold `width * height * 4`
/// bytes.
pub fn encode(width: usize, height: usize, rgba: &[u8]) -> Vec<u8> {
    debug_assert_eq!(rgba.len(), width * height * 4);

    let row_bytes = (width * 3 + 3) & !3;
    let pixel_bytes = row_bytes * height;
    let file_size = FILE_HEADER_SIZE + INFO_HEADER_SIZE + pixel_bytes as u32;

    let mut out = Vec::with_capacity(file_size as usize);

    // BITMAPFILEHEADER
    out.extend_from_slice(b"BM");
    out.extend_from_slice(&file_size.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // reserved
    out.extend_from_slice(&(FILE_HEADER_SIZE + INFO_HEADER_SIZE).to_le_bytes());

    // BITMAPINFOHEADER
    out.extend_from_slice(&INFO_HEADER_SIZE.to_le_bytes());
    out.extend_from_slice(&(width as i32).to_le_bytes());
    out.extend_from_slice(&(height as i32).to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // planes
    out.extend_from_slice(&24u16.to_le_bytes()); // bits per pixel
    out.extend_from_slice(&0u32.to_le_bytes()); // BI_RGB
    out.extend_from_slice(&(pixel_bytes as u32).to_le_bytes());
    out.extend_from_slice(&2835i32.to_le_bytes()); // 72 DPI
    out.extend_from_slice(&2835i32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // palette colors
    out.extend_from_slice(&0u32.to_le_bytes()); // important colors

    let padding = row_bytes - width * 3;
    for y in (0..height).rev() {
        let row = &rgba[y * width * 4..(y + 1) * width * 4];
        for px in row.chunks_exact(4) {
            out.push(px[2]);
            out.push(px[1]);
            out.push(px[0]);
        }
        out.extend(std::iter::repeat(0u8).take(padding));
    }

    out
}
