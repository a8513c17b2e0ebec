// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! PNG decoding.
//!
//! PNGs are decoded to 8-bit RGBA on the streamer thread.  Palettes and low bit depths are
//! expanded, 16-bit channels are stripped to 8.

use super::TextureHeader;
use crate::error::RequestError;
use crate::pixel_formats::ImageFormat;
use png::{BitDepth, ColorType, Transformations};
use std::io::Cursor;

pub const SIGNATURE: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// Decodes `bytes` into a single-mip RGBA8 texture.
pub fn decode_rgba8(bytes: &[u8]) -> Result<(TextureHeader, Vec<u8>), RequestError> {
    let mut decoder = png::Decoder::new(Cursor::new(bytes));
    decoder.set_transformations(Transformations::EXPAND | Transformations::STRIP_16);
    let mut reader = decoder.read_info()?;
    let (width, height) = {
        let info = reader.info();
        (info.width, info.height)
    };
    //after EXPAND + STRIP_16 every pixel fits in 4 bytes
    let mut buffer = vec![0u8; width as usize * height as usize * 4];
    let frame = reader.next_frame(&mut buffer)?;
    if frame.bit_depth != BitDepth::Eight {
        return Err(RequestError::UnsupportedFormat(format!(
            "png bit depth {:?} after expansion",
            frame.bit_depth
        )));
    }
    let channels = match frame.color_type {
        ColorType::Grayscale => 1,
        ColorType::GrayscaleAlpha => 2,
        ColorType::Rgb => 3,
        ColorType::Rgba => 4,
        ColorType::Indexed => {
            return Err(RequestError::UnsupportedFormat(
                "indexed png after expansion".to_owned(),
            ));
        }
    };
    buffer.truncate(frame.buffer_size());
    let rgba = expand_to_rgba(&buffer, channels, frame.line_size, width, height);
    let header = TextureHeader {
        width,
        height,
        depth: 1,
        mip_levels: 1,
        array_layers: 1,
        format: ImageFormat::Rgba8Unorm,
        cubemap: false,
    };
    Ok((header, rgba))
}

fn expand_to_rgba(
    decoded: &[u8],
    channels: usize,
    line_size: usize,
    width: u32,
    height: u32,
) -> Vec<u8> {
    let mut rgba = Vec::with_capacity(width as usize * height as usize * 4);
    for row in decoded.chunks(line_size).take(height as usize) {
        for pixel in row.chunks_exact(channels).take(width as usize) {
            match *pixel {
                [l] => rgba.extend_from_slice(&[l, l, l, 0xFF]),
                [l, a] => rgba.extend_from_slice(&[l, l, l, a]),
                [r, g, b] => rgba.extend_from_slice(&[r, g, b, 0xFF]),
                [r, g, b, a] => rgba.extend_from_slice(&[r, g, b, a]),
                _ => unreachable!("chunks_exact yields {channels} bytes"),
            }
        }
    }
    rgba
}
