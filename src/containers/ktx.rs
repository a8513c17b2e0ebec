// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! KTX 1.1 headers.
//!
//! Only little-endian files are accepted.  Texel data follows the key/value block, stored mip by
//! mip, each mip prefixed with its `imageSize`, rows padded to 4 bytes.

use super::TextureHeader;
use crate::error::RequestError;
use crate::pixel_formats::ImageFormat;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

pub const IDENTIFIER: [u8; 12] = [
    0xAB, 0x4B, 0x54, 0x58, 0x20, 0x31, 0x31, 0xBB, 0x0D, 0x0A, 0x1A, 0x0A,
];
const ENDIANNESS_LE: u32 = 0x0403_0201;
const HEADER_LEN: usize = 64;
pub(crate) const ROW_ALIGNMENT: u64 = 4;

fn format_from_gl(internal_format: u32) -> Option<ImageFormat> {
    Some(match internal_format {
        0x8229 => ImageFormat::R8Unorm,
        0x822B => ImageFormat::Rg8Unorm,
        0x8058 => ImageFormat::Rgba8Unorm,
        0x8C43 => ImageFormat::Rgba8Srgb,
        0x93A1 => ImageFormat::Bgra8Unorm,
        0x822D => ImageFormat::R16Float,
        0x881A => ImageFormat::Rgba16Float,
        0x822E => ImageFormat::R32Float,
        0x8814 => ImageFormat::Rgba32Float,
        0x83F0 | 0x83F1 => ImageFormat::Bc1Unorm,
        0x8C4D => ImageFormat::Bc1Srgb,
        0x83F3 => ImageFormat::Bc3Unorm,
        0x8C4F => ImageFormat::Bc3Srgb,
        0x8E8C => ImageFormat::Bc7Unorm,
        0x8E8D => ImageFormat::Bc7Srgb,
        _ => return None,
    })
}

/// GL internal format for `format`; the inverse of the importer's table.
pub fn gl_internal_format(format: ImageFormat) -> u32 {
    match format {
        ImageFormat::R8Unorm => 0x8229,
        ImageFormat::Rg8Unorm => 0x822B,
        ImageFormat::Rgba8Unorm => 0x8058,
        ImageFormat::Rgba8Srgb => 0x8C43,
        ImageFormat::Bgra8Unorm | ImageFormat::Bgra8Srgb => 0x93A1,
        ImageFormat::R16Float => 0x822D,
        ImageFormat::Rgba16Float => 0x881A,
        ImageFormat::R32Float => 0x822E,
        ImageFormat::Rgba32Float => 0x8814,
        ImageFormat::Bc1Unorm => 0x83F1,
        ImageFormat::Bc1Srgb => 0x8C4D,
        ImageFormat::Bc3Unorm => 0x83F3,
        ImageFormat::Bc3Srgb => 0x8C4F,
        ImageFormat::Bc7Unorm => 0x8E8C,
        ImageFormat::Bc7Srgb => 0x8E8D,
    }
}

/// Parses the header, returning it and the offset of the first mip's `imageSize`.
pub fn parse_header(bytes: &[u8]) -> Result<(TextureHeader, usize), RequestError> {
    if !bytes.starts_with(&IDENTIFIER) {
        return Err(RequestError::BadMagic { container: "ktx" });
    }
    if bytes.len() < HEADER_LEN {
        return Err(RequestError::Truncated {
            container: "ktx",
            needed: HEADER_LEN as u64,
            available: bytes.len() as u64,
        });
    }
    let mut reader = Cursor::new(&bytes[IDENTIFIER.len()..HEADER_LEN]);
    let endianness = reader.read_u32::<LittleEndian>()?;
    if endianness != ENDIANNESS_LE {
        return Err(RequestError::UnsupportedFormat(
            "big-endian ktx".to_owned(),
        ));
    }
    let _gl_type = reader.read_u32::<LittleEndian>()?;
    let _gl_type_size = reader.read_u32::<LittleEndian>()?;
    let _gl_format = reader.read_u32::<LittleEndian>()?;
    let internal_format = reader.read_u32::<LittleEndian>()?;
    let _base_internal_format = reader.read_u32::<LittleEndian>()?;
    let width = reader.read_u32::<LittleEndian>()?;
    let height = reader.read_u32::<LittleEndian>()?;
    let depth = reader.read_u32::<LittleEndian>()?;
    let array_elements = reader.read_u32::<LittleEndian>()?;
    let faces = reader.read_u32::<LittleEndian>()?;
    let mip_levels = reader.read_u32::<LittleEndian>()?;
    let key_value_bytes = reader.read_u32::<LittleEndian>()?;

    let format = format_from_gl(internal_format).ok_or_else(|| {
        RequestError::UnsupportedFormat(format!("ktx internal format {internal_format:#x}"))
    })?;
    if width == 0 {
        return Err(RequestError::UnsupportedFormat("ktx width is zero".to_owned()));
    }
    if faces != 1 && faces != 6 {
        return Err(RequestError::UnsupportedFormat(format!("ktx with {faces} faces")));
    }
    let data_offset = HEADER_LEN as u64 + key_value_bytes as u64;
    if data_offset > bytes.len() as u64 {
        return Err(RequestError::Truncated {
            container: "ktx",
            needed: data_offset,
            available: bytes.len() as u64,
        });
    }
    let array_layers = array_elements.max(1).checked_mul(faces).ok_or_else(|| {
        RequestError::UnsupportedFormat(format!("ktx with {array_elements} cube arrays"))
    })?;
    let header = TextureHeader {
        width,
        height: height.max(1),
        depth: depth.max(1),
        mip_levels: mip_levels.max(1),
        array_layers,
        format,
        cubemap: faces == 6,
    };
    Ok((header, data_offset as usize))
}
