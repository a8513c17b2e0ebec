// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! DDS headers, including the DX10 extension.
//!
//! Texel data is tightly packed, layer by layer, each layer holding its full mip chain.

use super::TextureHeader;
use crate::error::RequestError;
use crate::pixel_formats::ImageFormat;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Seek, SeekFrom};

pub const MAGIC: &[u8] = b"DDS ";
const HEADER_LEN: usize = 124;
const DX10_HEADER_LEN: usize = 20;

const DDSD_MIPMAPCOUNT: u32 = 0x2_0000;
const DDSD_DEPTH: u32 = 0x80_0000;
const DDPF_FOURCC: u32 = 0x4;
const DDPF_RGB: u32 = 0x40;
const DDPF_LUMINANCE: u32 = 0x2_0000;
const DDSCAPS2_CUBEMAP: u32 = 0x200;
const DDSCAPS2_VOLUME: u32 = 0x20_0000;
const DX10_MISC_TEXTURECUBE: u32 = 0x4;

const fn four_cc(code: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*code)
}

fn format_from_dxgi(dxgi: u32) -> Option<ImageFormat> {
    Some(match dxgi {
        2 => ImageFormat::Rgba32Float,
        10 => ImageFormat::Rgba16Float,
        28 => ImageFormat::Rgba8Unorm,
        29 => ImageFormat::Rgba8Srgb,
        41 => ImageFormat::R32Float,
        49 => ImageFormat::Rg8Unorm,
        54 => ImageFormat::R16Float,
        61 => ImageFormat::R8Unorm,
        71 => ImageFormat::Bc1Unorm,
        72 => ImageFormat::Bc1Srgb,
        77 => ImageFormat::Bc3Unorm,
        78 => ImageFormat::Bc3Srgb,
        87 => ImageFormat::Bgra8Unorm,
        91 => ImageFormat::Bgra8Srgb,
        98 => ImageFormat::Bc7Unorm,
        99 => ImageFormat::Bc7Srgb,
        _ => return None,
    })
}

/// DXGI format code for `format`.
pub fn dxgi_format(format: ImageFormat) -> u32 {
    match format {
        ImageFormat::Rgba32Float => 2,
        ImageFormat::Rgba16Float => 10,
        ImageFormat::Rgba8Unorm => 28,
        ImageFormat::Rgba8Srgb => 29,
        ImageFormat::R32Float => 41,
        ImageFormat::Rg8Unorm => 49,
        ImageFormat::R16Float => 54,
        ImageFormat::R8Unorm => 61,
        ImageFormat::Bc1Unorm => 71,
        ImageFormat::Bc1Srgb => 72,
        ImageFormat::Bc3Unorm => 77,
        ImageFormat::Bc3Srgb => 78,
        ImageFormat::Bgra8Unorm => 87,
        ImageFormat::Bgra8Srgb => 91,
        ImageFormat::Bc7Unorm => 98,
        ImageFormat::Bc7Srgb => 99,
    }
}

struct PixelFormat {
    flags: u32,
    four_cc: u32,
    rgb_bit_count: u32,
    masks: [u32; 4],
}

fn legacy_format(pf: &PixelFormat) -> Option<ImageFormat> {
    if pf.flags & DDPF_FOURCC != 0 {
        return match pf.four_cc {
            c if c == four_cc(b"DXT1") => Some(ImageFormat::Bc1Unorm),
            c if c == four_cc(b"DXT5") => Some(ImageFormat::Bc3Unorm),
            111 => Some(ImageFormat::R16Float),
            113 => Some(ImageFormat::Rgba16Float),
            114 => Some(ImageFormat::R32Float),
            116 => Some(ImageFormat::Rgba32Float),
            _ => None,
        };
    }
    if pf.flags & DDPF_RGB != 0 && pf.rgb_bit_count == 32 {
        return match pf.masks {
            [0xFF, 0xFF00, 0xFF_0000, _] => Some(ImageFormat::Rgba8Unorm),
            [0xFF_0000, 0xFF00, 0xFF, _] => Some(ImageFormat::Bgra8Unorm),
            _ => None,
        };
    }
    if (pf.flags & (DDPF_LUMINANCE | DDPF_RGB) != 0) && pf.rgb_bit_count == 8 {
        return Some(ImageFormat::R8Unorm);
    }
    None
}

/// Parses the header, returning it and the offset of the first texel.
pub fn parse_header(bytes: &[u8]) -> Result<(TextureHeader, usize), RequestError> {
    if !bytes.starts_with(MAGIC) {
        return Err(RequestError::BadMagic { container: "dds" });
    }
    let truncated = |needed: usize| RequestError::Truncated {
        container: "dds",
        needed: needed as u64,
        available: bytes.len() as u64,
    };
    let mut data_offset = MAGIC.len() + HEADER_LEN;
    if bytes.len() < data_offset {
        return Err(truncated(data_offset));
    }
    let mut reader = Cursor::new(&bytes[MAGIC.len()..]);
    let size = reader.read_u32::<LittleEndian>()?;
    if size as usize != HEADER_LEN {
        return Err(RequestError::BadMagic { container: "dds" });
    }
    let flags = reader.read_u32::<LittleEndian>()?;
    let height = reader.read_u32::<LittleEndian>()?;
    let width = reader.read_u32::<LittleEndian>()?;
    let _pitch_or_linear_size = reader.read_u32::<LittleEndian>()?;
    let depth = reader.read_u32::<LittleEndian>()?;
    let mip_count = reader.read_u32::<LittleEndian>()?;
    reader.seek(SeekFrom::Start(72))?;
    let _pf_size = reader.read_u32::<LittleEndian>()?;
    let pf = PixelFormat {
        flags: reader.read_u32::<LittleEndian>()?,
        four_cc: reader.read_u32::<LittleEndian>()?,
        rgb_bit_count: reader.read_u32::<LittleEndian>()?,
        masks: [
            reader.read_u32::<LittleEndian>()?,
            reader.read_u32::<LittleEndian>()?,
            reader.read_u32::<LittleEndian>()?,
            reader.read_u32::<LittleEndian>()?,
        ],
    };
    let _caps = reader.read_u32::<LittleEndian>()?;
    let caps2 = reader.read_u32::<LittleEndian>()?;

    let mut array_layers = 1;
    let mut cubemap = caps2 & DDSCAPS2_CUBEMAP != 0;
    let format = if pf.flags & DDPF_FOURCC != 0 && pf.four_cc == four_cc(b"DX10") {
        if bytes.len() < data_offset + DX10_HEADER_LEN {
            return Err(truncated(data_offset + DX10_HEADER_LEN));
        }
        reader.seek(SeekFrom::Start(HEADER_LEN as u64))?;
        let dxgi = reader.read_u32::<LittleEndian>()?;
        let _dimension = reader.read_u32::<LittleEndian>()?;
        let misc = reader.read_u32::<LittleEndian>()?;
        array_layers = reader.read_u32::<LittleEndian>()?.max(1);
        cubemap |= misc & DX10_MISC_TEXTURECUBE != 0;
        data_offset += DX10_HEADER_LEN;
        format_from_dxgi(dxgi).ok_or_else(|| {
            RequestError::UnsupportedFormat(format!("dds dxgi format {dxgi}"))
        })?
    } else {
        legacy_format(&pf).ok_or_else(|| {
            RequestError::UnsupportedFormat(format!(
                "dds pixel format flags {:#x} fourcc {:#x}",
                pf.flags, pf.four_cc
            ))
        })?
    };
    if width == 0 || height == 0 {
        return Err(RequestError::UnsupportedFormat("dds extent is zero".to_owned()));
    }
    let depth = if flags & DDSD_DEPTH != 0 || caps2 & DDSCAPS2_VOLUME != 0 {
        depth.max(1)
    } else {
        1
    };
    let mip_levels = if flags & DDSD_MIPMAPCOUNT != 0 {
        mip_count.max(1)
    } else {
        1
    };
    if cubemap {
        array_layers = array_layers.checked_mul(6).ok_or_else(|| {
            RequestError::UnsupportedFormat(format!("dds with {array_layers} cube arrays"))
        })?;
    }
    let header = TextureHeader {
        width,
        height,
        depth,
        mip_levels,
        array_layers,
        format,
        cubemap,
    };
    Ok((header, data_offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containers::{ContainerKind, SubresourceOrder, open};
    use crate::device::Subresource;
    use byteorder::WriteBytesExt;

    fn dx10_header(format: ImageFormat, width: u32, height: u32, mips: u32, layers: u32) -> Vec<u8> {
        let mut bytes = MAGIC.to_vec();
        let mut header = vec![0u32; HEADER_LEN / 4];
        header[0] = HEADER_LEN as u32;
        header[1] = 0x1007 | DDSD_MIPMAPCOUNT;
        header[2] = height;
        header[3] = width;
        header[6] = mips;
        header[18] = 32;
        header[19] = DDPF_FOURCC;
        header[20] = four_cc(b"DX10");
        for value in header {
            bytes.write_u32::<LittleEndian>(value).unwrap();
        }
        for value in [dxgi_format(format), 3, 0, layers, 0] {
            bytes.write_u32::<LittleEndian>(value).unwrap();
        }
        bytes
    }

    #[test]
    fn dx10_array_is_layers_outer() {
        let mut bytes = dx10_header(ImageFormat::Rgba8Unorm, 2, 1, 2, 2);
        //layer 0: mip0 (2 texels), mip1 (1 texel); then layer 1
        bytes.extend_from_slice(&[0; 8]);
        bytes.extend_from_slice(&[1; 4]);
        bytes.extend_from_slice(&[2; 8]);
        bytes.extend_from_slice(&[3; 4]);
        let mut stream = open(bytes, ContainerKind::Detect).unwrap();
        assert_eq!(stream.order(), SubresourceOrder::LayersOuter);
        assert_eq!(stream.header().array_layers, 2);
        let order: Vec<_> = stream.subresources().collect();
        assert_eq!(order[1], Subresource { mip: 1, layer: 0 });
        for (subresource, expected) in order.into_iter().zip([0u8, 1, 2, 3]) {
            stream.begin_subresource(subresource).unwrap();
            let width = if subresource.mip == 0 { 2 } else { 1 };
            assert!(stream.read_row(width * 4).unwrap().iter().all(|b| *b == expected));
        }
    }

    #[test]
    fn legacy_dxt1() {
        let mut bytes = MAGIC.to_vec();
        let mut header = vec![0u32; HEADER_LEN / 4];
        header[0] = HEADER_LEN as u32;
        header[1] = 0x1007;
        header[2] = 8;
        header[3] = 8;
        header[18] = 32;
        header[19] = DDPF_FOURCC;
        header[20] = four_cc(b"DXT1");
        for value in header {
            bytes.write_u32::<LittleEndian>(value).unwrap();
        }
        let (parsed, offset) = parse_header(&bytes).unwrap();
        assert_eq!(parsed.format, ImageFormat::Bc1Unorm);
        assert_eq!(parsed.mip_levels, 1);
        assert_eq!(offset, 128);
    }

    #[test]
    fn cubemap_counts_faces() {
        let mut bytes = dx10_header(ImageFormat::Bc7Unorm, 4, 4, 1, 1);
        //misc flags live at byte 4 + 124 + 8
        let misc = MAGIC.len() + HEADER_LEN + 8;
        bytes[misc] = DX10_MISC_TEXTURECUBE as u8;
        let (parsed, _) = parse_header(&bytes).unwrap();
        assert!(parsed.cubemap);
        assert_eq!(parsed.array_layers, 6);
    }
}
