// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Texture and mesh containers.

An importer turns container bytes into a [TextureHeader] plus a [TextureStream]: a cursor that
yields subresource rows in the order the container stores them.  Containers differ in three ways
the upload path cares about:

* subresource order ([SubresourceOrder]): KTX stores every layer of mip 0 before mip 1, DDS stores
  every mip of layer 0 before layer 1.
* a pre-mip hook: KTX prefixes each mip with a `u32` image size that must be skipped.
* row padding: KTX pads rows to 4 bytes.

The loader never converts texels; PNG is the exception, decoded to RGBA8 because it has no GPU
layout of its own.
*/

pub mod dds;
pub mod ktx;
pub mod mesh;
pub mod png_support;

use crate::bittricks::checked_round_up;
use crate::device::Subresource;
use crate::error::RequestError;
use crate::pixel_formats::{ImageFormat, mip_extent};

/// Shape of a texture as described by its container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureHeader {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    /// Includes cube faces: a cubemap has a multiple of 6 layers.
    pub array_layers: u32,
    pub format: ImageFormat,
    pub cubemap: bool,
}

impl TextureHeader {
    /// Tightly packed bytes of one subresource.  Saturates for extents no device accepts.
    pub fn subresource_bytes(&self, mip: u32) -> u64 {
        self.checked_subresource_bytes(mip).unwrap_or(u64::MAX)
    }

    /// Tightly packed bytes of the whole texture.  Saturates like [Self::subresource_bytes].
    pub fn total_bytes(&self) -> u64 {
        self.checked_total_bytes().unwrap_or(u64::MAX)
    }

    fn checked_subresource_bytes(&self, mip: u32) -> Option<u64> {
        let width = mip_extent(self.width, mip);
        let height = mip_extent(self.height, mip);
        let depth = mip_extent(self.depth, mip);
        self.format
            .row_bytes(width)
            .checked_mul(self.format.row_count(height) as u64)?
            .checked_mul(depth as u64)
    }

    fn checked_total_bytes(&self) -> Option<u64> {
        (0..self.mip_levels)
            .try_fold(0u64, |sum, mip| sum.checked_add(self.checked_subresource_bytes(mip)?))?
            .checked_mul(self.array_layers as u64)
    }

    /// Rejects a header whose mip chain cannot exist, or whose texels could not fit in the
    /// `available` bytes that follow it.
    ///
    /// Headers come straight from files, so this runs before anything is sized from them.
    pub fn validate(&self, container: &'static str, available: u64) -> Result<(), RequestError> {
        if self.array_layers == 0 {
            return Err(RequestError::UnsupportedFormat(format!("{container} has no layers")));
        }
        let largest = self.width.max(self.height).max(self.depth).max(1);
        let max_mips = u32::BITS - largest.leading_zeros();
        if self.mip_levels > max_mips {
            return Err(RequestError::UnsupportedFormat(format!(
                "{container} declares {mips} mips for a {largest} texel extent",
                mips = self.mip_levels
            )));
        }
        let needed = self.checked_total_bytes().ok_or_else(|| {
            RequestError::UnsupportedFormat(format!("{container} texture size overflows"))
        })?;
        if needed > available {
            return Err(RequestError::Truncated {
                container,
                needed,
                available,
            });
        }
        Ok(())
    }
}

/// The order a container stores subresources in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubresourceOrder {
    /// For each mip, every layer.
    MipsOuter,
    /// For each layer, every mip.
    LayersOuter,
}

impl SubresourceOrder {
    pub fn iter(self, mip_levels: u32, array_layers: u32) -> impl Iterator<Item = Subresource> {
        let (outer, inner) = match self {
            SubresourceOrder::MipsOuter => (mip_levels, array_layers),
            SubresourceOrder::LayersOuter => (array_layers, mip_levels),
        };
        (0..outer).flat_map(move |o| {
            (0..inner).map(move |i| match self {
                SubresourceOrder::MipsOuter => Subresource { mip: o, layer: i },
                SubresourceOrder::LayersOuter => Subresource { mip: i, layer: o },
            })
        })
    }
}

/// Which importer to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    /// Pick by magic.
    Detect,
    Ktx,
    Dds,
    Png,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PreMip {
    None,
    /// Skip a little-endian `u32` before each mip.
    ImageSize,
}

/// Sequential reader over a container's texel data.
#[derive(Debug)]
pub struct TextureStream {
    header: TextureHeader,
    order: SubresourceOrder,
    container: &'static str,
    bytes: Vec<u8>,
    cursor: usize,
    row_alignment: u64,
    pre_mip: PreMip,
}

impl TextureStream {
    /// Tightly packed texel data, layers outer.
    pub fn raw(header: TextureHeader, bytes: Vec<u8>) -> Self {
        Self::new(header, SubresourceOrder::LayersOuter, "raw", bytes, 0)
    }

    fn new(
        header: TextureHeader,
        order: SubresourceOrder,
        container: &'static str,
        bytes: Vec<u8>,
        data_offset: usize,
    ) -> Self {
        TextureStream {
            header,
            order,
            container,
            bytes,
            cursor: data_offset,
            row_alignment: 1,
            pre_mip: PreMip::None,
        }
    }

    pub fn header(&self) -> &TextureHeader {
        &self.header
    }

    pub fn order(&self) -> SubresourceOrder {
        self.order
    }

    pub fn container(&self) -> &'static str {
        self.container
    }

    /// Overrides the format, e.g. to sample a linear file as sRGB.
    pub(crate) fn set_format(&mut self, format: ImageFormat) {
        self.header.format = format;
    }

    /// Subresources in storage order.
    pub fn subresources(&self) -> impl Iterator<Item = Subresource> + use<> {
        self.order
            .iter(self.header.mip_levels, self.header.array_layers)
    }

    /// Positions the cursor at the start of `subresource`, which must be next in storage order.
    pub fn begin_subresource(&mut self, subresource: Subresource) -> Result<(), RequestError> {
        let first_of_mip = match self.order {
            SubresourceOrder::MipsOuter => subresource.layer == 0,
            SubresourceOrder::LayersOuter => true,
        };
        if first_of_mip && self.pre_mip == PreMip::ImageSize {
            self.take(4)?;
        }
        Ok(())
    }

    /// The next `row_bytes` bytes of texel data, skipping any row padding.
    pub fn read_row(&mut self, row_bytes: u64) -> Result<&[u8], RequestError> {
        let padded =
            checked_round_up(row_bytes, self.row_alignment).ok_or(RequestError::Truncated {
                container: self.container,
                needed: u64::MAX,
                available: (self.bytes.len() - self.cursor) as u64,
            })?;
        let start = self.cursor;
        self.take(padded)?;
        Ok(&self.bytes[start..start + row_bytes as usize])
    }

    fn take(&mut self, len: u64) -> Result<(), RequestError> {
        let available = (self.bytes.len() - self.cursor) as u64;
        if len > available {
            return Err(RequestError::Truncated {
                container: self.container,
                needed: len,
                available,
            });
        }
        self.cursor += len as usize;
        Ok(())
    }
}

/// Parses `bytes` with the importer for `kind`.
pub fn open(bytes: Vec<u8>, kind: ContainerKind) -> Result<TextureStream, RequestError> {
    let kind = match kind {
        ContainerKind::Detect => detect(&bytes)?,
        other => other,
    };
    match kind {
        ContainerKind::Ktx => {
            let (header, data_offset) = ktx::parse_header(&bytes)?;
            header.validate("ktx", (bytes.len() - data_offset) as u64)?;
            let mut stream = TextureStream::new(
                header,
                SubresourceOrder::MipsOuter,
                "ktx",
                bytes,
                data_offset,
            );
            stream.row_alignment = ktx::ROW_ALIGNMENT;
            stream.pre_mip = PreMip::ImageSize;
            Ok(stream)
        }
        ContainerKind::Dds => {
            let (header, data_offset) = dds::parse_header(&bytes)?;
            header.validate("dds", (bytes.len() - data_offset) as u64)?;
            Ok(TextureStream::new(
                header,
                SubresourceOrder::LayersOuter,
                "dds",
                bytes,
                data_offset,
            ))
        }
        ContainerKind::Png => {
            let (header, texels) = png_support::decode_rgba8(&bytes)?;
            header.validate("png", texels.len() as u64)?;
            Ok(TextureStream::new(
                header,
                SubresourceOrder::LayersOuter,
                "png",
                texels,
                0,
            ))
        }
        ContainerKind::Detect => unreachable!("detect resolves to a concrete kind"),
    }
}

fn detect(bytes: &[u8]) -> Result<ContainerKind, RequestError> {
    if bytes.starts_with(&ktx::IDENTIFIER) {
        Ok(ContainerKind::Ktx)
    } else if bytes.starts_with(dds::MAGIC) {
        Ok(ContainerKind::Dds)
    } else if bytes.starts_with(png_support::SIGNATURE) {
        Ok(ContainerKind::Png)
    } else {
        Err(RequestError::BadMagic {
            container: "texture",
        })
    }
}
