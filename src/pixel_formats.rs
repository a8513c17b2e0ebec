// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Pixel format descriptions used for texture uploads.
//!
//! The loader never converts pixels.  What it needs from a format is its memory layout:
//!
//! - Block dimensions (1x1 for plain formats, 4x4 for BC compressed formats)
//! - Bytes per block
//! - Whether an sRGB variant exists, so a caller can request sRGB sampling of a linear file
//!
//! # Available Formats
//!
//! ## Uncompressed
//! - [`ImageFormat::R8Unorm`], [`ImageFormat::Rg8Unorm`], [`ImageFormat::Rgba8Unorm`]
//! - [`ImageFormat::Rgba8Srgb`], [`ImageFormat::Bgra8Unorm`], [`ImageFormat::Bgra8Srgb`]
//! - [`ImageFormat::R16Float`], [`ImageFormat::Rgba16Float`]
//! - [`ImageFormat::R32Float`], [`ImageFormat::Rgba32Float`]
//!
//! ## Block compressed
//! - [`ImageFormat::Bc1Unorm`] / [`ImageFormat::Bc1Srgb`] (8 bytes per 4x4 block)
//! - [`ImageFormat::Bc3Unorm`] / [`ImageFormat::Bc3Srgb`] (16 bytes per 4x4 block)
//! - [`ImageFormat::Bc7Unorm`] / [`ImageFormat::Bc7Srgb`] (16 bytes per 4x4 block)
//!
//! # Examples
//!
//! ```
//! use bytes_in_flight::pixel_formats::ImageFormat;
//!
//! let format = ImageFormat::Bc1Unorm;
//! // a 10x10 BC1 mip is 3x3 blocks of 8 bytes
//! assert_eq!(format.row_bytes(10), 24);
//! assert_eq!(format.row_count(10), 3);
//! assert_eq!(format.srgb_variant(), Some(ImageFormat::Bc1Srgb));
//! ```

/*
Unlike a renderer, the loader learns formats from file headers at runtime, so this is an enum
rather than one type per format.  Nothing here is generic over the pixel type.
 */

/// Memory layout of a texture's texels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Unorm,
    Bgra8Srgb,
    R16Float,
    Rgba16Float,
    R32Float,
    Rgba32Float,
    Bc1Unorm,
    Bc1Srgb,
    Bc3Unorm,
    Bc3Srgb,
    Bc7Unorm,
    Bc7Srgb,
}

impl ImageFormat {
    /// Number of bytes in one block (one texel for uncompressed formats).
    pub const fn bytes_per_block(self) -> u32 {
        match self {
            ImageFormat::R8Unorm => 1,
            ImageFormat::Rg8Unorm => 2,
            ImageFormat::R16Float => 2,
            ImageFormat::Rgba8Unorm
            | ImageFormat::Rgba8Srgb
            | ImageFormat::Bgra8Unorm
            | ImageFormat::Bgra8Srgb
            | ImageFormat::R32Float => 4,
            ImageFormat::Rgba16Float => 8,
            ImageFormat::Rgba32Float => 16,
            ImageFormat::Bc1Unorm | ImageFormat::Bc1Srgb => 8,
            ImageFormat::Bc3Unorm
            | ImageFormat::Bc3Srgb
            | ImageFormat::Bc7Unorm
            | ImageFormat::Bc7Srgb => 16,
        }
    }

    pub const fn is_compressed(self) -> bool {
        matches!(
            self,
            ImageFormat::Bc1Unorm
                | ImageFormat::Bc1Srgb
                | ImageFormat::Bc3Unorm
                | ImageFormat::Bc3Srgb
                | ImageFormat::Bc7Unorm
                | ImageFormat::Bc7Srgb
        )
    }

    /// Width of one block in texels.
    pub const fn block_width(self) -> u32 {
        if self.is_compressed() { 4 } else { 1 }
    }

    /// Height of one block in texels.
    pub const fn block_height(self) -> u32 {
        if self.is_compressed() { 4 } else { 1 }
    }

    pub const fn is_srgb(self) -> bool {
        matches!(
            self,
            ImageFormat::Rgba8Srgb
                | ImageFormat::Bgra8Srgb
                | ImageFormat::Bc1Srgb
                | ImageFormat::Bc3Srgb
                | ImageFormat::Bc7Srgb
        )
    }

    /// The sRGB-encoded variant of this format, if there is one.
    ///
    /// sRGB formats return themselves.
    pub const fn srgb_variant(self) -> Option<ImageFormat> {
        match self {
            ImageFormat::Rgba8Unorm | ImageFormat::Rgba8Srgb => Some(ImageFormat::Rgba8Srgb),
            ImageFormat::Bgra8Unorm | ImageFormat::Bgra8Srgb => Some(ImageFormat::Bgra8Srgb),
            ImageFormat::Bc1Unorm | ImageFormat::Bc1Srgb => Some(ImageFormat::Bc1Srgb),
            ImageFormat::Bc3Unorm | ImageFormat::Bc3Srgb => Some(ImageFormat::Bc3Srgb),
            ImageFormat::Bc7Unorm | ImageFormat::Bc7Srgb => Some(ImageFormat::Bc7Srgb),
            _ => None,
        }
    }

    /// Tightly packed bytes in one row of blocks for a mip that is `width` texels wide.
    pub const fn row_bytes(self, width: u32) -> u64 {
        let blocks = width.div_ceil(self.block_width()) as u64;
        blocks * self.bytes_per_block() as u64
    }

    /// Number of block rows for a mip that is `height` texels tall.
    pub const fn row_count(self, height: u32) -> u32 {
        height.div_ceil(self.block_height())
    }
}

/// Extent of `mip` for a dimension whose base size is `base`.
pub const fn mip_extent(base: u32, mip: u32) -> u32 {
    let shifted = if mip >= 32 { 0 } else { base >> mip };
    if shifted == 0 { 1 } else { shifted }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncompressed_layout() {
        let format = ImageFormat::Rgba8Unorm;
        assert_eq!(format.row_bytes(63), 252);
        assert_eq!(format.row_count(7), 7);
        assert!(!format.is_compressed());
    }

    #[test]
    fn compressed_layout_rounds_partial_blocks() {
        let format = ImageFormat::Bc7Unorm;
        assert_eq!(format.row_bytes(1), 16);
        assert_eq!(format.row_bytes(5), 32);
        assert_eq!(format.row_count(1), 1);
        assert_eq!(format.row_count(9), 3);
    }

    #[test]
    fn srgb_variants() {
        assert_eq!(ImageFormat::R8Unorm.srgb_variant(), None);
        assert_eq!(ImageFormat::Rgba8Srgb.srgb_variant(), Some(ImageFormat::Rgba8Srgb));
        assert!(ImageFormat::Bc3Srgb.is_srgb());
    }

    #[test]
    fn mip_extents_clamp_to_one() {
        assert_eq!(mip_extent(256, 0), 256);
        assert_eq!(mip_extent(256, 3), 32);
        assert_eq!(mip_extent(256, 9), 1);
        assert_eq!(mip_extent(3, 40), 1);
    }
}
