// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Error types.
//!
//! Two layers report failures here.  [RequestError] describes why a queued request ended as
//! invalid; those never reach the caller as a `Result` (the request's token still completes, and
//! the failure is logged).  [Error] is returned synchronously by [crate::ResourceLoader] methods.

pub use crate::device::DeviceError;
use crate::pixel_formats::ImageFormat;

/// Why a request could not be executed.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unrecognized {container} magic")]
    BadMagic { container: &'static str },
    #[error("{container} stream truncated: needed {needed} bytes, {available} available")]
    Truncated {
        container: &'static str,
        needed: u64,
        available: u64,
    },
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("{0:?} has no sRGB variant")]
    NoSrgbVariant(ImageFormat),
    #[error("vertex layout mismatch: {0}")]
    LayoutMismatch(String),
    #[error("geometry buffer has no free chunk for {size} bytes")]
    ChunkAllocation { size: u64 },
    #[error("staging ring full and overflow flushing is disabled")]
    StagingBufferFull,
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
    #[error("png decode error: {0}")]
    Png(#[from] png::DecodingError),
}

/// Errors returned by [crate::ResourceLoader].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid descriptor: {0}")]
    InvalidDesc(&'static str),
    #[error("node index {node} out of range ({count} devices)")]
    NodeOutOfRange { node: u32, count: usize },
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
    #[error("could not start the streamer thread: {0}")]
    Spawn(#[from] std::io::Error),
}
