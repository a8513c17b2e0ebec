// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Request handlers.

Each request kind has a handler that runs on the streamer against a [CopyEngine].  Handlers follow
one rule: allocate staging memory first, then acquire the command buffer.  An allocation may flush
the engine to make room, which ends the command buffer that was recording.
*/

pub mod buffer;
pub mod geometry;
pub mod texture;

use crate::copy_engine::CopyEngine;
use crate::device::{Buffer, Device};
use crate::error::RequestError;
use crate::staging::{MappedMemoryRange, StagingResult};
use std::sync::Arc;

/// How a request ended.
#[derive(Debug)]
pub(crate) enum UpdateResult {
    Completed,
    /// Only possible with overflow flushing disabled.
    StagingBufferFull,
    Invalid(RequestError),
    /// The handler panicked.  Carries the panic message.
    Panicked(String),
}

impl From<Result<(), RequestError>> for UpdateResult {
    fn from(result: Result<(), RequestError>) -> Self {
        match result {
            Ok(()) => UpdateResult::Completed,
            Err(RequestError::StagingBufferFull) => UpdateResult::StagingBufferFull,
            Err(e) => UpdateResult::Invalid(e),
        }
    }
}

/// An upload buffer owned by an open update.  Removed from the device unless the update is ended.
#[derive(Debug)]
pub(crate) struct UploadBuffer {
    device: Arc<dyn Device>,
    buffer: Buffer,
    armed: bool,
}

impl UploadBuffer {
    pub fn new(device: Arc<dyn Device>, buffer: Buffer) -> Self {
        UploadBuffer {
            device,
            buffer,
            armed: true,
        }
    }

    /// Hands the buffer to a request, which destroys it after the copy.
    pub fn into_buffer(mut self) -> Buffer {
        self.armed = false;
        self.buffer.clone()
    }
}

impl Drop for UploadBuffer {
    fn drop(&mut self) {
        if self.armed {
            logwise::debuginternal_sync!(
                "update dropped without being ended; removing its upload buffer {id}",
                id = self.buffer.id()
            );
            self.device.remove_buffer(&self.buffer);
        }
    }
}

pub(crate) fn staging_range(
    engine: &mut CopyEngine,
    size: u64,
    alignment: u64,
) -> Result<MappedMemoryRange, RequestError> {
    match engine.allocate_staging(size, alignment)? {
        StagingResult::Range(range) => Ok(range),
        StagingResult::Full => Err(RequestError::StagingBufferFull),
    }
}

/// Stages `bytes` and records a copy into `dst` at `dst_offset`.
pub(crate) fn upload_bytes(
    engine: &mut CopyEngine,
    dst: &Buffer,
    dst_offset: u64,
    bytes: &[u8],
) -> Result<(), RequestError> {
    if bytes.is_empty() {
        return Ok(());
    }
    let size = bytes.len() as u64;
    let range = staging_range(engine, size, 1)?;
    range.write(bytes)?;
    let cmd = engine.acquire_cmd()?;
    engine
        .device()
        .cmd_copy_buffer(&cmd, dst, dst_offset, range.buffer(), range.offset(), size)?;
    Ok(())
}
