// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Buffer loads and scoped buffer updates.

use super::{UploadBuffer, staging_range, upload_bytes};
use crate::copy_engine::CopyEngine;
use crate::device::{Buffer, BufferDesc, Device, DeviceError, ResourceBarrier, ResourceState};
use crate::error::RequestError;
use crate::staging::MappedMemoryRange;

/// Initial contents of a buffer created by [crate::ResourceLoader::add_buffer].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BufferData {
    /// Leave the contents alone (or zero them, with `force_reset`).
    #[default]
    None,
    Bytes(Vec<u8>),
    /// Copy from an existing buffer the caller keeps alive until the load completes.
    Buffer { buffer: Buffer, offset: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferLoadDesc {
    pub desc: BufferDesc,
    pub data: BufferData,
    /// Zero the whole buffer before (or instead of) writing `data`.
    pub force_reset: bool,
    /// State to transition to after the upload, if the buffer has a specific use.
    pub final_state: Option<ResourceState>,
}

impl BufferLoadDesc {
    pub fn new(desc: BufferDesc, data: BufferData) -> Self {
        BufferLoadDesc {
            desc,
            data,
            force_reset: false,
            final_state: None,
        }
    }
}

/// Describes a [crate::ResourceLoader::begin_update_buffer] window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferUpdateDesc {
    pub buffer: Buffer,
    pub dst_offset: u64,
    pub size: u64,
    pub final_state: Option<ResourceState>,
}

/**
An open buffer update.

Write through [BufferUpdate::range], then hand it back to
[crate::ResourceLoader::end_update_buffer].  On unified memory or host-visible buffers the range
*is* the destination and writes are visible immediately; otherwise it is a dedicated upload buffer
copied when the update ends.
*/
#[derive(Debug)]
#[must_use = "an update does nothing until passed to end_update_buffer"]
pub struct BufferUpdate {
    pub(crate) desc: BufferUpdateDesc,
    pub(crate) range: MappedMemoryRange,
    pub(crate) upload: Option<UploadBuffer>,
}

impl BufferUpdate {
    pub fn range(&self) -> &MappedMemoryRange {
        &self.range
    }

    pub fn write(&self, data: &[u8]) -> Result<(), DeviceError> {
        self.range.write(data)
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        self.range.write_at(offset, data)
    }

    /// Writes land directly in the destination.
    pub fn is_direct(&self) -> bool {
        self.upload.is_none()
    }
}

#[derive(Debug)]
pub(crate) enum BufferSource {
    Bytes(Vec<u8>),
    Zeroed { size: u64 },
    UploadBuffer {
        buffer: Buffer,
        offset: u64,
        size: u64,
        /// The request owns `buffer` and destroys it with the resource set.
        owned: bool,
    },
}

#[derive(Debug)]
pub(crate) struct BufferLoad {
    pub buffer: Buffer,
    pub dst_offset: u64,
    pub source: BufferSource,
    pub final_state: Option<ResourceState>,
}

pub(crate) fn load_buffer(engine: &mut CopyEngine, load: BufferLoad) -> Result<(), RequestError> {
    let BufferLoad {
        buffer,
        dst_offset,
        source,
        final_state,
    } = load;
    match source {
        BufferSource::Bytes(bytes) => upload_bytes(engine, &buffer, dst_offset, &bytes)?,
        BufferSource::Zeroed { size } => {
            let range = staging_range(engine, size, 1)?;
            //staging memory is reused, so it is not zero
            range.with_slice_mut(|bytes| bytes.fill(0))?;
            let cmd = engine.acquire_cmd()?;
            engine.device().cmd_copy_buffer(
                &cmd,
                &buffer,
                dst_offset,
                range.buffer(),
                range.offset(),
                size,
            )?;
        }
        BufferSource::UploadBuffer {
            buffer: src,
            offset,
            size,
            owned,
        } => {
            let cmd = engine.acquire_cmd();
            if owned {
                engine.defer_destroy(src.clone());
            }
            engine
                .device()
                .cmd_copy_buffer(&cmd?, &buffer, dst_offset, &src, offset, size)?;
        }
    }
    if let Some(state) = final_state {
        let cmd = engine.acquire_cmd()?;
        engine.device().cmd_resource_barrier(
            &cmd,
            &[ResourceBarrier::Buffer {
                buffer,
                from: ResourceState::CopyDest,
                to: state,
            }],
        )?;
    }
    Ok(())
}

#[cfg(all(test, feature = "backend_software"))]
mod tests {
    use super::*;
    use crate::device::{MemoryUsage, QueueType};
    use crate::imp::software::{CompletionMode, ExecutedCommand, SoftwareDevice};
    use std::sync::Arc;

    fn setup() -> (Arc<SoftwareDevice>, CopyEngine, Buffer) {
        let device = Arc::new(SoftwareDevice::new(CompletionMode::Immediate));
        let engine =
            CopyEngine::new(device.clone(), 0, QueueType::Transfer, 2, 256, true).unwrap();
        let dst = device
            .add_buffer(&BufferDesc::new(64, MemoryUsage::GpuOnly))
            .unwrap();
        (device, engine, dst)
    }

    #[test]
    fn zeroed_load_clears_reused_staging() {
        let (device, mut engine, dst) = setup();
        load_buffer(
            &mut engine,
            BufferLoad {
                buffer: dst.clone(),
                dst_offset: 0,
                source: BufferSource::Bytes(vec![0xAA; 64]),
                final_state: None,
            },
        )
        .unwrap();
        engine.flush().unwrap();
        engine.rotate();
        engine.flush().unwrap();
        engine.rotate();
        //back on set 0, whose staging still holds 0xAA
        load_buffer(
            &mut engine,
            BufferLoad {
                buffer: dst.clone(),
                dst_offset: 0,
                source: BufferSource::Zeroed { size: 32 },
                final_state: Some(ResourceState::VertexAndConstantBuffer),
            },
        )
        .unwrap();
        engine.flush().unwrap();
        let contents = device.read_buffer(&dst).unwrap();
        assert_eq!(&contents[..32], &[0; 32]);
        assert_eq!(&contents[32..], &[0xAA; 32]);
        assert!(matches!(
            device.executed_commands().last(),
            Some(ExecutedCommand::Barrier(_))
        ));
    }

    #[test]
    fn owned_upload_buffer_is_destroyed_with_the_set() {
        let (device, mut engine, dst) = setup();
        let upload = device
            .add_buffer(&BufferDesc::new(16, MemoryUsage::CpuToGpu))
            .unwrap();
        device.map_buffer(&upload).unwrap().write(0, &[5; 16]).unwrap();
        let live = device.live_buffer_count();
        load_buffer(
            &mut engine,
            BufferLoad {
                buffer: dst.clone(),
                dst_offset: 48,
                source: BufferSource::UploadBuffer {
                    buffer: upload,
                    offset: 0,
                    size: 16,
                    owned: true,
                },
                final_state: None,
            },
        )
        .unwrap();
        engine.flush().unwrap();
        engine.rotate();
        assert_eq!(device.live_buffer_count(), live);
        assert_eq!(&device.read_buffer(&dst).unwrap()[48..], &[5; 16]);
        //set 1, then set 0 again
        engine.prepare_active_set().unwrap();
        engine.rotate();
        engine.prepare_active_set().unwrap();
        assert_eq!(device.live_buffer_count(), live - 1);
    }
}
