// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Staging memory.

Every resource set owns a [StagingRing]: one CPU-visible buffer carved up by a bump cursor.  The
cursor only rewinds when the set is prepared, after its fence has signaled, so an allocation never
overlaps memory the GPU may still be reading.

[CopyEngine::allocate_staging] serves a request in one of three ways:

* larger than the whole ring: a dedicated buffer of exactly that size, destroyed with the set's
  temporary buffers the next time the set is prepared.  The cursor is untouched.
* fits in what's left of the ring: an aligned bump.
* fits only in an empty ring: with flush-on-overflow, submit the active set, rotate, and retry in
  the fresh set.  Otherwise the request fails with [StagingResult::Full].
*/

use crate::bittricks::checked_round_up;
use crate::config::RESOURCE_BUFFER_ALIGNMENT;
use crate::copy_engine::CopyEngine;
use crate::device::{
    Buffer, BufferDesc, Device, DeviceCaps, DeviceError, HostMemory, MemoryUsage, ResourceState,
};

/// A CPU-writable window onto a buffer the device will read from.
#[derive(Debug, Clone)]
pub struct MappedMemoryRange {
    memory: HostMemory,
    buffer: Buffer,
    offset: u64,
    size: u64,
}

impl MappedMemoryRange {
    pub(crate) fn new(memory: HostMemory, buffer: Buffer, offset: u64, size: u64) -> Self {
        MappedMemoryRange {
            memory,
            buffer,
            offset,
            size,
        }
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// Offset of the range within [Self::buffer].
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Writes `data` at the start of the range.
    pub fn write(&self, data: &[u8]) -> Result<(), DeviceError> {
        self.write_at(0, data)
    }

    /// Writes `data` at `offset` bytes into the range.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        let len = data.len() as u64;
        if offset.checked_add(len).is_none_or(|end| end > self.size) {
            return Err(DeviceError::OutOfRange {
                offset,
                size: len,
                len: self.size,
            });
        }
        self.memory.write(self.offset + offset, data)
    }

    /// Runs `f` over the whole range.
    pub fn with_slice_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R, DeviceError> {
        self.memory.with_range_mut(self.offset, self.size, f)
    }

    /// Copies the range out, mostly for inspection.
    pub fn read(&self) -> Result<Vec<u8>, DeviceError> {
        self.memory.read(self.offset, self.size)
    }
}

/// Outcome of a staging allocation.
#[derive(Debug)]
pub enum StagingResult {
    Range(MappedMemoryRange),
    /// The ring can't fit the allocation and overflow flushing is disabled.
    Full,
}

/// One resource set's staging buffer and bump cursor.
#[derive(Debug)]
pub(crate) struct StagingRing {
    buffer: Buffer,
    memory: HostMemory,
    allocated_space: u64,
}

impl StagingRing {
    pub fn new(buffer: Buffer, memory: HostMemory) -> Self {
        StagingRing {
            buffer,
            memory,
            allocated_space: 0,
        }
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn capacity(&self) -> u64 {
        self.buffer.size()
    }

    pub fn allocated_space(&self) -> u64 {
        self.allocated_space
    }

    pub fn reset(&mut self) {
        self.allocated_space = 0;
    }

    /// Bumps the cursor for an aligned allocation, returning its offset if it fits.
    pub fn try_bump(&mut self, size: u64, alignment: u64) -> Option<u64> {
        let offset = checked_round_up(self.allocated_space, alignment)?;
        let end = offset.checked_add(size)?;
        if end > self.capacity() {
            return None;
        }
        self.allocated_space = end;
        Some(offset)
    }

    fn range(&self, offset: u64, size: u64) -> MappedMemoryRange {
        MappedMemoryRange::new(self.memory.clone(), self.buffer.clone(), offset, size)
    }
}

/// The alignment actually applied to a staging allocation.
pub(crate) fn effective_alignment(requested: u64, caps: &DeviceCaps) -> u64 {
    requested
        .max(caps.upload_buffer_alignment)
        .max(RESOURCE_BUFFER_ALIGNMENT)
}

impl CopyEngine {
    /// Allocates `size` bytes of staging memory in the active resource set.
    ///
    /// Call this before [CopyEngine::acquire_cmd] for the copy that reads the range: an overflow
    /// flush submits the command buffer that was recording.
    pub fn allocate_staging(
        &mut self,
        size: u64,
        alignment: u64,
    ) -> Result<StagingResult, DeviceError> {
        let caps = self.caps();
        let alignment = effective_alignment(alignment, &caps);
        let size = checked_round_up(size.max(1), alignment)
            .ok_or(DeviceError::OutOfMemory { requested: size })?;
        self.prepare_active_set()?;

        if size > self.active_set().staging.capacity() {
            let buffer = self.device().add_buffer(&BufferDesc {
                size,
                memory_usage: MemoryUsage::CpuToGpu,
                start_state: ResourceState::GenericRead,
                node_index: self.node_index(),
                name: Some("staging overflow".to_owned()),
            })?;
            let Some(memory) = self.device().map_buffer(&buffer) else {
                self.device().remove_buffer(&buffer);
                return Err(DeviceError::InvalidDesc("overflow buffer is not host visible"));
            };
            logwise::debuginternal_sync!(
                "staging overflow: dedicated buffer of {size} bytes",
                size = size
            );
            self.defer_destroy(buffer.clone());
            return Ok(StagingResult::Range(MappedMemoryRange::new(
                memory, buffer, 0, size,
            )));
        }

        if let Some(offset) = self.active_set_mut().staging.try_bump(size, alignment) {
            return Ok(StagingResult::Range(self.active_set().staging.range(offset, size)));
        }
        if !self.flush_on_overflow() {
            return Ok(StagingResult::Full);
        }
        logwise::trace_sync!(
            "staging ring full at {used} bytes; flushing",
            used = self.active_set().staging.allocated_space()
        );
        if self.flush()?.is_some() {
            self.rotate();
        } else {
            //only requests that failed before recording used this ring
            self.active_set_mut().staging.reset();
        }
        self.prepare_active_set()?;
        let offset = self
            .active_set_mut()
            .staging
            .try_bump(size, alignment)
            .ok_or(DeviceError::OutOfMemory { requested: size })?;
        Ok(StagingResult::Range(self.active_set().staging.range(offset, size)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_respects_alignment_and_capacity() {
        let memory = HostMemory::zeroed(64);
        let buffer = Buffer::from_raw(1, 64, MemoryUsage::CpuToGpu, 0);
        let mut ring = StagingRing::new(buffer, memory);
        assert_eq!(ring.try_bump(10, 4), Some(0));
        assert_eq!(ring.try_bump(8, 16), Some(16));
        assert_eq!(ring.allocated_space(), 24);
        assert_eq!(ring.try_bump(48, 4), None);
        //a failed bump leaves the cursor alone
        assert_eq!(ring.allocated_space(), 24);
        assert_eq!(ring.try_bump(40, 4), Some(24));
        ring.reset();
        assert_eq!(ring.try_bump(64, 4), Some(0));
    }

    #[test]
    fn alignment_has_a_floor() {
        let caps = DeviceCaps {
            upload_buffer_alignment: 1,
            ..DeviceCaps::default()
        };
        assert_eq!(effective_alignment(1, &caps), RESOURCE_BUFFER_ALIGNMENT);
        assert_eq!(effective_alignment(256, &caps), 256);
    }

    #[test]
    fn range_writes_are_bounded() {
        let memory = HostMemory::zeroed(32);
        let buffer = Buffer::from_raw(1, 32, MemoryUsage::CpuToGpu, 0);
        let range = MappedMemoryRange::new(memory.clone(), buffer, 8, 8);
        range.write_at(4, &[7, 7, 7, 7]).unwrap();
        assert!(range.write_at(5, &[7, 7, 7, 7]).is_err());
        assert_eq!(memory.read(12, 4).unwrap(), vec![7, 7, 7, 7]);
    }
}
