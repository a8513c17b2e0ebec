// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! The device boundary consumed by the loader.
//!
//! The loader never talks to a graphics API directly.  Instead it drives an object implementing
//! [Device], which exposes the small slice of a GPU API that uploads need:
//!
//! - Resource lifecycle: buffers, textures, fences, semaphores, queues and command buffers
//! - Command recording: buffer copies, buffer/texture copies and resource state barriers
//! - Submission and synchronization: submit with wait/signal semaphores and a signal fence
//! - Capability queries: the alignment rules for copies out of upload memory
//!
//! Handles are small `Clone` values.  They carry an opaque id assigned by the backend plus the
//! metadata the loader needs to plan copies (sizes, memory placement, texture layout), so the
//! loader never has to call back into the device just to ask how big something is.

use crate::pixel_formats::ImageFormat;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// Index of a GPU in a multi-GPU setup.
pub type NodeIndex = u32;

/// Errors reported by a device backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("out of device memory allocating {requested} bytes")]
    OutOfMemory { requested: u64 },
    #[error("unknown {kind} handle {id}")]
    UnknownHandle { kind: &'static str, id: u64 },
    #[error("range {offset}+{size} is outside a {len} byte allocation")]
    OutOfRange { offset: u64, size: u64, len: u64 },
    #[error("command buffer {id} is not recording")]
    NotRecording { id: u64 },
    #[error("invalid descriptor: {0}")]
    InvalidDesc(&'static str),
    #[error("queue submission failed: {0}")]
    SubmitFailed(String),
}

/// Where a buffer lives and who can touch it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryUsage {
    /// Device local, not CPU visible (except on unified memory devices).
    GpuOnly,
    /// CPU writable, GPU readable.  Staging rings and upload buffers use this.
    CpuToGpu,
    /// GPU writable, CPU readable.  Readback targets use this.
    GpuToCpu,
    CpuOnly,
}

impl MemoryUsage {
    pub const fn is_host_visible(self) -> bool {
        !matches!(self, MemoryUsage::GpuOnly)
    }
}

/// Resource states tracked by explicit APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Undefined,
    Common,
    CopyDest,
    CopySource,
    VertexAndConstantBuffer,
    IndexBuffer,
    ShaderResource,
    UnorderedAccess,
    GenericRead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueType {
    Graphics,
    Transfer,
    Compute,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: u64,
    pub memory_usage: MemoryUsage,
    pub start_state: ResourceState,
    pub node_index: NodeIndex,
    pub name: Option<String>,
}

impl BufferDesc {
    pub fn new(size: u64, memory_usage: MemoryUsage) -> Self {
        BufferDesc {
            size,
            memory_usage,
            start_state: ResourceState::Common,
            node_index: 0,
            name: None,
        }
    }
}

/// A device buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Buffer {
    id: u64,
    size: u64,
    memory_usage: MemoryUsage,
    node_index: NodeIndex,
}

impl Buffer {
    /// Backends construct handles; the loader only reads them.
    pub fn from_raw(id: u64, size: u64, memory_usage: MemoryUsage, node_index: NodeIndex) -> Self {
        Buffer {
            id,
            size,
            memory_usage,
            node_index,
        }
    }
    pub fn id(&self) -> u64 {
        self.id
    }
    pub fn size(&self) -> u64 {
        self.size
    }
    pub fn memory_usage(&self) -> MemoryUsage {
        self.memory_usage
    }
    pub fn node_index(&self) -> NodeIndex {
        self.node_index
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub format: ImageFormat,
    pub cubemap: bool,
    pub start_state: ResourceState,
    pub node_index: NodeIndex,
    pub name: Option<String>,
}

impl TextureDesc {
    pub fn new_2d(width: u32, height: u32, format: ImageFormat) -> Self {
        TextureDesc {
            width,
            height,
            depth: 1,
            mip_levels: 1,
            array_layers: 1,
            format,
            cubemap: false,
            start_state: ResourceState::ShaderResource,
            node_index: 0,
            name: None,
        }
    }
}

/// A device texture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Texture {
    id: u64,
    desc: Arc<TextureDesc>,
}

impl Texture {
    pub fn from_raw(id: u64, desc: TextureDesc) -> Self {
        Texture {
            id,
            desc: Arc::new(desc),
        }
    }
    pub fn id(&self) -> u64 {
        self.id
    }
    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDesc {
    pub queue_type: QueueType,
    pub node_index: NodeIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Queue {
    pub(crate) id: u64,
    pub(crate) queue_type: QueueType,
}

impl Queue {
    pub fn from_raw(id: u64, queue_type: QueueType) -> Self {
        Queue { id, queue_type }
    }
    pub fn id(&self) -> u64 {
        self.id
    }
    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }
}

/// A command pool and its single command buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cmd {
    id: u64,
}

impl Cmd {
    pub fn from_raw(id: u64) -> Self {
        Cmd { id }
    }
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fence {
    id: u64,
}

impl Fence {
    pub fn from_raw(id: u64) -> Self {
        Fence { id }
    }
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Semaphore {
    id: u64,
}

impl Semaphore {
    pub fn from_raw(id: u64) -> Self {
        Semaphore { id }
    }
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    Complete,
    Incomplete,
    /// Never submitted since creation or the last reset.
    NotSubmitted,
}

/// One subresource of a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subresource {
    pub mip: u32,
    pub layer: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceBarrier {
    Buffer {
        buffer: Buffer,
        from: ResourceState,
        to: ResourceState,
    },
    Texture {
        texture: Texture,
        from: ResourceState,
        to: ResourceState,
        /// `None` transitions every subresource.
        subresource: Option<Subresource>,
        /// Queue ownership transfer: acquire from this queue type.
        acquire_from: Option<QueueType>,
        /// Queue ownership transfer: release to this queue type.
        release_to: Option<QueueType>,
    },
}

/// Layout of one subresource's texels inside a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferTextureLayout {
    pub offset: u64,
    /// Bytes between the starts of consecutive block rows.
    pub row_pitch: u64,
    /// Bytes between the starts of consecutive depth slices.
    pub slice_pitch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCaps {
    /// Minimum offset alignment for buffer-to-buffer copies out of upload memory.
    pub upload_buffer_alignment: u64,
    /// Offset alignment for the start of a subresource inside upload memory.
    pub upload_buffer_texture_alignment: u64,
    /// Row pitch alignment for buffer/texture copies.
    pub upload_buffer_texture_row_alignment: u64,
    /// CPU and GPU share memory, so device-local buffers are also host visible.
    pub unified_memory: bool,
}

impl Default for DeviceCaps {
    fn default() -> Self {
        DeviceCaps {
            upload_buffer_alignment: 4,
            upload_buffer_texture_alignment: 512,
            upload_buffer_texture_row_alignment: 256,
            unified_memory: false,
        }
    }
}

pub struct QueueSubmitDesc<'a> {
    pub cmds: &'a [Cmd],
    pub wait_semaphores: &'a [Semaphore],
    pub signal_semaphores: &'a [Semaphore],
    pub signal_fence: Option<&'a Fence>,
}

/**
CPU-visible memory backing a mapped buffer.

Clones share the same bytes.  Writers lock for the duration of a copy, so a GPU-side reader
(a backend executing a submitted copy) never observes a half-written range.
*/
#[derive(Clone)]
pub struct HostMemory {
    bytes: Arc<wasm_safe_mutex::Mutex<Box<[u8]>>>,
    len: u64,
}

impl HostMemory {
    pub fn zeroed(len: u64) -> Self {
        HostMemory {
            bytes: Arc::new(wasm_safe_mutex::Mutex::new(
                vec![0u8; len as usize].into_boxed_slice(),
            )),
            len,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check(&self, offset: u64, size: u64) -> Result<(), DeviceError> {
        match offset.checked_add(size) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(DeviceError::OutOfRange {
                offset,
                size,
                len: self.len,
            }),
        }
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        self.check(offset, data.len() as u64)?;
        let mut guard = self.bytes.lock_sync();
        let start = offset as usize;
        guard[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn read(&self, offset: u64, size: u64) -> Result<Vec<u8>, DeviceError> {
        self.check(offset, size)?;
        let guard = self.bytes.lock_sync();
        let start = offset as usize;
        Ok(guard[start..start + size as usize].to_vec())
    }

    /// Runs `f` with exclusive access to `offset..offset+size`.
    pub fn with_range_mut<R>(
        &self,
        offset: u64,
        size: u64,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, DeviceError> {
        self.check(offset, size)?;
        let mut guard = self.bytes.lock_sync();
        let start = offset as usize;
        Ok(f(&mut guard[start..start + size as usize]))
    }

    pub fn ptr_eq(&self, other: &HostMemory) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }
}

impl Debug for HostMemory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostMemory").field("len", &self.len).finish()
    }
}

/**
A GPU, as seen by the loader.

Implementations must be thread safe: the loader calls into the device from its streamer thread
while application threads create and destroy resources.

Recording calls take the command buffer they record into.  The loader guarantees a command buffer
is only recorded from one thread at a time, between `begin_cmd` and `end_cmd`.
*/
pub trait Device: Send + Sync + Debug {
    fn caps(&self) -> DeviceCaps;

    fn add_buffer(&self, desc: &BufferDesc) -> Result<Buffer, DeviceError>;
    fn remove_buffer(&self, buffer: &Buffer);
    /// CPU view of a buffer, or `None` if the buffer is not host visible.
    fn map_buffer(&self, buffer: &Buffer) -> Option<HostMemory>;

    fn add_texture(&self, desc: &TextureDesc) -> Result<Texture, DeviceError>;
    fn remove_texture(&self, texture: &Texture);

    fn add_queue(&self, desc: &QueueDesc) -> Result<Queue, DeviceError>;
    fn remove_queue(&self, queue: &Queue);

    fn add_cmd(&self, queue: &Queue) -> Result<Cmd, DeviceError>;
    fn remove_cmd(&self, cmd: &Cmd);
    /// Resets the pool backing `cmd`, discarding anything recorded.
    fn reset_cmd(&self, cmd: &Cmd) -> Result<(), DeviceError>;
    fn begin_cmd(&self, cmd: &Cmd) -> Result<(), DeviceError>;
    fn end_cmd(&self, cmd: &Cmd) -> Result<(), DeviceError>;

    fn cmd_copy_buffer(
        &self,
        cmd: &Cmd,
        dst: &Buffer,
        dst_offset: u64,
        src: &Buffer,
        src_offset: u64,
        size: u64,
    ) -> Result<(), DeviceError>;

    fn cmd_copy_buffer_to_texture(
        &self,
        cmd: &Cmd,
        dst: &Texture,
        subresource: Subresource,
        src: &Buffer,
        layout: BufferTextureLayout,
    ) -> Result<(), DeviceError>;

    fn cmd_copy_texture_to_buffer(
        &self,
        cmd: &Cmd,
        dst: &Buffer,
        layout: BufferTextureLayout,
        src: &Texture,
        subresource: Subresource,
    ) -> Result<(), DeviceError>;

    fn cmd_resource_barrier(&self, cmd: &Cmd, barriers: &[ResourceBarrier])
    -> Result<(), DeviceError>;

    fn queue_submit(&self, queue: &Queue, desc: &QueueSubmitDesc<'_>) -> Result<(), DeviceError>;

    fn add_fence(&self) -> Result<Fence, DeviceError>;
    fn remove_fence(&self, fence: &Fence);
    fn fence_status(&self, fence: &Fence) -> FenceStatus;
    /// Blocks until every submitted fence in `fences` is complete.
    ///
    /// Fences that were never submitted are treated as complete.
    fn wait_for_fences(&self, fences: &[&Fence]);

    fn add_semaphore(&self) -> Result<Semaphore, DeviceError>;
    fn remove_semaphore(&self, semaphore: &Semaphore);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_memory_bounds() {
        let memory = HostMemory::zeroed(16);
        memory.write(12, &[1, 2, 3, 4]).unwrap();
        assert_eq!(memory.read(12, 4).unwrap(), vec![1, 2, 3, 4]);
        assert!(matches!(
            memory.write(13, &[1, 2, 3, 4]),
            Err(DeviceError::OutOfRange { offset: 13, size: 4, len: 16 })
        ));
        assert!(memory.read(u64::MAX, 2).is_err());
    }

    #[test]
    fn host_memory_clones_share_bytes() {
        let memory = HostMemory::zeroed(4);
        let alias = memory.clone();
        alias
            .with_range_mut(0, 4, |bytes| bytes.copy_from_slice(&[9, 8, 7, 6]))
            .unwrap();
        assert_eq!(memory.read(0, 4).unwrap(), vec![9, 8, 7, 6]);
        assert!(memory.ptr_eq(&alias));
    }
}
