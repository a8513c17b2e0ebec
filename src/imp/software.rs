// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
A device that lives entirely in host memory.

Commands recorded into a [SoftwareDevice] are not executed when recorded.  They execute when the
submission carrying them completes, the same point at which a real GPU would have finished reading
staging memory.  This makes the backend useful for observing loader behavior:

* [CompletionMode::Immediate] completes every submission inside `queue_submit`.
* [CompletionMode::Manual] holds submissions until [SoftwareDevice::complete_next] or
  [SoftwareDevice::complete_all] is called, so a test can play the part of a slow GPU.  While a
  submission is held, its fence reads as incomplete and `wait_for_fences` blocks.

If the loader overwrote staging memory before its fence signaled, the bytes that land in the
destination would be wrong; tests check destination contents for that reason.
*/

use crate::device::{
    Buffer, BufferDesc, BufferTextureLayout, Cmd, Device, DeviceCaps, DeviceError, Fence,
    FenceStatus, HostMemory, Queue, QueueDesc, QueueSubmitDesc, QueueType, ResourceBarrier,
    Semaphore, Subresource, Texture, TextureDesc,
};
use crate::pixel_formats::mip_extent;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Condvar, Mutex};

/// When submissions complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    Immediate,
    Manual,
}

/// A command as it executed, in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutedCommand {
    CopyBuffer {
        dst: u64,
        dst_offset: u64,
        src: u64,
        src_offset: u64,
        size: u64,
    },
    CopyBufferToTexture {
        dst: u64,
        subresource: Subresource,
        src: u64,
        offset: u64,
    },
    CopyTextureToBuffer {
        dst: u64,
        offset: u64,
        src: u64,
        subresource: Subresource,
    },
    Barrier(Vec<ResourceBarrier>),
}

/// What a queue submission carried, for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub queue: u64,
    pub queue_type: QueueType,
    pub wait_semaphores: Vec<u64>,
    pub signal_semaphores: Vec<u64>,
    pub fence: Option<u64>,
    pub command_count: usize,
}

#[derive(Debug, Clone)]
enum Recorded {
    CopyBuffer {
        dst: Buffer,
        dst_memory: HostMemory,
        dst_offset: u64,
        src: Buffer,
        src_memory: HostMemory,
        src_offset: u64,
        size: u64,
    },
    CopyBufferToTexture {
        dst: Texture,
        subresource: Subresource,
        src: Buffer,
        src_memory: HostMemory,
        layout: BufferTextureLayout,
    },
    CopyTextureToBuffer {
        dst: Buffer,
        dst_memory: HostMemory,
        layout: BufferTextureLayout,
        src: Texture,
        subresource: Subresource,
    },
    Barrier(Vec<ResourceBarrier>),
}

#[derive(Debug)]
struct CmdState {
    recording: bool,
    commands: Vec<Recorded>,
}

#[derive(Debug, Default)]
struct FenceState {
    submitted: bool,
    complete: bool,
}

#[derive(Debug)]
struct TextureState {
    desc: TextureDesc,
    /// Tightly packed block rows, indexed by `layer * mip_levels + mip`.
    subresources: Vec<Vec<u8>>,
}

#[derive(Debug)]
struct Submission {
    commands: Vec<Recorded>,
    fence: Option<u64>,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    buffers: HashMap<u64, HostMemory>,
    textures: HashMap<u64, TextureState>,
    queues: HashMap<u64, QueueType>,
    cmds: HashMap<u64, CmdState>,
    fences: HashMap<u64, FenceState>,
    semaphores: HashSet<u64>,
    pending: VecDeque<Submission>,
    executed: Vec<ExecutedCommand>,
    submissions: Vec<SubmissionRecord>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn memory(&self, buffer: &Buffer) -> Result<HostMemory, DeviceError> {
        self.buffers
            .get(&buffer.id())
            .cloned()
            .ok_or(DeviceError::UnknownHandle {
                kind: "buffer",
                id: buffer.id(),
            })
    }

    fn recording_cmd(&mut self, cmd: &Cmd) -> Result<&mut CmdState, DeviceError> {
        let state = self.cmds.get_mut(&cmd.id()).ok_or(DeviceError::UnknownHandle {
            kind: "cmd",
            id: cmd.id(),
        })?;
        if !state.recording {
            return Err(DeviceError::NotRecording { id: cmd.id() });
        }
        Ok(state)
    }

    fn execute(&mut self, submission: Submission) {
        for command in submission.commands {
            self.execute_one(command);
        }
        if let Some(fence) = submission.fence {
            if let Some(state) = self.fences.get_mut(&fence) {
                state.complete = true;
            }
        }
    }

    fn execute_one(&mut self, command: Recorded) {
        match command {
            Recorded::CopyBuffer {
                dst,
                dst_memory,
                dst_offset,
                src,
                src_memory,
                src_offset,
                size,
            } => {
                let copied = src_memory
                    .read(src_offset, size)
                    .and_then(|bytes| dst_memory.write(dst_offset, &bytes));
                if let Err(e) = copied {
                    logwise::error_sync!(
                        "software copy_buffer failed: {err}",
                        err = logwise::privacy::LogIt(&e)
                    );
                }
                self.executed.push(ExecutedCommand::CopyBuffer {
                    dst: dst.id(),
                    dst_offset,
                    src: src.id(),
                    src_offset,
                    size,
                });
            }
            Recorded::CopyBufferToTexture {
                dst,
                subresource,
                src,
                src_memory,
                layout,
            } => {
                if let Some(texture) = self.textures.get_mut(&dst.id()) {
                    let index = subresource_index(&texture.desc, subresource);
                    let geometry = SubresourceGeometry::new(&texture.desc, subresource);
                    let storage = &mut texture.subresources[index];
                    for slice in 0..geometry.depth {
                        for row in 0..geometry.rows {
                            let src_offset = layout.offset
                                + slice as u64 * layout.slice_pitch
                                + row as u64 * layout.row_pitch;
                            let dst_offset = geometry.packed_offset(slice, row) as usize;
                            match src_memory.read(src_offset, geometry.row_bytes) {
                                Ok(bytes) => storage
                                    [dst_offset..dst_offset + geometry.row_bytes as usize]
                                    .copy_from_slice(&bytes),
                                Err(e) => logwise::error_sync!(
                                    "software copy_buffer_to_texture failed: {err}",
                                    err = logwise::privacy::LogIt(&e)
                                ),
                            }
                        }
                    }
                } else {
                    logwise::warn_sync!(
                        "software texture {id} destroyed before its copy executed",
                        id = dst.id()
                    );
                }
                self.executed.push(ExecutedCommand::CopyBufferToTexture {
                    dst: dst.id(),
                    subresource,
                    src: src.id(),
                    offset: layout.offset,
                });
            }
            Recorded::CopyTextureToBuffer {
                dst,
                dst_memory,
                layout,
                src,
                subresource,
            } => {
                if let Some(texture) = self.textures.get(&src.id()) {
                    let index = subresource_index(&texture.desc, subresource);
                    let geometry = SubresourceGeometry::new(&texture.desc, subresource);
                    let storage = &texture.subresources[index];
                    for slice in 0..geometry.depth {
                        for row in 0..geometry.rows {
                            let dst_offset = layout.offset
                                + slice as u64 * layout.slice_pitch
                                + row as u64 * layout.row_pitch;
                            let src_offset = geometry.packed_offset(slice, row) as usize;
                            let bytes =
                                &storage[src_offset..src_offset + geometry.row_bytes as usize];
                            if let Err(e) = dst_memory.write(dst_offset, bytes) {
                                logwise::error_sync!(
                                    "software copy_texture_to_buffer failed: {err}",
                                    err = logwise::privacy::LogIt(&e)
                                );
                            }
                        }
                    }
                }
                self.executed.push(ExecutedCommand::CopyTextureToBuffer {
                    dst: dst.id(),
                    offset: layout.offset,
                    src: src.id(),
                    subresource,
                });
            }
            Recorded::Barrier(barriers) => {
                self.executed.push(ExecutedCommand::Barrier(barriers));
            }
        }
    }
}

fn subresource_index(desc: &TextureDesc, subresource: Subresource) -> usize {
    (subresource.layer * desc.mip_levels + subresource.mip) as usize
}

/// Packed shape of one subresource.
struct SubresourceGeometry {
    row_bytes: u64,
    rows: u32,
    depth: u32,
}

impl SubresourceGeometry {
    fn new(desc: &TextureDesc, subresource: Subresource) -> Self {
        let width = mip_extent(desc.width, subresource.mip);
        let height = mip_extent(desc.height, subresource.mip);
        SubresourceGeometry {
            row_bytes: desc.format.row_bytes(width),
            rows: desc.format.row_count(height),
            depth: mip_extent(desc.depth, subresource.mip),
        }
    }

    fn packed_len(&self) -> u64 {
        self.row_bytes * self.rows as u64 * self.depth as u64
    }

    fn checked_packed_len(&self) -> Option<u64> {
        self.row_bytes
            .checked_mul(self.rows as u64)?
            .checked_mul(self.depth as u64)
    }

    fn packed_offset(&self, slice: u32, row: u32) -> u64 {
        (slice as u64 * self.rows as u64 + row as u64) * self.row_bytes
    }

    /// Bytes a buffer must hold for this subresource at `layout`.
    fn required_len(&self, layout: &BufferTextureLayout) -> Option<u64> {
        if self.rows == 0 || self.depth == 0 {
            return Some(layout.offset);
        }
        let last_slice = (self.depth as u64 - 1).checked_mul(layout.slice_pitch)?;
        let last_row = (self.rows as u64 - 1).checked_mul(layout.row_pitch)?;
        layout
            .offset
            .checked_add(last_slice)?
            .checked_add(last_row)?
            .checked_add(self.row_bytes)
    }
}

/**
A [Device] implemented on the CPU.

```
use bytes_in_flight::device::{BufferDesc, Device, MemoryUsage};
use bytes_in_flight::imp::software::{CompletionMode, SoftwareDevice};

let device = SoftwareDevice::new(CompletionMode::Immediate);
let buffer = device.add_buffer(&BufferDesc::new(16, MemoryUsage::CpuToGpu)).unwrap();
device.map_buffer(&buffer).unwrap().write(0, &[1, 2, 3, 4]).unwrap();
assert_eq!(&device.read_buffer(&buffer).unwrap()[..4], &[1, 2, 3, 4]);
```
*/
#[derive(Debug)]
pub struct SoftwareDevice {
    mode: CompletionMode,
    caps: DeviceCaps,
    state: Mutex<State>,
    completed: Condvar,
}

impl SoftwareDevice {
    pub fn new(mode: CompletionMode) -> Self {
        Self::with_caps(mode, DeviceCaps::default())
    }

    pub fn with_caps(mode: CompletionMode, caps: DeviceCaps) -> Self {
        SoftwareDevice {
            mode,
            caps,
            state: Mutex::new(State::default()),
            completed: Condvar::new(),
        }
    }

    /// Completes the oldest held submission.  Returns `false` if nothing was pending.
    pub fn complete_next(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(submission) = state.pending.pop_front() else {
            return false;
        };
        state.execute(submission);
        drop(state);
        self.completed.notify_all();
        true
    }

    /// Completes every held submission in order.  Returns how many completed.
    pub fn complete_all(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        let mut count = 0;
        while let Some(submission) = state.pending.pop_front() {
            state.execute(submission);
            count += 1;
        }
        drop(state);
        self.completed.notify_all();
        count
    }

    pub fn pending_submissions(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    /// Total `queue_submit` calls so far.
    pub fn submission_count(&self) -> usize {
        self.state.lock().unwrap().submissions.len()
    }

    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub fn executed_commands(&self) -> Vec<ExecutedCommand> {
        self.state.lock().unwrap().executed.clone()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.state.lock().unwrap().buffers.len()
    }

    pub fn live_texture_count(&self) -> usize {
        self.state.lock().unwrap().textures.len()
    }

    pub fn read_buffer(&self, buffer: &Buffer) -> Option<Vec<u8>> {
        let memory = self.state.lock().unwrap().memory(buffer).ok()?;
        memory.read(0, memory.len()).ok()
    }

    /// Tightly packed contents of one subresource.
    pub fn read_texture(&self, texture: &Texture, subresource: Subresource) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let entry = state.textures.get(&texture.id())?;
        if subresource.mip >= entry.desc.mip_levels || subresource.layer >= entry.desc.array_layers
        {
            return None;
        }
        Some(entry.subresources[subresource_index(&entry.desc, subresource)].clone())
    }

    /// Overwrites one subresource, for tests that read textures back.
    pub fn write_texture(&self, texture: &Texture, subresource: Subresource, bytes: &[u8]) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.textures.get_mut(&texture.id()) {
            let index = subresource_index(&entry.desc, subresource);
            let storage = &mut entry.subresources[index];
            let len = storage.len().min(bytes.len());
            storage[..len].copy_from_slice(&bytes[..len]);
        }
    }
}

impl Device for SoftwareDevice {
    fn caps(&self) -> DeviceCaps {
        self.caps
    }

    fn add_buffer(&self, desc: &BufferDesc) -> Result<Buffer, DeviceError> {
        if desc.size == 0 {
            return Err(DeviceError::InvalidDesc("buffer size is zero"));
        }
        if usize::try_from(desc.size).is_err() {
            return Err(DeviceError::OutOfMemory {
                requested: desc.size,
            });
        }
        let mut state = self.state.lock().unwrap();
        let id = state.next_id();
        state.buffers.insert(id, HostMemory::zeroed(desc.size));
        Ok(Buffer::from_raw(
            id,
            desc.size,
            desc.memory_usage,
            desc.node_index,
        ))
    }

    fn remove_buffer(&self, buffer: &Buffer) {
        self.state.lock().unwrap().buffers.remove(&buffer.id());
    }

    fn map_buffer(&self, buffer: &Buffer) -> Option<HostMemory> {
        if !(buffer.memory_usage().is_host_visible() || self.caps.unified_memory) {
            return None;
        }
        self.state.lock().unwrap().memory(buffer).ok()
    }

    fn add_texture(&self, desc: &TextureDesc) -> Result<Texture, DeviceError> {
        if desc.width == 0 || desc.height == 0 || desc.depth == 0 {
            return Err(DeviceError::InvalidDesc("texture extent is zero"));
        }
        if desc.mip_levels == 0 || desc.array_layers == 0 {
            return Err(DeviceError::InvalidDesc("texture has no subresources"));
        }
        let largest = desc.width.max(desc.height).max(desc.depth);
        if desc.mip_levels > u32::BITS - largest.leading_zeros() {
            return Err(DeviceError::InvalidDesc("more mips than the extent allows"));
        }
        let count = desc
            .mip_levels
            .checked_mul(desc.array_layers)
            .ok_or(DeviceError::InvalidDesc("texture has too many subresources"))?;
        //size everything before allocating anything
        let mut total = 0u64;
        for mip in 0..desc.mip_levels {
            let requested = SubresourceGeometry::new(desc, Subresource { mip, layer: 0 })
                .checked_packed_len()
                .and_then(|len| len.checked_mul(desc.array_layers as u64))
                .and_then(|len| total.checked_add(len));
            total = match requested {
                Some(total) if usize::try_from(total).is_ok() => total,
                _ => return Err(DeviceError::OutOfMemory { requested: u64::MAX }),
            };
        }
        let mut subresources = Vec::with_capacity(count as usize);
        for layer in 0..desc.array_layers {
            for mip in 0..desc.mip_levels {
                let geometry = SubresourceGeometry::new(desc, Subresource { mip, layer });
                subresources.push(vec![0u8; geometry.packed_len() as usize]);
            }
        }
        let mut state = self.state.lock().unwrap();
        let id = state.next_id();
        state.textures.insert(
            id,
            TextureState {
                desc: desc.clone(),
                subresources,
            },
        );
        Ok(Texture::from_raw(id, desc.clone()))
    }

    fn remove_texture(&self, texture: &Texture) {
        self.state.lock().unwrap().textures.remove(&texture.id());
    }

    fn add_queue(&self, desc: &QueueDesc) -> Result<Queue, DeviceError> {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id();
        state.queues.insert(id, desc.queue_type);
        Ok(Queue::from_raw(id, desc.queue_type))
    }

    fn remove_queue(&self, queue: &Queue) {
        self.state.lock().unwrap().queues.remove(&queue.id());
    }

    fn add_cmd(&self, queue: &Queue) -> Result<Cmd, DeviceError> {
        let mut state = self.state.lock().unwrap();
        if !state.queues.contains_key(&queue.id()) {
            return Err(DeviceError::UnknownHandle {
                kind: "queue",
                id: queue.id(),
            });
        }
        let id = state.next_id();
        state.cmds.insert(
            id,
            CmdState {
                recording: false,
                commands: Vec::new(),
            },
        );
        Ok(Cmd::from_raw(id))
    }

    fn remove_cmd(&self, cmd: &Cmd) {
        self.state.lock().unwrap().cmds.remove(&cmd.id());
    }

    fn reset_cmd(&self, cmd: &Cmd) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        let entry = state.cmds.get_mut(&cmd.id()).ok_or(DeviceError::UnknownHandle {
            kind: "cmd",
            id: cmd.id(),
        })?;
        entry.recording = false;
        entry.commands.clear();
        Ok(())
    }

    fn begin_cmd(&self, cmd: &Cmd) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        let entry = state.cmds.get_mut(&cmd.id()).ok_or(DeviceError::UnknownHandle {
            kind: "cmd",
            id: cmd.id(),
        })?;
        entry.recording = true;
        Ok(())
    }

    fn end_cmd(&self, cmd: &Cmd) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.recording_cmd(cmd)?.recording = false;
        Ok(())
    }

    fn cmd_copy_buffer(
        &self,
        cmd: &Cmd,
        dst: &Buffer,
        dst_offset: u64,
        src: &Buffer,
        src_offset: u64,
        size: u64,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        let dst_memory = state.memory(dst)?;
        let src_memory = state.memory(src)?;
        for (memory, offset) in [(&dst_memory, dst_offset), (&src_memory, src_offset)] {
            if offset.checked_add(size).is_none_or(|end| end > memory.len()) {
                return Err(DeviceError::OutOfRange {
                    offset,
                    size,
                    len: memory.len(),
                });
            }
        }
        state.recording_cmd(cmd)?.commands.push(Recorded::CopyBuffer {
            dst: dst.clone(),
            dst_memory,
            dst_offset,
            src: src.clone(),
            src_memory,
            src_offset,
            size,
        });
        Ok(())
    }

    fn cmd_copy_buffer_to_texture(
        &self,
        cmd: &Cmd,
        dst: &Texture,
        subresource: Subresource,
        src: &Buffer,
        layout: BufferTextureLayout,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        let src_memory = state.memory(src)?;
        check_texture_copy(&state, dst, subresource, &src_memory, &layout)?;
        state
            .recording_cmd(cmd)?
            .commands
            .push(Recorded::CopyBufferToTexture {
                dst: dst.clone(),
                subresource,
                src: src.clone(),
                src_memory,
                layout,
            });
        Ok(())
    }

    fn cmd_copy_texture_to_buffer(
        &self,
        cmd: &Cmd,
        dst: &Buffer,
        layout: BufferTextureLayout,
        src: &Texture,
        subresource: Subresource,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        let dst_memory = state.memory(dst)?;
        check_texture_copy(&state, src, subresource, &dst_memory, &layout)?;
        state
            .recording_cmd(cmd)?
            .commands
            .push(Recorded::CopyTextureToBuffer {
                dst: dst.clone(),
                dst_memory,
                layout,
                src: src.clone(),
                subresource,
            });
        Ok(())
    }

    fn cmd_resource_barrier(
        &self,
        cmd: &Cmd,
        barriers: &[ResourceBarrier],
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state
            .recording_cmd(cmd)?
            .commands
            .push(Recorded::Barrier(barriers.to_vec()));
        Ok(())
    }

    fn queue_submit(&self, queue: &Queue, desc: &QueueSubmitDesc<'_>) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        let queue_type = *state
            .queues
            .get(&queue.id())
            .ok_or(DeviceError::UnknownHandle {
                kind: "queue",
                id: queue.id(),
            })?;
        for semaphore in desc.wait_semaphores.iter().chain(desc.signal_semaphores) {
            if !state.semaphores.contains(&semaphore.id()) {
                return Err(DeviceError::UnknownHandle {
                    kind: "semaphore",
                    id: semaphore.id(),
                });
            }
        }
        let mut commands = Vec::new();
        for cmd in desc.cmds {
            let entry = state.cmds.get_mut(&cmd.id()).ok_or(DeviceError::UnknownHandle {
                kind: "cmd",
                id: cmd.id(),
            })?;
            if entry.recording {
                return Err(DeviceError::SubmitFailed(format!(
                    "cmd {} submitted while still recording",
                    cmd.id()
                )));
            }
            commands.extend(entry.commands.drain(..));
        }
        let fence = match desc.signal_fence {
            Some(fence) => {
                let entry = state
                    .fences
                    .get_mut(&fence.id())
                    .ok_or(DeviceError::UnknownHandle {
                        kind: "fence",
                        id: fence.id(),
                    })?;
                if entry.submitted && !entry.complete {
                    return Err(DeviceError::SubmitFailed(format!(
                        "fence {} is already in flight",
                        fence.id()
                    )));
                }
                entry.submitted = true;
                entry.complete = false;
                Some(fence.id())
            }
            None => None,
        };
        state.submissions.push(SubmissionRecord {
            queue: queue.id(),
            queue_type,
            wait_semaphores: desc.wait_semaphores.iter().map(Semaphore::id).collect(),
            signal_semaphores: desc.signal_semaphores.iter().map(Semaphore::id).collect(),
            fence,
            command_count: commands.len(),
        });
        let submission = Submission { commands, fence };
        match self.mode {
            CompletionMode::Immediate => {
                state.execute(submission);
                drop(state);
                self.completed.notify_all();
            }
            CompletionMode::Manual => state.pending.push_back(submission),
        }
        Ok(())
    }

    fn add_fence(&self) -> Result<Fence, DeviceError> {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id();
        state.fences.insert(id, FenceState::default());
        Ok(Fence::from_raw(id))
    }

    fn remove_fence(&self, fence: &Fence) {
        self.state.lock().unwrap().fences.remove(&fence.id());
    }

    fn fence_status(&self, fence: &Fence) -> FenceStatus {
        let state = self.state.lock().unwrap();
        match state.fences.get(&fence.id()) {
            Some(FenceState {
                submitted: true,
                complete: false,
            }) => FenceStatus::Incomplete,
            Some(FenceState {
                submitted: true,
                complete: true,
            }) => FenceStatus::Complete,
            _ => FenceStatus::NotSubmitted,
        }
    }

    fn wait_for_fences(&self, fences: &[&Fence]) {
        let mut state = self.state.lock().unwrap();
        loop {
            let outstanding = fences.iter().any(|fence| {
                matches!(
                    state.fences.get(&fence.id()),
                    Some(FenceState {
                        submitted: true,
                        complete: false
                    })
                )
            });
            if !outstanding {
                return;
            }
            state = self.completed.wait(state).unwrap();
        }
    }

    fn add_semaphore(&self) -> Result<Semaphore, DeviceError> {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id();
        state.semaphores.insert(id);
        Ok(Semaphore::from_raw(id))
    }

    fn remove_semaphore(&self, semaphore: &Semaphore) {
        self.state.lock().unwrap().semaphores.remove(&semaphore.id());
    }
}

fn check_texture_copy(
    state: &State,
    texture: &Texture,
    subresource: Subresource,
    memory: &HostMemory,
    layout: &BufferTextureLayout,
) -> Result<(), DeviceError> {
    let entry = state
        .textures
        .get(&texture.id())
        .ok_or(DeviceError::UnknownHandle {
            kind: "texture",
            id: texture.id(),
        })?;
    if subresource.mip >= entry.desc.mip_levels || subresource.layer >= entry.desc.array_layers {
        return Err(DeviceError::InvalidDesc("subresource out of range"));
    }
    let geometry = SubresourceGeometry::new(&entry.desc, subresource);
    if layout.row_pitch < geometry.row_bytes {
        return Err(DeviceError::InvalidDesc("row pitch smaller than a row"));
    }
    match geometry.required_len(layout) {
        Some(end) if end <= memory.len() => Ok(()),
        _ => Err(DeviceError::OutOfRange {
            offset: layout.offset,
            size: geometry.packed_len(),
            len: memory.len(),
        }),
    }
}
