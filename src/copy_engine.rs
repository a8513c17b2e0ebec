// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Per-queue recording and submission.

A [CopyEngine] owns one device queue and a ring of [CopyResourceSet]s.  Each set is everything one
submission needs: a command buffer, the fence and semaphore it signals, a staging ring, and the
dedicated buffers allocated when the ring was too small.

The set lifecycle:

1. **prepare**: wait for the set's fence from its previous use, reset its command buffer, destroy
   its temporary buffers, rewind its staging cursor.  Nothing in the set is touched before this,
   so the GPU is never reading staging memory the CPU is writing.
2. **record**: [CopyEngine::acquire_cmd] begins recording; handlers allocate staging and record
   copies.
3. **flush**: end and submit, signaling the set's fence and semaphore.
4. **rotate**: move to the next set.

Engine state is only touched by whichever thread runs the streamer tick.  The last submitted
fence and semaphore are published separately so other threads can read them mid-tick.
*/

use crate::device::{
    Buffer, BufferDesc, Cmd, Device, DeviceCaps, DeviceError, Fence, FenceStatus, MemoryUsage,
    NodeIndex, Queue, QueueDesc, QueueSubmitDesc, QueueType, ResourceState, Semaphore,
};
use crate::staging::StagingRing;
use crate::token::SyncToken;
use std::collections::VecDeque;
use std::sync::Arc;

/// The fence and semaphore signaled by a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedWork {
    pub fence: Fence,
    pub semaphore: Semaphore,
}

/// The most recent submission of one engine, readable from any thread.
#[derive(Debug, Default)]
pub(crate) struct LastSubmitted(wasm_safe_mutex::Mutex<Option<SubmittedWork>>);

impl LastSubmitted {
    pub fn get(&self) -> Option<SubmittedWork> {
        self.0.lock_sync().clone()
    }

    fn set(&self, work: SubmittedWork) {
        *self.0.lock_sync() = Some(work);
    }
}

#[derive(Debug)]
pub(crate) struct CopyResourceSet {
    cmd: Cmd,
    fence: Fence,
    semaphore: Semaphore,
    pub(crate) staging: StagingRing,
    pub(crate) temp_buffers: Vec<Buffer>,
    /// Lowest and highest token recorded into this set since it was prepared.
    tokens: Option<(SyncToken, SyncToken)>,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    set: usize,
    tokens: Option<(SyncToken, SyncToken)>,
}

#[derive(Debug)]
pub(crate) struct CopyEngine {
    device: Arc<dyn Device>,
    node_index: NodeIndex,
    caps: DeviceCaps,
    queue: Queue,
    sets: Vec<CopyResourceSet>,
    active_set: usize,
    /// The active set was prepared since the last rotate.
    prepared: bool,
    is_recording: bool,
    flush_on_overflow: bool,
    wait_semaphores: Vec<Semaphore>,
    in_flight: VecDeque<InFlight>,
    last_submitted: Arc<LastSubmitted>,
    destroyed: bool,
}

impl CopyEngine {
    pub fn new(
        device: Arc<dyn Device>,
        node_index: NodeIndex,
        queue_type: QueueType,
        buffer_count: u32,
        buffer_size: u64,
        flush_on_overflow: bool,
    ) -> Result<Self, DeviceError> {
        let caps = device.caps();
        let queue = device.add_queue(&QueueDesc {
            queue_type,
            node_index,
        })?;
        let mut sets = Vec::with_capacity(buffer_count as usize);
        for index in 0..buffer_count {
            let cmd = device.add_cmd(&queue)?;
            let fence = device.add_fence()?;
            let semaphore = device.add_semaphore()?;
            let buffer = device.add_buffer(&BufferDesc {
                size: buffer_size,
                memory_usage: MemoryUsage::CpuToGpu,
                start_state: ResourceState::GenericRead,
                node_index,
                name: Some(format!("staging ring {index}")),
            })?;
            let memory = device
                .map_buffer(&buffer)
                .ok_or(DeviceError::InvalidDesc("staging buffer is not host visible"))?;
            sets.push(CopyResourceSet {
                cmd,
                fence,
                semaphore,
                staging: StagingRing::new(buffer, memory),
                temp_buffers: Vec::new(),
                tokens: None,
            });
        }
        logwise::debuginternal_sync!(
            "copy engine on node {node} with {count} sets of {size} bytes",
            node = node_index,
            count = buffer_count,
            size = buffer_size
        );
        Ok(CopyEngine {
            device,
            node_index,
            caps,
            queue,
            sets,
            active_set: 0,
            prepared: false,
            is_recording: false,
            flush_on_overflow,
            wait_semaphores: Vec::new(),
            in_flight: VecDeque::new(),
            last_submitted: Arc::new(LastSubmitted::default()),
            destroyed: false,
        })
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn caps(&self) -> DeviceCaps {
        self.caps
    }

    pub fn node_index(&self) -> NodeIndex {
        self.node_index
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue.queue_type()
    }

    pub fn is_recording(&self) -> bool {
        self.is_recording
    }

    pub fn flush_on_overflow(&self) -> bool {
        self.flush_on_overflow
    }

    pub fn active_set_index(&self) -> usize {
        self.active_set
    }

    pub(crate) fn active_set_mut(&mut self) -> &mut CopyResourceSet {
        &mut self.sets[self.active_set]
    }

    pub(crate) fn active_set(&self) -> &CopyResourceSet {
        &self.sets[self.active_set]
    }

    pub fn last_submitted(&self) -> Arc<LastSubmitted> {
        self.last_submitted.clone()
    }

    /// Waits for the active set's previous submission and resets it for reuse.
    ///
    /// No-op if the set was already prepared since the last rotate.
    pub fn prepare_active_set(&mut self) -> Result<(), DeviceError> {
        if self.prepared {
            return Ok(());
        }
        let index = self.active_set;
        let set = &mut self.sets[index];
        if self.device.fence_status(&set.fence) == FenceStatus::Incomplete {
            let interval = logwise::perfwarn_begin!("bytes_in_flight::CopyEngine fence wait");
            self.device.wait_for_fences(&[&set.fence]);
            drop(interval);
        }
        self.in_flight.retain(|entry| entry.set != index);
        self.device.reset_cmd(&set.cmd)?;
        for buffer in set.temp_buffers.drain(..) {
            self.device.remove_buffer(&buffer);
        }
        set.staging.reset();
        set.tokens = None;
        self.prepared = true;
        Ok(())
    }

    /// Begins recording into the active set, or returns the command buffer already recording.
    pub fn acquire_cmd(&mut self) -> Result<Cmd, DeviceError> {
        if !self.is_recording {
            self.prepare_active_set()?;
            self.device.begin_cmd(&self.sets[self.active_set].cmd)?;
            self.is_recording = true;
        }
        Ok(self.sets[self.active_set].cmd.clone())
    }

    /// Marks `token` as recorded into the active set.
    pub fn note_token(&mut self, token: SyncToken) {
        let set = &mut self.sets[self.active_set];
        set.tokens = Some(match set.tokens {
            Some((low, high)) => (low.min(token), high.max(token)),
            None => (token, token),
        });
    }

    /// Hands a buffer to the active set; it is destroyed when the set is next prepared.
    pub fn defer_destroy(&mut self, buffer: Buffer) {
        self.sets[self.active_set].temp_buffers.push(buffer);
    }

    /// The next submission from this engine waits on `semaphore`.
    pub fn add_wait_semaphore(&mut self, semaphore: Semaphore) {
        self.wait_semaphores.push(semaphore);
    }

    /// Ends and submits the active set.  Returns `None` if nothing was recording.
    pub fn flush(&mut self) -> Result<Option<SubmittedWork>, DeviceError> {
        if !self.is_recording {
            return Ok(None);
        }
        let set = &self.sets[self.active_set];
        self.device.end_cmd(&set.cmd)?;
        let waits = std::mem::take(&mut self.wait_semaphores);
        self.device.queue_submit(
            &self.queue,
            &QueueSubmitDesc {
                cmds: std::slice::from_ref(&set.cmd),
                wait_semaphores: &waits,
                signal_semaphores: std::slice::from_ref(&set.semaphore),
                signal_fence: Some(&set.fence),
            },
        )?;
        self.is_recording = false;
        self.in_flight.push_back(InFlight {
            set: self.active_set,
            tokens: set.tokens,
        });
        let work = SubmittedWork {
            fence: set.fence.clone(),
            semaphore: set.semaphore.clone(),
        };
        self.last_submitted.set(work.clone());
        logwise::trace_sync!(
            "flushed set {set} on node {node}",
            set = self.active_set,
            node = self.node_index
        );
        Ok(Some(work))
    }

    /// Advances to the next resource set.  The previous set must have been flushed.
    pub fn rotate(&mut self) {
        assert!(!self.is_recording, "rotate while recording");
        self.active_set = (self.active_set + 1) % self.sets.len();
        self.prepared = false;
    }

    /// Drops in-flight entries whose fences have signaled.  Never blocks.
    pub fn retire(&mut self) {
        while let Some(entry) = self.in_flight.front() {
            let fence = &self.sets[entry.set].fence;
            if self.device.fence_status(fence) == FenceStatus::Incomplete {
                break;
            }
            self.in_flight.pop_front();
        }
    }

    /// Blocks until the oldest in-flight submission completes, then retires.
    ///
    /// Returns `false` if nothing was in flight.
    pub fn wait_oldest(&mut self) -> bool {
        let Some(entry) = self.in_flight.front() else {
            return false;
        };
        let interval = logwise::perfwarn_begin!("bytes_in_flight::CopyEngine wait_oldest");
        self.device.wait_for_fences(&[&self.sets[entry.set].fence]);
        drop(interval);
        self.retire();
        true
    }

    pub fn has_in_flight(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// Lowest token recorded into this engine whose work may still be running.
    pub fn lowest_pending_token(&self) -> Option<SyncToken> {
        let in_flight = self
            .in_flight
            .iter()
            .filter_map(|entry| entry.tokens.map(|(low, _)| low));
        let recording = if self.is_recording {
            self.sets[self.active_set].tokens.map(|(low, _)| low)
        } else {
            None
        };
        in_flight.chain(recording).min()
    }

    /// Submits anything recorded and waits for every submission to finish.
    pub fn wait_idle(&mut self) -> Result<(), DeviceError> {
        if self.flush()?.is_some() {
            self.rotate();
        }
        let fences: Vec<&Fence> = self
            .in_flight
            .iter()
            .map(|entry| &self.sets[entry.set].fence)
            .collect();
        if !fences.is_empty() {
            self.device.wait_for_fences(&fences);
        }
        self.in_flight.clear();
        Ok(())
    }

    /// Waits idle and releases every device object.
    pub fn destroy(&mut self) -> Result<(), DeviceError> {
        if self.destroyed {
            return Ok(());
        }
        self.wait_idle()?;
        for set in self.sets.drain(..) {
            for buffer in &set.temp_buffers {
                self.device.remove_buffer(buffer);
            }
            self.device.remove_buffer(set.staging.buffer());
            self.device.remove_cmd(&set.cmd);
            self.device.remove_fence(&set.fence);
            self.device.remove_semaphore(&set.semaphore);
        }
        self.device.remove_queue(&self.queue);
        self.destroyed = true;
        Ok(())
    }
}
