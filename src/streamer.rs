// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The streamer.

[StreamerCore::tick] is the loader's whole pipeline: drain the request queue, execute each
request against its node's copy engine, submit everything recorded, then publish which tokens
have completed.  A [scheduler::Scheduler] decides which thread ticks and when.

A token completes once every token at or below it has been submitted and none of them is still
recorded into a resource set whose fence has not signaled:

```text
completed = min(submitted, lowest pending token - 1)
```
*/

pub(crate) mod scheduler;

use crate::config::{RESOURCE_BUFFER_ALIGNMENT, ResourceLoaderDesc};
use crate::copy_engine::{CopyEngine, LastSubmitted, SubmittedWork};
use crate::device::{Device, DeviceError, NodeIndex, QueueType};
use crate::request::{RequestKind, RequestQueue, UpdateRequest};
use crate::token::{SyncToken, TokenState};
use crate::upload::UpdateResult;
use crate::upload::buffer::load_buffer;
use crate::upload::geometry::load_geometry;
use crate::upload::texture::{barrier_texture, copy_texture, load_texture};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// The engines of one device node.
#[derive(Debug)]
struct GpuEngines {
    upload: CopyEngine,
    /// Created by the first readback.
    copy: Option<CopyEngine>,
}

impl GpuEngines {
    fn engines_mut(&mut self) -> impl Iterator<Item = &mut CopyEngine> {
        std::iter::once(&mut self.upload).chain(self.copy.as_mut())
    }

    fn engines(&self) -> impl Iterator<Item = &CopyEngine> {
        std::iter::once(&self.upload).chain(self.copy.as_ref())
    }

    fn copy_engine(&mut self, buffer_count: u32) -> Result<&mut CopyEngine, DeviceError> {
        let engine = match self.copy.take() {
            Some(engine) => engine,
            //readback never stages, so the rings stay minimal
            None => CopyEngine::new(
                self.upload.device().clone(),
                self.upload.node_index(),
                QueueType::Transfer,
                buffer_count,
                RESOURCE_BUFFER_ALIGNMENT,
                false,
            )?,
        };
        Ok(self.copy.insert(engine))
    }
}

/// Everything a tick touches.  Shared between the loader and its scheduler.
#[derive(Debug)]
pub(crate) struct StreamerCore {
    devices: Vec<Arc<dyn Device>>,
    queue: RequestQueue,
    tokens: TokenState,
    engines: Mutex<Vec<GpuEngines>>,
    upload_last_submitted: Vec<Arc<LastSubmitted>>,
    buffer_count: u32,
    idle_poll_interval: Duration,
    shut_down: AtomicBool,
}

fn fatal(what: &str, node: usize, error: DeviceError) -> ! {
    logwise::error_sync!(
        "device error while {what} on node {node}: {error}",
        what = what.to_owned(),
        node = node,
        error = logwise::privacy::LogIt(&error)
    );
    panic!("device error while {what} on node {node}: {error}");
}

impl StreamerCore {
    pub fn new(
        devices: Vec<Arc<dyn Device>>,
        desc: &ResourceLoaderDesc,
    ) -> Result<Self, DeviceError> {
        let buffer_count = desc.clamped_buffer_count();
        let mut engines = Vec::with_capacity(devices.len());
        for (node, device) in devices.iter().enumerate() {
            let upload = CopyEngine::new(
                device.clone(),
                node as NodeIndex,
                QueueType::Transfer,
                buffer_count,
                desc.buffer_size,
                desc.flush_on_overflow,
            )?;
            engines.push(GpuEngines { upload, copy: None });
        }
        let upload_last_submitted = engines.iter().map(|e| e.upload.last_submitted()).collect();
        Ok(StreamerCore {
            queue: RequestQueue::new(devices.len()),
            devices,
            tokens: TokenState::new(),
            engines: Mutex::new(engines),
            upload_last_submitted,
            buffer_count,
            idle_poll_interval: desc.idle_poll_interval,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn devices(&self) -> &[Arc<dyn Device>] {
        &self.devices
    }

    pub fn tokens(&self) -> &TokenState {
        &self.tokens
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn idle_poll_interval(&self) -> Duration {
        self.idle_poll_interval
    }

    pub fn enqueue(&self, node: NodeIndex, kind: RequestKind) -> SyncToken {
        self.queue.push(node, kind, &self.tokens)
    }

    /// The most recent submission of `node`'s upload engine.
    pub fn last_submitted(&self, node: NodeIndex) -> Option<SubmittedWork> {
        self.upload_last_submitted
            .get(node as usize)
            .and_then(|last| last.get())
    }

    /// Runs one pass of the pipeline.  Returns whether any submission is still in flight.
    pub fn tick(&self) -> bool {
        //lock before draining, so concurrent ticks execute batches in drain order
        let mut engines = self.engines.lock().unwrap();
        let drained = self.queue.drain(&self.tokens);
        if !drained.is_empty() {
            let interval = logwise::perfwarn_begin!("bytes_in_flight::StreamerCore::tick");
            for (node, batch) in drained.batches.into_iter().enumerate() {
                if batch.is_empty() {
                    continue;
                }
                let gpu = &mut engines[node];
                if let Err(e) = gpu.upload.prepare_active_set() {
                    fatal("preparing a resource set", node, e);
                }
                for request in batch {
                    self.execute(gpu, request);
                }
            }
            for (node, gpu) in engines.iter_mut().enumerate() {
                for engine in gpu.engines_mut() {
                    match engine.flush() {
                        Ok(Some(_)) => engine.rotate(),
                        Ok(None) => {}
                        Err(e) => fatal("submitting", node, e),
                    }
                }
            }
            drop(interval);
        }
        self.tokens.publish_submitted(drained.last_token);
        self.publish_completed(&mut engines)
    }

    fn execute(&self, gpu: &mut GpuEngines, request: UpdateRequest) {
        let UpdateRequest { wait_index, kind } = request;
        let name = kind.name();
        let result = match kind {
            RequestKind::CopyTexture(copy) => match gpu.copy_engine(self.buffer_count) {
                Ok(engine) => run(engine, wait_index, |engine| copy_texture(engine, copy)),
                Err(e) => UpdateResult::Invalid(e.into()),
            },
            RequestKind::LoadBuffer(load) => {
                run(&mut gpu.upload, wait_index, |engine| load_buffer(engine, load))
            }
            RequestKind::LoadTexture(load) => {
                run(&mut gpu.upload, wait_index, |engine| load_texture(engine, load))
            }
            RequestKind::LoadGeometry(load) => {
                run(&mut gpu.upload, wait_index, |engine| load_geometry(engine, load))
            }
            RequestKind::TextureBarrier(barrier) => run(&mut gpu.upload, wait_index, |engine| {
                barrier_texture(engine, barrier)
            }),
        };
        match result {
            UpdateResult::Completed => {}
            UpdateResult::StagingBufferFull => {
                logwise::error_sync!(
                    "{name} (token {token}) does not fit in the staging ring; dropped",
                    name = name.to_owned(),
                    token = wait_index
                );
            }
            UpdateResult::Invalid(e) => {
                logwise::error_sync!(
                    "{name} (token {token}) failed: {error}",
                    name = name.to_owned(),
                    token = wait_index,
                    error = logwise::privacy::LogIt(&e)
                );
            }
            UpdateResult::Panicked(message) => {
                logwise::error_sync!(
                    "{name} (token {token}) panicked: {message}",
                    name = name.to_owned(),
                    token = wait_index,
                    message = message
                );
            }
        }
    }

    /// Retires signaled fences and publishes the completed token.
    fn publish_completed(&self, engines: &mut [GpuEngines]) -> bool {
        let mut in_flight = false;
        let mut lowest_pending: Option<SyncToken> = None;
        for gpu in engines.iter_mut() {
            for engine in gpu.engines_mut() {
                engine.retire();
                in_flight |= engine.has_in_flight();
                if let Some(token) = engine.lowest_pending_token() {
                    lowest_pending = Some(lowest_pending.map_or(token, |low| low.min(token)));
                }
            }
        }
        let submitted = self.tokens.submitted();
        let completed = match lowest_pending {
            Some(token) => submitted.min(token - 1),
            None => submitted,
        };
        self.tokens.publish_completed(completed);
        in_flight
    }

    /// Polls fences without executing anything.
    pub fn poll(&self) -> bool {
        let mut engines = self.engines.lock().unwrap();
        self.publish_completed(&mut engines)
    }

    /// Blocks on the in-flight submission holding the lowest pending token.
    ///
    /// Returns `false` if nothing was in flight.
    pub fn wait_oldest(&self) -> bool {
        let mut engines = self.engines.lock().unwrap();
        let oldest = engines
            .iter_mut()
            .flat_map(GpuEngines::engines_mut)
            .filter(|engine| engine.has_in_flight())
            .min_by_key(|engine| engine.lowest_pending_token().unwrap_or(SyncToken::MAX));
        let waited = match oldest {
            Some(engine) => engine.wait_oldest(),
            None => false,
        };
        self.publish_completed(&mut engines);
        waited
    }

    /// Whether any engine still has work on the device.
    pub fn has_in_flight(&self) -> bool {
        let engines = self.engines.lock().unwrap();
        engines
            .iter()
            .flat_map(GpuEngines::engines)
            .any(CopyEngine::has_in_flight)
    }

    /// Executes whatever is left, waits for the device, and destroys every engine.
    ///
    /// Only the first call does anything.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.tick();
        let mut engines = self.engines.lock().unwrap();
        for (node, gpu) in engines.iter_mut().enumerate() {
            for engine in gpu.engines_mut() {
                if let Err(e) = engine.wait_idle() {
                    logwise::error_sync!(
                        "waiting for node {node} at shutdown: {error}",
                        node = node,
                        error = logwise::privacy::LogIt(&e)
                    );
                }
            }
        }
        self.publish_completed(&mut engines);
        for (node, gpu) in engines.iter_mut().enumerate() {
            for engine in gpu.engines_mut() {
                if let Err(e) = engine.destroy() {
                    logwise::error_sync!(
                        "destroying node {node}'s engines: {error}",
                        node = node,
                        error = logwise::privacy::LogIt(&e)
                    );
                }
            }
        }
        logwise::info_sync!(
            "streamer shut down at token {token}",
            token = self.tokens.completed()
        );
    }
}

/// Runs one handler and notes its token into `engine` if it recorded anything.
///
/// A handler that panics fails its own request; the streamer and the other requests carry on.
fn run(
    engine: &mut CopyEngine,
    token: SyncToken,
    handler: impl FnOnce(&mut CopyEngine) -> Result<(), crate::error::RequestError>,
) -> UpdateResult {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(&mut *engine)));
    if engine.is_recording() {
        engine.note_token(token);
    }
    match result {
        Ok(result) => result.into(),
        Err(payload) => UpdateResult::Panicked(panic_message(&*payload)),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic".to_owned()
    }
}

#[cfg(all(test, feature = "backend_software"))]
mod tests {
    use super::*;
    use crate::device::{BufferDesc, MemoryUsage, ResourceState};
    use crate::imp::software::{CompletionMode, SoftwareDevice};
    use crate::upload::buffer::{BufferLoad, BufferSource};

    fn core(mode: CompletionMode) -> (Arc<SoftwareDevice>, StreamerCore) {
        let device = Arc::new(SoftwareDevice::new(mode));
        let desc = ResourceLoaderDesc {
            buffer_size: 256,
            ..Default::default()
        };
        let core = StreamerCore::new(vec![device.clone() as Arc<dyn Device>], &desc).unwrap();
        (device, core)
    }

    fn load(device: &SoftwareDevice, byte: u8) -> RequestKind {
        let buffer = device
            .add_buffer(&BufferDesc::new(16, MemoryUsage::GpuOnly))
            .unwrap();
        RequestKind::LoadBuffer(BufferLoad {
            buffer,
            dst_offset: 0,
            source: BufferSource::Bytes(vec![byte; 16]),
            final_state: Some(ResourceState::VertexAndConstantBuffer),
        })
    }

    #[test]
    fn tick_submits_and_completes() {
        let (device, core) = core(CompletionMode::Immediate);
        let first = core.enqueue(0, load(&device, 1));
        let second = core.enqueue(0, load(&device, 2));
        assert_eq!((first, second), (1, 2));
        assert!(!core.tick());
        assert_eq!(core.tokens().submitted(), 2);
        assert_eq!(core.tokens().completed(), 2);
        assert_eq!(device.submission_count(), 1);
        assert!(core.last_submitted(0).is_some());
        core.shutdown();
    }

    #[test]
    fn panicking_handler_fails_only_its_request() {
        let (device, core) = core(CompletionMode::Immediate);
        {
            let mut engines = core.engines.lock().unwrap();
            let result = run(&mut engines[0].upload, 1, |_| panic!("corrupt header"));
            assert!(matches!(result, UpdateResult::Panicked(ref message) if message == "corrupt header"));
        }
        //the engines lock is not poisoned, so later requests still run
        let token = core.enqueue(0, load(&device, 4));
        assert!(!core.tick());
        assert_eq!(core.tokens().completed(), token);
        core.shutdown();
    }

    #[test]
    fn completion_waits_for_fences() {
        let (device, core) = core(CompletionMode::Manual);
        let token = core.enqueue(0, load(&device, 3));
        assert!(core.tick());
        assert_eq!(core.tokens().submitted(), token);
        assert_eq!(core.tokens().completed(), 0);
        device.complete_all();
        assert!(!core.poll());
        assert_eq!(core.tokens().completed(), token);
        core.shutdown();
    }

    #[test]
    fn invalid_request_still_completes() {
        let (device, core) = core(CompletionMode::Immediate);
        let buffer = device
            .add_buffer(&BufferDesc::new(4, MemoryUsage::GpuOnly))
            .unwrap();
        //copy past the end of the destination
        let token = core.enqueue(
            0,
            RequestKind::LoadBuffer(BufferLoad {
                buffer,
                dst_offset: 2,
                source: BufferSource::Bytes(vec![0; 8]),
                final_state: None,
            }),
        );
        core.tick();
        assert_eq!(core.tokens().completed(), token);
        core.shutdown();
    }
}
