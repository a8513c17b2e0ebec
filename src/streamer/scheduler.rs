// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Who runs the streamer tick.

use super::StreamerCore;
use crate::token::SyncToken;
use std::fmt::Debug;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub(crate) trait Scheduler: Send + Sync + Debug {
    /// Called after a request was queued.
    fn enqueued(&self);
    /// Returns once everything queued so far has been submitted.
    fn flush(&self);
    fn wait_for_token(&self, token: SyncToken);
    fn wait_for_token_submitted(&self, token: SyncToken);
    /// Gives the scheduler a chance to observe finished fences without blocking.
    fn poll(&self);
    /// Executes what is still queued and stops.  Idempotent.
    fn shutdown(&mut self);
}

/// Ticks on a dedicated background thread.
#[derive(Debug)]
pub(crate) struct ThreadedScheduler {
    core: Arc<StreamerCore>,
    thread: Option<JoinHandle<()>>,
}

impl ThreadedScheduler {
    pub fn new(core: Arc<StreamerCore>) -> std::io::Result<Self> {
        let move_core = core.clone();
        let thread = thread::Builder::new()
            .name("bytes_in_flight streamer".to_string())
            .spawn(move || streamer_thread(&move_core))?;
        Ok(ThreadedScheduler {
            core,
            thread: Some(thread),
        })
    }
}

fn streamer_thread(core: &StreamerCore) {
    logwise::info_sync!("streamer thread started");
    let mut in_flight = false;
    loop {
        //while fences are pending, wake up to poll them even without new work
        core.queue()
            .wait_for_work(in_flight.then_some(core.idle_poll_interval()));
        if core.queue().is_shutdown() {
            break;
        }
        in_flight = core.tick();
    }
    core.tick();
    logwise::info_sync!("streamer thread exiting");
}

impl Scheduler for ThreadedScheduler {
    fn enqueued(&self) {}

    fn flush(&self) {
        let target = self.core.tokens().counter();
        self.core.tokens().wait_submitted(target);
    }

    fn wait_for_token(&self, token: SyncToken) {
        self.core.tokens().wait_completed(token);
    }

    fn wait_for_token_submitted(&self, token: SyncToken) {
        self.core.tokens().wait_submitted(token);
    }

    fn poll(&self) {}

    fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.core.queue().request_shutdown();
        if thread.join().is_err() {
            logwise::error_sync!("streamer thread panicked");
        }
    }
}

impl Drop for ThreadedScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Ticks on whichever thread calls into the loader.
///
/// Enqueueing runs a tick, so a request is recorded and submitted before its `add_*` call returns.
/// Waiting blocks on fences directly.
#[derive(Debug)]
pub(crate) struct InlineScheduler {
    core: Arc<StreamerCore>,
}

impl InlineScheduler {
    pub fn new(core: Arc<StreamerCore>) -> Self {
        InlineScheduler { core }
    }
}

impl Scheduler for InlineScheduler {
    fn enqueued(&self) {
        self.core.tick();
    }

    fn flush(&self) {
        self.core.tick();
    }

    fn wait_for_token(&self, token: SyncToken) {
        self.core.tick();
        while self.core.tokens().completed() < token {
            //with nothing in flight, a tick publishes everything as complete
            if !self.core.wait_oldest() {
                self.core.tick();
            }
        }
    }

    fn wait_for_token_submitted(&self, token: SyncToken) {
        if self.core.tokens().submitted() < token {
            self.core.tick();
        }
    }

    fn poll(&self) {
        self.core.poll();
    }

    fn shutdown(&mut self) {}
}
