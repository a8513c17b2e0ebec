// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The request queue.

Callers on any thread push requests; the streamer drains them.  There is one FIFO list per device
node.  Tokens are assigned under the queue lock, so within a node the list order is the token
order, and a drain takes every request with a token at or below the counter it observed.
*/

use crate::device::NodeIndex;
use crate::token::{SyncToken, TokenState};
use crate::upload::buffer::BufferLoad;
use crate::upload::geometry::GeometryLoad;
use crate::upload::texture::{TextureBarrierRequest, TextureCopyDesc, TextureLoad};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

#[derive(Debug)]
pub(crate) enum RequestKind {
    LoadBuffer(BufferLoad),
    LoadTexture(TextureLoad),
    LoadGeometry(GeometryLoad),
    TextureBarrier(TextureBarrierRequest),
    CopyTexture(TextureCopyDesc),
}

impl RequestKind {
    pub fn name(&self) -> &'static str {
        match self {
            RequestKind::LoadBuffer(_) => "buffer load",
            RequestKind::LoadTexture(_) => "texture load",
            RequestKind::LoadGeometry(_) => "geometry load",
            RequestKind::TextureBarrier(_) => "texture barrier",
            RequestKind::CopyTexture(_) => "texture copy",
        }
    }
}

#[derive(Debug)]
pub(crate) struct UpdateRequest {
    /// The request's token.  It completes once this request's work is done on the device.
    pub wait_index: SyncToken,
    pub kind: RequestKind,
}

#[derive(Debug)]
struct QueueState {
    lists: Vec<Vec<UpdateRequest>>,
    shutdown: bool,
}

/// Everything taken by one drain.
#[derive(Debug)]
pub(crate) struct Drained {
    /// Requests per node, FIFO.
    pub batches: Vec<Vec<UpdateRequest>>,
    /// The token counter when the queue was drained.  Every token at or below it was taken now
    /// or by an earlier drain.
    pub last_token: SyncToken,
}

impl Drained {
    pub fn is_empty(&self) -> bool {
        self.batches.iter().all(Vec::is_empty)
    }
}

#[derive(Debug)]
pub(crate) struct RequestQueue {
    state: Mutex<QueueState>,
    work: Condvar,
}

impl RequestQueue {
    pub fn new(node_count: usize) -> Self {
        RequestQueue {
            state: Mutex::new(QueueState {
                lists: (0..node_count).map(|_| Vec::new()).collect(),
                shutdown: false,
            }),
            work: Condvar::new(),
        }
    }

    /// Appends a request to `node`'s list and returns its token.
    ///
    /// `node` must be in range; the loader validates it.
    pub fn push(&self, node: NodeIndex, kind: RequestKind, tokens: &TokenState) -> SyncToken {
        let mut state = self.state.lock().unwrap();
        let wait_index = tokens.next();
        logwise::trace_sync!(
            "queued {kind} as token {token} on node {node}",
            kind = kind.name().to_owned(),
            token = wait_index,
            node = node
        );
        state.lists[node as usize].push(UpdateRequest { wait_index, kind });
        drop(state);
        self.work.notify_all();
        wait_index
    }

    /// Takes every queued request.
    pub fn drain(&self, tokens: &TokenState) -> Drained {
        let mut state = self.state.lock().unwrap();
        let batches = state.lists.iter_mut().map(std::mem::take).collect();
        //read under the lock, so no token above it was taken and none below it was missed
        let last_token = tokens.counter();
        Drained {
            batches,
            last_token,
        }
    }

    pub fn has_work(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.lists.iter().any(|list| !list.is_empty())
    }

    /// Blocks until there is work or shutdown was requested.  With a `timeout`, returns early
    /// when it elapses.
    pub fn wait_for_work(&self, timeout: Option<Duration>) {
        let ready = |state: &QueueState| state.shutdown || state.lists.iter().any(|l| !l.is_empty());
        let mut state = self.state.lock().unwrap();
        match timeout {
            None => {
                while !ready(&state) {
                    state = self.work.wait(state).unwrap();
                }
            }
            Some(timeout) => {
                if !ready(&state) {
                    let (_state, _) = self
                        .work
                        .wait_timeout_while(state, timeout, |state| !ready(state))
                        .unwrap();
                }
            }
        }
    }

    pub fn request_shutdown(&self) {
        self.state.lock().unwrap().shutdown = true;
        self.work.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().unwrap().shutdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ResourceState, Texture, TextureDesc};
    use crate::pixel_formats::ImageFormat;
    use std::sync::Arc;
    use std::time::Instant;

    fn barrier() -> RequestKind {
        RequestKind::TextureBarrier(TextureBarrierRequest {
            texture: Texture::from_raw(1, TextureDesc::new_2d(1, 1, ImageFormat::R8Unorm)),
            from: ResourceState::Undefined,
            to: ResourceState::ShaderResource,
        })
    }

    #[test]
    fn drain_is_fifo_per_node() {
        let queue = RequestQueue::new(2);
        let tokens = TokenState::new();
        assert_eq!(queue.push(0, barrier(), &tokens), 1);
        assert_eq!(queue.push(1, barrier(), &tokens), 2);
        assert_eq!(queue.push(0, barrier(), &tokens), 3);
        assert!(queue.has_work());
        let drained = queue.drain(&tokens);
        assert_eq!(drained.last_token, 3);
        let node0: Vec<_> = drained.batches[0].iter().map(|r| r.wait_index).collect();
        let node1: Vec<_> = drained.batches[1].iter().map(|r| r.wait_index).collect();
        assert_eq!(node0, vec![1, 3]);
        assert_eq!(node1, vec![2]);
        assert!(!queue.has_work());
        assert!(queue.drain(&tokens).is_empty());
    }

    #[test]
    fn waiter_wakes_on_push_and_shutdown() {
        let queue = Arc::new(RequestQueue::new(1));
        let tokens = Arc::new(TokenState::new());
        let pusher = {
            let (queue, tokens) = (queue.clone(), tokens.clone());
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                queue.push(0, barrier(), &tokens);
            })
        };
        queue.wait_for_work(None);
        assert!(queue.has_work());
        pusher.join().unwrap();

        let queue = RequestQueue::new(1);
        queue.request_shutdown();
        queue.wait_for_work(None);
        assert!(queue.is_shutdown());
    }

    #[test]
    fn timed_wait_returns_without_work() {
        let queue = RequestQueue::new(1);
        let start = Instant::now();
        queue.wait_for_work(Some(Duration::from_millis(5)));
        assert!(start.elapsed() >= Duration::from_millis(5));
        assert!(!queue.has_work());
    }
}
