// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Sync tokens.

Every queued request is tagged with a [SyncToken].  Three counters describe the loader's progress:

* `counter`: the last token handed out.
* `submitted`: every request with a token at or below this value has been handed to the device.
* `completed`: every request with a token at or below this value has finished on the device.

At all times `completed <= submitted <= counter`.  Both published counters only move forward.

Tokens start at 1, so token 0 is always complete.  APIs that did not need to queue any work return
0.
*/

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

/// Identifies a point in the submission order.
pub type SyncToken = u64;

/// A token that is complete before any work is queued.
pub const COMPLETED_TOKEN: SyncToken = 0;

#[derive(Debug)]
pub(crate) struct TokenState {
    counter: AtomicU64,
    submitted: AtomicU64,
    completed: AtomicU64,
    //guards nothing; pairs with `changed` so waiters can't miss a publication
    lock: Mutex<()>,
    changed: Condvar,
    wake_list: wasm_safe_mutex::Mutex<Vec<r#continue::Sender<()>>>,
}

impl TokenState {
    pub fn new() -> Self {
        TokenState {
            counter: AtomicU64::new(0),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            lock: Mutex::new(()),
            changed: Condvar::new(),
            wake_list: wasm_safe_mutex::Mutex::new(Vec::new()),
        }
    }

    /// Hands out the next token.
    ///
    /// Callers hold the request queue lock, so token order matches queue order.
    pub fn next(&self) -> SyncToken {
        self.counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn counter(&self) -> SyncToken {
        self.counter.load(Ordering::Acquire)
    }

    pub fn submitted(&self) -> SyncToken {
        self.submitted.load(Ordering::Acquire)
    }

    pub fn completed(&self) -> SyncToken {
        self.completed.load(Ordering::Acquire)
    }

    pub fn publish_submitted(&self, token: SyncToken) {
        debug_assert!(token <= self.counter());
        let prior = self.submitted.fetch_max(token, Ordering::AcqRel);
        if token > prior {
            self.notify();
        }
    }

    pub fn publish_completed(&self, token: SyncToken) {
        debug_assert!(token <= self.submitted());
        let prior = self.completed.fetch_max(token, Ordering::AcqRel);
        if token > prior {
            logwise::trace_sync!("token completed {token}", token = token);
            self.notify();
        }
    }

    fn notify(&self) {
        drop(self.lock.lock().unwrap());
        self.changed.notify_all();
        let senders = std::mem::take(&mut *self.wake_list.lock_sync());
        for sender in senders {
            sender.send(());
        }
    }

    pub fn wait_completed(&self, token: SyncToken) {
        self.wait_until(|| self.completed() >= token);
    }

    pub fn wait_submitted(&self, token: SyncToken) {
        self.wait_until(|| self.submitted() >= token);
    }

    fn wait_until(&self, ready: impl Fn() -> bool) {
        if ready() {
            return;
        }
        let interval = logwise::perfwarn_begin!("bytes_in_flight::token wait");
        let mut guard = self.lock.lock().unwrap();
        while !ready() {
            guard = self.changed.wait(guard).unwrap();
        }
        drop(guard);
        drop(interval);
    }

    pub async fn completed_async(&self, token: SyncToken) {
        loop {
            //insert first
            let (s, f) = r#continue::continuation();
            self.wake_list.lock_sync().push(s);
            //then check
            if self.completed() >= token {
                return;
            }
            f.await;
        }
    }
}

impl Drop for TokenState {
    fn drop(&mut self) {
        //senders left over from waits that returned early
        for sender in std::mem::take(&mut *self.wake_list.lock_sync()) {
            sender.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn tokens_start_after_zero() {
        let tokens = TokenState::new();
        assert_eq!(tokens.next(), 1);
        assert_eq!(tokens.next(), 2);
        assert_eq!(tokens.counter(), 2);
        assert!(tokens.completed() >= COMPLETED_TOKEN);
    }

    #[test]
    fn publication_never_regresses() {
        let tokens = TokenState::new();
        for _ in 0..5 {
            tokens.next();
        }
        tokens.publish_submitted(4);
        tokens.publish_submitted(2);
        assert_eq!(tokens.submitted(), 4);
        tokens.publish_completed(3);
        tokens.publish_completed(1);
        assert_eq!(tokens.completed(), 3);
    }

    #[test]
    fn blocking_wait_wakes_on_publish() {
        let tokens = Arc::new(TokenState::new());
        tokens.next();
        let publisher = tokens.clone();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            publisher.publish_submitted(1);
            publisher.publish_completed(1);
        });
        tokens.wait_completed(1);
        assert_eq!(tokens.completed(), 1);
        thread.join().unwrap();
    }

    #[test]
    fn async_wait_wakes_on_publish() {
        let tokens = Arc::new(TokenState::new());
        tokens.next();
        let publisher = tokens.clone();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            publisher.publish_submitted(1);
            publisher.publish_completed(1);
        });
        test_executors::sleep_on(tokens.completed_async(1));
        assert_eq!(tokens.completed(), 1);
        thread.join().unwrap();
    }
}
