// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Blocking request/response bridge.
//!
//! A caller registers a waiter under `(connection id, sequence)`, stamps the sequence
//! into its request and sleeps on a condition variable. The io thread that reads a frame
//! carrying an outstanding sequence hands it to the waiter instead of `on_message`.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use crate::message::Message;
use crate::{NetError, NetResult};

type CallKey = (u64, u16);

#[derive(Debug, Default)]
pub(crate) struct CallWaiter {
    outcome: Mutex<Option<NetResult<Message>>>,
    ready: Condvar,
}

impl CallWaiter {
    /// First outcome wins; later ones are dropped.
    pub fn wake(&self, result: NetResult<Message>) {
        let mut outcome = self.outcome.lock();
        if outcome.is_none() {
            *outcome = Some(result);
            self.ready.notify_one();
        }
    }

    fn wait(&self, timeout: Duration) -> NetResult<Message> {
        let deadline = Instant::now() + timeout;
        let mut outcome = self.outcome.lock();
        while outcome.is_none() {
            if self.ready.wait_until(&mut outcome, deadline).timed_out() {
                break;
            }
        }
        outcome.take().unwrap_or(Err(NetError::Timeout(timeout)))
    }
}

#[derive(Debug, Default)]
pub(crate) struct CallRegistry {
    waiters: DashMap<CallKey, Arc<CallWaiter>>,
}

impl CallRegistry {
    pub fn new() -> CallRegistry {
        CallRegistry::default()
    }

    /// Picks the next free non-zero sequence of the connection.
    pub fn register(&self, conn_id: u64, next_sequence: &AtomicU16) -> NetResult<PendingCall<'_>> {
        let waiter = Arc::new(CallWaiter::default());
        for _ in 0..=u16::MAX as u32 {
            let sequence = next_sequence.fetch_add(1, Ordering::Relaxed);
            if sequence == 0 {
                continue;
            }
            if let Entry::Vacant(vacant) = self.waiters.entry((conn_id, sequence)) {
                vacant.insert(waiter.clone());
                return Ok(PendingCall {
                    registry: self,
                    key: (conn_id, sequence),
                    waiter,
                });
            }
        }
        Err(NetError::NoMemory(format!(
            "every call sequence of connection {} is in flight",
            conn_id
        )))
    }

    /// Detaches the waiter expecting `sequence`, if any.
    pub fn take(&self, conn_id: u64, sequence: u16) -> Option<Arc<CallWaiter>> {
        if sequence == 0 {
            return None;
        }
        self.waiters
            .remove(&(conn_id, sequence))
            .map(|(_, waiter)| waiter)
    }

    /// Wakes every caller still waiting on the connection.
    pub fn fail_connection(&self, conn_id: u64) -> usize {
        let mut failed = 0;
        self.waiters.retain(|(id, _), waiter| {
            if *id != conn_id {
                return true;
            }
            waiter.wake(Err(NetError::ConnectionClosed(conn_id)));
            failed += 1;
            false
        });
        failed
    }

    pub fn outstanding(&self) -> usize {
        self.waiters.len()
    }
}

/// Registration of one in-flight call; dropping it unregisters the waiter.
#[derive(Debug)]
pub(crate) struct PendingCall<'a> {
    registry: &'a CallRegistry,
    key: CallKey,
    waiter: Arc<CallWaiter>,
}

impl PendingCall<'_> {
    pub fn sequence(&self) -> u16 {
        self.key.1
    }

    pub fn wait(&self, timeout: Duration) -> NetResult<Message> {
        self.waiter.wait(timeout)
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        // the sequence may already serve a newer call
        self.registry
            .waiters
            .remove_if(&self.key, |_, waiter| Arc::ptr_eq(waiter, &self.waiter));
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::message::{HeapAllocator, MessageAllocator};
    use crate::ErrorCode;

    fn allocator() -> Arc<dyn MessageAllocator> {
        Arc::new(HeapAllocator::new(0))
    }

    #[test]
    fn test_sequence_skips_zero_and_in_flight() {
        let registry = CallRegistry::new();
        let next = AtomicU16::new(u16::MAX);
        let first = registry.register(1, &next).unwrap();
        assert_eq!(first.sequence(), u16::MAX);
        // wraps past 0
        let second = registry.register(1, &next).unwrap();
        assert_eq!(second.sequence(), 1);

        next.store(u16::MAX, Ordering::Relaxed);
        let third = registry.register(1, &next).unwrap();
        assert_eq!(third.sequence(), 2);
        assert_eq!(registry.outstanding(), 3);

        // same sequence on another connection is fine
        next.store(1, Ordering::Relaxed);
        let other = registry.register(2, &next).unwrap();
        assert_eq!(other.sequence(), 1);
    }

    #[test]
    fn test_timeout_unregisters() {
        let registry = CallRegistry::new();
        let next = AtomicU16::new(1);
        let pending = registry.register(7, &next).unwrap();
        let err = pending.wait(Duration::from_millis(20)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Timeout);
        drop(pending);
        assert_eq!(registry.outstanding(), 0);
        assert!(registry.take(7, 1).is_none());
    }

    #[test]
    fn test_response_wakes_waiter() {
        let registry = Arc::new(CallRegistry::new());
        let next = AtomicU16::new(1);
        let alloc = allocator();

        let responder = {
            let registry = registry.clone();
            let alloc = alloc.clone();
            thread::spawn(move || {
                let waiter = loop {
                    if let Some(waiter) = registry.take(3, 1) {
                        break waiter;
                    }
                    thread::sleep(Duration::from_millis(1));
                };
                waiter.wake(Message::copy_from(b"pong", &alloc));
            })
        };

        let pending = registry.register(3, &next).unwrap();
        let response = pending.wait(Duration::from_secs(5)).unwrap();
        assert_eq!(response.as_slice(), b"pong");
        responder.join().unwrap();
    }

    #[test]
    fn test_fail_connection_wakes_only_its_callers() {
        let registry = CallRegistry::new();
        let next = AtomicU16::new(1);
        let doomed = registry.register(5, &next).unwrap();
        let survivor = registry.register(6, &next).unwrap();

        assert_eq!(registry.fail_connection(5), 1);
        let err = doomed.wait(Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, NetError::ConnectionClosed(5)));
        assert_eq!(registry.outstanding(), 1);
        drop(survivor);
        assert_eq!(registry.outstanding(), 0);
    }

    #[test]
    fn test_stale_guard_keeps_newer_registration() {
        let registry = CallRegistry::new();
        let next = AtomicU16::new(9);
        let old = registry.register(1, &next).unwrap();
        // response arrives and frees the sequence
        let waiter = registry.take(1, 9).unwrap();
        waiter.wake(Err(NetError::ConnectionClosed(1)));

        next.store(9, Ordering::Relaxed);
        let newer = registry.register(1, &next).unwrap();
        assert_eq!(newer.sequence(), 9);
        drop(old);
        assert!(registry.take(1, 9).is_some());
        drop(newer);
    }
}
