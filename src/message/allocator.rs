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

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;

use crate::{NetError, NetResult};

/// Source of every message buffer handed out by the engine.
///
/// A buffer obtained from `allocate` is always returned through `release` of the same
/// allocator, exactly once, when the owning [`Message`](super::Message) is dropped.
pub trait MessageAllocator: Send + Sync + Debug {
    /// Returns a zeroed buffer of exactly `len` bytes.
    fn allocate(&self, len: usize) -> NetResult<BytesMut>;

    fn release(&self, buf: BytesMut);

    /// Bytes currently handed out.
    fn in_use(&self) -> u64 {
        0
    }
}

/// Plain heap allocator with an optional budget.
#[derive(Debug, Default)]
pub struct HeapAllocator {
    /// 0 means unlimited
    limit_bytes: u64,
    in_use: AtomicU64,
    allocations: AtomicU64,
}

impl HeapAllocator {
    pub fn new(max_memory_mb: u64) -> HeapAllocator {
        HeapAllocator {
            limit_bytes: max_memory_mb.saturating_mul(1024 * 1024),
            in_use: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
        }
    }

    pub fn with_limit_bytes(limit_bytes: u64) -> HeapAllocator {
        HeapAllocator {
            limit_bytes,
            ..Default::default()
        }
    }

    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }
}

impl MessageAllocator for HeapAllocator {
    fn allocate(&self, len: usize) -> NetResult<BytesMut> {
        let size = len as u64;
        let limit = self.limit_bytes;
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                let next = used.checked_add(size)?;
                if limit != 0 && next > limit {
                    None
                } else {
                    Some(next)
                }
            })
            .map_err(|used| {
                NetError::NoMemory(format!(
                    "allocating {} bytes exceeds budget ({} of {} bytes in use)",
                    len, used, limit
                ))
            })?;
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(BytesMut::zeroed(len))
    }

    fn release(&self, buf: BytesMut) {
        self.in_use.fetch_sub(buf.len() as u64, Ordering::AcqRel);
    }

    fn in_use(&self) -> u64 {
        self.in_use.load(Ordering::Acquire)
    }
}
