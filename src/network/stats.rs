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

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Running totals updated by the io threads.
#[derive(Debug, Default)]
pub(crate) struct EngineCounters {
    pub connections_accepted: AtomicU64,
    pub connections_closed: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub frames_received: AtomicU64,
    pub protocol_violations: AtomicU64,
    pub heartbeat_timeouts: AtomicU64,
    pub calls_completed: AtomicU64,
}

impl EngineCounters {
    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of an engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub name: String,
    pub engine_type: String,
    pub running: bool,
    /// RFC 3339 local time of the last start
    pub started_at: Option<String>,
    pub io_threads: usize,
    pub listeners: usize,
    pub connections: usize,
    /// connections per io thread, empty while stopped
    pub worker_loads: Vec<usize>,
    pub pending_calls: usize,
    pub memory_in_use: u64,
    pub connections_accepted: u64,
    pub connections_closed: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub frames_received: u64,
    pub protocol_violations: u64,
    pub heartbeat_timeouts: u64,
    pub calls_completed: u64,
}

impl EngineStats {
    pub(crate) fn fill_counters(&mut self, counters: &EngineCounters) {
        self.connections_accepted = EngineCounters::read(&counters.connections_accepted);
        self.connections_closed = EngineCounters::read(&counters.connections_closed);
        self.bytes_received = EngineCounters::read(&counters.bytes_received);
        self.bytes_sent = EngineCounters::read(&counters.bytes_sent);
        self.frames_received = EngineCounters::read(&counters.frames_received);
        self.protocol_violations = EngineCounters::read(&counters.protocol_violations);
        self.heartbeat_timeouts = EngineCounters::read(&counters.heartbeat_timeouts);
        self.calls_completed = EngineCounters::read(&counters.calls_completed);
    }
}

impl fmt::Display for EngineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "engine {} ({}, {}{}): {} io threads, {} listeners, {} connections {:?}, \
             in {}B / out {}B, {} frames, {} violations, {} heartbeat timeouts, \
             {} pending calls, {}B message memory",
            self.name,
            self.engine_type,
            if self.running { "running" } else { "stopped" },
            self.started_at
                .as_ref()
                .map(|at| format!(" since {}", at))
                .unwrap_or_default(),
            self.io_threads,
            self.listeners,
            self.connections,
            self.worker_loads,
            self.bytes_received,
            self.bytes_sent,
            self.frames_received,
            self.protocol_violations,
            self.heartbeat_timeouts,
            self.pending_calls,
            self.memory_in_use,
        )
    }
}
