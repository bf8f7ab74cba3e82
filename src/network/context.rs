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

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::error;

use crate::message::MessageAllocator;
use crate::service::{EngineConfig, ShutdownSignal};
use crate::NetError;

use super::call::CallRegistry;
use super::connection::ConnectionShared;
use super::handle::{Handle, HandleTable, IdGenerator};
use super::listener::ListenerShared;
use super::stats::EngineCounters;

/// State shared by the engine facade, the manager and every io thread.
pub(crate) struct EngineContext {
    pub config: EngineConfig,
    pub allocator: Arc<dyn MessageAllocator>,
    pub connections: HandleTable<ConnectionShared>,
    pub listeners: HandleTable<ListenerShared>,
    pub calls: CallRegistry,
    pub counters: EngineCounters,
    /// set while started
    stop_signal: Mutex<Option<ShutdownSignal>>,
}

impl EngineContext {
    pub fn new(config: EngineConfig, allocator: Arc<dyn MessageAllocator>) -> Arc<EngineContext> {
        let ids = Arc::new(IdGenerator::new());
        Arc::new(EngineContext {
            config,
            allocator,
            connections: HandleTable::new("connection", ids.clone()),
            listeners: HandleTable::new("listener", ids),
            calls: CallRegistry::new(),
            counters: EngineCounters::default(),
            stop_signal: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.net_engine_name
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.config.call_timeout_ms as u64)
    }

    pub fn arm(&self, signal: ShutdownSignal) {
        *self.stop_signal.lock() = Some(signal);
    }

    pub fn disarm(&self) {
        self.stop_signal.lock().take();
    }

    /// Logs an internal inconsistency and stops every io thread. The engine stays
    /// started until its owner calls `stop`.
    pub fn raise_fatal(&self, err: &NetError) {
        error!(
            code = %err.code(),
            engine = self.name(),
            fatal = true,
            "engine state corrupted, shutting down io threads: {}",
            err
        );
        if let Some(signal) = self.stop_signal.lock().as_ref() {
            signal.trigger();
        }
    }

    /// Drops the table entry of a finished connection. Absent entries were destroyed
    /// through the engine already.
    pub fn forget_connection(&self, handle: &Handle) {
        match self.connections.remove(handle) {
            Ok(_) | Err(NetError::NotFound(_)) => {}
            Err(err) => self.raise_fatal(&err),
        }
    }
}
