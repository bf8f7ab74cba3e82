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
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Local};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::message::{HeapAllocator, Message, MessageAllocator};
use crate::service::{
    ConnectionConfig, EngineConfig, ListenerConfig, NetEngineType, ShutdownSignal, SocketOptions,
};
use crate::{NetError, NetResult};

use super::callback::NetCallback;
use super::connection::{Connection, Registration};
use super::context::EngineContext;
use super::handle::{ConnectionHandle, ListenerHandle};
use super::listener::{self, AcceptLoop, ListenerShared};
use super::manager::Manager;
use super::stats::EngineStats;
use super::worker::{on_io_thread, IoWorker, WorkerCommand, WorkerSet};

/// Threads of a started engine.
struct EngineRuntime {
    started_at: DateTime<Local>,
    signal: ShutdownSignal,
    manager: Manager,
    workers: Vec<IoWorker>,
    worker_set: Arc<WorkerSet>,
}

/// TCP transport engine.
///
/// `start` brings up `io_thread_count` io threads plus one manager thread; listeners and
/// connections can be created once it runs. Every method may be called from any thread,
/// callbacks included, except `stop` which must not run on an engine thread.
///
/// ```no_run
/// use std::sync::Arc;
/// use lidr_net::{Connection, EngineConfig, ListenerConfig, NetCallback, NetEngine, NetResult};
///
/// struct Echo;
///
/// impl NetCallback for Echo {
///     fn on_message(&self, conn: &Connection, frame: &[u8]) -> NetResult<()> {
///         conn.send(frame)
///     }
/// }
///
/// let engine = NetEngine::new(EngineConfig::default(), Arc::new(Echo)).unwrap();
/// engine.start().unwrap();
/// let listener = engine.create_listener(&ListenerConfig::default(), None).unwrap();
/// // ...
/// engine.destroy_listener(listener).unwrap();
/// engine.stop().unwrap();
/// ```
pub struct NetEngine {
    context: Arc<EngineContext>,
    callback: Arc<dyn NetCallback>,
    runtime: RwLock<Option<EngineRuntime>>,
}

impl NetEngine {
    /// Engine with the default heap allocator bounded by `max_memory_mb`.
    pub fn new(config: EngineConfig, callback: Arc<dyn NetCallback>) -> NetResult<NetEngine> {
        let allocator = Arc::new(HeapAllocator::new(config.max_memory_mb));
        Self::with_allocator(config, callback, allocator)
    }

    pub fn with_allocator(
        config: EngineConfig,
        callback: Arc<dyn NetCallback>,
        allocator: Arc<dyn MessageAllocator>,
    ) -> NetResult<NetEngine> {
        config
            .validate()
            .inspect_err(|err| log_failure(&config.net_engine_name, "create_engine", err))?;
        if config.net_engine_type != NetEngineType::Tcp {
            let err = NetError::InvalidParam(format!(
                "{} engines are not supported",
                config.net_engine_type
            ));
            log_failure(&config.net_engine_name, "create_engine", &err);
            return Err(err);
        }
        info!(
            engine = %config.net_engine_name,
            io_threads = config.io_thread_count,
            heartbeat_interval_ms = config.heartbeat_interval_ms,
            heartbeat_timeout_ms = config.heartbeat_timeout_ms,
            "engine created"
        );
        Ok(NetEngine {
            context: EngineContext::new(config, allocator),
            callback,
            runtime: RwLock::new(None),
        })
    }

    pub fn name(&self) -> &str {
        self.context.name()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.context.config
    }

    pub fn allocator(&self) -> &Arc<dyn MessageAllocator> {
        &self.context.allocator
    }

    pub fn is_running(&self) -> bool {
        self.runtime.read().is_some()
    }

    pub fn start(&self) -> NetResult<()> {
        self.try_start()
            .inspect_err(|err| log_failure(self.name(), "start", err))
    }

    fn try_start(&self) -> NetResult<()> {
        let mut runtime = self.runtime.write();
        if runtime.is_some() {
            return Err(NetError::InvalidCall(format!(
                "engine {} already started",
                self.name()
            )));
        }
        let signal = ShutdownSignal::new();
        let (mut workers, worker_set) = IoWorker::spawn_all(
            self.name(),
            self.context.config.io_thread_count as usize,
            &signal,
        )?;
        let manager = match Manager::spawn(self.context.clone(), &signal) {
            Ok(manager) => manager,
            Err(err) => {
                signal.trigger();
                workers.iter_mut().for_each(IoWorker::join);
                return Err(err);
            }
        };
        self.context.arm(signal.clone());
        *runtime = Some(EngineRuntime {
            started_at: Local::now(),
            signal,
            manager,
            workers,
            worker_set: Arc::new(worker_set),
        });
        info!(
            engine = self.name(),
            io_threads = self.context.config.io_thread_count,
            "engine started"
        );
        Ok(())
    }

    /// Closes every listener and connection and joins the engine threads.
    pub fn stop(&self) -> NetResult<()> {
        self.try_stop()
            .inspect_err(|err| log_failure(self.name(), "stop", err))
    }

    fn try_stop(&self) -> NetResult<()> {
        if on_io_thread() {
            return Err(NetError::InvalidCall(
                "stop from an engine thread would join itself".to_string(),
            ));
        }
        let taken = self.runtime.write().take();
        let Some(mut runtime) = taken else {
            return Err(NetError::InvalidCall(format!(
                "engine {} is not started",
                self.name()
            )));
        };
        runtime.signal.trigger();
        self.context.disarm();
        runtime.manager.join();
        runtime.workers.iter_mut().for_each(IoWorker::join);

        for listener in self.context.listeners.drain() {
            listener.close();
        }
        for shared in self.context.connections.drain() {
            Connection::from_shared(shared).release();
        }
        info!(engine = self.name(), "engine stopped");
        Ok(())
    }

    /// Binds a listener. Accepted connections use `callback`, or the engine's when `None`.
    pub fn create_listener(
        &self,
        config: &ListenerConfig,
        callback: Option<Arc<dyn NetCallback>>,
    ) -> NetResult<ListenerHandle> {
        self.try_create_listener(config, callback)
            .inspect_err(|err| log_failure(self.name(), "create_listener", err))
    }

    fn try_create_listener(
        &self,
        config: &ListenerConfig,
        callback: Option<Arc<dyn NetCallback>>,
    ) -> NetResult<ListenerHandle> {
        let runtime = self.runtime.read();
        let runtime = runtime.as_ref().ok_or_else(|| self.not_started())?;
        let options = SocketOptions::resolve(
            &self.context.config,
            config.socket_buffer_bytes,
            config.heartbeat_interval_ms,
            config.heartbeat_timeout_ms,
        )?;
        let socket = listener::bind(config, options, runtime.manager.reactor())?;
        let local_addr = socket.local_addr()?;
        let callback = callback.unwrap_or_else(|| self.callback.clone());
        let (handle, shared) = self.context.listeners.insert_with(|handle| {
            Ok(ListenerShared::new(
                handle,
                config.listener_name.clone(),
                local_addr,
                options,
                callback,
            ))
        })?;

        let context = self.context.clone();
        let workers = runtime.worker_set.clone();
        if let Err(err) = runtime.manager.spawn_listener(move |shutdown| {
            AcceptLoop::new(socket, shared, context, workers, shutdown)
        }) {
            let _ = self.context.listeners.remove(&handle);
            return Err(err);
        }
        Ok(handle)
    }

    /// Stops accepting; already accepted connections are not affected.
    pub fn destroy_listener(&self, handle: ListenerHandle) -> NetResult<()> {
        let listener = self
            .context
            .listeners
            .remove(&handle)
            .inspect_err(|err| log_failure(self.name(), "destroy_listener", err))?;
        listener.close();
        info!(engine = self.name(), listener = %listener.handle(), "listener destroyed");
        Ok(())
    }

    /// Bound address, useful with port 0.
    pub fn listener_addr(&self, handle: ListenerHandle) -> NetResult<SocketAddr> {
        Ok(self.context.listeners.get(&handle)?.local_addr())
    }

    /// Starts connecting in the background and returns immediately. The outcome is
    /// reported through `on_connected`, or `on_event` plus `on_disconnected`.
    pub fn create_connection(
        &self,
        config: &ConnectionConfig,
        callback: Option<Arc<dyn NetCallback>>,
    ) -> NetResult<ConnectionHandle> {
        self.try_create_connection(config, callback)
            .inspect_err(|err| log_failure(self.name(), "create_connection", err))
    }

    fn try_create_connection(
        &self,
        config: &ConnectionConfig,
        callback: Option<Arc<dyn NetCallback>>,
    ) -> NetResult<ConnectionHandle> {
        let runtime = self.runtime.read();
        let runtime = runtime.as_ref().ok_or_else(|| self.not_started())?;
        if config.connection_remote_ip.is_empty() || config.connection_remote_port == 0 {
            return Err(NetError::InvalidParam(format!(
                "connection {} has no remote address",
                config.connection_name
            )));
        }
        let options = SocketOptions::resolve(
            &self.context.config,
            config.socket_buffer_bytes,
            config.heartbeat_interval_ms,
            config.heartbeat_timeout_ms,
        )?;
        let worker = runtime.worker_set.pick()?;
        let (conn, commands) = Connection::register(
            &self.context,
            Registration {
                name: config.connection_name.clone(),
                inbound: false,
                options,
                remote_addr: None,
                local_addr: None,
                worker_load: worker.load_counter(),
            },
        )?;
        let handle = conn.handle();
        info!(
            engine = self.name(),
            connection = %handle,
            remote = %config.remote_address(),
            worker = worker.index(),
            "connecting"
        );
        worker.dispatch(WorkerCommand::Connect {
            conn,
            remote: config.remote_address(),
            callback: callback.unwrap_or_else(|| self.callback.clone()),
            commands,
        })?;
        Ok(handle)
    }

    /// Unlinks the connection and asks its io thread to flush and close it;
    /// `on_disconnected` follows from that thread.
    pub fn destroy_connection(&self, handle: ConnectionHandle) -> NetResult<()> {
        let shared = self
            .context
            .connections
            .remove(&handle)
            .inspect_err(|err| log_failure(self.name(), "destroy_connection", err))?;
        Connection::from_shared(shared).close();
        Ok(())
    }

    pub fn connection(&self, handle: ConnectionHandle) -> NetResult<Connection> {
        let shared = self.context.connections.get(&handle)?;
        Ok(Connection::from_shared(shared))
    }

    pub fn new_message(&self, length: u32) -> NetResult<Message> {
        Message::new(length, &self.context.allocator)
    }

    pub fn stats(&self) -> EngineStats {
        let runtime = self.runtime.read();
        let mut stats = EngineStats {
            name: self.name().to_string(),
            engine_type: self.context.config.net_engine_type.to_string(),
            running: runtime.is_some(),
            started_at: runtime
                .as_ref()
                .map(|runtime| runtime.started_at.to_rfc3339()),
            io_threads: runtime
                .as_ref()
                .map(|runtime| runtime.worker_set.len())
                .unwrap_or_default(),
            listeners: self.context.listeners.len(),
            connections: self.context.connections.len(),
            worker_loads: runtime
                .as_ref()
                .map(|runtime| runtime.worker_set.loads())
                .unwrap_or_default(),
            pending_calls: self.context.calls.outstanding(),
            memory_in_use: self.context.allocator.in_use(),
            ..Default::default()
        };
        stats.fill_counters(&self.context.counters);
        stats
    }

    fn not_started(&self) -> NetError {
        NetError::InvalidCall(format!("engine {} is not started", self.name()))
    }
}

fn log_failure(engine: &str, operation: &'static str, err: &NetError) {
    warn!(code = %err.code(), engine, operation, "{}", err);
}

impl fmt::Debug for NetEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetEngine")
            .field("name", &self.name())
            .field("running", &self.is_running())
            .field("listeners", &self.context.listeners.len())
            .field("connections", &self.context.connections.len())
            .finish()
    }
}

impl Drop for NetEngine {
    fn drop(&mut self) {
        if !self.is_running() {
            return;
        }
        if on_io_thread() {
            // cannot join from here; threads wind down on their own
            if let Some(runtime) = self.runtime.write().take() {
                runtime.signal.trigger();
            }
            self.context.listeners.drain();
            self.context.connections.drain();
            return;
        }
        let _ = self.stop();
    }
}
