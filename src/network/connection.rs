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
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use once_cell::sync::OnceCell;
use tokio::sync::mpsc;
use tracing::trace;

use crate::message::Message;
use crate::protocol::{peek_sequence, write_sequence};
use crate::service::SocketOptions;
use crate::{NetError, NetResult};

use super::context::EngineContext;
use super::handle::ConnectionHandle;
use super::stats::EngineCounters;
use super::{now_ms, worker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Connected = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> ConnectionState {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    /// Still accepts outbound data.
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

/// Bytes waiting in a connection's send queue.
pub(crate) enum OutboundJob {
    Message(Message),
    Raw(Bytes),
}

impl OutboundJob {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            OutboundJob::Message(message) => message.as_slice(),
            OutboundJob::Raw(bytes) => bytes,
        }
    }
}

/// Requests posted to the session that owns the socket.
pub(crate) enum SessionCommand {
    Send(OutboundJob),
    Ping,
    Expire,
    Close,
}

/// Everything known about a connection before its worker picks it up.
pub(crate) struct Registration {
    pub name: String,
    pub inbound: bool,
    pub options: SocketOptions,
    pub remote_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
    pub worker_load: Arc<AtomicUsize>,
}

pub(crate) struct ConnectionShared {
    handle: ConnectionHandle,
    name: String,
    inbound: bool,
    options: SocketOptions,
    state: AtomicU8,
    remote_addr: OnceCell<SocketAddr>,
    local_addr: OnceCell<SocketAddr>,
    last_activity_ms: AtomicU64,
    last_ping_ms: AtomicU64,
    next_sequence: AtomicU16,
    worker_load: Arc<AtomicUsize>,
    released: AtomicBool,
    commands: mpsc::UnboundedSender<SessionCommand>,
    context: Arc<EngineContext>,
}

/// A TCP connection as seen by callbacks and API threads.
///
/// Cheap to clone. The socket itself lives on the io thread that owns the connection;
/// everything done through this type is either an atomic read or a command posted to
/// that thread.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnectionShared>,
}

impl Connection {
    /// Adds a connection in `Connecting` state to the engine's table.
    pub(crate) fn register(
        context: &Arc<EngineContext>,
        registration: Registration,
    ) -> NetResult<(Connection, mpsc::UnboundedReceiver<SessionCommand>)> {
        let (commands, receiver) = mpsc::unbounded_channel();
        let now = now_ms();
        let (_, shared) = context.connections.insert_with(|handle| {
            let remote_addr = OnceCell::new();
            if let Some(addr) = registration.remote_addr {
                let _ = remote_addr.set(addr);
            }
            let local_addr = OnceCell::new();
            if let Some(addr) = registration.local_addr {
                let _ = local_addr.set(addr);
            }
            Ok(ConnectionShared {
                handle,
                name: registration.name,
                inbound: registration.inbound,
                options: registration.options,
                state: AtomicU8::new(ConnectionState::Connecting as u8),
                remote_addr,
                local_addr,
                last_activity_ms: AtomicU64::new(now),
                last_ping_ms: AtomicU64::new(now),
                next_sequence: AtomicU16::new(1),
                worker_load: registration.worker_load,
                released: AtomicBool::new(false),
                commands,
                context: context.clone(),
            })
        })?;
        shared.worker_load.fetch_add(1, Ordering::AcqRel);
        Ok((Connection { shared }, receiver))
    }

    pub(crate) fn from_shared(shared: Arc<ConnectionShared>) -> Connection {
        Connection { shared }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.shared.handle
    }

    pub fn id(&self) -> u64 {
        self.shared.handle.id()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Accepted by a listener rather than created through `create_connection`.
    pub fn is_inbound(&self) -> bool {
        self.shared.inbound
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.remote_addr.get().copied()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr.get().copied()
    }

    pub fn options(&self) -> SocketOptions {
        self.shared.options
    }

    /// Allocates a message from the engine's allocator.
    pub fn new_message(&self, length: u32) -> NetResult<Message> {
        Message::new(length, &self.shared.context.allocator)
    }

    /// Queues a whole frame. The engine releases the message once it is written or the
    /// connection closes.
    pub fn send_message(&self, message: Message) -> NetResult<()> {
        if !self.state().is_open() {
            return Err(NetError::ConnectionClosed(self.id()));
        }
        if self.post(SessionCommand::Send(OutboundJob::Message(message))) {
            Ok(())
        } else {
            Err(NetError::ConnectionClosed(self.id()))
        }
    }

    /// Copies `data` into a fresh message and queues it.
    pub fn send(&self, data: &[u8]) -> NetResult<()> {
        let message = Message::copy_from(data, &self.shared.context.allocator)?;
        self.send_message(message)
    }

    /// Sends a LIDR request and blocks until the frame carrying the same sequence comes
    /// back, the connection closes or `timeout` (engine default when `None`) expires.
    ///
    /// The sequence field of `request` is overwritten. Must not be used from an io
    /// thread, which would stop the very loop that delivers the response.
    pub fn call(&self, mut request: Message, timeout: Option<Duration>) -> NetResult<Message> {
        if worker::on_io_thread() {
            return Err(NetError::InvalidCall(
                "call from an io thread would block its event loop".to_string(),
            ));
        }
        if peek_sequence(&request).is_none() {
            return Err(NetError::InvalidParam(
                "call request must start with a LIDR header".to_string(),
            ));
        }
        let context = &self.shared.context;
        let timeout = timeout.unwrap_or_else(|| context.call_timeout());

        let pending = context
            .calls
            .register(self.id(), &self.shared.next_sequence)?;
        // registered before the state check, so a concurrent close either sees the
        // waiter or this call sees the close
        if !self.state().is_open() {
            return Err(NetError::ConnectionClosed(self.id()));
        }
        write_sequence(&mut request, pending.sequence())?;
        trace!(
            connection = %self.handle(),
            sequence = pending.sequence(),
            "call sent"
        );
        self.send_message(request)?;
        let response = pending.wait(timeout)?;
        EngineCounters::add(&context.counters.calls_completed, 1);
        Ok(response)
    }

    pub fn call_bytes(&self, request: &[u8], timeout: Option<Duration>) -> NetResult<Message> {
        let message = Message::copy_from(request, &self.shared.context.allocator)?;
        self.call(message, timeout)
    }

    /// Asks the owning io thread to flush what is queued and close. Safe from any
    /// thread, including inside callbacks.
    pub fn close(&self) {
        self.post(SessionCommand::Close);
    }

    pub(crate) fn post(&self, command: SessionCommand) -> bool {
        self.shared.commands.send(command).is_ok()
    }

    pub(crate) fn context(&self) -> &Arc<EngineContext> {
        &self.shared.context
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.shared.state.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn set_addresses(&self, remote: SocketAddr, local: SocketAddr) {
        let _ = self.shared.remote_addr.set(remote);
        let _ = self.shared.local_addr.set(local);
    }

    pub(crate) fn touch(&self, now: u64) {
        self.shared.last_activity_ms.store(now, Ordering::Release);
    }

    pub(crate) fn last_activity_ms(&self) -> u64 {
        self.shared.last_activity_ms.load(Ordering::Acquire)
    }

    pub(crate) fn last_ping_ms(&self) -> u64 {
        self.shared.last_ping_ms.load(Ordering::Acquire)
    }

    pub(crate) fn mark_ping(&self, now: u64) {
        self.shared.last_ping_ms.store(now, Ordering::Release);
    }

    /// Final bookkeeping once the socket is gone: waiters woken, worker load and table
    /// entry given back. Runs once however many paths reach it.
    pub(crate) fn release(&self) {
        if self.shared.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_state(ConnectionState::Closed);
        let context = &self.shared.context;
        context.calls.fail_connection(self.id());
        self.shared.worker_load.fetch_sub(1, Ordering::AcqRel);
        EngineCounters::add(&context.counters.connections_closed, 1);
        context.forget_connection(&self.shared.handle);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.shared.handle)
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .field("remote_addr", &self.remote_addr())
            .finish()
    }
}
