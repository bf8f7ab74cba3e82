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

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, ErrorKind};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncWriteExt, Interest};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};

use crate::message::Message;
use crate::protocol::{heartbeat_frame, heartbeat_kind, peek_sequence, FrameLength, Heartbeat};
use crate::service::{Shutdown, SocketOptions};
use crate::NetError;

use super::callback::{guarded, NetCallback, NetEvent};
use super::connection::{Connection, ConnectionState, OutboundJob, SessionCommand};
use super::stats::EngineCounters;
use super::{apply_socket_buffers, now_ms};

const READ_CHUNK: usize = 16 * 1024;
/// reads per readiness wake-up before other connections get a turn
const MAX_READS_PER_WAKE: usize = 16;
/// most a declared but unreceived frame may pre-allocate
const MAX_FRAME_RESERVE: usize = 1024 * 1024;
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Room to reserve for the rest of a frame of `declared` bytes when `buffered` are in.
///
/// The declared length comes from the peer, so the buffer only grows ahead of the data by
/// a bounded step; reads extend it as bytes actually arrive.
fn receive_reserve(buffered: usize, declared: usize) -> usize {
    declared.saturating_sub(buffered).min(MAX_FRAME_RESERVE)
}

/// Why a session stopped serving its socket.
#[derive(Debug)]
pub(crate) enum CloseReason {
    /// `close` or `destroy_connection`
    Local,
    EngineStopped,
    PeerClosed,
    HeartbeatTimeout,
    ProtocolViolation,
    Handler(NetError),
    Io(io::Error),
}

impl CloseReason {
    fn event(&self) -> Option<NetEvent> {
        match self {
            CloseReason::Local | CloseReason::EngineStopped | CloseReason::PeerClosed => None,
            CloseReason::HeartbeatTimeout => Some(NetEvent::HeartbeatTimeout),
            CloseReason::ProtocolViolation => Some(NetEvent::ProtocolViolation),
            CloseReason::Handler(err) => Some(NetEvent::HandlerFailed(err.to_string())),
            CloseReason::Io(err) => Some(NetEvent::Io(err.to_string())),
        }
    }

    /// Queued data is still worth delivering.
    fn flushes(&self) -> bool {
        matches!(self, CloseReason::Local | CloseReason::EngineStopped)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Local => f.write_str("closed locally"),
            CloseReason::EngineStopped => f.write_str("engine stopped"),
            CloseReason::PeerClosed => f.write_str("closed by peer"),
            CloseReason::HeartbeatTimeout => f.write_str("heartbeat timeout"),
            CloseReason::ProtocolViolation => f.write_str("protocol violation"),
            CloseReason::Handler(err) => write!(f, "handler failed: {}", err),
            CloseReason::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

/// Worker-side state of one established connection.
///
/// Owns the socket, the receive buffer and the FIFO of outbound messages. Inbound bytes
/// are framed with the callback's length probe; outbound messages are written in order,
/// a partially written one staying at the head until its last byte is out.
pub(crate) struct Session {
    conn: Connection,
    callback: Arc<dyn NetCallback>,
    stream: TcpStream,
    recv_buffer: BytesMut,
    outbound: VecDeque<OutboundJob>,
    /// bytes of the head job already written
    head_written: usize,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    shutdown: Shutdown,
}

impl Session {
    pub fn new(
        conn: Connection,
        callback: Arc<dyn NetCallback>,
        stream: TcpStream,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
        shutdown: Shutdown,
        outbound: VecDeque<OutboundJob>,
    ) -> Session {
        Session {
            conn,
            callback,
            stream,
            recv_buffer: BytesMut::with_capacity(READ_CHUNK),
            outbound,
            head_written: 0,
            commands,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let reason = self.serve().await;
        self.close(reason).await;
    }

    async fn serve(&mut self) -> CloseReason {
        self.conn.touch(now_ms());
        self.conn.set_state(ConnectionState::Connected);
        debug!(
            connection = %self.conn.handle(),
            name = self.conn.name(),
            remote = ?self.conn.remote_addr(),
            "connection established"
        );
        if let Err(err) = guarded("on_connected", &self.conn, || {
            self.callback.on_connected(&self.conn)
        }) {
            return CloseReason::Handler(err);
        }

        loop {
            let interest = if self.outbound.is_empty() {
                Interest::READABLE
            } else {
                Interest::READABLE | Interest::WRITABLE
            };
            tokio::select! {
                _ = self.shutdown.recv() => return CloseReason::EngineStopped,
                command = self.commands.recv() => {
                    // the sender lives in the shared state this session holds
                    let Some(command) = command else {
                        return CloseReason::Local;
                    };
                    if let Some(reason) = self.apply(command) {
                        return reason;
                    }
                }
                ready = self.stream.ready(interest) => {
                    let ready = match ready {
                        Ok(ready) => ready,
                        Err(err) => return CloseReason::Io(err),
                    };
                    if ready.is_readable() || ready.is_read_closed() {
                        if let Err(reason) = self.read_available() {
                            return reason;
                        }
                    }
                    if ready.is_writable() {
                        if let Err(reason) = self.write_pending() {
                            return reason;
                        }
                    }
                }
            }
        }
    }

    fn apply(&mut self, command: SessionCommand) -> Option<CloseReason> {
        match command {
            SessionCommand::Send(job) => {
                self.outbound.push_back(job);
                None
            }
            SessionCommand::Ping => {
                self.outbound.push_back(OutboundJob::Raw(heartbeat_frame(false)));
                None
            }
            SessionCommand::Expire => Some(CloseReason::HeartbeatTimeout),
            SessionCommand::Close => Some(CloseReason::Local),
        }
    }

    fn read_available(&mut self) -> Result<(), CloseReason> {
        let mut received = 0;
        let mut peer_closed = false;
        for _ in 0..MAX_READS_PER_WAKE {
            self.recv_buffer.reserve(READ_CHUNK);
            match self.stream.try_read_buf(&mut self.recv_buffer) {
                Ok(0) => {
                    peer_closed = true;
                    break;
                }
                Ok(n) => received += n,
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(CloseReason::Io(err)),
            }
        }
        if received > 0 {
            self.conn.touch(now_ms());
            EngineCounters::add(
                &self.conn.context().counters.bytes_received,
                received as u64,
            );
            self.dispatch_frames()?;
        }
        if peer_closed {
            return Err(CloseReason::PeerClosed);
        }
        Ok(())
    }

    /// Hands every complete frame in the receive buffer to its consumer.
    fn dispatch_frames(&mut self) -> Result<(), CloseReason> {
        while !self.recv_buffer.is_empty() {
            let probe = guarded("on_message_length", &self.conn, || {
                self.callback.on_message_length(&self.conn, &self.recv_buffer)
            })
            .map_err(CloseReason::Handler)?;
            match probe {
                FrameLength::Incomplete => break,
                FrameLength::Complete(0) | FrameLength::Violation => {
                    self.recv_buffer.clear();
                    return Err(CloseReason::ProtocolViolation);
                }
                FrameLength::Complete(length) => {
                    let length = length as usize;
                    if length > self.recv_buffer.len() {
                        self.recv_buffer
                            .reserve(receive_reserve(self.recv_buffer.len(), length));
                        break;
                    }
                    let frame = self.recv_buffer.split_to(length);
                    self.handle_frame(&frame)?;
                }
            }
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: &[u8]) -> Result<(), CloseReason> {
        let context = self.conn.context().clone();
        EngineCounters::add(&context.counters.frames_received, 1);
        match heartbeat_kind(frame) {
            Some(Heartbeat::Ping) => {
                self.outbound.push_back(OutboundJob::Raw(heartbeat_frame(true)));
                return Ok(());
            }
            Some(Heartbeat::Pong) => return Ok(()),
            None => {}
        }
        let waiter = peek_sequence(frame).and_then(|sequence| context.calls.take(self.conn.id(), sequence));
        if let Some(waiter) = waiter {
            waiter.wake(Message::copy_from(frame, &context.allocator));
            return Ok(());
        }
        match guarded("on_message", &self.conn, || {
            self.callback.on_message(&self.conn, frame)
        }) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) | Err(err) => Err(CloseReason::Handler(err)),
        }
    }

    /// Writes queued jobs in order until the socket would block.
    fn write_pending(&mut self) -> Result<(), CloseReason> {
        let mut sent = 0u64;
        let result = loop {
            let Some(job) = self.outbound.front() else {
                break Ok(());
            };
            let remaining = &job.as_bytes()[self.head_written..];
            match self.stream.try_write(remaining) {
                Ok(0) => break Err(CloseReason::Io(io::Error::from(ErrorKind::WriteZero))),
                Ok(n) => {
                    sent += n as u64;
                    self.head_written += n;
                    if self.head_written == job.as_bytes().len() {
                        self.outbound.pop_front();
                        self.head_written = 0;
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => break Err(CloseReason::Io(err)),
            }
        };
        if sent > 0 {
            EngineCounters::add(&self.conn.context().counters.bytes_sent, sent);
        }
        result
    }

    async fn flush(&mut self) -> Result<(), CloseReason> {
        while !self.outbound.is_empty() {
            self.stream.writable().await.map_err(CloseReason::Io)?;
            self.write_pending()?;
        }
        Ok(())
    }

    async fn close(mut self, reason: CloseReason) {
        self.conn.set_state(ConnectionState::Closing);
        let context = self.conn.context().clone();
        context.calls.fail_connection(self.conn.id());

        if reason.flushes() && !self.outbound.is_empty() {
            match time::timeout(CLOSE_FLUSH_TIMEOUT, self.flush()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(connection = %self.conn.handle(), "flush on close failed: {}", err),
                Err(_) => debug!(
                    connection = %self.conn.handle(),
                    pending = self.outbound.len(),
                    "flush on close timed out"
                ),
            }
        }
        self.outbound.clear();
        self.commands.close();
        while self.commands.try_recv().is_ok() {}

        match reason {
            CloseReason::ProtocolViolation => {
                EngineCounters::add(&context.counters.protocol_violations, 1)
            }
            CloseReason::HeartbeatTimeout => {
                EngineCounters::add(&context.counters.heartbeat_timeouts, 1)
            }
            _ => {}
        }
        if let Some(event) = reason.event() {
            warn!(
                connection = %self.conn.handle(),
                name = self.conn.name(),
                remote = ?self.conn.remote_addr(),
                "closing connection: {}",
                event
            );
            let _ = guarded("on_event", &self.conn, || {
                self.callback.on_event(&self.conn, &event)
            });
        } else {
            info!(
                connection = %self.conn.handle(),
                name = self.conn.name(),
                "connection {}",
                reason
            );
        }

        let _ = self.stream.shutdown().await;
        self.conn.set_state(ConnectionState::Closed);
        let _ = guarded("on_disconnected", &self.conn, || {
            self.callback.on_disconnected(&self.conn)
        });
        self.conn.release();
    }
}

/// Connects an outbound connection, then serves it like an accepted one.
///
/// Sends posted while connecting are kept and written first. A close or engine stop
/// while connecting abandons the attempt.
pub(crate) async fn establish(
    conn: Connection,
    callback: Arc<dyn NetCallback>,
    remote: String,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    mut shutdown: Shutdown,
) {
    let mut pending = VecDeque::new();
    let connecting = connect(&remote, conn.options());
    tokio::pin!(connecting);
    let outcome = loop {
        tokio::select! {
            _ = shutdown.recv() => break Err(None),
            command = commands.recv() => match command {
                Some(SessionCommand::Send(job)) => pending.push_back(job),
                Some(SessionCommand::Ping) => {}
                Some(SessionCommand::Expire) | Some(SessionCommand::Close) | None => break Err(None),
            },
            result = &mut connecting => break result.map_err(Some),
        }
    };
    match outcome {
        Ok(stream) => {
            if let (Ok(peer), Ok(local)) = (stream.peer_addr(), stream.local_addr()) {
                conn.set_addresses(peer, local);
            }
            Session::new(conn, callback, stream, commands, shutdown, pending)
                .run()
                .await;
        }
        Err(err) => {
            drop(pending);
            abandon(&conn, callback.as_ref(), err);
        }
    }
}

/// Closes a connection that never got a serving session.
pub(crate) fn abandon(conn: &Connection, callback: &dyn NetCallback, err: Option<io::Error>) {
    conn.set_state(ConnectionState::Closing);
    conn.context().calls.fail_connection(conn.id());
    if let Some(err) = err {
        let event = NetEvent::ConnectFailed(err.to_string());
        warn!(
            connection = %conn.handle(),
            name = conn.name(),
            "{}",
            event
        );
        let _ = guarded("on_event", conn, || callback.on_event(conn, &event));
    } else {
        debug!(connection = %conn.handle(), "connection abandoned before it was established");
    }
    conn.set_state(ConnectionState::Closed);
    let _ = guarded("on_disconnected", conn, || callback.on_disconnected(conn));
    conn.release();
}

async fn connect(remote: &str, options: SocketOptions) -> io::Result<TcpStream> {
    let addr = lookup_host(remote).await?.next().ok_or_else(|| {
        io::Error::new(
            ErrorKind::InvalidInput,
            format!("{} resolves to no address", remote),
        )
    })?;
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    apply_socket_buffers(&socket, options.socket_buffer_bytes)?;
    let stream = time::timeout(CONNECT_TIMEOUT, socket.connect(addr))
        .await
        .map_err(|_| io::Error::new(ErrorKind::TimedOut, format!("connect to {} timed out", addr)))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}
