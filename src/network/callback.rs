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
use std::panic::{self, AssertUnwindSafe};

use tracing::error;

use crate::protocol::{probe_frame_length, FrameLength};
use crate::{NetError, NetResult};

use super::Connection;

/// Conditions reported through [`NetCallback::on_event`] right before the engine closes a
/// connection because of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetEvent {
    ProtocolViolation,
    HeartbeatTimeout,
    /// `on_message` returned an error or a callback panicked.
    HandlerFailed(String),
    Io(String),
    /// Outbound connection never got established.
    ConnectFailed(String),
}

impl fmt::Display for NetEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetEvent::ProtocolViolation => f.write_str("protocol violation"),
            NetEvent::HeartbeatTimeout => f.write_str("heartbeat timeout"),
            NetEvent::HandlerFailed(reason) => write!(f, "handler failed: {}", reason),
            NetEvent::Io(reason) => write!(f, "io error: {}", reason),
            NetEvent::ConnectFailed(reason) => write!(f, "connect failed: {}", reason),
        }
    }
}

/// Application hooks invoked by the io threads.
///
/// Every method runs on the worker that owns the connection, so a slow callback stalls
/// every other connection of that worker. Panics are caught and treated like a failed
/// `on_message`.
pub trait NetCallback: Send + Sync {
    /// Decides where the next frame ends. Defaults to the LIDR header rules.
    fn on_message_length(&self, conn: &Connection, data: &[u8]) -> FrameLength {
        let _ = conn;
        probe_frame_length(data)
    }

    /// One complete frame. Returning an error closes the connection.
    fn on_message(&self, conn: &Connection, frame: &[u8]) -> NetResult<()>;

    fn on_event(&self, conn: &Connection, event: &NetEvent) {
        let _ = (conn, event);
    }

    fn on_connected(&self, conn: &Connection) {
        let _ = conn;
    }

    /// Delivered exactly once per connection, including ones that never got established.
    fn on_disconnected(&self, conn: &Connection) {
        let _ = conn;
    }
}

/// Runs a user callback, turning a panic into a collaborator fault.
pub(crate) fn guarded<R>(hook: &'static str, conn: &Connection, f: impl FnOnce() -> R) -> NetResult<R> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let err = NetError::from_panic(payload);
        error!(
            code = %err.code(),
            connection = %conn.handle(),
            "{} panicked: {}",
            hook,
            err
        );
        err
    })
}
