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

//! TCP transport engine.
//!
//! # Architecture
//!
//! A started [`NetEngine`] runs `io_thread_count` io threads and one manager thread, each
//! driving its own single-threaded tokio runtime:
//!
//! - the manager owns every listening socket and the heartbeat sweep. Accepted sockets
//!   are moved to the io thread serving the fewest connections;
//! - an io thread owns the sockets handed to it. One session task per connection waits
//!   for readiness, frames inbound bytes with [`NetCallback::on_message_length`] and
//!   flushes the outbound queue in order;
//! - API threads and callbacks talk to a connection through [`Connection`], which only
//!   reads atomics or posts commands to the owning io thread.
//!
//! Listeners and connections are named by generation-tagged [`Handle`]s, so a handle kept
//! after its object was destroyed fails with `NotFound` instead of reaching a newer one.

use std::io;
use std::time::Instant;

use once_cell::sync::Lazy;
use tokio::net::TcpSocket;

pub use callback::{NetCallback, NetEvent};
pub use connection::{Connection, ConnectionState};
pub use engine::NetEngine;
pub use handle::{ConnectionHandle, Handle, ListenerHandle};
pub use stats::EngineStats;

mod call;
mod callback;
mod connection;
mod context;
mod engine;
mod handle;
mod listener;
mod manager;
mod session;
mod stats;
mod worker;

static CLOCK_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic milliseconds since the first use of the engine clock.
pub(crate) fn now_ms() -> u64 {
    CLOCK_EPOCH.elapsed().as_millis() as u64
}

/// Applies a send/receive buffer size; 0 keeps the OS default.
pub(crate) fn apply_socket_buffers(socket: &TcpSocket, bytes: u32) -> io::Result<()> {
    if bytes != 0 {
        socket.set_send_buffer_size(bytes)?;
        socket.set_recv_buffer_size(bytes)?;
    }
    Ok(())
}
