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

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::runtime;
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};

use crate::service::{ListenerConfig, Shutdown, ShutdownSignal, SocketOptions};
use crate::{NetError, NetResult};

use super::apply_socket_buffers;
use super::callback::NetCallback;
use super::connection::{Connection, Registration};
use super::context::EngineContext;
use super::handle::ListenerHandle;
use super::stats::EngineCounters;
use super::worker::{WorkerCommand, WorkerSet};

const LISTEN_BACKLOG: u32 = 1024;
/// accepts per wake-up before the manager's other tasks get a turn
const ACCEPT_BATCH: usize = 64;
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(8);

/// Table entry of a listener; the socket itself lives in its accept loop.
pub(crate) struct ListenerShared {
    handle: ListenerHandle,
    name: String,
    local_addr: SocketAddr,
    options: SocketOptions,
    callback: Arc<dyn NetCallback>,
    closed: ShutdownSignal,
}

impl ListenerShared {
    pub fn new(
        handle: ListenerHandle,
        name: String,
        local_addr: SocketAddr,
        options: SocketOptions,
        callback: Arc<dyn NetCallback>,
    ) -> ListenerShared {
        ListenerShared {
            handle,
            name,
            local_addr,
            options,
            callback,
            closed: ShutdownSignal::new(),
        }
    }

    pub fn handle(&self) -> ListenerHandle {
        self.handle
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops the accept loop; connections it accepted stay up.
    pub fn close(&self) {
        self.closed.trigger();
    }
}

/// Binds a listening socket and registers it with the manager's reactor.
pub(crate) fn bind(
    config: &ListenerConfig,
    options: SocketOptions,
    reactor: &runtime::Handle,
) -> NetResult<TcpListener> {
    let ip: IpAddr = config.listener_ip.parse().map_err(|_| {
        NetError::InvalidParam(format!("listener ip {:?} is not an ip address", config.listener_ip))
    })?;
    let addr = SocketAddr::new(ip, config.listener_port);
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    apply_socket_buffers(&socket, options.socket_buffer_bytes)?;
    socket.bind(addr)?;
    let _enter = reactor.enter();
    Ok(socket.listen(LISTEN_BACKLOG)?)
}

/// Accept loop of one listener, run on the manager thread.
pub(crate) struct AcceptLoop {
    listener: TcpListener,
    shared: Arc<ListenerShared>,
    context: Arc<EngineContext>,
    workers: Arc<WorkerSet>,
    shutdown: Shutdown,
    closed: Shutdown,
}

impl AcceptLoop {
    pub fn new(
        listener: TcpListener,
        shared: Arc<ListenerShared>,
        context: Arc<EngineContext>,
        workers: Arc<WorkerSet>,
        shutdown: Shutdown,
    ) -> AcceptLoop {
        let closed = shared.closed.subscribe();
        AcceptLoop {
            listener,
            shared,
            context,
            workers,
            shutdown,
            closed,
        }
    }

    pub async fn run(mut self) {
        info!(
            listener = %self.shared.handle,
            name = %self.shared.name,
            addr = %self.shared.local_addr,
            "listening"
        );
        let mut backoff = Duration::from_millis(50);
        let mut batch = 0;
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.recv() => break,
                _ = self.closed.recv() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        backoff = Duration::from_millis(50);
                        if let Err(err) = self.adopt(stream, peer) {
                            warn!(
                                code = %err.code(),
                                listener = %self.shared.handle,
                                peer = %peer,
                                "dropping accepted connection: {}",
                                err
                            );
                        }
                        batch += 1;
                        if batch >= ACCEPT_BATCH {
                            batch = 0;
                            tokio::task::yield_now().await;
                        }
                    }
                    Err(err) => {
                        warn!(listener = %self.shared.handle, "accept failed: {}", err);
                        time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_ACCEPT_BACKOFF);
                    }
                },
            }
        }
        info!(listener = %self.shared.handle, name = %self.shared.name, "listener closed");
    }

    /// Registers the connection and moves its socket to the least loaded io thread.
    fn adopt(&self, stream: TcpStream, peer: SocketAddr) -> NetResult<()> {
        stream.set_nodelay(true)?;
        let local = stream.local_addr()?;
        let stream = stream.into_std()?;
        let worker = self.workers.pick()?;
        let (conn, commands) = Connection::register(
            &self.context,
            Registration {
                name: format!("{}/{}", self.shared.name, peer),
                inbound: true,
                options: self.shared.options,
                remote_addr: Some(peer),
                local_addr: Some(local),
                worker_load: worker.load_counter(),
            },
        )?;
        EngineCounters::add(&self.context.counters.connections_accepted, 1);
        debug!(
            listener = %self.shared.handle,
            connection = %conn.handle(),
            peer = %peer,
            worker = worker.index(),
            "accepted connection"
        );
        worker.dispatch(WorkerCommand::Adopt {
            conn,
            stream,
            callback: self.shared.callback.clone(),
            commands,
        })
    }
}
