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

use std::cell::Cell;
use std::net::TcpStream as StdTcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::net::TcpStream;
use tokio::runtime;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::service::{Shutdown, ShutdownSignal, TaskTracker};
use crate::{NetError, NetResult};

use super::callback::NetCallback;
use super::connection::{Connection, SessionCommand};
use super::session::{self, Session};

thread_local! {
    static IO_THREAD: Cell<bool> = const { Cell::new(false) };
}

pub(crate) fn mark_io_thread() {
    IO_THREAD.with(|flag| flag.set(true));
}

/// True on engine-owned threads, where blocking is forbidden.
pub(crate) fn on_io_thread() -> bool {
    IO_THREAD.with(|flag| flag.get())
}

/// Work handed to an io thread.
pub(crate) enum WorkerCommand {
    /// Serve a socket accepted by a listener.
    Adopt {
        conn: Connection,
        stream: StdTcpStream,
        callback: Arc<dyn NetCallback>,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
    },
    /// Dial `remote`, then serve the socket.
    Connect {
        conn: Connection,
        remote: String,
        callback: Arc<dyn NetCallback>,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
    },
}

impl WorkerCommand {
    fn into_parts(self) -> (Connection, Arc<dyn NetCallback>) {
        match self {
            WorkerCommand::Adopt { conn, callback, .. }
            | WorkerCommand::Connect { conn, callback, .. } => (conn, callback),
        }
    }
}

/// Cloneable address of one io thread.
#[derive(Clone)]
pub(crate) struct WorkerHandle {
    index: usize,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    load: Arc<AtomicUsize>,
}

impl WorkerHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn load(&self) -> usize {
        self.load.load(Ordering::Acquire)
    }

    pub fn load_counter(&self) -> Arc<AtomicUsize> {
        self.load.clone()
    }

    pub fn dispatch(&self, command: WorkerCommand) -> NetResult<()> {
        self.commands.send(command).map_err(|rejected| {
            let (conn, callback) = rejected.0.into_parts();
            session::abandon(&conn, callback.as_ref(), None);
            NetError::InvalidCall(format!("io thread {} is not running", self.index))
        })
    }
}

/// The io threads of a started engine.
pub(crate) struct WorkerSet {
    workers: Vec<WorkerHandle>,
}

impl WorkerSet {
    /// Connections go to the io thread currently serving the fewest.
    pub fn pick(&self) -> NetResult<&WorkerHandle> {
        self.workers
            .iter()
            .min_by_key(|worker| worker.load())
            .ok_or_else(|| NetError::InvalidCall("engine has no io thread".to_string()))
    }

    pub fn loads(&self) -> Vec<usize> {
        self.workers.iter().map(WorkerHandle::load).collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }
}

/// Join side of an io thread.
pub(crate) struct IoWorker {
    index: usize,
    thread: Option<JoinHandle<()>>,
}

impl IoWorker {
    /// Starts `count` io threads. On failure the threads already started are stopped.
    pub fn spawn_all(
        engine_name: &str,
        count: usize,
        signal: &ShutdownSignal,
    ) -> NetResult<(Vec<IoWorker>, WorkerSet)> {
        let mut workers = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);
        for index in 0..count {
            match IoWorker::spawn(engine_name, index, signal) {
                Ok((worker, handle)) => {
                    workers.push(worker);
                    handles.push(handle);
                }
                Err(err) => {
                    signal.trigger();
                    for worker in workers.iter_mut() {
                        worker.join();
                    }
                    return Err(err);
                }
            }
        }
        Ok((workers, WorkerSet { workers: handles }))
    }

    fn spawn(
        engine_name: &str,
        index: usize,
        signal: &ShutdownSignal,
    ) -> NetResult<(IoWorker, WorkerHandle)> {
        let rt = runtime::Builder::new_current_thread().enable_all().build()?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let event_loop = EventLoop {
            index,
            commands: commands_rx,
            shutdown: signal.subscribe(),
            signal: signal.clone(),
            tracker: TaskTracker::new(),
        };
        let thread = thread::Builder::new()
            .name(format!("{}-io-{}", engine_name, index))
            .spawn(move || {
                mark_io_thread();
                rt.block_on(event_loop.run());
            })?;
        Ok((
            IoWorker {
                index,
                thread: Some(thread),
            },
            WorkerHandle {
                index,
                commands: commands_tx,
                load: Arc::new(AtomicUsize::new(0)),
            },
        ))
    }

    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("io thread {} panicked", self.index);
            }
        }
    }
}

/// Loop of one io thread: takes connections and runs one session task per connection.
struct EventLoop {
    index: usize,
    commands: mpsc::UnboundedReceiver<WorkerCommand>,
    shutdown: Shutdown,
    signal: ShutdownSignal,
    tracker: TaskTracker,
}

impl EventLoop {
    async fn run(mut self) {
        debug!("io thread {} started", self.index);
        while !self.shutdown.is_shutdown() {
            tokio::select! {
                biased;
                _ = self.shutdown.recv() => {}
                command = self.commands.recv() => match command {
                    Some(command) => self.start_session(command),
                    None => break,
                },
            }
        }

        // connections handed over but never served
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            let (conn, callback) = command.into_parts();
            session::abandon(&conn, callback.as_ref(), None);
        }
        self.tracker.wait().await;
        info!("io thread {} stopped", self.index);
    }

    fn start_session(&self, command: WorkerCommand) {
        let Some(guard) = self.tracker.guard() else {
            let (conn, callback) = command.into_parts();
            session::abandon(&conn, callback.as_ref(), None);
            return;
        };
        let shutdown = self.signal.subscribe();
        match command {
            WorkerCommand::Adopt {
                conn,
                stream,
                callback,
                commands,
            } => match TcpStream::from_std(stream) {
                Ok(stream) => {
                    tokio::spawn(async move {
                        Session::new(conn, callback, stream, commands, shutdown, Default::default())
                            .run()
                            .await;
                        drop(guard);
                    });
                }
                Err(err) => session::abandon(&conn, callback.as_ref(), Some(err)),
            },
            WorkerCommand::Connect {
                conn,
                remote,
                callback,
                commands,
            } => {
                tokio::spawn(async move {
                    session::establish(conn, callback, remote, commands, shutdown).await;
                    drop(guard);
                });
            }
        }
    }
}
