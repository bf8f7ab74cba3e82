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
use std::thread::{self, JoinHandle};

use tokio::runtime;
use tokio::sync::mpsc;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, error, info, trace};

use crate::service::{EngineConfig, Shutdown, ShutdownSignal, TaskTracker};
use crate::{NetError, NetResult};

use super::connection::{Connection, ConnectionState, SessionCommand};
use super::context::EngineContext;
use super::listener::AcceptLoop;
use super::now_ms;
use super::worker::mark_io_thread;

const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(10);
const MAX_SWEEP_PERIOD: Duration = Duration::from_secs(1);

/// What the heartbeat sweep wants done with one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Liveness {
    Alive,
    Ping,
    Expired,
}

/// Heartbeat decision for a connection idle since `last_activity_ms` and last pinged at
/// `last_ping_ms`. A zero interval disables pings, a zero timeout disables expiry.
pub(crate) fn liveness(
    now_ms: u64,
    last_activity_ms: u64,
    last_ping_ms: u64,
    interval_ms: u32,
    timeout_ms: u32,
) -> Liveness {
    let idle = now_ms.saturating_sub(last_activity_ms);
    if timeout_ms != 0 && idle >= timeout_ms as u64 {
        return Liveness::Expired;
    }
    if interval_ms != 0
        && idle >= interval_ms as u64
        && now_ms.saturating_sub(last_ping_ms) >= interval_ms as u64
    {
        return Liveness::Ping;
    }
    Liveness::Alive
}

/// Sweep period derived from the engine defaults: half the shortest enabled heartbeat
/// setting, clamped to `[10ms, 1s]`.
pub(crate) fn sweep_period(config: &EngineConfig) -> Duration {
    let shortest = [config.heartbeat_interval_ms, config.heartbeat_timeout_ms]
        .into_iter()
        .filter(|ms| *ms != 0)
        .min();
    match shortest {
        Some(ms) => Duration::from_millis(ms as u64 / 2).clamp(MIN_SWEEP_PERIOD, MAX_SWEEP_PERIOD),
        None => MAX_SWEEP_PERIOD,
    }
}

/// The manager thread: owns every listener's accept loop and the heartbeat sweep.
pub(crate) struct Manager {
    reactor: runtime::Handle,
    /// handed to accept loops; dropped on join so the thread can finish
    task_guard: Option<mpsc::Sender<()>>,
    signal: ShutdownSignal,
    thread: Option<JoinHandle<()>>,
}

impl Manager {
    pub fn spawn(context: Arc<EngineContext>, signal: &ShutdownSignal) -> NetResult<Manager> {
        let rt = runtime::Builder::new_current_thread().enable_all().build()?;
        let reactor = rt.handle().clone();
        let tracker = TaskTracker::new();
        let task_guard = tracker.guard();
        let sweeper = Sweeper {
            period: sweep_period(&context.config),
            context,
            shutdown: signal.subscribe(),
            tracker,
        };
        let thread = thread::Builder::new()
            .name(format!("{}-manager", sweeper.context.name()))
            .spawn(move || {
                mark_io_thread();
                rt.block_on(sweeper.run());
            })?;
        Ok(Manager {
            reactor,
            task_guard,
            signal: signal.clone(),
            thread: Some(thread),
        })
    }

    /// Runtime the listening sockets register with.
    pub fn reactor(&self) -> &runtime::Handle {
        &self.reactor
    }

    pub fn spawn_listener(
        &self,
        build: impl FnOnce(Shutdown) -> AcceptLoop,
    ) -> NetResult<()> {
        if self.signal.is_triggered() {
            return Err(NetError::InvalidCall("manager is stopping".to_string()));
        }
        let guard = self
            .task_guard
            .clone()
            .ok_or_else(|| NetError::InvalidCall("manager is stopping".to_string()))?;
        let accept_loop = build(self.signal.subscribe());
        self.reactor.spawn(async move {
            accept_loop.run().await;
            drop(guard);
        });
        Ok(())
    }

    pub fn join(&mut self) {
        self.task_guard.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("manager thread panicked");
            }
        }
    }
}

struct Sweeper {
    period: Duration,
    context: Arc<EngineContext>,
    shutdown: Shutdown,
    tracker: TaskTracker,
}

impl Sweeper {
    async fn run(mut self) {
        debug!(period = ?self.period, "manager started");
        let mut ticker = time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.recv() => break,
                _ = ticker.tick() => self.sweep(),
            }
        }
        self.tracker.wait().await;
        info!("manager stopped");
    }

    /// Pings idle connections and expires silent ones.
    fn sweep(&self) {
        let now = now_ms();
        for shared in self.context.connections.snapshot() {
            let conn = Connection::from_shared(shared);
            if conn.state() != ConnectionState::Connected {
                continue;
            }
            let options = conn.options();
            match liveness(
                now,
                conn.last_activity_ms(),
                conn.last_ping_ms(),
                options.heartbeat_interval_ms,
                options.heartbeat_timeout_ms,
            ) {
                Liveness::Alive => {}
                Liveness::Ping => {
                    trace!(connection = %conn.handle(), "heartbeat ping");
                    conn.mark_ping(now);
                    conn.post(SessionCommand::Ping);
                }
                Liveness::Expired => {
                    debug!(
                        connection = %conn.handle(),
                        idle_ms = now.saturating_sub(conn.last_activity_ms()),
                        "heartbeat expired"
                    );
                    conn.post(SessionCommand::Expire);
                }
            }
        }
    }
}
