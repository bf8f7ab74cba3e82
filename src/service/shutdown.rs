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

use tokio::sync::{mpsc, watch};

/// Sending side of a stop signal. Firing it is sticky: receivers created afterwards
/// observe it immediately.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    notify: watch::Sender<bool>,
}

impl ShutdownSignal {
    pub fn new() -> ShutdownSignal {
        let (notify, _) = watch::channel(false);
        ShutdownSignal { notify }
    }

    pub fn trigger(&self) {
        self.notify.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.notify.borrow()
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown::new(self.notify.subscribe())
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of a [`ShutdownSignal`].
#[derive(Debug)]
pub struct Shutdown {
    is_shutdown: bool,
    notify: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new(notify: watch::Receiver<bool>) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify,
        }
    }
    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    /// Resolves once the signal fired or the sender is gone.
    pub async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }
        // a closed channel counts as a signal
        let _ = self.notify.wait_for(|stopped| *stopped).await;
        self.is_shutdown = true;
    }
}

/// Tracks a group of tasks so the owner can wait until all of them dropped their guard.
///
/// Every task holds a clone of the sender returned by [`TaskTracker::guard`]; once the
/// tracker itself stops handing them out, `wait` resolves when the last clone is dropped.
#[derive(Debug)]
pub struct TaskTracker {
    complete_tx: Option<mpsc::Sender<()>>,
    complete_rx: mpsc::Receiver<()>,
}

impl TaskTracker {
    pub fn new() -> TaskTracker {
        let (complete_tx, complete_rx) = mpsc::channel(1);
        TaskTracker {
            complete_tx: Some(complete_tx),
            complete_rx,
        }
    }

    /// `None` once `wait` has started.
    pub fn guard(&self) -> Option<mpsc::Sender<()>> {
        self.complete_tx.clone()
    }

    pub async fn wait(&mut self) {
        self.complete_tx.take();
        let _ = self.complete_rx.recv().await;
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_shutdown_recv_is_sticky() {
        let signal = ShutdownSignal::new();
        let mut shutdown = signal.subscribe();
        assert!(!shutdown.is_shutdown());
        signal.trigger();
        shutdown.recv().await;
        assert!(shutdown.is_shutdown());
        // already fired, returns immediately
        shutdown.recv().await;
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_signal() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        let mut late = signal.subscribe();
        tokio::time::timeout(Duration::from_secs(1), late.recv())
            .await
            .expect("late subscriber must not wait");
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn test_tracker_waits_for_all_guards() {
        let mut tracker = TaskTracker::new();
        let guard = tracker.guard().unwrap();
        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
            let _ = done_tx.send(()).await;
        });
        tracker.wait().await;
        assert!(done_rx.recv().await.is_some());
        assert!(tracker.guard().is_none());
    }
}
