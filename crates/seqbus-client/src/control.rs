//! Cooperative pause/resume/shutdown control for long-running tasks.
//!
//! Composition instead of inheritance: a task owns a [`ControlReceiver`]
//! and calls [`ControlReceiver::check`] at the top of each loop iteration;
//! the outside world holds the matching [`ControlHandle`]. Signals travel
//! over a channel, status over a watch, so nothing here blocks a thread -
//! the only blocking-style waits live in test helpers.

use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Signals a controllable task understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Park the task at its next check point
    Pause,
    /// Wake a paused task
    Resume,
    /// Terminate cooperatively
    Shutdown,
}

/// Queryable lifecycle status of a controllable task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Created, not yet running
    Init,
    /// Actively looping
    Running,
    /// Parked on a pause request
    Paused,
    /// Shutdown observed, winding down
    ShuttingDown,
    /// Loop exited
    Stopped,
}

/// Create a connected control handle/receiver pair.
pub fn control_channel() -> (ControlHandle, ControlReceiver) {
    let (tx, rx) = mpsc::channel(8);
    let (status_tx, status_rx) = watch::channel(TaskStatus::Init);
    (
        ControlHandle {
            tx,
            status: status_rx,
        },
        ControlReceiver {
            rx,
            status: status_tx,
            paused: false,
            shutdown: false,
        },
    )
}

/// External side: send signals, observe status.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlSignal>,
    status: watch::Receiver<TaskStatus>,
}

impl ControlHandle {
    /// Request a pause at the task's next check point.
    pub async fn pause(&self) {
        let _ = self.tx.send(ControlSignal::Pause).await;
    }

    /// Wake a paused task.
    pub async fn resume(&self) {
        let _ = self.tx.send(ControlSignal::Resume).await;
    }

    /// Request cooperative shutdown. Safe to call more than once.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(ControlSignal::Shutdown).await;
    }

    /// Current task status.
    pub fn status(&self) -> TaskStatus {
        *self.status.borrow()
    }

    /// Wait until the task reaches `target`.
    pub async fn await_status(&self, target: TaskStatus) {
        let mut rx = self.status.clone();
        loop {
            if *rx.borrow() == target {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Task side: drained at the top of each loop iteration.
#[derive(Debug)]
pub struct ControlReceiver {
    rx: mpsc::Receiver<ControlSignal>,
    status: watch::Sender<TaskStatus>,
    paused: bool,
    shutdown: bool,
}

impl ControlReceiver {
    fn apply(&mut self, signal: ControlSignal) {
        debug!(?signal, "control signal");
        match signal {
            ControlSignal::Pause => self.paused = true,
            ControlSignal::Resume => self.paused = false,
            ControlSignal::Shutdown => self.shutdown = true,
        }
    }

    /// Drain pending signals; park while paused. Returns `false` once
    /// shutdown was requested.
    pub async fn check(&mut self) -> bool {
        loop {
            while let Ok(signal) = self.rx.try_recv() {
                self.apply(signal);
            }
            if self.shutdown {
                let _ = self.status.send(TaskStatus::ShuttingDown);
                return false;
            }
            if !self.paused {
                let _ = self.status.send(TaskStatus::Running);
                return true;
            }
            let _ = self.status.send(TaskStatus::Paused);
            match self.rx.recv().await {
                Some(signal) => self.apply(signal),
                // All handles dropped: treat as shutdown.
                None => self.shutdown = true,
            }
        }
    }

    /// Wait until shutdown is requested, applying other signals as they
    /// arrive. Meant for `select!` arms racing against in-flight work;
    /// pause cannot park here because the in-flight work must complete
    /// first.
    pub async fn wait_shutdown(&mut self) {
        while !self.shutdown {
            match self.rx.recv().await {
                Some(signal) => self.apply(signal),
                None => self.shutdown = true,
            }
        }
        let _ = self.status.send(TaskStatus::ShuttingDown);
    }

    /// True once a shutdown signal was observed. Used to suppress the
    /// error transition produced by closing the active network channel.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Mark the loop as exited.
    pub fn mark_stopped(&mut self) {
        let _ = self.status.send(TaskStatus::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let (handle, mut recv) = control_channel();
        let task = tokio::spawn(async move {
            let mut iterations = 0u32;
            while recv.check().await {
                iterations += 1;
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            recv.mark_stopped();
            iterations
        });
        handle.await_status(TaskStatus::Running).await;
        handle.shutdown().await;
        handle.await_status(TaskStatus::Stopped).await;
        assert!(task.await.unwrap() >= 1);
    }

    #[tokio::test]
    async fn test_pause_parks_until_resume() {
        let (handle, mut recv) = control_channel();
        let (tick_tx, mut tick_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while recv.check().await {
                let _ = tick_tx.send(());
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });

        tick_rx.recv().await.unwrap();
        handle.pause().await;
        handle.await_status(TaskStatus::Paused).await;

        // Drain ticks emitted before the pause landed, then verify the
        // loop stays parked.
        while tick_rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(tick_rx.try_recv().is_err());

        handle.resume().await;
        handle.await_status(TaskStatus::Running).await;
        tick_rx.recv().await.unwrap();
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_wins_over_pause() {
        let (handle, mut recv) = control_channel();
        handle.pause().await;
        handle.shutdown().await;
        assert!(!recv.check().await);
        assert!(recv.is_shutdown());
    }
}
