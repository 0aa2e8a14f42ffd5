//! Startup and shutdown signalling shared by the bus and its transports

use futures::future::join_all;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// One-shot broadcast signal opened once the bus has finished starting up
///
/// Receive loops wait on the gate before taking their first message so that
/// consumers never run while other transports are still starting. The gate is
/// opened by the [`GateControl`] half created alongside it and stays open for
/// the rest of the process lifetime.
#[derive(Clone)]
pub struct ReadinessGate {
    rx: watch::Receiver<bool>,
}

impl ReadinessGate {
    /// Creates a closed gate together with the handle that opens it
    pub fn new() -> (Self, GateControl) {
        let (tx, rx) = watch::channel(false);

        (Self { rx }, GateControl { tx })
    }

    /// Waits until the gate has been opened
    ///
    /// Resolves immediately when it already is. Also resolves when the
    /// controlling half has been dropped without opening, as no opening can
    /// ever happen at that point and waiting forever would stall shutdown.
    pub async fn opened(&self) {
        let mut rx = self.rx.clone();

        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                warn!("Readiness gate was dropped before opening");
                return;
            }
        }
    }

    /// Whether the gate has been opened
    pub fn is_open(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Opening half of a [`ReadinessGate`]
pub struct GateControl {
    tx: watch::Sender<bool>,
}

impl GateControl {
    /// Opens the gate, releasing all waiting receive loops
    pub fn open(&self) {
        debug!("Opening readiness gate");
        let _ = self.tx.send(true);
    }
}

/// Cooperative shutdown signal observed by receive loops
///
/// Cloned into every background task a transport owns; the corresponding
/// [`ShutdownController`] is triggered exactly once when the transport stops.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Waits until shutdown has been requested
    pub async fn requested(&self) {
        let mut rx = self.rx.clone();

        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Whether shutdown has been requested
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Triggering half of a [`ShutdownSignal`]
pub struct ShutdownController {
    tx: watch::Sender<bool>,
}

impl ShutdownController {
    /// Creates a new controller with its matching signal
    pub fn new() -> (Self, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);

        (Self { tx }, ShutdownSignal { rx })
    }

    /// Requests shutdown of every task observing the matching signal
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// Set of background tasks owned by a transport
///
/// Tracks receive-loop handles so that [`TaskSet::stop`] can signal them and
/// wait for in-flight work to drain within the host-provided grace window.
pub struct TaskSet {
    controller: ShutdownController,
    signal: ShutdownSignal,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskSet {
    /// Creates an empty set with an untriggered shutdown signal
    pub fn new() -> Arc<Self> {
        let (controller, signal) = ShutdownController::new();

        Arc::new(Self {
            controller,
            signal,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Signal handed to every spawned task
    pub fn signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    /// Spawns a task onto the runtime and tracks its handle
    pub async fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().await.push(tokio::spawn(future));
    }

    /// Requests shutdown and waits for all tracked tasks to finish
    ///
    /// Returns the number of tasks still running when the grace window
    /// elapsed. Those tasks keep their handles detached; they are not aborted
    /// as they may be half-way through an acknowledgement.
    pub async fn stop(&self, grace: Duration) -> usize {
        self.controller.shutdown();

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        let total = tasks.len();

        match timeout(grace, join_all(tasks)).await {
            Ok(_) => 0,
            Err(_) => {
                warn!("{} background task(s) outlived the shutdown grace window", total);
                total
            }
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use futures::poll;
    use tokio::task::{spawn, yield_now};
    use tokio::time::sleep;

    #[tokio::test]
    async fn hold_loops_until_opened() {
        let (gate, control) = ReadinessGate::new();

        let waiting = gate.clone();
        let handle = spawn(async move { waiting.opened().await });
        yield_now().await;
        assert!(!poll!(handle).is_ready());

        control.open();
        yield_now().await;
        assert!(gate.is_open());
    }

    #[tokio::test]
    async fn release_immediately_once_open() {
        let (gate, control) = ReadinessGate::new();
        control.open();

        gate.opened().await;
    }

    #[tokio::test]
    async fn release_when_the_control_is_dropped() {
        let (gate, control) = ReadinessGate::new();
        drop(control);

        gate.opened().await;
        assert!(!gate.is_open());
    }

    #[tokio::test]
    async fn propagate_shutdown_requests() {
        let (controller, signal) = ShutdownController::new();
        assert!(!signal.is_requested());

        controller.shutdown();
        signal.requested().await;
        assert!(signal.is_requested());
    }

    #[tokio::test]
    async fn drain_tasks_within_the_grace_window() {
        let set = TaskSet::new();
        let signal = set.signal();

        set.spawn(async move {
            signal.requested().await;
            sleep(Duration::from_millis(10)).await;
        })
        .await;

        let outstanding = set.stop(Duration::from_secs(1)).await;
        assert_eq!(outstanding, 0);
    }

    #[tokio::test]
    async fn report_tasks_outliving_the_grace_window() {
        let set = TaskSet::new();

        set.spawn(async move {
            sleep(Duration::from_secs(60)).await;
        })
        .await;

        let outstanding = set.stop(Duration::from_millis(10)).await;
        assert_eq!(outstanding, 1);
    }
}
