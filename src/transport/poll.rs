//! Receive-loop state machine shared by polling transports
//!
//! Brokers without a push API (Queue Storage, SQS) are drained by a loop
//! stepping through `Idle → Polling → Dispatching → Polling`, backing off on
//! empty results and draining the batch in flight when shutdown is
//! requested.

use crate::lifecycle::{ReadinessGate, ShutdownSignal};
use crate::BoxedError;
use async_trait::async_trait;
use log::{debug, warn};
use std::time::Duration;
use tokio::time::sleep;

/// States of a polling receive loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollState {
    /// Waiting for the readiness gate
    Idle,
    /// Asking the broker for a batch
    Polling,
    /// Dispatching a received batch
    Dispatching,
    /// Sleeping after an empty result
    Backoff,
    /// Draining and terminating
    Stopping,
}

/// Source of deliveries for a polling receive loop
#[async_trait]
pub(crate) trait PollSource: Send + Sync {
    /// One delivery as received from the broker
    type Delivery: Send;

    /// Asks the broker for the next batch, possibly empty
    async fn poll(&self) -> Result<Vec<Self::Delivery>, BoxedError>;

    /// Dispatches one delivery, including settlement
    async fn dispatch(&self, delivery: Self::Delivery);

    /// Name used in log messages
    fn describe(&self) -> String;
}

/// Drives a [`PollSource`] until shutdown is requested
///
/// The batch being dispatched when shutdown arrives is always finished; the
/// loop re-checks the signal between batches, never in the middle of one.
pub(crate) async fn run_poll_loop<S: PollSource>(
    source: S,
    gate: ReadinessGate,
    shutdown: ShutdownSignal,
    empty_results_delay: Duration,
) {
    let mut state = PollState::Idle;
    let mut pending: Vec<S::Delivery> = Vec::new();

    loop {
        state = match state {
            PollState::Idle => {
                tokio::select! {
                    _ = gate.opened() => PollState::Polling,
                    _ = shutdown.requested() => PollState::Stopping,
                }
            }

            PollState::Polling => {
                if shutdown.is_requested() {
                    PollState::Stopping
                } else {
                    tokio::select! {
                        _ = shutdown.requested() => PollState::Stopping,
                        result = source.poll() => match result {
                            Ok(batch) if batch.is_empty() => PollState::Backoff,
                            Ok(batch) => {
                                pending = batch;
                                PollState::Dispatching
                            }
                            Err(error) => {
                                warn!("Polling {} failed: {}", source.describe(), error);
                                PollState::Backoff
                            }
                        },
                    }
                }
            }

            PollState::Dispatching => {
                for delivery in pending.drain(..) {
                    source.dispatch(delivery).await;
                }
                PollState::Polling
            }

            PollState::Backoff => {
                tokio::select! {
                    _ = sleep(empty_results_delay) => PollState::Polling,
                    _ = shutdown.requested() => PollState::Stopping,
                }
            }

            PollState::Stopping => break,
        };
    }

    debug!("Receive loop for {} stopped", source.describe());
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::lifecycle::ShutdownController;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::task::yield_now;

    struct ScriptedSource {
        batches: Mutex<Vec<Vec<u32>>>,
        dispatched: Arc<Mutex<Vec<u32>>>,
        polls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PollSource for ScriptedSource {
        type Delivery = u32;

        async fn poll(&self) -> Result<Vec<u32>, BoxedError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let mut batches = self.batches.lock().unwrap();
            Ok(if batches.is_empty() {
                Vec::new()
            } else {
                batches.remove(0)
            })
        }

        async fn dispatch(&self, delivery: u32) {
            self.dispatched.lock().unwrap().push(delivery);
        }

        fn describe(&self) -> String {
            "scripted".into()
        }
    }

    #[tokio::test]
    async fn dispatch_batches_in_order() {
        let dispatched = Arc::new(Mutex::new(Vec::new()));
        let polls = Arc::new(AtomicUsize::new(0));
        let source = ScriptedSource {
            batches: Mutex::new(vec![vec![1, 2], vec![3]]),
            dispatched: dispatched.clone(),
            polls: polls.clone(),
        };

        let (gate, gate_control) = crate::lifecycle::ReadinessGate::new();
        let (controller, shutdown) = ShutdownController::new();
        gate_control.open();

        let handle = tokio::spawn(run_poll_loop(
            source,
            gate,
            shutdown,
            Duration::from_millis(5),
        ));

        while dispatched.lock().unwrap().len() < 3 {
            yield_now().await;
        }

        controller.shutdown();
        handle.await.unwrap();

        assert_eq!(*dispatched.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn wait_for_the_gate_before_polling() {
        let polls = Arc::new(AtomicUsize::new(0));
        let source = ScriptedSource {
            batches: Mutex::new(Vec::new()),
            dispatched: Arc::new(Mutex::new(Vec::new())),
            polls: polls.clone(),
        };

        let (gate, _gate_control) = crate::lifecycle::ReadinessGate::new();
        let (controller, shutdown) = ShutdownController::new();

        let handle = tokio::spawn(run_poll_loop(
            source,
            gate,
            shutdown,
            Duration::from_millis(5),
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(polls.load(Ordering::SeqCst), 0);

        controller.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn back_off_after_empty_results() {
        let polls = Arc::new(AtomicUsize::new(0));
        let source = ScriptedSource {
            batches: Mutex::new(Vec::new()),
            dispatched: Arc::new(Mutex::new(Vec::new())),
            polls: polls.clone(),
        };

        let (gate, gate_control) = crate::lifecycle::ReadinessGate::new();
        let (controller, shutdown) = ShutdownController::new();
        gate_control.open();

        let handle = tokio::spawn(run_poll_loop(
            source,
            gate,
            shutdown,
            Duration::from_secs(60),
        ));

        tokio::time::sleep(Duration::from_millis(30)).await;
        controller.shutdown();
        handle.await.unwrap();

        // With a one-minute backoff only the first poll can have happened.
        assert_eq!(polls.load(Ordering::SeqCst), 1);
    }
}
