//! Azure Queue Storage transport
//!
//! One storage queue per event plus an optional `-deadletter` shadow queue.
//! Storage queues have no header channel, so reserved headers travel inside
//! the serialized envelope only. Scheduling rides on the visibility timeout;
//! the returned marker is `messageId|popReceipt` and cancelling deletes the
//! still-invisible message by that pair.

use super::{
    dispatch_message, run_poll_loop, DispatchOutcome, EventTransport, IncomingMessage,
    OutgoingMessage, PollSource, ScheduledMarker, SingleFlightCache, TransportError,
    TransportStartContext,
};
use crate::bus::EventBus;
use crate::config::BusConfiguration;
use crate::constants::{DEADLETTER_SUFFIX, DEFAULT_POLL_BATCH_SIZE};
use crate::lifecycle::TaskSet;
use crate::registration::EventRegistration;
use crate::{BoxedError, EmptyResult};
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Name the Queue Storage transport registers under
pub const NAME: &str = "azure-queue-storage";

/// Message pulled from a storage queue
#[derive(Debug, Clone)]
pub struct QueueMessage {
    /// Broker-assigned message identifier
    pub message_id: String,
    /// Receipt required to delete this delivery
    pub pop_receipt: String,
    /// Raw payload
    pub body: Vec<u8>,
}

/// Handle to a freshly enqueued message
#[derive(Debug, Clone)]
pub struct SentMessage {
    /// Broker-assigned message identifier
    pub message_id: String,
    /// Receipt required to delete the message before it becomes visible
    pub pop_receipt: String,
}

/// Operations the transport calls on one storage queue
///
/// The host implements this over its storage SDK's queue client; tests
/// implement it in-process.
#[async_trait]
pub trait StorageQueue: Send + Sync {
    /// Creates the queue when it does not exist yet
    async fn create_if_missing(&self) -> EmptyResult;

    /// Enqueues a message, optionally delayed and with a bounded lifetime
    async fn send_message(
        &self,
        body: &[u8],
        visibility_timeout: Option<Duration>,
        time_to_live: Option<Duration>,
    ) -> Result<SentMessage, BoxedError>;

    /// Receives up to `max` visible messages
    async fn receive_messages(&self, max: usize) -> Result<Vec<QueueMessage>, BoxedError>;

    /// Deletes a message by its id and receipt
    async fn delete_message(&self, message_id: &str, pop_receipt: &str) -> EmptyResult;
}

/// Operations the transport calls on the storage account
#[async_trait]
pub trait QueueStorageClient: Send + Sync {
    /// Returns a client for one queue by name
    async fn queue_client(&self, queue: &str) -> Result<Arc<dyn StorageQueue>, BoxedError>;

    /// Cheap reachability probe against the account
    async fn ping(&self) -> EmptyResult;
}

struct Runtime {
    bus: EventBus,
    configuration: Arc<BusConfiguration>,
    tasks: Arc<TaskSet>,
}

/// Transport publishing to and polling Azure Queue Storage
pub struct QueueStorageTransport {
    client: Arc<dyn QueueStorageClient>,
    queues: SingleFlightCache<String, Arc<dyn StorageQueue>>,
    runtime: Mutex<Option<Arc<Runtime>>>,
}

impl QueueStorageTransport {
    /// Creates a transport on top of a storage client
    pub fn new(client: Arc<dyn QueueStorageClient>) -> Self {
        Self {
            client,
            queues: SingleFlightCache::new(),
            runtime: Mutex::new(None),
        }
    }

    fn runtime(&self) -> Result<Arc<Runtime>, TransportError> {
        self.runtime
            .lock()
            .unwrap()
            .clone()
            .ok_or(TransportError::NotRunning(NAME))
    }

    async fn queue(
        &self,
        name: &str,
        provision: bool,
    ) -> Result<Arc<dyn StorageQueue>, TransportError> {
        let client = self.client.clone();
        let key = name.to_owned();

        let queue = self
            .queues
            .get_or_create(&key.clone(), || async move {
                let queue = client.queue_client(&key).await?;
                if provision {
                    queue.create_if_missing().await?;
                }
                Ok::<_, BoxedError>(queue)
            })
            .await?;

        Ok(queue)
    }
}

#[async_trait]
impl EventTransport for QueueStorageTransport {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn send_one(
        &self,
        message: OutgoingMessage,
        registration: &EventRegistration,
    ) -> Result<Option<ScheduledMarker>, TransportError> {
        let runtime = self.runtime()?;
        let queue = self
            .queue(
                registration.event_name(),
                runtime.configuration.enable_entity_creation,
            )
            .await?;

        // A scheduled instant in the past means publish immediately.
        let visibility = message
            .scheduled
            .map(|at| (at - Utc::now()).to_std().unwrap_or_default());
        let time_to_live = message
            .expires
            .map(|at| (at - Utc::now()).to_std().unwrap_or_default());

        let sent = queue
            .send_message(&message.body, visibility, time_to_live)
            .await?;

        Ok(message
            .scheduled
            .map(|_| ScheduledMarker::new(format!("{}|{}", sent.message_id, sent.pop_receipt))))
    }

    async fn cancel_scheduled(
        &self,
        marker: ScheduledMarker,
        registration: &EventRegistration,
    ) -> Result<(), TransportError> {
        self.runtime()?;

        let (message_id, pop_receipt) = marker
            .as_str()
            .split_once('|')
            .ok_or_else(|| TransportError::Broker("malformed scheduled marker".into()))?;

        let queue = self.queue(registration.event_name(), false).await?;
        queue.delete_message(message_id, pop_receipt).await?;

        Ok(())
    }

    async fn start(&self, context: TransportStartContext) -> EmptyResult {
        let runtime = Arc::new(Runtime {
            bus: context.bus,
            configuration: context.configuration,
            tasks: TaskSet::new(),
        });
        *self.runtime.lock().unwrap() = Some(runtime.clone());

        let provision = runtime.configuration.enable_entity_creation;

        for registration in context.registrations {
            let queue = self.queue(registration.event_name(), provision).await?;

            let deadletter = if registration.wants_deadletter() {
                let name = format!("{}{}", registration.event_name(), DEADLETTER_SUFFIX);
                Some(self.queue(&name, provision).await?)
            } else {
                None
            };

            if registration.consumers().is_empty() {
                continue;
            }

            debug!(
                "Polling queue {} for {} consumer(s)",
                registration.event_name(),
                registration.consumers().len()
            );

            let source = QueuePollSource {
                queue,
                deadletter,
                registration,
                bus: runtime.bus.clone(),
            };

            runtime
                .tasks
                .spawn(run_poll_loop(
                    source,
                    context.gate.clone(),
                    runtime.tasks.signal(),
                    runtime.configuration.empty_results_delay,
                ))
                .await;
        }

        Ok(())
    }

    async fn stop(&self, grace: Duration) -> EmptyResult {
        let runtime = self.runtime.lock().unwrap().take();

        if let Some(runtime) = runtime {
            let outstanding = runtime.tasks.stop(grace).await;
            if outstanding > 0 {
                warn!("{} queue poll loop(s) outlived the grace window", outstanding);
            }
        }

        self.queues.clear().await;
        Ok(())
    }

    async fn check_health(&self) -> Result<bool, TransportError> {
        match self.client.ping().await {
            Ok(()) => Ok(true),
            Err(error) => {
                warn!("Queue storage health probe failed: {}", error);
                Ok(false)
            }
        }
    }
}

struct QueuePollSource {
    queue: Arc<dyn StorageQueue>,
    deadletter: Option<Arc<dyn StorageQueue>>,
    registration: Arc<EventRegistration>,
    bus: EventBus,
}

#[async_trait]
impl PollSource for QueuePollSource {
    type Delivery = QueueMessage;

    async fn poll(&self) -> Result<Vec<QueueMessage>, BoxedError> {
        self.queue.receive_messages(DEFAULT_POLL_BATCH_SIZE).await
    }

    async fn dispatch(&self, delivery: QueueMessage) {
        let incoming = IncomingMessage {
            body: delivery.body.clone(),
            content_type: None,
            headers: HashMap::new(),
            sequence: Some(format!("{}|{}", delivery.message_id, delivery.pop_receipt)),
        };

        let mut deadletter = false;
        let mut redeliver = false;

        for consumer in self.registration.consumers() {
            match dispatch_message(incoming.clone(), &self.registration, consumer, &self.bus).await
            {
                DispatchOutcome::Acknowledge | DispatchOutcome::Discard(_) => {}
                DispatchOutcome::DeadLetter(_) => deadletter = true,
                DispatchOutcome::Fail(_) => redeliver = true,
            }
        }

        // Redelivery wins: the message reappears once its visibility timeout
        // expires, giving every consumer another attempt.
        if redeliver {
            return;
        }

        if deadletter {
            if let Some(shadow) = &self.deadletter {
                if let Err(error) = shadow.send_message(&delivery.body, None, None).await {
                    warn!(
                        "Failed to shadow dead-letter message {} from {}: {}",
                        delivery.message_id,
                        self.registration.event_name(),
                        error
                    );
                    return;
                }
            }
        }

        if let Err(error) = self
            .queue
            .delete_message(&delivery.message_id, &delivery.pop_receipt)
            .await
        {
            warn!(
                "Failed to delete message {} from {}: {}",
                delivery.message_id,
                self.registration.event_name(),
                error
            );
        }
    }

    fn describe(&self) -> String {
        format!("queue {}", self.registration.event_name())
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::bus::EventBus;
    use crate::context::EventContext;
    use crate::registration::EventConsumer;
    use async_trait::async_trait;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tokio::time::{sleep, timeout};

    #[derive(Debug, Clone)]
    struct Stored {
        message_id: String,
        pop_receipt: String,
        body: Vec<u8>,
        visible_at: Instant,
    }

    #[derive(Default)]
    struct FakeQueue {
        counter: AtomicUsize,
        messages: Mutex<Vec<Stored>>,
    }

    #[async_trait]
    impl StorageQueue for FakeQueue {
        async fn create_if_missing(&self) -> EmptyResult {
            Ok(())
        }

        async fn send_message(
            &self,
            body: &[u8],
            visibility_timeout: Option<Duration>,
            _time_to_live: Option<Duration>,
        ) -> Result<SentMessage, BoxedError> {
            let number = self.counter.fetch_add(1, Ordering::SeqCst);
            let stored = Stored {
                message_id: format!("m{}", number),
                pop_receipt: format!("p{}", number),
                body: body.to_vec(),
                visible_at: Instant::now() + visibility_timeout.unwrap_or_default(),
            };

            let sent = SentMessage {
                message_id: stored.message_id.clone(),
                pop_receipt: stored.pop_receipt.clone(),
            };

            self.messages.lock().unwrap().push(stored);
            Ok(sent)
        }

        async fn receive_messages(&self, max: usize) -> Result<Vec<QueueMessage>, BoxedError> {
            let now = Instant::now();
            let mut messages = self.messages.lock().unwrap();

            let mut received = Vec::new();
            for stored in messages.iter_mut() {
                if received.len() == max {
                    break;
                }

                if stored.visible_at <= now {
                    // Receiving hides the message for a while, like the
                    // real broker's visibility timeout does.
                    stored.visible_at = now + Duration::from_secs(30);
                    received.push(QueueMessage {
                        message_id: stored.message_id.clone(),
                        pop_receipt: stored.pop_receipt.clone(),
                        body: stored.body.clone(),
                    });
                }
            }

            Ok(received)
        }

        async fn delete_message(&self, message_id: &str, pop_receipt: &str) -> EmptyResult {
            self.messages
                .lock()
                .unwrap()
                .retain(|stored| {
                    stored.message_id != message_id || stored.pop_receipt != pop_receipt
                });
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeStorage {
        queues: Mutex<HashMap<String, Arc<FakeQueue>>>,
    }

    impl FakeStorage {
        fn queue(&self, name: &str) -> Arc<FakeQueue> {
            self.queues
                .lock()
                .unwrap()
                .entry(name.to_owned())
                .or_default()
                .clone()
        }

        fn stored(&self, name: &str) -> usize {
            self.queue(name).messages.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl QueueStorageClient for FakeStorage {
        async fn queue_client(&self, queue: &str) -> Result<Arc<dyn StorageQueue>, BoxedError> {
            Ok(self.queue(queue))
        }

        async fn ping(&self) -> EmptyResult {
            Ok(())
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct ParcelShipped {
        parcel: String,
    }

    #[derive(Default)]
    struct RefusingConsumer;

    #[async_trait]
    impl EventConsumer for RefusingConsumer {
        type Event = ParcelShipped;

        async fn consume(&self, _context: &EventContext<ParcelShipped>) -> EmptyResult {
            Err("address unknown".into())
        }
    }

    #[derive(Default)]
    struct AcceptingConsumer;

    #[async_trait]
    impl EventConsumer for AcceptingConsumer {
        type Event = ParcelShipped;

        async fn consume(&self, _context: &EventContext<ParcelShipped>) -> EmptyResult {
            Ok(())
        }
    }

    fn fast_polling() -> crate::config::BusConfiguration {
        crate::config::BusConfiguration {
            empty_results_delay: Duration::from_millis(10),
            ..Default::default()
        }
    }

    async fn wait_until<F>(mut condition: F)
    where
        F: FnMut() -> bool,
    {
        timeout(Duration::from_secs(1), async {
            while !condition() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition was not reached within a second");
    }

    #[tokio::test]
    async fn cancel_scheduled_publishes_by_marker() {
        let storage = Arc::new(FakeStorage::default());

        let bus = EventBus::builder()
            .with_configuration(fast_polling())
            .add_transport(QueueStorageTransport::new(storage.clone()))
            .register_event::<ParcelShipped, _>(|_| {})
            .build()
            .unwrap();

        bus.start().await.unwrap();

        let marker = bus
            .publisher()
            .publish(
                ParcelShipped {
                    parcel: "tube".into(),
                },
                Some(Utc::now() + chrono::Duration::minutes(10)),
            )
            .await
            .unwrap()
            .expect("a scheduled publish returns a marker");

        assert!(marker.as_str().contains('|'));
        assert_eq!(storage.stored("parcel-shipped"), 1);

        bus.publisher()
            .cancel::<ParcelShipped>(marker)
            .await
            .unwrap();

        assert_eq!(storage.stored("parcel-shipped"), 0);
    }

    #[tokio::test]
    async fn shadow_dead_letter_failed_messages() {
        let storage = Arc::new(FakeStorage::default());

        let bus = EventBus::builder()
            .with_configuration(fast_polling())
            .add_transport(QueueStorageTransport::new(storage.clone()))
            .register_event::<ParcelShipped, _>(|event| {
                event.consume_with(RefusingConsumer::default);
            })
            .build()
            .unwrap();

        bus.start().await.unwrap();
        bus.publisher()
            .publish(
                ParcelShipped {
                    parcel: "tube".into(),
                },
                None,
            )
            .await
            .unwrap();

        wait_until(|| storage.stored("parcel-shipped-deadletter") == 1).await;
        assert_eq!(storage.stored("parcel-shipped"), 0);

        bus.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn deliver_and_delete_processed_messages() {
        let storage = Arc::new(FakeStorage::default());

        let bus = EventBus::builder()
            .with_configuration(fast_polling())
            .add_transport(QueueStorageTransport::new(storage.clone()))
            .register_event::<ParcelShipped, _>(|event| {
                event.consume_with(AcceptingConsumer::default);
            })
            .build()
            .unwrap();

        bus.start().await.unwrap();
        bus.publisher()
            .publish(
                ParcelShipped {
                    parcel: "tube".into(),
                },
                None,
            )
            .await
            .unwrap();

        wait_until(|| storage.stored("parcel-shipped") == 0).await;
        assert_eq!(storage.stored("parcel-shipped-deadletter"), 0);

        bus.stop(Duration::from_secs(1)).await.unwrap();
    }
}
