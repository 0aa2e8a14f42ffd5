//! Azure Service Bus transport
//!
//! Broadcast events travel through a topic with one subscription per
//! consumer; point-to-point events use a queue. Service Bus handles
//! scheduling, cancellation, dead-lettering and batching natively, so this
//! transport mostly maps pipeline outcomes onto broker verbs. Entities are
//! created on demand when entity creation is enabled.

use super::{
    dispatch_message, BrokerDelivery, DeliveryStream, DispatchOutcome, EventTransport,
    OutgoingMessage, ScheduledMarker, SingleFlightCache, TransportError, TransportStartContext,
};
use crate::bus::EventBus;
use crate::config::BusConfiguration;
use crate::lifecycle::{ReadinessGate, ShutdownSignal, TaskSet};
use crate::registration::{EntityKind, EventRegistration};
use crate::{BoxedError, EmptyResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use log::{debug, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Name the Service Bus transport registers under
pub const NAME: &str = "azure-service-bus";

/// Entity a receiver is attached to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReceiverEntity {
    /// A point-to-point queue
    Queue {
        /// Name of the queue
        queue: String,
    },
    /// A subscription under a broadcast topic
    Subscription {
        /// Name of the topic
        topic: String,
        /// Name of the subscription
        subscription: String,
    },
}

/// Sender attached to one entity
#[async_trait]
pub trait ServiceBusSender: Send + Sync {
    /// Sends one message
    async fn send(&self, message: &OutgoingMessage) -> EmptyResult;

    /// Sends a batch of messages atomically
    async fn send_batch(&self, messages: &[OutgoingMessage]) -> EmptyResult;

    /// Schedules a message, returning its broker sequence number
    async fn schedule(
        &self,
        message: &OutgoingMessage,
        at: DateTime<Utc>,
    ) -> Result<i64, BoxedError>;

    /// Cancels a scheduled message by its sequence number
    async fn cancel_scheduled(&self, sequence_number: i64) -> EmptyResult;
}

/// Operations the transport calls on the Service Bus namespace
#[async_trait]
pub trait ServiceBusClient: Send + Sync {
    /// Creates a queue when it does not exist yet
    async fn create_queue(&self, name: &str) -> EmptyResult;

    /// Creates a topic when it does not exist yet
    async fn create_topic(&self, name: &str) -> EmptyResult;

    /// Creates a subscription under a topic when it does not exist yet
    async fn create_subscription(&self, topic: &str, subscription: &str) -> EmptyResult;

    /// Creates a sender attached to a queue or topic
    async fn create_sender(&self, entity: &str) -> Result<Arc<dyn ServiceBusSender>, BoxedError>;

    /// Registers a receiver and returns its stream of deliveries
    async fn subscribe(&self, entity: &ReceiverEntity) -> Result<DeliveryStream, BoxedError>;

    /// Cheap reachability probe against the namespace
    async fn ping(&self) -> EmptyResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiverState {
    Registered,
    Running,
    Faulted,
    Closed,
}

struct Runtime {
    bus: EventBus,
    configuration: Arc<BusConfiguration>,
    tasks: Arc<TaskSet>,
}

/// Transport over Azure Service Bus
pub struct ServiceBusTransport {
    client: Arc<dyn ServiceBusClient>,
    senders: SingleFlightCache<String, Arc<dyn ServiceBusSender>>,
    runtime: Mutex<Option<Arc<Runtime>>>,
}

impl ServiceBusTransport {
    /// Creates a transport on top of a namespace client
    pub fn new(client: Arc<dyn ServiceBusClient>) -> Self {
        Self {
            client,
            senders: SingleFlightCache::new(),
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

    /// Returns the cached sender for an entity, provisioning it on demand
    async fn sender(
        &self,
        registration: &EventRegistration,
        provision: bool,
    ) -> Result<Arc<dyn ServiceBusSender>, TransportError> {
        let client = self.client.clone();
        let entity = registration.event_name().to_owned();
        let kind = registration.entity_kind();

        let sender = self
            .senders
            .get_or_create(&entity.clone(), || async move {
                if provision {
                    match kind {
                        EntityKind::Broadcast => client.create_topic(&entity).await?,
                        EntityKind::Queue => client.create_queue(&entity).await?,
                    }
                }

                client.create_sender(&entity).await
            })
            .await?;

        Ok(sender)
    }
}

#[async_trait]
impl EventTransport for ServiceBusTransport {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn send_one(
        &self,
        message: OutgoingMessage,
        registration: &EventRegistration,
    ) -> Result<Option<ScheduledMarker>, TransportError> {
        let runtime = self.runtime()?;
        let sender = self
            .sender(registration, runtime.configuration.enable_entity_creation)
            .await?;

        match message.scheduled {
            Some(at) => {
                let sequence_number = sender.schedule(&message, at).await?;
                Ok(Some(ScheduledMarker::new(sequence_number.to_string())))
            }
            None => {
                sender.send(&message).await?;
                Ok(None)
            }
        }
    }

    async fn send_many(
        &self,
        messages: Vec<OutgoingMessage>,
        registration: &EventRegistration,
    ) -> Result<Vec<Option<ScheduledMarker>>, TransportError> {
        // Scheduled messages each need their own sequence number, so only
        // immediate batches take the native path.
        if messages.iter().any(|m| m.scheduled.is_some()) {
            let mut markers = Vec::with_capacity(messages.len());
            for message in messages {
                markers.push(self.send_one(message, registration).await?);
            }
            return Ok(markers);
        }

        let runtime = self.runtime()?;
        let sender = self
            .sender(registration, runtime.configuration.enable_entity_creation)
            .await?;

        sender.send_batch(&messages).await?;
        Ok(vec![None; messages.len()])
    }

    async fn cancel_scheduled(
        &self,
        marker: ScheduledMarker,
        registration: &EventRegistration,
    ) -> Result<(), TransportError> {
        self.runtime()?;

        let sequence_number: i64 = marker
            .as_str()
            .parse()
            .map_err(|_| TransportError::Broker("malformed scheduled marker".into()))?;

        let sender = self.sender(registration, false).await?;
        sender.cancel_scheduled(sequence_number).await?;

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
            if provision {
                match registration.entity_kind() {
                    EntityKind::Broadcast => {
                        self.client.create_topic(registration.event_name()).await?
                    }
                    EntityKind::Queue => {
                        self.client.create_queue(registration.event_name()).await?
                    }
                }
            }

            for (index, consumer) in registration.consumers().iter().enumerate() {
                let entity = match registration.entity_kind() {
                    EntityKind::Broadcast => {
                        if provision {
                            self.client
                                .create_subscription(
                                    registration.event_name(),
                                    consumer.consumer_name(),
                                )
                                .await?;
                        }

                        ReceiverEntity::Subscription {
                            topic: registration.event_name().to_owned(),
                            subscription: consumer.consumer_name().to_owned(),
                        }
                    }
                    EntityKind::Queue => ReceiverEntity::Queue {
                        queue: registration.event_name().to_owned(),
                    },
                };

                runtime
                    .tasks
                    .spawn(receive_loop(
                        self.client.clone(),
                        entity,
                        registration.clone(),
                        index,
                        runtime.bus.clone(),
                        context.gate.clone(),
                        runtime.tasks.signal(),
                    ))
                    .await;
            }
        }

        Ok(())
    }

    async fn stop(&self, grace: Duration) -> EmptyResult {
        let runtime = self.runtime.lock().unwrap().take();

        if let Some(runtime) = runtime {
            let outstanding = runtime.tasks.stop(grace).await;
            if outstanding > 0 {
                warn!(
                    "{} Service Bus receiver(s) outlived the grace window",
                    outstanding
                );
            }
        }

        self.senders.clear().await;
        Ok(())
    }

    async fn check_health(&self) -> Result<bool, TransportError> {
        match self.client.ping().await {
            Ok(()) => Ok(true),
            Err(error) => {
                warn!("Service Bus health probe failed: {}", error);
                Ok(false)
            }
        }
    }
}

async fn receive_loop(
    client: Arc<dyn ServiceBusClient>,
    entity: ReceiverEntity,
    registration: Arc<EventRegistration>,
    consumer_index: usize,
    bus: EventBus,
    gate: ReadinessGate,
    shutdown: ShutdownSignal,
) {
    gate.opened().await;

    let mut state = ReceiverState::Registered;
    debug!("Receiver for {:?} is {:?}", entity, state);

    let mut stream = match client.subscribe(&entity).await {
        Ok(stream) => stream,
        Err(error) => {
            warn!("Failed to register receiver for {:?}: {}", entity, error);
            return;
        }
    };

    state = ReceiverState::Running;
    debug!("Receiver for {:?} is {:?}", entity, state);

    loop {
        tokio::select! {
            _ = shutdown.requested() => {
                state = ReceiverState::Closed;
                break;
            }
            item = stream.next() => match item {
                Some(Ok(mut delivery)) => {
                    if state == ReceiverState::Faulted {
                        state = ReceiverState::Running;
                        debug!("Receiver for {:?} recovered", entity);
                    }

                    let consumer = &registration.consumers()[consumer_index];
                    let outcome =
                        dispatch_message(delivery.message(), &registration, consumer, &bus).await;

                    settle(&mut *delivery, outcome).await;
                }
                Some(Err(error)) => {
                    state = ReceiverState::Faulted;
                    warn!("Receiver for {:?} faulted: {}", entity, error);
                }
                None => {
                    state = ReceiverState::Closed;
                    warn!("Delivery stream for {:?} ended", entity);
                    break;
                }
            }
        }
    }

    debug!("Receiver for {:?} is {:?}", entity, state);
}

async fn settle(delivery: &mut dyn BrokerDelivery, outcome: DispatchOutcome) {
    let result = match outcome {
        DispatchOutcome::Acknowledge | DispatchOutcome::Discard(_) => {
            delivery.acknowledge().await
        }
        DispatchOutcome::DeadLetter(error) => delivery.dead_letter(&error.to_string()).await,
        DispatchOutcome::Fail(_) => delivery.reject(true).await,
    };

    if let Err(error) = result {
        warn!("Failed to settle delivery: {}", error);
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::bus::EventBus;
    use crate::constants::headers;
    use crate::context::EventContext;
    use crate::registration::EventConsumer;
    use crate::transport::IncomingMessage;
    use futures::channel::mpsc;
    use pretty_assertions::assert_eq;
    use serde::{Deserialize, Serialize};
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::time::{sleep, timeout};

    struct FakeSender {
        sent: StdMutex<Vec<OutgoingMessage>>,
        scheduled: StdMutex<Vec<(i64, OutgoingMessage)>>,
        cancelled: StdMutex<Vec<i64>>,
        sequence: AtomicI64,
    }

    impl FakeSender {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: StdMutex::new(Vec::new()),
                scheduled: StdMutex::new(Vec::new()),
                cancelled: StdMutex::new(Vec::new()),
                sequence: AtomicI64::new(1),
            })
        }
    }

    #[async_trait]
    impl ServiceBusSender for FakeSender {
        async fn send(&self, message: &OutgoingMessage) -> EmptyResult {
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }

        async fn send_batch(&self, messages: &[OutgoingMessage]) -> EmptyResult {
            self.sent.lock().unwrap().extend_from_slice(messages);
            Ok(())
        }

        async fn schedule(
            &self,
            message: &OutgoingMessage,
            _at: DateTime<Utc>,
        ) -> Result<i64, BoxedError> {
            let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
            self.scheduled
                .lock()
                .unwrap()
                .push((sequence, message.clone()));
            Ok(sequence)
        }

        async fn cancel_scheduled(&self, sequence_number: i64) -> EmptyResult {
            self.scheduled
                .lock()
                .unwrap()
                .retain(|(sequence, _)| *sequence != sequence_number);
            self.cancelled.lock().unwrap().push(sequence_number);
            Ok(())
        }
    }

    struct FakeDelivery {
        message: IncomingMessage,
        dead_lettered: Arc<StdMutex<Option<String>>>,
        completed: Arc<StdMutex<bool>>,
    }

    #[async_trait]
    impl BrokerDelivery for FakeDelivery {
        fn message(&self) -> IncomingMessage {
            self.message.clone()
        }

        async fn acknowledge(&mut self) -> EmptyResult {
            *self.completed.lock().unwrap() = true;
            Ok(())
        }

        async fn reject(&mut self, _requeue: bool) -> EmptyResult {
            Ok(())
        }

        fn supports_dead_letter(&self) -> bool {
            true
        }

        async fn dead_letter(&mut self, reason: &str) -> EmptyResult {
            *self.dead_lettered.lock().unwrap() = Some(reason.to_owned());
            Ok(())
        }
    }

    type DeliveryFeed = mpsc::UnboundedSender<Result<Box<dyn BrokerDelivery>, BoxedError>>;

    #[derive(Default)]
    struct FakeNamespace {
        senders: StdMutex<HashMap<String, Arc<FakeSender>>>,
        topics: StdMutex<Vec<String>>,
        subscriptions: StdMutex<Vec<(String, String)>>,
        feeds: StdMutex<HashMap<ReceiverEntity, DeliveryFeed>>,
    }

    impl FakeNamespace {
        fn sender(&self, entity: &str) -> Arc<FakeSender> {
            self.senders
                .lock()
                .unwrap()
                .entry(entity.to_owned())
                .or_insert_with(FakeSender::new)
                .clone()
        }

        fn feed(&self, entity: &ReceiverEntity) -> DeliveryFeed {
            self.feeds.lock().unwrap().get(entity).unwrap().clone()
        }
    }

    #[async_trait]
    impl ServiceBusClient for FakeNamespace {
        async fn create_queue(&self, _name: &str) -> EmptyResult {
            Ok(())
        }

        async fn create_topic(&self, name: &str) -> EmptyResult {
            self.topics.lock().unwrap().push(name.to_owned());
            Ok(())
        }

        async fn create_subscription(&self, topic: &str, subscription: &str) -> EmptyResult {
            self.subscriptions
                .lock()
                .unwrap()
                .push((topic.to_owned(), subscription.to_owned()));
            Ok(())
        }

        async fn create_sender(
            &self,
            entity: &str,
        ) -> Result<Arc<dyn ServiceBusSender>, BoxedError> {
            Ok(self.sender(entity))
        }

        async fn subscribe(&self, entity: &ReceiverEntity) -> Result<DeliveryStream, BoxedError> {
            let (tx, rx) = mpsc::unbounded();
            self.feeds.lock().unwrap().insert(entity.clone(), tx);
            Ok(rx.boxed())
        }

        async fn ping(&self) -> EmptyResult {
            Ok(())
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct InvoicePaid {
        invoice: String,
    }

    #[derive(Default)]
    struct RefusingConsumer;

    #[async_trait]
    impl EventConsumer for RefusingConsumer {
        type Event = InvoicePaid;

        async fn consume(&self, _context: &EventContext<InvoicePaid>) -> EmptyResult {
            Err("ledger closed".into())
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

    fn serialized_invoice() -> Vec<u8> {
        br#"{"Id":"inv-1","Event":{"invoice":"A-113"}}"#.to_vec()
    }

    #[tokio::test]
    async fn provision_topics_and_subscriptions_on_start() {
        let namespace = Arc::new(FakeNamespace::default());

        let bus = EventBus::builder()
            .add_transport(ServiceBusTransport::new(namespace.clone()))
            .register_event::<InvoicePaid, _>(|event| {
                event.consume_with(RefusingConsumer::default);
            })
            .build()
            .unwrap();

        bus.start().await.unwrap();

        assert_eq!(namespace.topics.lock().unwrap().as_slice(), &["invoice-paid"]);
        let subscriptions = namespace.subscriptions.lock().unwrap();
        assert_eq!(subscriptions.len(), 1);
        assert_eq!(subscriptions[0].0, "invoice-paid");
        assert!(subscriptions[0].1.contains("refusing-consumer"));
    }

    #[tokio::test]
    async fn return_sequence_numbers_as_markers_and_cancel_by_them() {
        let namespace = Arc::new(FakeNamespace::default());

        let bus = EventBus::builder()
            .add_transport(ServiceBusTransport::new(namespace.clone()))
            .register_event::<InvoicePaid, _>(|_| {})
            .build()
            .unwrap();

        bus.start().await.unwrap();

        let marker = bus
            .publisher()
            .publish(
                InvoicePaid {
                    invoice: "A-113".into(),
                },
                Some(Utc::now() + chrono::Duration::minutes(10)),
            )
            .await
            .unwrap()
            .expect("a scheduled publish returns a marker");

        assert_eq!(marker.as_str(), "1");

        let sender = namespace.sender("invoice-paid");
        assert_eq!(sender.scheduled.lock().unwrap().len(), 1);

        bus.publisher().cancel::<InvoicePaid>(marker).await.unwrap();
        assert!(sender.scheduled.lock().unwrap().is_empty());
        assert_eq!(sender.cancelled.lock().unwrap().as_slice(), &[1]);
    }

    #[tokio::test]
    async fn dead_letter_natively_when_the_consumer_fails() {
        let namespace = Arc::new(FakeNamespace::default());

        let bus = EventBus::builder()
            .add_transport(ServiceBusTransport::new(namespace.clone()))
            .register_event::<InvoicePaid, _>(|event| {
                event.consume_with(RefusingConsumer::default);
            })
            .build()
            .unwrap();

        bus.start().await.unwrap();

        // The receiver registers on a background task once the gate opens.
        wait_until(|| !namespace.feeds.lock().unwrap().is_empty()).await;

        let entity = {
            let feeds = namespace.feeds.lock().unwrap();
            feeds.keys().next().cloned().expect("a receiver registered")
        };

        let dead_lettered = Arc::new(StdMutex::new(None));
        let completed = Arc::new(StdMutex::new(false));

        let delivery = FakeDelivery {
            message: IncomingMessage {
                body: serialized_invoice(),
                content_type: Some("application/json".into()),
                headers: HashMap::from([(
                    headers::ID.to_owned(),
                    Value::String("inv-1".into()),
                )]),
                sequence: Some("7".into()),
            },
            dead_lettered: dead_lettered.clone(),
            completed: completed.clone(),
        };

        namespace
            .feed(&entity)
            .unbounded_send(Ok(Box::new(delivery)))
            .unwrap();

        wait_until(|| dead_lettered.lock().unwrap().is_some()).await;

        let reason = dead_lettered.lock().unwrap().clone().unwrap();
        assert!(reason.contains("ledger closed"));
        assert!(!*completed.lock().unwrap());

        bus.stop(Duration::from_secs(1)).await.unwrap();
    }
}
