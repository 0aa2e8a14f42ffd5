//! The bus façade tying registrations, serialization and transports together
//!
//! An [`EventBus`] is assembled once through its builder: transports are
//! attached, events and consumers registered, and building freezes the
//! registry (deriving every wire name and validating the configuration).
//! Starting the bus starts every transport in registration order and then
//! opens the readiness gate that receive loops wait on.

mod publisher;

pub use publisher::EventPublisher;

use crate::config::BusConfiguration;
use crate::context::EventContext;
use crate::lifecycle::{GateControl, ReadinessGate};
use crate::registration::{
    ConfigurationError, EventConfigurator, EventRegistration, Registry, RegistryBuilder,
    RegistrationError,
};
use crate::serialization::{HostInfo, SerializationError};
use crate::transport::{
    prepare_outgoing, EventTransport, ScheduledMarker, TransportError, TransportStartContext,
};
use crate::EmptyResult;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::Instrument;

/// Errors raised by publish and cancel operations
#[derive(Debug, Error)]
pub enum PublishError {
    /// The event type has no registration
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// The payload failed to serialize; nothing was sent
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// The transport rejected the operation
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The context was never handed out by a bus
    #[error("the context is not bound to a bus")]
    NotBound,

    /// The owning transport is not attached to this bus
    #[error("transport {0:?} is not attached to this bus")]
    UnknownTransport(String),
}

/// Builder assembling an [`EventBus`]
#[derive(Default)]
pub struct EventBusBuilder {
    configuration: BusConfiguration,
    host: HostInfo,
    transports: Vec<Arc<dyn EventTransport>>,
    registry: RegistryBuilder,
}

impl EventBusBuilder {
    /// Creates a builder with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the bus-wide configuration
    pub fn with_configuration(mut self, configuration: BusConfiguration) -> Self {
        self.configuration = configuration;
        self
    }

    /// Replaces the host metadata attached to published events
    pub fn with_host(mut self, host: HostInfo) -> Self {
        self.host = host;
        self
    }

    /// Attaches a transport
    ///
    /// Transports holding shared state (the in-memory harness for instance)
    /// are cheap to clone, so callers can keep one handle and attach another.
    pub fn add_transport(mut self, transport: impl EventTransport + 'static) -> Self {
        self.transports.push(Arc::new(transport));
        self
    }

    /// Registers an event type, or configures it further when already known
    pub fn register_event<T, F>(mut self, configure: F) -> Self
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce(&mut EventConfigurator<'_, T>),
    {
        self.registry.register_event::<T, F>(configure);
        self
    }

    /// Freezes the registry and produces the bus
    ///
    /// When exactly one transport is attached it becomes the default for
    /// registrations that did not pick one themselves.
    pub fn build(self) -> Result<EventBus, ConfigurationError> {
        let mut transports = HashMap::new();
        let mut transport_order = Vec::with_capacity(self.transports.len());
        let mut transport_names = HashSet::new();

        for transport in self.transports {
            let name = transport.name().to_owned();
            if transports.insert(name.clone(), transport).is_some() {
                return Err(ConfigurationError::DuplicateTransport(name));
            }

            transport_names.insert(name.clone());
            transport_order.push(name);
        }

        let default_transport = match transport_order.as_slice() {
            [only] => Some(only.as_str()),
            _ => None,
        };

        let registry = self.registry.freeze(
            &self.configuration.naming,
            &self.host,
            &transport_names,
            default_transport,
            self.configuration.default_unhandled_error_behavior,
        )?;

        let (gate, gate_control) = ReadinessGate::new();

        Ok(EventBus {
            inner: Arc::new(BusInner {
                configuration: Arc::new(self.configuration),
                host: self.host,
                registry: Arc::new(registry),
                transports,
                transport_order,
                gate,
                gate_control,
                started: AtomicBool::new(false),
            }),
        })
    }
}

struct BusInner {
    configuration: Arc<BusConfiguration>,
    host: HostInfo,
    registry: Arc<Registry>,
    transports: HashMap<String, Arc<dyn EventTransport>>,
    transport_order: Vec<String>,
    gate: ReadinessGate,
    gate_control: GateControl,
    started: AtomicBool,
}

/// Routes publishes to owning transports and manages their lifecycle
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Starts assembling a bus
    pub fn builder() -> EventBusBuilder {
        EventBusBuilder::new()
    }

    /// Publisher surface wrapping raw payloads into contexts
    pub fn publisher(&self) -> EventPublisher {
        EventPublisher::new(self.clone())
    }

    /// The frozen registry
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// The bus-wide configuration
    pub fn configuration(&self) -> &BusConfiguration {
        &self.inner.configuration
    }

    fn transport_for(
        &self,
        registration: &EventRegistration,
    ) -> Result<Arc<dyn EventTransport>, PublishError> {
        self.inner
            .transports
            .get(registration.transport_name())
            .cloned()
            .ok_or_else(|| PublishError::UnknownTransport(registration.transport_name().to_owned()))
    }

    /// Publishes a prepared context through the owning transport
    pub async fn publish_context<T>(
        &self,
        mut context: EventContext<T>,
        scheduled: Option<DateTime<Utc>>,
    ) -> Result<Option<ScheduledMarker>, PublishError>
    where
        T: Send + Sync + 'static,
    {
        let registration = self.inner.registry.by_event_type::<T>()?;
        let transport = self.transport_for(&registration)?;

        let (message, span) = prepare_outgoing(
            &mut context,
            &registration,
            &self.inner.host,
            transport.name(),
            scheduled,
        )
        .await?;

        let marker = transport
            .send_one(message, &registration)
            .instrument(span)
            .await?;

        Ok(marker)
    }

    /// Publishes a batch of prepared contexts through the owning transport
    pub async fn publish_context_many<T>(
        &self,
        contexts: Vec<EventContext<T>>,
        scheduled: Option<DateTime<Utc>>,
    ) -> Result<Vec<Option<ScheduledMarker>>, PublishError>
    where
        T: Send + Sync + 'static,
    {
        if contexts.is_empty() {
            return Ok(Vec::new());
        }

        let registration = self.inner.registry.by_event_type::<T>()?;
        let transport = self.transport_for(&registration)?;

        let mut messages = Vec::with_capacity(contexts.len());
        for mut context in contexts {
            let (message, _span) = prepare_outgoing(
                &mut context,
                &registration,
                &self.inner.host,
                transport.name(),
                scheduled,
            )
            .await?;
            messages.push(message);
        }

        Ok(transport.send_many(messages, &registration).await?)
    }

    /// Cancels a scheduled publish by its marker
    pub async fn cancel<T>(&self, marker: ScheduledMarker) -> Result<(), PublishError>
    where
        T: Send + Sync + 'static,
    {
        let registration = self.inner.registry.by_event_type::<T>()?;
        let transport = self.transport_for(&registration)?;

        Ok(transport.cancel_scheduled(marker, &registration).await?)
    }

    /// Cancels a batch of scheduled publishes
    pub async fn cancel_many<T>(&self, markers: Vec<ScheduledMarker>) -> Result<(), PublishError>
    where
        T: Send + Sync + 'static,
    {
        for marker in markers {
            self.cancel::<T>(marker).await?;
        }
        Ok(())
    }

    /// Starts every transport in registration order, then opens the gate
    ///
    /// By the time a transport starts, serializers are bound and the
    /// registry is frozen; consumers still only run once the gate opens
    /// after the last transport started.
    pub async fn start(&self) -> EmptyResult {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            warn!("Event bus is already started");
            return Ok(());
        }

        for name in &self.inner.transport_order {
            let transport = &self.inner.transports[name];

            let context = TransportStartContext {
                registry: self.inner.registry.clone(),
                registrations: self.inner.registry.by_transport(name),
                gate: self.inner.gate.clone(),
                bus: self.clone(),
                configuration: self.inner.configuration.clone(),
            };

            transport.start(context).await?;
            info!("Transport {} started", name);
        }

        self.inner.gate_control.open();
        info!("Event bus ready");

        Ok(())
    }

    /// Stops every transport, waiting out the grace window per transport
    ///
    /// Transports are stopped in reverse start order. All of them are asked
    /// to stop even when one fails; the first failure is returned.
    pub async fn stop(&self, grace: Duration) -> EmptyResult {
        info!("Stopping event bus");

        let mut first_failure = None;

        for name in self.inner.transport_order.iter().rev() {
            let transport = &self.inner.transports[name];

            if let Err(error) = transport.stop(grace).await {
                warn!("Transport {} failed to stop cleanly: {}", name, error);
                first_failure.get_or_insert(error);
            }
        }

        match first_failure {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    /// Whether every transport currently reports healthy
    pub async fn check_health(&self) -> bool {
        for name in &self.inner.transport_order {
            match self.inner.transports[name].check_health().await {
                Ok(true) => {}
                Ok(false) => return false,
                Err(error) => {
                    warn!("Health check of transport {} failed: {}", name, error);
                    return false;
                }
            }
        }

        true
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("transports", &self.inner.transport_order)
            .field("registrations", &self.inner.registry.all().len())
            .finish()
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::registration::{EventConsumer, UnhandledErrorBehavior};
    use crate::transport::in_memory::InMemoryTransport;
    use crate::EmptyResult;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use tokio::time::{sleep, timeout};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct SampleEvent {
        make: String,
        model: String,
        registration: String,
        vin: String,
        year: u32,
    }

    impl SampleEvent {
        fn roadster() -> Self {
            Self {
                make: "TESLA".into(),
                model: "Roadster 2.0".into(),
                registration: "1234567890".into(),
                vin: "5YJ3E1EA5KF328931".into(),
                year: 2021,
            }
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct FollowUpEvent {
        note: String,
    }

    #[derive(Default)]
    struct SampleEventConsumer;

    #[async_trait]
    impl EventConsumer for SampleEventConsumer {
        type Event = SampleEvent;

        async fn consume(&self, _context: &EventContext<SampleEvent>) -> EmptyResult {
            Ok(())
        }
    }

    #[derive(Default)]
    struct StallingConsumer;

    #[async_trait]
    impl EventConsumer for StallingConsumer {
        type Event = SampleEvent;

        async fn consume(&self, _context: &EventContext<SampleEvent>) -> EmptyResult {
            Err("engine stalled".into())
        }
    }

    #[derive(Default)]
    struct SlowConsumer;

    #[async_trait]
    impl EventConsumer for SlowConsumer {
        type Event = SampleEvent;

        async fn consume(&self, _context: &EventContext<SampleEvent>) -> EmptyResult {
            sleep(Duration::from_millis(150)).await;
            Ok(())
        }
    }

    #[derive(Default)]
    struct RepublishingConsumer;

    #[async_trait]
    impl EventConsumer for RepublishingConsumer {
        type Event = SampleEvent;

        async fn consume(&self, context: &EventContext<SampleEvent>) -> EmptyResult {
            context
                .publish_follow_up(
                    FollowUpEvent {
                        note: "inspected".into(),
                    },
                    None,
                )
                .await?;
            Ok(())
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
    async fn deliver_published_events_to_their_consumer() {
        let harness = InMemoryTransport::new();

        let bus = EventBus::builder()
            .add_transport(harness.clone())
            .register_event::<SampleEvent, _>(|event| {
                event.consume_with(SampleEventConsumer::default);
            })
            .build()
            .unwrap();

        bus.start().await.unwrap();
        bus.publisher()
            .publish(SampleEvent::roadster(), None)
            .await
            .unwrap();

        wait_until(|| !harness.consumed_records().is_empty()).await;

        let consumed = harness.consumed::<SampleEvent>().await;
        assert_eq!(consumed.len(), 1);
        assert_eq!(*consumed[0].event(), SampleEvent::roadster());
        assert!(harness.failed::<SampleEvent>().await.is_empty());
    }

    #[tokio::test]
    async fn link_consumed_events_to_their_publish() {
        let harness = InMemoryTransport::new();

        let bus = EventBus::builder()
            .add_transport(harness.clone())
            .register_event::<SampleEvent, _>(|event| {
                event.consume_with(SampleEventConsumer::default);
            })
            .build()
            .unwrap();

        bus.start().await.unwrap();
        bus.publisher()
            .publish(SampleEvent::roadster(), None)
            .await
            .unwrap();

        wait_until(|| !harness.consumed_records().is_empty()).await;

        let published = harness.published::<SampleEvent>().await;
        let consumed = harness.consumed::<SampleEvent>().await;

        let source_id = published[0].id().unwrap();
        assert!(!source_id.is_empty());
        assert_eq!(consumed[0].correlation_id(), Some(source_id));
        assert_ne!(consumed[0].id(), published[0].id());
    }

    #[tokio::test]
    async fn record_failures_with_their_cause() {
        let harness = InMemoryTransport::new();

        let bus = EventBus::builder()
            .add_transport(harness.clone())
            .register_event::<SampleEvent, _>(|event| {
                event.consume_with_behavior(
                    StallingConsumer::default,
                    UnhandledErrorBehavior::Deadletter,
                );
            })
            .build()
            .unwrap();

        bus.start().await.unwrap();
        bus.publisher()
            .publish(SampleEvent::roadster(), None)
            .await
            .unwrap();

        wait_until(|| !harness.failed_records().is_empty()).await;

        let failed = harness.failed::<SampleEvent>().await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].1.causes(), &["engine stalled".to_owned()]);
        assert!(harness.consumed::<SampleEvent>().await.is_empty());
    }

    #[tokio::test]
    async fn account_for_every_dispatch_attempt() {
        let harness = InMemoryTransport::new();

        let bus = EventBus::builder()
            .add_transport(harness.clone())
            .register_event::<SampleEvent, _>(|event| {
                event.consume_with(SampleEventConsumer::default);
                event.consume_with_behavior(
                    StallingConsumer::default,
                    UnhandledErrorBehavior::Discard,
                );
            })
            .build()
            .unwrap();

        bus.start().await.unwrap();
        bus.publisher()
            .publish_many(vec![SampleEvent::roadster(), SampleEvent::roadster()], None)
            .await
            .unwrap();

        // Two publishes times two consumers makes four attempts.
        wait_until(|| {
            harness.consumed_records().len() + harness.failed_records().len() == 4
        })
        .await;

        assert_eq!(harness.consumed_records().len(), 2);
        assert_eq!(harness.failed_records().len(), 2);
    }

    #[tokio::test]
    async fn correlate_republished_events_with_their_trigger() {
        let harness = InMemoryTransport::new();

        let bus = EventBus::builder()
            .add_transport(harness.clone())
            .register_event::<SampleEvent, _>(|event| {
                event.consume_with(RepublishingConsumer::default);
            })
            .register_event::<FollowUpEvent, _>(|_| {})
            .build()
            .unwrap();

        bus.start().await.unwrap();
        bus.publisher()
            .publish(SampleEvent::roadster(), None)
            .await
            .unwrap();

        wait_until(|| {
            harness
                .published_records()
                .iter()
                .any(|record| record.event_name == "follow-up-event")
        })
        .await;

        let consumed = harness.consumed::<SampleEvent>().await;
        let follow_ups = harness.published::<FollowUpEvent>().await;

        assert_eq!(follow_ups.len(), 1);
        assert_eq!(follow_ups[0].correlation_id(), consumed[0].id());
    }

    #[tokio::test]
    async fn finish_in_flight_work_before_stop_returns() {
        let harness = InMemoryTransport::new();

        let bus = EventBus::builder()
            .add_transport(harness.clone())
            .register_event::<SampleEvent, _>(|event| {
                event.consume_with(SlowConsumer::default);
            })
            .build()
            .unwrap();

        bus.start().await.unwrap();
        bus.publisher()
            .publish(SampleEvent::roadster(), None)
            .await
            .unwrap();

        // Give the dispatch task a moment to enter the consumer.
        sleep(Duration::from_millis(30)).await;

        bus.stop(Duration::from_secs(2)).await.unwrap();

        assert_eq!(harness.consumed_records().len(), 1);

        // Nothing is dispatched after stop returned.
        let result = bus.publisher().publish(SampleEvent::roadster(), None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn reject_publishes_of_unregistered_events() {
        let bus = EventBus::builder()
            .add_transport(InMemoryTransport::new())
            .build()
            .unwrap();

        bus.start().await.unwrap();

        let result = bus.publisher().publish(SampleEvent::roadster(), None).await;
        assert!(matches!(result, Err(PublishError::Registration(_))));
    }

    #[tokio::test]
    async fn refuse_cancelling_where_unsupported() {
        let bus = EventBus::builder()
            .add_transport(InMemoryTransport::new())
            .register_event::<SampleEvent, _>(|_| {})
            .build()
            .unwrap();

        bus.start().await.unwrap();

        let result = bus
            .cancel::<SampleEvent>(ScheduledMarker::new("whatever"))
            .await;

        assert!(matches!(
            result,
            Err(PublishError::Transport(TransportError::NotSupported(_)))
        ));
    }

    #[tokio::test]
    async fn aggregate_transport_health() {
        let bus = EventBus::builder()
            .add_transport(InMemoryTransport::new())
            .build()
            .unwrap();

        bus.start().await.unwrap();
        assert!(bus.check_health().await);
    }

    #[tokio::test]
    async fn honor_delivery_delays() {
        let harness = InMemoryTransport::with_delivery_delay(Duration::from_millis(60));

        let bus = EventBus::builder()
            .add_transport(harness.clone())
            .register_event::<SampleEvent, _>(|event| {
                event.consume_with(SampleEventConsumer::default);
            })
            .build()
            .unwrap();

        bus.start().await.unwrap();
        bus.publisher()
            .publish(SampleEvent::roadster(), None)
            .await
            .unwrap();

        sleep(Duration::from_millis(20)).await;
        assert!(harness.consumed_records().is_empty());

        wait_until(|| !harness.consumed_records().is_empty()).await;
    }
}
