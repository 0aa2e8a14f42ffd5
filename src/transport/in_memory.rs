//! Process-local transport doubling as a test harness
//!
//! Everything that passes through is recorded: publishes, successful
//! consumptions and failed ones, each retrievable in raw or typed form.
//! Dispatch happens on background tasks so scheduled publishes and the
//! optional delivery delay behave like a real broker, just faster.

use super::{
    dispatch_message, DispatchOutcome, EventTransport, IncomingMessage, OutgoingMessage,
    ScheduledMarker, TransportError, TransportStartContext,
};
use crate::bus::EventBus;
use crate::constants::headers;
use crate::context::EventContext;
use crate::lifecycle::{ReadinessGate, TaskSet};
use crate::registration::{EventRegistration, Registry};
use crate::{BoxedError, EmptyResult};
use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

/// Name the in-memory transport registers under
pub const NAME: &str = "in-memory";

/// Serializable error-chain snapshot attached to failed deliveries
///
/// Retains the message of every error in the source chain so tests can
/// assert on causes without knowing the concrete error types involved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCause {
    causes: Vec<String>,
}

impl FailureCause {
    /// Creates a snapshot from any error, walking its source chain
    pub fn new(error: &(dyn Error + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source: Option<&(dyn Error + 'static)> = Some(error);

        while let Some(error) = source {
            causes.push(error.to_string());
            source = error.source();
        }

        Self { causes }
    }

    /// Creates a snapshot from a boxed error
    pub fn from_boxed(error: &BoxedError) -> Self {
        Self::new(error.as_ref())
    }

    /// Messages of the error chain, outermost first
    pub fn causes(&self) -> &[String] {
        &self.causes
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.causes.split_first() {
            None => write!(f, "unknown failure"),
            Some((first, rest)) => {
                write!(f, "{}", first)?;
                for cause in rest {
                    write!(f, ": {}", cause)?;
                }
                Ok(())
            }
        }
    }
}

impl Error for FailureCause {}

/// One recorded passage of a message through the harness
#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    /// Wire name of the event
    pub event_name: String,
    /// Identifier the message travelled under
    pub event_id: Option<String>,
    /// Correlation identifier the message travelled under
    pub correlation_id: Option<String>,
    /// Serialized payload
    pub body: Vec<u8>,
    /// Declared content type
    pub content_type: Option<String>,
    /// Transport headers
    pub headers: HashMap<String, Value>,
    /// Consumer the record belongs to; absent on publish records
    pub consumer_name: Option<String>,
}

/// A [`DeliveryRecord`] whose consumer failed, with the cause attached
#[derive(Debug, Clone)]
pub struct FailedRecord {
    /// The failed delivery
    pub record: DeliveryRecord,
    /// Why the consumer failed
    pub cause: FailureCause,
}

struct Runtime {
    registry: Arc<Registry>,
    gate: ReadinessGate,
    bus: EventBus,
    tasks: Arc<TaskSet>,
}

struct Inner {
    delivery_delay: Option<Duration>,
    published: Mutex<Vec<DeliveryRecord>>,
    consumed: Mutex<Vec<DeliveryRecord>>,
    failed: Mutex<Vec<FailedRecord>>,
    runtime: Mutex<Option<Arc<Runtime>>>,
}

/// Process-local fan-out transport with recording
#[derive(Clone)]
pub struct InMemoryTransport {
    inner: Arc<Inner>,
}

impl InMemoryTransport {
    /// Creates a harness dispatching as soon as a message is published
    pub fn new() -> Self {
        Self::with_delivery_delay(None)
    }

    /// Creates a harness that waits before each dispatch
    pub fn with_delivery_delay(delay: impl Into<Option<Duration>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                delivery_delay: delay.into(),
                published: Mutex::new(Vec::new()),
                consumed: Mutex::new(Vec::new()),
                failed: Mutex::new(Vec::new()),
                runtime: Mutex::new(None),
            }),
        }
    }

    /// Raw records of everything published
    pub fn published_records(&self) -> Vec<DeliveryRecord> {
        self.inner.published.lock().unwrap().clone()
    }

    /// Raw records of every successful consumption
    pub fn consumed_records(&self) -> Vec<DeliveryRecord> {
        self.inner.consumed.lock().unwrap().clone()
    }

    /// Raw records of every failed consumption
    pub fn failed_records(&self) -> Vec<FailedRecord> {
        self.inner.failed.lock().unwrap().clone()
    }

    /// Published events of one type, deserialized
    pub async fn published<T>(&self) -> Vec<EventContext<T>>
    where
        T: Send + Sync + 'static,
    {
        self.decode(self.published_records()).await
    }

    /// Successfully consumed events of one type, deserialized
    ///
    /// Each context carries the identity it was delivered under: a fresh id
    /// and the publishing event's id as its correlation id.
    pub async fn consumed<T>(&self) -> Vec<EventContext<T>>
    where
        T: Send + Sync + 'static,
    {
        self.decode(self.consumed_records()).await
    }

    /// Failed events of one type, deserialized and paired with their cause
    pub async fn failed<T>(&self) -> Vec<(EventContext<T>, FailureCause)>
    where
        T: Send + Sync + 'static,
    {
        let mut failures = Vec::new();

        for failed in self.failed_records() {
            let cause = failed.cause.clone();
            if let Some(context) = self.decode(vec![failed.record]).await.into_iter().next() {
                failures.push((context, cause));
            }
        }

        failures
    }

    async fn decode<T>(&self, records: Vec<DeliveryRecord>) -> Vec<EventContext<T>>
    where
        T: Send + Sync + 'static,
    {
        let runtime = match self.inner.runtime.lock().unwrap().clone() {
            Some(runtime) => runtime,
            None => return Vec::new(),
        };

        let registration = match runtime.registry.by_event_type::<T>() {
            Ok(registration) => registration,
            Err(_) => return Vec::new(),
        };
        let serializer = match registration.serializer_slot::<T>() {
            Ok(serializer) => serializer,
            Err(_) => return Vec::new(),
        };

        let mut contexts = Vec::new();
        for record in records {
            if record.event_name != registration.event_name() {
                continue;
            }

            if let Ok(mut context) = serializer
                .deserialize(&record.body, record.content_type.as_deref())
                .await
            {
                if let Some(id) = &record.event_id {
                    context.set_id(id.clone());
                }
                if let Some(correlation) = &record.correlation_id {
                    context.set_correlation_id(correlation.clone());
                }
                contexts.push(context);
            }
        }

        contexts
    }

    fn runtime(&self) -> Result<Arc<Runtime>, TransportError> {
        self.inner
            .runtime
            .lock()
            .unwrap()
            .clone()
            .ok_or(TransportError::NotRunning(NAME))
    }

    async fn dispatch(inner: Arc<Inner>, runtime: Arc<Runtime>, message: OutgoingMessage, registration: Arc<EventRegistration>) {
        runtime.gate.opened().await;

        let mut delay = inner.delivery_delay.unwrap_or_default();
        if let Some(scheduled) = message.scheduled {
            delay += (scheduled - Utc::now()).to_std().unwrap_or_default();
        }

        if !delay.is_zero() {
            let shutdown = runtime.tasks.signal();
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.requested() => return,
            }
        }

        for consumer in registration.consumers() {
            let delivered_id = Uuid::new_v4().to_string();

            let mut headers = message.headers.clone();
            headers.insert(headers::ID.to_owned(), Value::String(delivered_id.clone()));
            headers.insert(
                headers::CORRELATION_ID.to_owned(),
                Value::String(message.event_id.clone()),
            );

            let incoming = IncomingMessage {
                body: message.body.clone(),
                content_type: Some(message.content_type.clone()),
                headers: headers.clone(),
                sequence: None,
            };

            let outcome = dispatch_message(incoming, &registration, consumer, &runtime.bus).await;

            let record = DeliveryRecord {
                event_name: registration.event_name().to_owned(),
                event_id: Some(delivered_id),
                correlation_id: Some(message.event_id.clone()),
                body: message.body.clone(),
                content_type: Some(message.content_type.clone()),
                headers,
                consumer_name: Some(consumer.consumer_name().to_owned()),
            };

            match outcome {
                DispatchOutcome::Acknowledge => {
                    inner.consumed.lock().unwrap().push(record);
                }
                DispatchOutcome::DeadLetter(error)
                | DispatchOutcome::Discard(error)
                | DispatchOutcome::Fail(error) => {
                    inner.failed.lock().unwrap().push(FailedRecord {
                        record,
                        cause: FailureCause::from_boxed(&error),
                    });
                }
            }
        }
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventTransport for InMemoryTransport {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn send_one(
        &self,
        message: OutgoingMessage,
        registration: &EventRegistration,
    ) -> Result<Option<ScheduledMarker>, TransportError> {
        let runtime = self.runtime()?;

        let registration = runtime
            .registry
            .by_event_name(registration.event_name())
            .ok_or(TransportError::NotRunning(NAME))?;

        self.inner.published.lock().unwrap().push(DeliveryRecord {
            event_name: registration.event_name().to_owned(),
            event_id: Some(message.event_id.clone()),
            correlation_id: message
                .headers
                .get(headers::CORRELATION_ID)
                .and_then(Value::as_str)
                .map(str::to_owned),
            body: message.body.clone(),
            content_type: Some(message.content_type.clone()),
            headers: message.headers.clone(),
            consumer_name: None,
        });

        let inner = self.inner.clone();
        let task_runtime = runtime.clone();
        runtime
            .tasks
            .spawn(Self::dispatch(inner, task_runtime, message, registration))
            .await;

        Ok(None)
    }

    async fn send_many(
        &self,
        messages: Vec<OutgoingMessage>,
        registration: &EventRegistration,
    ) -> Result<Vec<Option<ScheduledMarker>>, TransportError> {
        let mut markers = Vec::with_capacity(messages.len());
        for message in messages {
            markers.push(self.send_one(message, registration).await?);
        }
        Ok(markers)
    }

    async fn start(&self, context: TransportStartContext) -> EmptyResult {
        debug!(
            "Starting in-memory transport with {} registration(s)",
            context.registrations.len()
        );

        let runtime = Arc::new(Runtime {
            registry: context.registry,
            gate: context.gate,
            bus: context.bus,
            tasks: TaskSet::new(),
        });

        *self.inner.runtime.lock().unwrap() = Some(runtime);
        Ok(())
    }

    async fn stop(&self, grace: Duration) -> EmptyResult {
        let runtime = self.inner.runtime.lock().unwrap().take();

        if let Some(runtime) = runtime {
            let outstanding = runtime.tasks.stop(grace).await;
            if outstanding > 0 {
                debug!("{} in-memory dispatch task(s) still running", outstanding);
            }
        }

        Ok(())
    }

    async fn check_health(&self) -> Result<bool, TransportError> {
        Ok(true)
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;
    use thiserror::Error;

    #[derive(Error, Debug)]
    enum LayeredError {
        #[error("handler rejected the event")]
        Rejected(#[source] std::io::Error),
    }

    #[test]
    fn walk_the_error_chain() {
        let inner = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let cause = FailureCause::new(&LayeredError::Rejected(inner));

        assert_eq!(
            cause.causes(),
            &["handler rejected the event".to_owned(), "disk on fire".to_owned()]
        );
        assert_eq!(cause.to_string(), "handler rejected the event: disk on fire");
    }

    #[test]
    fn format_an_empty_chain() {
        let cause = FailureCause { causes: Vec::new() };
        assert_eq!(cause.to_string(), "unknown failure");
    }

    #[tokio::test]
    async fn refuse_publishes_before_start() {
        let transport = InMemoryTransport::new();

        let message = OutgoingMessage {
            event_id: "id".into(),
            body: Vec::new(),
            content_type: "application/json".into(),
            headers: HashMap::new(),
            expires: None,
            scheduled: None,
        };

        let mut builder = crate::registration::RegistryBuilder::new();
        builder.register_event::<SampleEvent, _>(|_| {});
        let registry = builder
            .freeze(
                &crate::naming::NamingOptions::default(),
                &crate::serialization::HostInfo::new("harness-tests", "0.0.0"),
                &[NAME.to_owned()].into_iter().collect(),
                Some(NAME),
                crate::registration::UnhandledErrorBehavior::Deadletter,
            )
            .unwrap();
        let registration = registry.by_event_type::<SampleEvent>().unwrap();

        let result = transport.send_one(message, &registration).await;
        assert!(matches!(result, Err(TransportError::NotRunning(_))));
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct SampleEvent {
        make: String,
    }
}
