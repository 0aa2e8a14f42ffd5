//! The contract every transport satisfies and the pipeline they share
//!
//! A transport owns the broker-specific verbs: sending serialized messages,
//! scheduling and cancelling them where the broker allows it, driving receive
//! loops and answering health checks. Everything broker-agnostic — id
//! assignment, serialization, tracing propagation, consumer dispatch and the
//! acknowledgement policy — lives in [`pipeline`] and is shared by all of
//! them.
//!
//! Concrete broker SDKs stay outside the crate: each transport declares a
//! narrow client capability trait covering exactly the operations it calls,
//! the host implements it over its SDK of choice and tests implement it
//! in-process.

mod cache;
mod pipeline;
mod poll;

pub mod amazon_sqs;
pub mod event_hubs;
pub mod in_memory;
pub mod kinesis;
pub mod queue_storage;
pub mod rabbitmq;
pub mod service_bus;

pub use cache::SingleFlightCache;
pub use pipeline::DispatchOutcome;

pub(crate) use pipeline::{dispatch_message, prepare_outgoing};
pub(crate) use poll::{run_poll_loop, PollSource};

use crate::bus::EventBus;
use crate::config::BusConfiguration;
use crate::lifecycle::ReadinessGate;
use crate::registration::{EventRegistration, Registry};
use crate::serialization::SerializationError;
use crate::{BoxedError, EmptyResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Serialized message on its way to a broker
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Identifier of the event being carried
    pub event_id: String,
    /// Serialized payload
    pub body: Vec<u8>,
    /// Declared content type of the payload
    pub content_type: String,
    /// Headers for the transport's native header channel
    pub headers: HashMap<String, Value>,
    /// Instant after which the message is no longer relevant
    pub expires: Option<DateTime<Utc>>,
    /// Instant before which the message must not be delivered
    pub scheduled: Option<DateTime<Utc>>,
}

/// Raw message received from a broker, normalized across transports
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Serialized payload
    pub body: Vec<u8>,
    /// Declared content type, when the broker carries one
    pub content_type: Option<String>,
    /// Headers read from the transport's native header channel
    pub headers: HashMap<String, Value>,
    /// Broker-assigned sequence number or receipt, for diagnostics
    pub sequence: Option<String>,
}

/// Transport-opaque handle to a scheduled publish
///
/// Only a marker returned from a scheduled publish can later be passed to
/// cancel, and only on the transport that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledMarker(String);

impl ScheduledMarker {
    /// Wraps a transport-specific identifier
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The transport-specific identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ScheduledMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors raised by transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    /// The broker or this transport does not support the operation
    #[error("{0} is not supported by this transport")]
    NotSupported(&'static str),

    /// The underlying broker client failed
    #[error("broker operation failed: {0}")]
    Broker(#[from] BoxedError),

    /// The payload could not be serialized
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// The transport was used before its start or after its stop
    #[error("transport {0} is not running")]
    NotRunning(&'static str),
}

/// Everything a transport needs to run, handed over on start
pub struct TransportStartContext {
    /// The frozen registry
    pub registry: Arc<Registry>,
    /// Registrations bound to this transport, in registration order
    pub registrations: Vec<Arc<EventRegistration>>,
    /// Gate that must open before the first message is processed
    pub gate: ReadinessGate,
    /// Bus handle used to bind consume contexts for republishing
    pub bus: EventBus,
    /// Bus-wide configuration
    pub configuration: Arc<BusConfiguration>,
}

/// Contract every transport implementation satisfies
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Stable name the bus routes registrations by
    fn name(&self) -> &'static str;

    /// Sends one serialized message, returning a marker when it was scheduled
    async fn send_one(
        &self,
        message: OutgoingMessage,
        registration: &EventRegistration,
    ) -> Result<Option<ScheduledMarker>, TransportError>;

    /// Sends a batch of serialized messages
    ///
    /// Transports with a native batch API override this; the default falls
    /// back to sequential sends.
    async fn send_many(
        &self,
        messages: Vec<OutgoingMessage>,
        registration: &EventRegistration,
    ) -> Result<Vec<Option<ScheduledMarker>>, TransportError> {
        warn!(
            "Transport {} lacks native batching, sending {} messages sequentially",
            self.name(),
            messages.len()
        );

        let mut markers = Vec::with_capacity(messages.len());
        for message in messages {
            markers.push(self.send_one(message, registration).await?);
        }

        Ok(markers)
    }

    /// Cancels a scheduled publish identified by its marker
    async fn cancel_scheduled(
        &self,
        marker: ScheduledMarker,
        registration: &EventRegistration,
    ) -> Result<(), TransportError> {
        let _ = (marker, registration);
        Err(TransportError::NotSupported("cancelling scheduled messages"))
    }

    /// Provisions entities and spawns receive loops
    async fn start(&self, context: TransportStartContext) -> EmptyResult;

    /// Stops receive loops, draining in-flight work within the grace window
    async fn stop(&self, grace: Duration) -> EmptyResult;

    /// Whether the broker is currently reachable and serving
    async fn check_health(&self) -> Result<bool, TransportError>;
}

/// Delivery handed out by a push-model broker client
///
/// Mirrors what broker SDKs expose on received messages: the payload, the
/// native header channel and the settlement verbs.
#[async_trait]
pub trait BrokerDelivery: Send {
    /// Uniform view of the delivered message
    fn message(&self) -> IncomingMessage;

    /// Settles the delivery as successfully processed
    async fn acknowledge(&mut self) -> EmptyResult;

    /// Settles the delivery as failed, optionally requeueing it
    async fn reject(&mut self, requeue: bool) -> EmptyResult;

    /// Whether the broker can dead-letter this delivery natively
    fn supports_dead_letter(&self) -> bool {
        false
    }

    /// Moves the delivery to the broker-native dead-letter destination
    async fn dead_letter(&mut self, reason: &str) -> EmptyResult {
        let _ = reason;
        Err("native dead-lettering is not supported".into())
    }
}

/// Stream of deliveries handed out by a push-model broker client
pub type DeliveryStream = futures::stream::BoxStream<'static, Result<Box<dyn BrokerDelivery>, BoxedError>>;
