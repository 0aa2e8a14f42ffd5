//! Bindings from event payload shapes to wire names, transports, serializers
//! and consumers
//!
//! Registrations are collected by a [`RegistryBuilder`] while the bus is
//! being configured and frozen into an immutable [`Registry`] when it is
//! built. Freezing derives every wire name exactly once; the registry handed
//! to transports never changes afterwards.

mod store;

pub use store::*;

use crate::bus::EventBus;
use crate::context::EventContext;
use crate::serialization::EventSerializer;
use crate::transport::IncomingMessage;
use crate::EmptyResult;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// Shape of the broker entity an event is published to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum EntityKind {
    /// Broadcast topic delivering to every consumer
    Broadcast,
    /// Point-to-point queue delivering to one consumer
    Queue,
}

/// What a transport does with a message whose consumer failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum UnhandledErrorBehavior {
    /// Move the message to the dead-letter destination
    Deadletter,
    /// Acknowledge the message and drop it
    Discard,
    /// Negatively acknowledge so the broker redelivers, or re-raise
    Fail,
}

/// Entity which may consume events of a single payload shape
///
/// A fresh instance is created for every delivery through the factory given
/// at registration, so implementations may hold per-delivery state freely.
#[async_trait]
pub trait EventConsumer: Send + Sync {
    /// Payload shape this consumer handles
    type Event: Send + Sync;

    /// Processes one event and returns whether it succeeded or failed
    async fn consume(&self, context: &EventContext<Self::Event>) -> EmptyResult;
}

/// Future returned by a consumer dispatcher
pub type DispatchFuture = BoxFuture<'static, EmptyResult>;

/// Typed dispatch closure captured when a consumer is registered
///
/// Receive loops invoke it with the raw message; deserialization, bus
/// binding and consumer instantiation all happen inside, so no type
/// information needs to be reconstructed at runtime.
pub type Dispatcher =
    Arc<dyn Fn(IncomingMessage, Arc<EventRegistration>, EventBus) -> DispatchFuture + Send + Sync>;

/// Holds a typed serializer behind the type-erased registration
pub(crate) struct SerializerSlot<T: Send + Sync>(pub(crate) Arc<dyn EventSerializer<T>>);

/// Frozen binding of an event payload shape to its wire identity
pub struct EventRegistration {
    pub(crate) event_type: TypeId,
    pub(crate) type_name: &'static str,
    pub(crate) event_name: String,
    pub(crate) transport_name: String,
    pub(crate) entity_kind: EntityKind,
    pub(crate) serializer: Arc<dyn Any + Send + Sync>,
    pub(crate) consumers: Vec<EventConsumerRegistration>,
}

impl EventRegistration {
    /// Stable wire name of the event
    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    /// Name of the transport owning this registration
    pub fn transport_name(&self) -> &str {
        &self.transport_name
    }

    /// Shape of the broker entity the event travels through
    pub fn entity_kind(&self) -> EntityKind {
        self.entity_kind
    }

    /// Rust type name of the payload shape
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Consumers registered under this event, in registration order
    pub fn consumers(&self) -> &[EventConsumerRegistration] {
        &self.consumers
    }

    /// Whether any consumer requests dead-lettering on failure
    pub fn wants_deadletter(&self) -> bool {
        self.consumers
            .iter()
            .any(|c| c.unhandled_error_behavior() == UnhandledErrorBehavior::Deadletter)
    }

    /// Resolves the registration's serializer for its own payload type
    pub(crate) fn serializer_slot<T: Send + Sync + 'static>(
        &self,
    ) -> Result<Arc<dyn EventSerializer<T>>, RegistrationError> {
        self.serializer
            .clone()
            .downcast::<SerializerSlot<T>>()
            .map(|slot| slot.0.clone())
            .map_err(|_| RegistrationError::InvalidSerializer(self.type_name))
    }
}

impl fmt::Debug for EventRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRegistration")
            .field("event_name", &self.event_name)
            .field("transport_name", &self.transport_name)
            .field("entity_kind", &self.entity_kind)
            .field("type_name", &self.type_name)
            .field("consumers", &self.consumers)
            .finish()
    }
}

/// Frozen binding of a consumer shape under one event registration
pub struct EventConsumerRegistration {
    pub(crate) consumer_type_name: &'static str,
    pub(crate) consumer_name: String,
    pub(crate) unhandled_error_behavior: UnhandledErrorBehavior,
    pub(crate) dispatcher: Dispatcher,
}

impl EventConsumerRegistration {
    /// Stable wire name of the consumer
    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    /// Rust type name of the consumer shape
    pub fn consumer_type_name(&self) -> &'static str {
        self.consumer_type_name
    }

    /// What the transport does when this consumer fails
    pub fn unhandled_error_behavior(&self) -> UnhandledErrorBehavior {
        self.unhandled_error_behavior
    }

    /// The dispatch closure captured at registration
    pub(crate) fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }
}

impl fmt::Debug for EventConsumerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventConsumerRegistration")
            .field("consumer_name", &self.consumer_name)
            .field("consumer_type_name", &self.consumer_type_name)
            .field("unhandled_error_behavior", &self.unhandled_error_behavior)
            .finish()
    }
}
