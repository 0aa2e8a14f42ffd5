//! Mutable registration collection and the freeze that turns it into an
//! immutable registry

use super::{
    Dispatcher, EntityKind, EventConsumer, EventConsumerRegistration, EventRegistration,
    SerializerSlot, UnhandledErrorBehavior,
};
use crate::bus::EventBus;
use crate::constants::{headers, SERVICE_BUS_ENTITY_NAME_LIMIT};
use crate::naming::{derive_consumer_name, derive_event_name, NamingOptions};
use crate::serialization::{EventSerializer, HostInfo, JsonEventSerializer};
use crate::transport::{service_bus, IncomingMessage};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::{type_name, Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised when resolving a frozen registration
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// No registration exists for the requested event type
    #[error("no event registered for type {0}")]
    UnknownEvent(&'static str),

    /// The registration's serializer does not accept the requested type
    #[error("the serializer registered for {0} does not accept its event type")]
    InvalidSerializer(&'static str),
}

/// Configuration errors detected while freezing the registry
///
/// All of these are fatal and abort bus construction.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// An event derives an empty wire name
    #[error("event {event} derives an empty name")]
    EmptyEventName {
        /// Type name of the offending event
        event: &'static str,
    },

    /// Two events on one transport derive the same wire name
    #[error("duplicate event name {name:?} on transport {transport}")]
    DuplicateEventName {
        /// The colliding name
        name: String,
        /// Transport both registrations are bound to
        transport: String,
    },

    /// Two consumers under one event derive the same wire name
    #[error("duplicate consumer name {name:?} under event {event:?}")]
    DuplicateConsumerName {
        /// The colliding name
        name: String,
        /// Wire name of the parent event
        event: String,
    },

    /// An event is not bound to any transport
    #[error("event {event} is not bound to any transport and no default applies")]
    NoTransport {
        /// Type name of the offending event
        event: &'static str,
    },

    /// An event references a transport that was never added to the bus
    #[error("event {event} references unknown transport {transport:?}")]
    UnknownTransport {
        /// Type name of the offending event
        event: &'static str,
        /// The unknown transport name
        transport: String,
    },

    /// Two transports were attached under the same name
    #[error("two transports register under the name {0:?}")]
    DuplicateTransport(String),

    /// An entity name exceeds what its broker accepts
    #[error("entity name {name:?} exceeds the {limit}-character limit of transport {transport}")]
    EntityNameTooLong {
        /// The offending name
        name: String,
        /// Transport imposing the limit
        transport: String,
        /// The limit itself
        limit: usize,
    },
}

struct ConsumerEntry {
    consumer_type_name: &'static str,
    name_override: Option<String>,
    behavior: Option<UnhandledErrorBehavior>,
    dispatcher: Dispatcher,
}

struct EventEntry {
    event_type: TypeId,
    type_name: &'static str,
    name_override: Option<String>,
    transport_name: Option<String>,
    entity_kind: EntityKind,
    serializer: Arc<dyn Any + Send + Sync>,
    consumers: Vec<ConsumerEntry>,
}

/// Typed view onto one event entry while the bus is being configured
///
/// This is the statically-typed stand-in for per-type metadata annotations:
/// overrides recorded here take precedence over the derivation pipeline.
pub struct EventConfigurator<'a, T> {
    entry: &'a mut EventEntry,
    _event: PhantomData<T>,
}

impl<'a, T> EventConfigurator<'a, T>
where
    T: Send + Sync + 'static,
{
    /// Overrides the derived event name with a literal one
    pub fn named(&mut self, name: impl Into<String>) -> &mut Self {
        self.entry.name_override = Some(name.into());
        self
    }

    /// Binds the event to a transport by name
    pub fn on_transport(&mut self, name: impl Into<String>) -> &mut Self {
        self.entry.transport_name = Some(name.into());
        self
    }

    /// Publishes through a broadcast topic (the default)
    pub fn broadcast(&mut self) -> &mut Self {
        self.entry.entity_kind = EntityKind::Broadcast;
        self
    }

    /// Publishes through a point-to-point queue
    pub fn point_to_point(&mut self) -> &mut Self {
        self.entry.entity_kind = EntityKind::Queue;
        self
    }

    /// Replaces the default serializer for this event
    pub fn serialize_with<S>(&mut self, serializer: S) -> &mut Self
    where
        S: EventSerializer<T> + 'static,
    {
        self.entry.serializer = Arc::new(SerializerSlot::<T>(Arc::new(serializer)));
        self
    }

    /// Registers a consumer using the bus-wide error behavior
    ///
    /// The factory runs once per delivery so every message is handled by a
    /// fresh consumer instance.
    pub fn consume_with<C, F>(&mut self, factory: F) -> &mut Self
    where
        C: EventConsumer<Event = T> + 'static,
        F: Fn() -> C + Send + Sync + 'static,
    {
        self.add_consumer::<C, F>(factory, None)
    }

    /// Registers a consumer with an explicit error behavior
    pub fn consume_with_behavior<C, F>(
        &mut self,
        factory: F,
        behavior: UnhandledErrorBehavior,
    ) -> &mut Self
    where
        C: EventConsumer<Event = T> + 'static,
        F: Fn() -> C + Send + Sync + 'static,
    {
        self.add_consumer::<C, F>(factory, Some(behavior))
    }

    /// Overrides the derived name of the most recently added consumer
    pub fn consumer_named(&mut self, name: impl Into<String>) -> &mut Self {
        if let Some(last) = self.entry.consumers.last_mut() {
            last.name_override = Some(name.into());
        }
        self
    }

    fn add_consumer<C, F>(&mut self, factory: F, behavior: Option<UnhandledErrorBehavior>) -> &mut Self
    where
        C: EventConsumer<Event = T> + 'static,
        F: Fn() -> C + Send + Sync + 'static,
    {
        let factory = Arc::new(factory);

        let dispatcher: Dispatcher = Arc::new(
            move |message: IncomingMessage, registration: Arc<EventRegistration>, bus: EventBus| {
                let factory = Arc::clone(&factory);

                let future: super::DispatchFuture = Box::pin(async move {
                    let serializer = registration.serializer_slot::<T>()?;
                    let mut context = serializer
                        .deserialize(&message.body, message.content_type.as_deref())
                        .await?;

                    // Transports that redeliver under a fresh identity carry
                    // it on the reserved headers rather than in the envelope.
                    if let Some(id) = message.headers.get(headers::ID).and_then(Value::as_str) {
                        context.set_id(id);
                    }
                    if let Some(correlation) = message
                        .headers
                        .get(headers::CORRELATION_ID)
                        .and_then(Value::as_str)
                    {
                        context.set_correlation_id(correlation);
                    }

                    context.bind(bus);

                    let consumer = factory();
                    consumer.consume(&context).await
                });

                future
            },
        );

        self.entry.consumers.push(ConsumerEntry {
            consumer_type_name: type_name::<C>(),
            name_override: None,
            behavior,
            dispatcher,
        });

        self
    }
}

/// Collects registrations while the bus is being configured
#[derive(Default)]
pub struct RegistryBuilder {
    entries: Vec<EventEntry>,
    index: HashMap<TypeId, usize>,
}

impl RegistryBuilder {
    /// Creates an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an event type, or configures it further when already known
    ///
    /// Registration is idempotent per event type: repeated calls operate on
    /// the same entry, appending consumers rather than replacing them.
    pub fn register_event<T, F>(&mut self, configure: F)
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce(&mut EventConfigurator<'_, T>),
    {
        let event_type = TypeId::of::<T>();

        let index = match self.index.get(&event_type) {
            Some(&index) => index,
            None => {
                self.entries.push(EventEntry {
                    event_type,
                    type_name: type_name::<T>(),
                    name_override: None,
                    transport_name: None,
                    entity_kind: EntityKind::Broadcast,
                    serializer: Arc::new(SerializerSlot::<T>(Arc::new(JsonEventSerializer))),
                    consumers: Vec::new(),
                });

                let index = self.entries.len() - 1;
                self.index.insert(event_type, index);
                index
            }
        };

        let mut configurator = EventConfigurator {
            entry: &mut self.entries[index],
            _event: PhantomData,
        };
        configure(&mut configurator);
    }

    /// Whether any event has been registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Derives all wire names and freezes the collection
    ///
    /// `default_transport` applies to registrations that did not pick one
    /// themselves; the bus passes the sole transport's name when exactly one
    /// is attached.
    pub fn freeze(
        self,
        naming: &NamingOptions,
        host: &HostInfo,
        transport_names: &HashSet<String>,
        default_transport: Option<&str>,
        default_behavior: UnhandledErrorBehavior,
    ) -> Result<Registry, ConfigurationError> {
        let mut ordered = Vec::with_capacity(self.entries.len());
        let mut by_type = HashMap::with_capacity(self.entries.len());
        let mut taken_names: HashSet<(String, String)> = HashSet::new();

        for entry in self.entries {
            let transport_name = entry
                .transport_name
                .as_deref()
                .or(default_transport)
                .ok_or(ConfigurationError::NoTransport {
                    event: entry.type_name,
                })?
                .to_owned();

            if !transport_names.contains(&transport_name) {
                return Err(ConfigurationError::UnknownTransport {
                    event: entry.type_name,
                    transport: transport_name,
                });
            }

            let event_name =
                derive_event_name(naming, entry.type_name, entry.name_override.as_deref());
            if event_name.is_empty() {
                return Err(ConfigurationError::EmptyEventName {
                    event: entry.type_name,
                });
            }

            check_entity_name(&event_name, &transport_name)?;

            if !taken_names.insert((transport_name.clone(), event_name.clone())) {
                return Err(ConfigurationError::DuplicateEventName {
                    name: event_name,
                    transport: transport_name,
                });
            }

            let mut consumers = Vec::with_capacity(entry.consumers.len());
            let mut consumer_names = HashSet::new();

            for consumer in entry.consumers {
                let consumer_name = derive_consumer_name(
                    naming,
                    consumer.consumer_type_name,
                    consumer.name_override.as_deref(),
                    &event_name,
                    &host.application_name,
                );

                check_entity_name(&consumer_name, &transport_name)?;

                if !consumer_names.insert(consumer_name.clone()) {
                    return Err(ConfigurationError::DuplicateConsumerName {
                        name: consumer_name,
                        event: event_name,
                    });
                }

                consumers.push(EventConsumerRegistration {
                    consumer_type_name: consumer.consumer_type_name,
                    consumer_name,
                    unhandled_error_behavior: consumer.behavior.unwrap_or(default_behavior),
                    dispatcher: consumer.dispatcher,
                });
            }

            let registration = Arc::new(EventRegistration {
                event_type: entry.event_type,
                type_name: entry.type_name,
                event_name,
                transport_name,
                entity_kind: entry.entity_kind,
                serializer: entry.serializer,
                consumers,
            });

            by_type.insert(entry.event_type, registration.clone());
            ordered.push(registration);
        }

        Ok(Registry { by_type, ordered })
    }
}

fn check_entity_name(name: &str, transport: &str) -> Result<(), ConfigurationError> {
    if transport == service_bus::NAME && name.len() > SERVICE_BUS_ENTITY_NAME_LIMIT {
        return Err(ConfigurationError::EntityNameTooLong {
            name: name.to_owned(),
            transport: transport.to_owned(),
            limit: SERVICE_BUS_ENTITY_NAME_LIMIT,
        });
    }

    Ok(())
}

/// Immutable collection of frozen registrations
#[derive(Debug, Default)]
pub struct Registry {
    by_type: HashMap<TypeId, Arc<EventRegistration>>,
    ordered: Vec<Arc<EventRegistration>>,
}

impl Registry {
    /// Looks up the registration owning a payload type
    pub fn by_event_type<T: 'static>(&self) -> Result<Arc<EventRegistration>, RegistrationError> {
        self.by_type
            .get(&TypeId::of::<T>())
            .cloned()
            .ok_or_else(|| RegistrationError::UnknownEvent(type_name::<T>()))
    }

    /// Registrations bound to a transport, in registration order
    pub fn by_transport(&self, transport_name: &str) -> Vec<Arc<EventRegistration>> {
        self.ordered
            .iter()
            .filter(|registration| registration.transport_name == transport_name)
            .cloned()
            .collect()
    }

    /// All registrations in registration order
    pub fn all(&self) -> &[Arc<EventRegistration>] {
        &self.ordered
    }

    /// Looks up a registration by its wire name
    pub fn by_event_name(&self, event_name: &str) -> Option<Arc<EventRegistration>> {
        self.ordered
            .iter()
            .find(|registration| registration.event_name == event_name)
            .cloned()
    }

    /// Resolves the typed serializer for a payload type
    pub(crate) fn serializer_for<T: Send + Sync + 'static>(
        &self,
    ) -> Result<Arc<dyn EventSerializer<T>>, RegistrationError> {
        self.by_event_type::<T>()?.serializer_slot::<T>()
    }
}
