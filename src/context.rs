//! Envelope carrying an event payload and its correlation metadata

use crate::bus::{EventBus, PublishError};
use crate::transport::ScheduledMarker;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Envelope carrying a payload and the metadata that travels with it
///
/// Created by the publisher surface on publish and by transports during
/// deserialization. The bus assigns a fresh id and the send timestamp during
/// publish finalization; everything else is caller-owned data.
pub struct EventContext<T> {
    id: Option<String>,
    request_id: Option<String>,
    correlation_id: Option<String>,
    conversation_id: Option<String>,
    initiator_id: Option<String>,
    expires: Option<DateTime<Utc>>,
    sent: Option<DateTime<Utc>>,
    headers: HashMap<String, Value>,
    event: T,
    bus: Option<EventBus>,
}

impl<T> EventContext<T> {
    /// Creates a fresh context around a payload with no carried metadata
    pub fn new(event: T) -> Self {
        Self {
            id: None,
            request_id: None,
            correlation_id: None,
            conversation_id: None,
            initiator_id: None,
            expires: None,
            sent: None,
            headers: HashMap::new(),
            event,
            bus: None,
        }
    }

    /// Creates a context from every wire-level field
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        id: Option<String>,
        request_id: Option<String>,
        correlation_id: Option<String>,
        conversation_id: Option<String>,
        initiator_id: Option<String>,
        expires: Option<DateTime<Utc>>,
        sent: Option<DateTime<Utc>>,
        headers: HashMap<String, Value>,
        event: T,
    ) -> Self {
        Self {
            id,
            request_id,
            correlation_id,
            conversation_id,
            initiator_id,
            expires,
            sent,
            headers,
            event,
            bus: None,
        }
    }

    /// Unique identifier of the event; assigned by the bus on publish when absent
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Identifier of the event that caused this one to be published
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Identifier of the request this event belongs to
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Identifier of the conversation this event belongs to
    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// Identifier of the party that initiated the conversation
    pub fn initiator_id(&self) -> Option<&str> {
        self.initiator_id.as_deref()
    }

    /// Instant after which the event is no longer relevant
    pub fn expires(&self) -> Option<DateTime<Utc>> {
        self.expires
    }

    /// Instant at which the event was published
    pub fn sent(&self) -> Option<DateTime<Utc>> {
        self.sent
    }

    /// Headers carried alongside the payload
    pub fn headers(&self) -> &HashMap<String, Value> {
        &self.headers
    }

    /// A single header value, when present
    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(name)
    }

    /// The typed payload
    pub fn event(&self) -> &T {
        &self.event
    }

    /// Consumes the context, returning the payload
    pub fn into_event(self) -> T {
        self.event
    }

    /// Sets the request id
    pub fn set_request_id(&mut self, id: impl Into<String>) {
        self.request_id = Some(id.into());
    }

    /// Sets the correlation id
    pub fn set_correlation_id(&mut self, id: impl Into<String>) {
        self.correlation_id = Some(id.into());
    }

    /// Sets the conversation id
    pub fn set_conversation_id(&mut self, id: impl Into<String>) {
        self.conversation_id = Some(id.into());
    }

    /// Sets the initiator id
    pub fn set_initiator_id(&mut self, id: impl Into<String>) {
        self.initiator_id = Some(id.into());
    }

    /// Sets the expiry instant
    pub fn set_expires(&mut self, at: DateTime<Utc>) {
        self.expires = Some(at);
    }

    /// Sets a header value
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.headers.insert(name.into(), value.into());
    }

    pub(crate) fn set_id(&mut self, id: impl Into<String>) {
        self.id = Some(id.into());
    }

    pub(crate) fn set_sent(&mut self, at: DateTime<Utc>) {
        self.sent = Some(at);
    }

    /// Binds the context to the bus it was received from
    pub(crate) fn bind(&mut self, bus: EventBus) {
        self.bus = Some(bus);
    }

    /// Publishes a follow-up event linked to this one
    ///
    /// The new context starts out fresh except for its correlation id, which
    /// is set to this context's id so the conversation can be traced across
    /// hops. This context itself is left untouched.
    ///
    /// Only contexts handed to a consumer are bound to a bus; calling this on
    /// a context built by hand fails with [`PublishError::NotBound`].
    pub async fn publish_follow_up<U>(
        &self,
        event: U,
        scheduled: Option<DateTime<Utc>>,
    ) -> Result<Option<ScheduledMarker>, PublishError>
    where
        U: Send + Sync + 'static,
    {
        let bus = self.bus.as_ref().ok_or(PublishError::NotBound)?;

        let mut context = EventContext::new(event);
        context.correlation_id = self.id.clone();

        bus.publish_context(context, scheduled).await
    }
}

impl<T: fmt::Debug> fmt::Debug for EventContext<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventContext")
            .field("id", &self.id)
            .field("request_id", &self.request_id)
            .field("correlation_id", &self.correlation_id)
            .field("conversation_id", &self.conversation_id)
            .field("initiator_id", &self.initiator_id)
            .field("expires", &self.expires)
            .field("sent", &self.sent)
            .field("headers", &self.headers)
            .field("event", &self.event)
            .finish()
    }
}

impl<T: Clone> Clone for EventContext<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            request_id: self.request_id.clone(),
            correlation_id: self.correlation_id.clone(),
            conversation_id: self.conversation_id.clone(),
            initiator_id: self.initiator_id.clone(),
            expires: self.expires,
            sent: self.sent,
            headers: self.headers.clone(),
            event: self.event.clone(),
            bus: self.bus.clone(),
        }
    }
}

impl<T: PartialEq> PartialEq for EventContext<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.request_id == other.request_id
            && self.correlation_id == other.correlation_id
            && self.conversation_id == other.conversation_id
            && self.initiator_id == other.initiator_id
            && self.expires == other.expires
            && self.sent == other.sent
            && self.headers == other.headers
            && self.event == other.event
    }
}
