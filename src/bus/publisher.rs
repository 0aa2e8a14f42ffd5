//! User-visible publish and cancel entry points

use super::{EventBus, PublishError};
use crate::context::EventContext;
use crate::transport::ScheduledMarker;
use chrono::{DateTime, Utc};

/// Stateless publish surface wrapping raw payloads into fresh contexts
///
/// Contexts created here carry no correlation; linking a publish to the
/// event that caused it is what
/// [`EventContext::publish_follow_up`](crate::context::EventContext::publish_follow_up)
/// is for.
#[derive(Clone)]
pub struct EventPublisher {
    bus: EventBus,
}

impl EventPublisher {
    pub(crate) fn new(bus: EventBus) -> Self {
        Self { bus }
    }

    /// Publishes one payload, optionally scheduled for later delivery
    ///
    /// Returns the transport's scheduled marker when the publish was
    /// scheduled and the broker supports cancellation.
    pub async fn publish<T>(
        &self,
        event: T,
        scheduled: Option<DateTime<Utc>>,
    ) -> Result<Option<ScheduledMarker>, PublishError>
    where
        T: Send + Sync + 'static,
    {
        self.bus
            .publish_context(EventContext::new(event), scheduled)
            .await
    }

    /// Publishes a batch of payloads
    pub async fn publish_many<T>(
        &self,
        events: Vec<T>,
        scheduled: Option<DateTime<Utc>>,
    ) -> Result<Vec<Option<ScheduledMarker>>, PublishError>
    where
        T: Send + Sync + 'static,
    {
        let contexts = events.into_iter().map(EventContext::new).collect();
        self.bus.publish_context_many(contexts, scheduled).await
    }

    /// Cancels a scheduled publish by its marker
    pub async fn cancel<T>(&self, marker: ScheduledMarker) -> Result<(), PublishError>
    where
        T: Send + Sync + 'static,
    {
        self.bus.cancel::<T>(marker).await
    }

    /// Cancels a batch of scheduled publishes
    pub async fn cancel_many<T>(&self, markers: Vec<ScheduledMarker>) -> Result<(), PublishError>
    where
        T: Send + Sync + 'static,
    {
        self.bus.cancel_many::<T>(markers).await
    }
}
