//! Broker-agnostic halves of the publish and consume paths
//!
//! Transports never serialize, deserialize or decide acknowledgement policy
//! themselves. The publish half finalizes the context and produces a
//! ready-to-send [`OutgoingMessage`]; the consume half runs a consumer's
//! dispatcher and condenses the result into a [`DispatchOutcome`] which the
//! transport maps onto its broker's settlement verbs.

use super::{IncomingMessage, OutgoingMessage};
use crate::bus::{EventBus, PublishError};
use crate::constants::headers;
use crate::context::EventContext;
use crate::registration::{EventConsumerRegistration, EventRegistration, UnhandledErrorBehavior};
use crate::serialization::HostInfo;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde_json::Value;
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

/// What a transport should do with a delivery after dispatch
///
/// Failure variants carry the error the consumer returned so transports can
/// attach it as a dead-letter reason or record it.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Settle the delivery as processed
    Acknowledge,
    /// Move the delivery to the dead-letter destination, then settle
    DeadLetter(crate::BoxedError),
    /// Settle the delivery and drop it
    Discard(crate::BoxedError),
    /// Negatively acknowledge so the broker redelivers, or re-raise
    Fail(crate::BoxedError),
}

/// Generates a W3C trace-parent style activity identifier
fn new_activity_id() -> String {
    let trace_id = Uuid::new_v4().simple().to_string();
    let span_id = Uuid::new_v4().simple().to_string();

    format!("00-{}-{}-01", trace_id, &span_id[..16])
}

/// Finalizes a context and serializes it into a ready-to-send message
///
/// Assigns the event id and send timestamp when absent, serializes through
/// the registration's serializer and injects the reserved headers onto the
/// transport header channel. Returns the message together with the producer
/// span the caller instruments the actual send with.
pub(crate) async fn prepare_outgoing<T: Send + Sync + 'static>(
    context: &mut EventContext<T>,
    registration: &EventRegistration,
    host: &HostInfo,
    transport_name: &str,
    scheduled: Option<DateTime<Utc>>,
) -> Result<(OutgoingMessage, tracing::Span), PublishError> {
    if context.id().is_none() {
        context.set_id(Uuid::new_v4().to_string());
    }
    if context.sent().is_none() {
        context.set_sent(Utc::now());
    }

    let serializer = registration.serializer_slot::<T>()?;
    let payload = serializer.serialize(context, host).await?;

    let event_id = context.id().unwrap_or_default().to_owned();
    let activity_id = new_activity_id();

    let span = tracing::info_span!(
        "event.publish",
        otel.kind = "producer",
        event.name = %registration.event_name(),
        messaging.system = %transport_name,
        messaging.destination = %registration.event_name(),
        activity.id = %activity_id,
    );

    let mut transport_headers = context.headers().clone();
    transport_headers.insert(headers::ACTIVITY_ID.to_owned(), Value::String(activity_id));
    transport_headers.insert(headers::ID.to_owned(), Value::String(event_id.clone()));
    if let Some(correlation) = context.correlation_id() {
        transport_headers.insert(
            headers::CORRELATION_ID.to_owned(),
            Value::String(correlation.to_owned()),
        );
    }

    let message = OutgoingMessage {
        event_id,
        body: payload.body,
        content_type: payload.content_type,
        headers: transport_headers,
        expires: context.expires(),
        scheduled,
    };

    Ok((message, span))
}

/// Runs one consumer against one delivery and condenses the result
///
/// The consume span is parented on the publishing activity when the
/// `ActivityId` header made it across the broker. Consumer failures are
/// logged with everything known about the delivery and mapped through the
/// consumer's configured error behavior; they never escape to the loop.
pub(crate) async fn dispatch_message(
    message: IncomingMessage,
    registration: &Arc<EventRegistration>,
    consumer: &EventConsumerRegistration,
    bus: &EventBus,
) -> DispatchOutcome {
    let parent_activity = message
        .headers
        .get(headers::ACTIVITY_ID)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let event_id = message
        .headers
        .get(headers::ID)
        .and_then(Value::as_str)
        .map(str::to_owned);
    let correlation_id = message
        .headers
        .get(headers::CORRELATION_ID)
        .and_then(Value::as_str)
        .map(str::to_owned);
    let sequence = message.sequence.clone();

    let span = tracing::info_span!(
        "event.consume",
        otel.kind = "consumer",
        event.name = %registration.event_name(),
        consumer.name = %consumer.consumer_name(),
        parent.activity = %parent_activity,
    );

    let dispatcher = consumer.dispatcher();
    let result = dispatcher(message, Arc::clone(registration), bus.clone())
        .instrument(span)
        .await;

    match result {
        Ok(()) => {
            debug!(
                "Consumer {} processed event {} (id {:?})",
                consumer.consumer_name(),
                registration.event_name(),
                event_id
            );
            DispatchOutcome::Acknowledge
        }
        Err(error) => {
            warn!(
                "Consumer {} failed on event {} (id {:?}, correlation {:?}, sequence {:?}): {}",
                consumer.consumer_name(),
                registration.event_name(),
                event_id,
                correlation_id,
                sequence,
                error
            );

            match consumer.unhandled_error_behavior() {
                UnhandledErrorBehavior::Deadletter => DispatchOutcome::DeadLetter(error),
                UnhandledErrorBehavior::Discard => DispatchOutcome::Discard(error),
                UnhandledErrorBehavior::Fail => DispatchOutcome::Fail(error),
            }
        }
    }
}
