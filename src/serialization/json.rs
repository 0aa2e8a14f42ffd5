//! Default serializer writing a self-describing JSON envelope

use super::{EventSerializer, HostInfo, SerializationError, SerializedPayload};
use crate::constants::{headers, JSON_CONTENT_TYPE};
use crate::context::EventContext;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Serializer producing the default JSON envelope
///
/// The envelope carries the context fields under PascalCase keys alongside
/// the payload itself and declares `application/json; charset=utf-8`. Host
/// metadata is embedded under the reserved `Host` header and stripped again
/// on the way in so that round-trips reproduce the original context.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonEventSerializer;

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct OutboundEnvelope<'a, T> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    initiator_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sent: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires: Option<DateTime<Utc>>,
    headers: HashMap<String, Value>,
    event: &'a T,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
#[serde(bound(deserialize = "T: serde::de::DeserializeOwned"))]
struct InboundEnvelope<T> {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    correlation_id: Option<String>,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    initiator_id: Option<String>,
    #[serde(default)]
    sent: Option<DateTime<Utc>>,
    #[serde(default)]
    expires: Option<DateTime<Utc>>,
    #[serde(default)]
    headers: HashMap<String, Value>,
    #[serde(default)]
    event: Option<T>,
}

fn readable(content_type: Option<&str>) -> bool {
    match content_type {
        None => true,
        Some(declared) => declared
            .split(';')
            .next()
            .map(|media| media.trim().eq_ignore_ascii_case("application/json"))
            .unwrap_or(false),
    }
}

#[async_trait]
impl<T> EventSerializer<T> for JsonEventSerializer
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    async fn serialize(
        &self,
        context: &EventContext<T>,
        host: &HostInfo,
    ) -> Result<SerializedPayload, SerializationError> {
        let mut envelope_headers = context.headers().clone();
        if let Ok(host) = serde_json::to_value(host) {
            envelope_headers.insert(headers::HOST.to_owned(), host);
        }

        let envelope = OutboundEnvelope {
            id: context.id(),
            request_id: context.request_id(),
            correlation_id: context.correlation_id(),
            conversation_id: context.conversation_id(),
            initiator_id: context.initiator_id(),
            sent: context.sent(),
            expires: context.expires(),
            headers: envelope_headers,
            event: context.event(),
        };

        let body = serde_json::to_vec(&envelope).map_err(SerializationError::Encode)?;

        Ok(SerializedPayload {
            body,
            content_type: JSON_CONTENT_TYPE.to_owned(),
        })
    }

    async fn deserialize(
        &self,
        payload: &[u8],
        content_type: Option<&str>,
    ) -> Result<EventContext<T>, SerializationError> {
        if !readable(content_type) {
            return Err(SerializationError::UnsupportedContentType(
                content_type.unwrap_or_default().to_owned(),
            ));
        }

        let envelope: InboundEnvelope<T> =
            serde_json::from_slice(payload).map_err(SerializationError::Decode)?;

        let event = envelope.event.ok_or(SerializationError::MissingEvent)?;

        let mut headers = envelope.headers;
        headers.remove(headers::HOST);

        Ok(EventContext::from_parts(
            envelope.id,
            envelope.request_id,
            envelope.correlation_id,
            envelope.conversation_id,
            envelope.initiator_id,
            envelope.expires,
            envelope.sent,
            headers,
            event,
        ))
    }
}
