//! Serialization contract between event contexts and transport payloads
//!
//! Transports only ever see opaque byte payloads with a declared content
//! type; turning an [`EventContext`](crate::context::EventContext) into such
//! a payload is the job of an [`EventSerializer`]. The JSON implementation in
//! [`json`] is the bus-wide default and can be replaced per registration.

mod json;

pub use json::JsonEventSerializer;

use crate::context::EventContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Serialized payload together with its declared content type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedPayload {
    /// The encoded bytes
    pub body: Vec<u8>,
    /// Media type and charset of the encoding
    pub content_type: String,
}

/// Metadata describing the host an event was published from
///
/// Serializers may embed this in a reserved header for diagnostics; readers
/// must tolerate its absence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostInfo {
    /// Name of the publishing application
    pub application_name: String,
    /// Version of the publishing application
    pub application_version: String,
    /// Deployment environment the application runs in
    pub environment_name: String,
    /// Machine the application runs on
    pub machine_name: String,
    /// Version of this library
    pub library_version: String,
}

impl HostInfo {
    /// Creates host metadata for an application, detecting the rest
    pub fn new(application_name: impl Into<String>, application_version: impl Into<String>) -> Self {
        Self {
            application_name: application_name.into(),
            application_version: application_version.into(),
            environment_name: std::env::var("ENVIRONMENT").unwrap_or_else(|_| "production".into()),
            machine_name: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".into()),
            library_version: env!("CARGO_PKG_VERSION").into(),
        }
    }
}

impl Default for HostInfo {
    fn default() -> Self {
        Self::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    }
}

/// Errors raised while converting between contexts and payloads
#[derive(Debug, Error)]
pub enum SerializationError {
    /// The payload could not be encoded
    #[error("failed to encode event payload: {0}")]
    Encode(#[source] serde_json::Error),

    /// The payload could not be decoded
    #[error("failed to decode event payload: {0}")]
    Decode(#[source] serde_json::Error),

    /// The payload decoded but carried no event body
    #[error("payload is missing the event body")]
    MissingEvent,

    /// The payload declares a content type this serializer cannot read
    #[error("unsupported content type {0:?}")]
    UnsupportedContentType(String),
}

/// Converts between typed event contexts and wire payloads
///
/// Implementations must be self-describing: a payload written by
/// [`serialize`](EventSerializer::serialize) must reconstruct the id, the
/// correlation-family ids, the headers and the payload when passed back to
/// [`deserialize`](EventSerializer::deserialize). Serialization is async as
/// implementations may call back into user code.
#[async_trait]
pub trait EventSerializer<T>: Send + Sync
where
    T: Send + Sync,
{
    /// Encodes a context into a payload, declaring its content type
    async fn serialize(
        &self,
        context: &EventContext<T>,
        host: &HostInfo,
    ) -> Result<SerializedPayload, SerializationError>;

    /// Reconstructs a context from a payload
    ///
    /// Fields absent from the payload decode to their empty value.
    async fn deserialize(
        &self,
        payload: &[u8],
        content_type: Option<&str>,
    ) -> Result<EventContext<T>, SerializationError>;
}
