//! Reserved wire-level names and bus-wide defaults

use std::time::Duration;

/// Header names reserved by the bus.
///
/// Transports carry these on their native header channel where one exists
/// (application properties, message attributes, basic properties). Brokers
/// without such a channel rely on the serialized envelope instead.
pub mod headers {
    /// W3C trace parent of the activity that published the message
    pub const ACTIVITY_ID: &str = "ActivityId";

    /// Unique identifier of the event
    pub const ID: &str = "Id";

    /// Identifier of the event that caused this one to be published
    pub const CORRELATION_ID: &str = "CorrelationId";

    /// Broker-assigned sequence number or receipt, where one exists
    pub const SEQUENCE_NUMBER: &str = "SequenceNumber";

    /// Declared content type of the serialized payload
    pub const CONTENT_TYPE: &str = "ContentType";

    /// Metadata about the publishing host
    pub const HOST: &str = "Host";
}

/// Content type declared by the default serializer
pub const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Suffix appended to an event name to form its shadow dead-letter entity
pub const DEADLETTER_SUFFIX: &str = "-deadletter";

/// Azure Service Bus rejects entity names longer than this
pub const SERVICE_BUS_ENTITY_NAME_LIMIT: usize = 50;

/// How long polling transports sleep after an empty receive
pub const DEFAULT_EMPTY_RESULTS_DELAY: Duration = Duration::from_secs(1);

/// How many messages polling transports request per receive call
pub const DEFAULT_POLL_BATCH_SIZE: usize = 16;
