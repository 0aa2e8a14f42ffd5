//! Amazon Kinesis transport
//!
//! Publish-only: events are put onto a stream named after the event, keyed
//! by their event id. Streams are assumed to exist, consuming is left to
//! dedicated stream-processing hosts, and neither scheduling nor
//! cancellation is available.

use super::{
    EventTransport, OutgoingMessage, ScheduledMarker, TransportError, TransportStartContext,
};
use crate::registration::EventRegistration;
use crate::EmptyResult;
use async_trait::async_trait;
use log::warn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Name the Kinesis transport registers under
pub const NAME: &str = "amazon-kinesis";

/// One record on its way onto a stream
#[derive(Debug, Clone)]
pub struct KinesisRecord {
    /// Partition key deciding which shard carries the record
    pub partition_key: String,
    /// Raw payload
    pub data: Vec<u8>,
}

/// Operations the transport calls on Kinesis
#[async_trait]
pub trait KinesisClient: Send + Sync {
    /// Puts a batch of records onto a stream
    async fn put_records(&self, stream: &str, records: &[KinesisRecord]) -> EmptyResult;

    /// Cheap reachability probe
    async fn ping(&self) -> EmptyResult;
}

/// Publish-only transport over Amazon Kinesis
pub struct KinesisTransport {
    client: Arc<dyn KinesisClient>,
    started: AtomicBool,
}

impl KinesisTransport {
    /// Creates a transport on top of a Kinesis client
    pub fn new(client: Arc<dyn KinesisClient>) -> Self {
        Self {
            client,
            started: AtomicBool::new(false),
        }
    }

    fn record(message: &OutgoingMessage) -> KinesisRecord {
        KinesisRecord {
            partition_key: message.event_id.clone(),
            data: message.body.clone(),
        }
    }

    fn warn_on_schedule(messages: &[OutgoingMessage]) {
        if messages.iter().any(|m| m.scheduled.is_some()) {
            warn!("Kinesis cannot schedule deliveries, records are put immediately");
        }
    }
}

#[async_trait]
impl EventTransport for KinesisTransport {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn send_one(
        &self,
        message: OutgoingMessage,
        registration: &EventRegistration,
    ) -> Result<Option<ScheduledMarker>, TransportError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(TransportError::NotRunning(NAME));
        }

        Self::warn_on_schedule(std::slice::from_ref(&message));

        self.client
            .put_records(registration.event_name(), &[Self::record(&message)])
            .await?;

        Ok(None)
    }

    async fn send_many(
        &self,
        messages: Vec<OutgoingMessage>,
        registration: &EventRegistration,
    ) -> Result<Vec<Option<ScheduledMarker>>, TransportError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(TransportError::NotRunning(NAME));
        }

        Self::warn_on_schedule(&messages);

        let records: Vec<_> = messages.iter().map(Self::record).collect();
        self.client
            .put_records(registration.event_name(), &records)
            .await?;

        Ok(vec![None; messages.len()])
    }

    async fn start(&self, context: TransportStartContext) -> EmptyResult {
        for registration in &context.registrations {
            if !registration.consumers().is_empty() {
                warn!(
                    "Kinesis transport is publish-only, {} consumer(s) registered for {} will never run",
                    registration.consumers().len(),
                    registration.event_name()
                );
            }
        }

        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self, _grace: Duration) -> EmptyResult {
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn check_health(&self) -> Result<bool, TransportError> {
        match self.client.ping().await {
            Ok(()) => Ok(true),
            Err(error) => {
                warn!("Kinesis health probe failed: {}", error);
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    struct RecordingClient {
        puts: Mutex<Vec<(String, Vec<KinesisRecord>)>>,
    }

    #[async_trait]
    impl KinesisClient for RecordingClient {
        async fn put_records(&self, stream: &str, records: &[KinesisRecord]) -> EmptyResult {
            self.puts
                .lock()
                .unwrap()
                .push((stream.to_owned(), records.to_vec()));
            Ok(())
        }

        async fn ping(&self) -> EmptyResult {
            Ok(())
        }
    }

    fn registration() -> Arc<EventRegistration> {
        let mut builder = crate::registration::RegistryBuilder::new();
        builder.register_event::<Reading, _>(|_| {});

        builder
            .freeze(
                &crate::naming::NamingOptions::default(),
                &crate::serialization::HostInfo::new("kinesis-tests", "0.0.0"),
                &[NAME.to_owned()].into_iter().collect(),
                Some(NAME),
                crate::registration::UnhandledErrorBehavior::Deadletter,
            )
            .unwrap()
            .by_event_type::<Reading>()
            .unwrap()
    }

    fn message(id: &str) -> OutgoingMessage {
        OutgoingMessage {
            event_id: id.to_owned(),
            body: vec![1, 2, 3],
            content_type: "application/json".into(),
            headers: Default::default(),
            expires: None,
            scheduled: None,
        }
    }

    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    struct Reading {
        value: f64,
    }

    #[tokio::test]
    async fn key_records_by_event_id() {
        let client = Arc::new(RecordingClient {
            puts: Mutex::new(Vec::new()),
        });
        let transport = KinesisTransport::new(client.clone());
        transport.started.store(true, Ordering::SeqCst);

        transport
            .send_many(vec![message("a"), message("b")], &registration())
            .await
            .unwrap();

        let puts = client.puts.lock().unwrap();
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].0, "reading");
        assert_eq!(puts[0].1[0].partition_key, "a");
        assert_eq!(puts[0].1[1].partition_key, "b");
    }

    #[tokio::test]
    async fn refuse_publishes_before_start() {
        let client = Arc::new(RecordingClient {
            puts: Mutex::new(Vec::new()),
        });
        let transport = KinesisTransport::new(client);

        let result = transport.send_one(message("a"), &registration()).await;
        assert!(matches!(result, Err(TransportError::NotRunning(_))));
    }
}
