//! RabbitMQ transport
//!
//! Events are published to a fanout exchange named after the event and fan
//! out into one durable queue per consumer. Scheduling rides on the
//! `x-delay` header and therefore requires the delayed-message plugin on the
//! broker; the marker returned is the event id and cancellation is not
//! possible once the message left the publisher.
//!
//! The transport owns its connection lifecycle: establishing it retries with
//! exponential backoff, and shutdown, blocked or callback-exception events
//! reported by the broker drop the connection so the next use reconnects.
//! A disposed transport never reconnects.

use super::{
    dispatch_message, DispatchOutcome, EventTransport, IncomingMessage, OutgoingMessage,
    ScheduledMarker, SingleFlightCache, TransportError, TransportStartContext,
};
use crate::bus::EventBus;
use crate::config::BusConfiguration;
use crate::constants::headers;
use crate::helpers::Backoff;
use crate::lifecycle::{ReadinessGate, ShutdownSignal, TaskSet};
use crate::registration::EventRegistration;
use crate::{BoxedError, EmptyResult};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, warn};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Name the RabbitMQ transport registers under
pub const NAME: &str = "rabbitmq";

/// Connection-level events reported by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The broker or the socket shut the connection down
    Shutdown,
    /// The broker blocked the connection, usually under resource pressure
    Blocked,
    /// A callback registered with the client library threw
    CallbackException,
}

/// One delivery taken from a queue
#[derive(Debug, Clone)]
pub struct AmqpDelivery {
    /// Channel-scoped tag used to settle the delivery
    pub delivery_tag: u64,
    /// Raw payload
    pub body: Vec<u8>,
    /// Content type from the basic properties
    pub content_type: Option<String>,
    /// Headers from the basic properties
    pub headers: HashMap<String, Value>,
}

/// Operations the transport calls on one AMQP channel
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    /// Declares a fanout exchange when it does not exist yet
    async fn declare_fanout_exchange(&self, exchange: &str) -> EmptyResult;

    /// Declares a durable queue when it does not exist yet
    async fn declare_durable_queue(&self, queue: &str) -> EmptyResult;

    /// Binds a queue to an exchange
    async fn bind_queue(&self, queue: &str, exchange: &str) -> EmptyResult;

    /// Publishes a message to an exchange
    async fn publish(
        &self,
        exchange: &str,
        body: &[u8],
        content_type: &str,
        headers: &HashMap<String, Value>,
    ) -> EmptyResult;

    /// Starts consuming a queue
    async fn consume(
        &self,
        queue: &str,
    ) -> Result<BoxStream<'static, Result<AmqpDelivery, BoxedError>>, BoxedError>;

    /// Positively acknowledges a delivery
    async fn ack(&self, delivery_tag: u64) -> EmptyResult;

    /// Negatively acknowledges a delivery, optionally requeueing it
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> EmptyResult;
}

/// Operations the transport calls on one AMQP connection
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    /// Opens a channel on this connection
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, BoxedError>;

    /// Stream of connection-level events, ending when the connection dies
    fn events(&self) -> BoxStream<'static, ConnectionEvent>;

    /// Whether the connection is currently open
    fn is_open(&self) -> bool;

    /// Closes the connection
    async fn close(&self) -> EmptyResult;
}

/// Factory establishing AMQP connections
#[async_trait]
pub trait AmqpConnector: Send + Sync {
    /// Establishes one connection to the broker
    async fn connect(&self) -> Result<Arc<dyn AmqpConnection>, BoxedError>;
}

/// Options specific to the RabbitMQ transport
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RabbitMqConfiguration {
    /// How many times establishing a connection is retried
    pub retry_count: u32,
}

impl Default for RabbitMqConfiguration {
    fn default() -> Self {
        Self { retry_count: 5 }
    }
}

/// Delays between connection attempts, `2^attempt` seconds per attempt
fn connection_backoff(retry_count: u32) -> Backoff {
    Backoff::new(Duration::from_secs(1), 2, retry_count)
}

struct Runtime {
    bus: EventBus,
    configuration: Arc<BusConfiguration>,
    tasks: Arc<TaskSet>,
}

struct Inner {
    connector: Arc<dyn AmqpConnector>,
    configuration: RabbitMqConfiguration,
    connection: tokio::sync::Mutex<Option<Arc<dyn AmqpConnection>>>,
    channels: SingleFlightCache<String, Arc<dyn AmqpChannel>>,
    disposed: AtomicBool,
    runtime: std::sync::Mutex<Option<Arc<Runtime>>>,
}

impl Inner {
    /// Returns the live connection, establishing one with backoff when absent
    async fn connection(self: &Arc<Self>) -> Result<Arc<dyn AmqpConnection>, BoxedError> {
        let mut slot = self.connection.lock().await;

        if let Some(connection) = slot.as_ref() {
            if connection.is_open() {
                return Ok(connection.clone());
            }
        }

        let mut backoff = connection_backoff(self.configuration.retry_count);

        let connection = loop {
            match self.connector.connect().await {
                Ok(connection) => break connection,
                Err(error) => match backoff.next() {
                    Some(delay) => {
                        warn!(
                            "Connecting to RabbitMQ failed ({}), retrying in {:?}",
                            error, delay
                        );
                        sleep(delay).await;
                    }
                    None => return Err(error),
                },
            }
        };

        let monitor = self.clone();
        let events = connection.events();
        tokio::spawn(async move {
            monitor.watch_connection(events).await;
        });

        *slot = Some(connection.clone());
        Ok(connection)
    }

    /// Drops the connection on broker-reported trouble so the next use
    /// reconnects; does nothing once the transport is disposed
    async fn watch_connection(self: Arc<Self>, mut events: BoxStream<'static, ConnectionEvent>) {
        while let Some(event) = events.next().await {
            if self.disposed.load(Ordering::SeqCst) {
                return;
            }

            warn!("RabbitMQ connection reported {:?}, reconnecting", event);
            self.connection.lock().await.take();
            self.channels.clear().await;
        }
    }

    async fn channel(self: &Arc<Self>, key: &str) -> Result<Arc<dyn AmqpChannel>, BoxedError> {
        let this = self.clone();

        self.channels
            .get_or_create(&key.to_owned(), || async move {
                let connection = this.connection().await?;
                connection.create_channel().await
            })
            .await
    }

    fn runtime(&self) -> Result<Arc<Runtime>, TransportError> {
        self.runtime
            .lock()
            .unwrap()
            .clone()
            .ok_or(TransportError::NotRunning(NAME))
    }
}

/// Transport over RabbitMQ
#[derive(Clone)]
pub struct RabbitMqTransport {
    inner: Arc<Inner>,
}

impl RabbitMqTransport {
    /// Creates a transport with default options
    pub fn new(connector: Arc<dyn AmqpConnector>) -> Self {
        Self::with_configuration(connector, RabbitMqConfiguration::default())
    }

    /// Creates a transport with explicit options
    pub fn with_configuration(
        connector: Arc<dyn AmqpConnector>,
        configuration: RabbitMqConfiguration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                configuration,
                connection: tokio::sync::Mutex::new(None),
                channels: SingleFlightCache::new(),
                disposed: AtomicBool::new(false),
                runtime: std::sync::Mutex::new(None),
            }),
        }
    }
}

#[async_trait]
impl EventTransport for RabbitMqTransport {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn send_one(
        &self,
        message: OutgoingMessage,
        registration: &EventRegistration,
    ) -> Result<Option<ScheduledMarker>, TransportError> {
        self.inner.runtime()?;

        let channel = self.inner.channel(registration.event_name()).await?;

        let mut amqp_headers = message.headers.clone();
        let scheduled = message.scheduled.is_some();
        if let Some(at) = message.scheduled {
            let delay = (at - chrono::Utc::now()).num_milliseconds().max(0);
            amqp_headers.insert("x-delay".to_owned(), Value::from(delay));
        }
        amqp_headers.insert(
            headers::CONTENT_TYPE.to_owned(),
            Value::String(message.content_type.clone()),
        );

        channel
            .publish(
                registration.event_name(),
                &message.body,
                &message.content_type,
                &amqp_headers,
            )
            .await?;

        Ok(scheduled.then(|| ScheduledMarker::new(message.event_id)))
    }

    async fn send_many(
        &self,
        messages: Vec<OutgoingMessage>,
        registration: &EventRegistration,
    ) -> Result<Vec<Option<ScheduledMarker>>, TransportError> {
        let mut markers = Vec::with_capacity(messages.len());
        for message in messages {
            markers.push(self.send_one(message, registration).await?);
        }
        Ok(markers)
    }

    async fn start(&self, context: TransportStartContext) -> EmptyResult {
        let runtime = Arc::new(Runtime {
            bus: context.bus,
            configuration: context.configuration,
            tasks: TaskSet::new(),
        });
        *self.inner.runtime.lock().unwrap() = Some(runtime.clone());

        let provision = runtime.configuration.enable_entity_creation;

        for registration in context.registrations {
            if provision {
                let channel = self.inner.channel(registration.event_name()).await?;
                channel
                    .declare_fanout_exchange(registration.event_name())
                    .await?;

                for consumer in registration.consumers() {
                    channel.declare_durable_queue(consumer.consumer_name()).await?;
                    channel
                        .bind_queue(consumer.consumer_name(), registration.event_name())
                        .await?;
                }
            }

            for index in 0..registration.consumers().len() {
                runtime
                    .tasks
                    .spawn(consume_loop(
                        self.inner.clone(),
                        registration.clone(),
                        index,
                        runtime.bus.clone(),
                        context.gate.clone(),
                        runtime.tasks.signal(),
                    ))
                    .await;
            }
        }

        Ok(())
    }

    async fn stop(&self, grace: Duration) -> EmptyResult {
        self.inner.disposed.store(true, Ordering::SeqCst);

        let runtime = self.inner.runtime.lock().unwrap().take();
        if let Some(runtime) = runtime {
            let outstanding = runtime.tasks.stop(grace).await;
            if outstanding > 0 {
                warn!("{} RabbitMQ consumer(s) outlived the grace window", outstanding);
            }
        }

        if let Some(connection) = self.inner.connection.lock().await.take() {
            if let Err(error) = connection.close().await {
                warn!("Closing the RabbitMQ connection failed: {}", error);
            }
        }
        self.inner.channels.clear().await;

        Ok(())
    }

    async fn check_health(&self) -> Result<bool, TransportError> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Ok(false);
        }

        if let Some(connection) = self.inner.connection.lock().await.as_ref() {
            if connection.is_open() {
                return Ok(true);
            }
        }

        match self.inner.connector.connect().await {
            Ok(connection) => {
                let open = connection.is_open();
                let _ = connection.close().await;
                Ok(open)
            }
            Err(error) => {
                warn!("RabbitMQ health probe failed: {}", error);
                Ok(false)
            }
        }
    }
}

async fn consume_loop(
    inner: Arc<Inner>,
    registration: Arc<EventRegistration>,
    consumer_index: usize,
    bus: EventBus,
    gate: ReadinessGate,
    shutdown: ShutdownSignal,
) {
    gate.opened().await;

    let queue = registration.consumers()[consumer_index]
        .consumer_name()
        .to_owned();
    let channel_key = format!("consume:{}", queue);

    while !shutdown.is_requested() {
        let channel = match inner.channel(&channel_key).await {
            Ok(channel) => channel,
            Err(error) => {
                warn!("Opening a channel for queue {} failed: {}", queue, error);
                tokio::select! {
                    _ = sleep(Duration::from_secs(1)) => continue,
                    _ = shutdown.requested() => break,
                }
            }
        };

        let mut deliveries = match channel.consume(&queue).await {
            Ok(deliveries) => deliveries,
            Err(error) => {
                warn!("Consuming queue {} failed: {}", queue, error);
                tokio::select! {
                    _ = sleep(Duration::from_secs(1)) => continue,
                    _ = shutdown.requested() => break,
                }
            }
        };

        debug!("Consuming queue {}", queue);

        loop {
            tokio::select! {
                _ = shutdown.requested() => return,
                item = deliveries.next() => match item {
                    Some(Ok(delivery)) => {
                        handle_delivery(&registration, consumer_index, &bus, &channel, delivery).await;
                    }
                    Some(Err(error)) => {
                        warn!("Receiving from queue {} failed: {}", queue, error);
                    }
                    None => {
                        // The channel died with its connection; leave the
                        // inner loop so a fresh channel gets consumed.
                        warn!("Delivery stream for queue {} ended", queue);
                        break;
                    }
                }
            }
        }

        inner.channels.clear().await;
    }
}

async fn handle_delivery(
    registration: &Arc<EventRegistration>,
    consumer_index: usize,
    bus: &EventBus,
    channel: &Arc<dyn AmqpChannel>,
    delivery: AmqpDelivery,
) {
    let incoming = IncomingMessage {
        body: delivery.body,
        content_type: delivery.content_type.clone().or_else(|| {
            delivery
                .headers
                .get(headers::CONTENT_TYPE)
                .and_then(Value::as_str)
                .map(str::to_owned)
        }),
        headers: delivery.headers,
        sequence: Some(delivery.delivery_tag.to_string()),
    };

    let consumer = &registration.consumers()[consumer_index];
    let outcome = dispatch_message(incoming, registration, consumer, bus).await;

    let result = match outcome {
        DispatchOutcome::Acknowledge | DispatchOutcome::Discard(_) => {
            channel.ack(delivery.delivery_tag).await
        }
        // Without requeue the broker drops the message or moves it to the
        // queue's configured dead-letter exchange.
        DispatchOutcome::DeadLetter(_) => channel.nack(delivery.delivery_tag, false).await,
        DispatchOutcome::Fail(_) => channel.nack(delivery.delivery_tag, true).await,
    };

    if let Err(error) = result {
        warn!(
            "Failed to settle delivery {} on queue {}: {}",
            delivery.delivery_tag,
            consumer.consumer_name(),
            error
        );
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn retry_connections_on_a_doubling_schedule() {
        let delays: Vec<_> = connection_backoff(4).collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
            ]
        );
    }

    #[test]
    fn stop_retrying_after_the_configured_attempts() {
        assert_eq!(connection_backoff(5).count(), 5);
        assert_eq!(connection_backoff(0).count(), 0);
    }
}
