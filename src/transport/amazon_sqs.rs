//! Amazon SNS/SQS transport
//!
//! Broadcast events fan out through an SNS topic into one SQS queue per
//! consumer; point-to-point events go straight onto a single queue named
//! after the event. Reserved headers ride on message attributes. Neither SNS
//! nor SQS can schedule far-future deliveries or cancel them, so scheduled
//! publishes are delivered immediately with a warning.
//!
//! The AWS create calls are idempotent and return the existing entity, which
//! is why the same client verbs double as name resolution when entity
//! creation is disabled.

use super::{
    dispatch_message, run_poll_loop, DispatchOutcome, EventTransport, IncomingMessage,
    OutgoingMessage, PollSource, ScheduledMarker, SingleFlightCache, TransportError,
    TransportStartContext,
};
use crate::bus::EventBus;
use crate::config::BusConfiguration;
use crate::constants::{headers, DEADLETTER_SUFFIX, DEFAULT_POLL_BATCH_SIZE};
use crate::lifecycle::TaskSet;
use crate::registration::{EntityKind, EventRegistration};
use crate::{BoxedError, EmptyResult};
use async_trait::async_trait;
use log::{debug, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Name the SNS/SQS transport registers under
pub const NAME: &str = "amazon-sqs";

/// Message pulled from an SQS queue
#[derive(Debug, Clone)]
pub struct SqsMessage {
    /// Broker-assigned message identifier
    pub message_id: String,
    /// Receipt required to delete this delivery
    pub receipt_handle: String,
    /// Raw payload
    pub body: Vec<u8>,
    /// Message attributes as delivered
    pub attributes: HashMap<String, Value>,
}

/// Operations the transport calls on the AWS messaging services
#[async_trait]
pub trait SnsSqsClient: Send + Sync {
    /// Creates (or resolves) a topic, returning its ARN
    async fn create_topic(&self, name: &str) -> Result<String, BoxedError>;

    /// Creates (or resolves) a queue, returning its URL
    async fn create_queue(&self, name: &str) -> Result<String, BoxedError>;

    /// Subscribes a queue to a topic
    async fn subscribe(&self, topic_arn: &str, queue_url: &str) -> EmptyResult;

    /// Publishes to a topic with message attributes
    async fn publish(
        &self,
        topic_arn: &str,
        body: &[u8],
        attributes: &HashMap<String, Value>,
    ) -> EmptyResult;

    /// Sends directly to a queue with message attributes
    async fn send_message(
        &self,
        queue_url: &str,
        body: &[u8],
        attributes: &HashMap<String, Value>,
    ) -> EmptyResult;

    /// Receives up to `max` messages from a queue
    async fn receive_messages(
        &self,
        queue_url: &str,
        max: usize,
    ) -> Result<Vec<SqsMessage>, BoxedError>;

    /// Deletes a message by its receipt handle
    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> EmptyResult;

    /// Cheap reachability probe
    async fn ping(&self) -> EmptyResult;
}

struct Runtime {
    bus: EventBus,
    configuration: Arc<BusConfiguration>,
    tasks: Arc<TaskSet>,
}

/// Transport publishing through SNS/SQS and polling SQS queues
pub struct AmazonSqsTransport {
    client: Arc<dyn SnsSqsClient>,
    topic_arns: SingleFlightCache<String, String>,
    queue_urls: SingleFlightCache<String, String>,
    runtime: Mutex<Option<Arc<Runtime>>>,
}

impl AmazonSqsTransport {
    /// Creates a transport on top of an AWS client
    pub fn new(client: Arc<dyn SnsSqsClient>) -> Self {
        Self {
            client,
            topic_arns: SingleFlightCache::new(),
            queue_urls: SingleFlightCache::new(),
            runtime: Mutex::new(None),
        }
    }

    fn runtime(&self) -> Result<Arc<Runtime>, TransportError> {
        self.runtime
            .lock()
            .unwrap()
            .clone()
            .ok_or(TransportError::NotRunning(NAME))
    }

    async fn topic_arn(&self, name: &str) -> Result<String, TransportError> {
        let client = self.client.clone();
        let key = name.to_owned();

        Ok(self
            .topic_arns
            .get_or_create(&key.clone(), || async move { client.create_topic(&key).await })
            .await?)
    }

    async fn queue_url(&self, name: &str) -> Result<String, TransportError> {
        let client = self.client.clone();
        let key = name.to_owned();

        Ok(self
            .queue_urls
            .get_or_create(&key.clone(), || async move { client.create_queue(&key).await })
            .await?)
    }

    fn attributes(message: &OutgoingMessage) -> HashMap<String, Value> {
        let mut attributes = message.headers.clone();
        attributes.insert(
            headers::CONTENT_TYPE.to_owned(),
            Value::String(message.content_type.clone()),
        );
        attributes
    }
}

#[async_trait]
impl EventTransport for AmazonSqsTransport {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn send_one(
        &self,
        message: OutgoingMessage,
        registration: &EventRegistration,
    ) -> Result<Option<ScheduledMarker>, TransportError> {
        self.runtime()?;

        if message.scheduled.is_some() {
            warn!(
                "SNS/SQS cannot schedule deliveries, event {} is published immediately",
                message.event_id
            );
        }

        let attributes = Self::attributes(&message);

        match registration.entity_kind() {
            EntityKind::Broadcast => {
                let topic_arn = self.topic_arn(registration.event_name()).await?;
                self.client
                    .publish(&topic_arn, &message.body, &attributes)
                    .await?;
            }
            EntityKind::Queue => {
                let queue_url = self.queue_url(registration.event_name()).await?;
                self.client
                    .send_message(&queue_url, &message.body, &attributes)
                    .await?;
            }
        }

        Ok(None)
    }

    async fn start(&self, context: TransportStartContext) -> EmptyResult {
        let runtime = Arc::new(Runtime {
            bus: context.bus,
            configuration: context.configuration,
            tasks: TaskSet::new(),
        });
        *self.runtime.lock().unwrap() = Some(runtime.clone());

        let provision = runtime.configuration.enable_entity_creation;

        for registration in context.registrations {
            let deadletter_url = if registration.wants_deadletter() {
                let name = format!("{}{}", registration.event_name(), DEADLETTER_SUFFIX);
                Some(self.queue_url(&name).await?)
            } else {
                None
            };

            match registration.entity_kind() {
                EntityKind::Broadcast => {
                    let topic_arn = self.topic_arn(registration.event_name()).await?;

                    for (index, consumer) in registration.consumers().iter().enumerate() {
                        let queue_url = self.queue_url(consumer.consumer_name()).await?;

                        if provision {
                            self.client.subscribe(&topic_arn, &queue_url).await?;
                        }

                        self.spawn_poll_loop(
                            &runtime,
                            &context.gate,
                            queue_url,
                            deadletter_url.clone(),
                            registration.clone(),
                            vec![index],
                        )
                        .await;
                    }
                }
                EntityKind::Queue => {
                    if registration.consumers().is_empty() {
                        continue;
                    }

                    let queue_url = self.queue_url(registration.event_name()).await?;
                    let all = (0..registration.consumers().len()).collect();

                    self.spawn_poll_loop(
                        &runtime,
                        &context.gate,
                        queue_url,
                        deadletter_url,
                        registration.clone(),
                        all,
                    )
                    .await;
                }
            }
        }

        Ok(())
    }

    async fn stop(&self, grace: Duration) -> EmptyResult {
        let runtime = self.runtime.lock().unwrap().take();

        if let Some(runtime) = runtime {
            let outstanding = runtime.tasks.stop(grace).await;
            if outstanding > 0 {
                warn!("{} SQS poll loop(s) outlived the grace window", outstanding);
            }
        }

        self.topic_arns.clear().await;
        self.queue_urls.clear().await;
        Ok(())
    }

    async fn check_health(&self) -> Result<bool, TransportError> {
        match self.client.ping().await {
            Ok(()) => Ok(true),
            Err(error) => {
                warn!("SNS/SQS health probe failed: {}", error);
                Ok(false)
            }
        }
    }
}

impl AmazonSqsTransport {
    async fn spawn_poll_loop(
        &self,
        runtime: &Arc<Runtime>,
        gate: &crate::lifecycle::ReadinessGate,
        queue_url: String,
        deadletter_url: Option<String>,
        registration: Arc<EventRegistration>,
        consumer_indices: Vec<usize>,
    ) {
        debug!(
            "Polling SQS queue {} for event {}",
            queue_url,
            registration.event_name()
        );

        let source = SqsPollSource {
            client: self.client.clone(),
            queue_url,
            deadletter_url,
            registration,
            consumer_indices,
            bus: runtime.bus.clone(),
        };

        runtime
            .tasks
            .spawn(run_poll_loop(
                source,
                gate.clone(),
                runtime.tasks.signal(),
                runtime.configuration.empty_results_delay,
            ))
            .await;
    }
}

struct SqsPollSource {
    client: Arc<dyn SnsSqsClient>,
    queue_url: String,
    deadletter_url: Option<String>,
    registration: Arc<EventRegistration>,
    consumer_indices: Vec<usize>,
    bus: EventBus,
}

#[async_trait]
impl PollSource for SqsPollSource {
    type Delivery = SqsMessage;

    async fn poll(&self) -> Result<Vec<SqsMessage>, BoxedError> {
        self.client
            .receive_messages(&self.queue_url, DEFAULT_POLL_BATCH_SIZE)
            .await
    }

    async fn dispatch(&self, delivery: SqsMessage) {
        let content_type = delivery
            .attributes
            .get(headers::CONTENT_TYPE)
            .and_then(Value::as_str)
            .map(str::to_owned);

        let incoming = IncomingMessage {
            body: delivery.body.clone(),
            content_type,
            headers: delivery.attributes.clone(),
            sequence: Some(delivery.message_id.clone()),
        };

        let mut deadletter = false;
        let mut redeliver = false;

        for &index in &self.consumer_indices {
            let consumer = &self.registration.consumers()[index];

            match dispatch_message(incoming.clone(), &self.registration, consumer, &self.bus).await
            {
                DispatchOutcome::Acknowledge | DispatchOutcome::Discard(_) => {}
                DispatchOutcome::DeadLetter(_) => deadletter = true,
                DispatchOutcome::Fail(_) => redeliver = true,
            }
        }

        // The message reappears after its visibility timeout expires.
        if redeliver {
            return;
        }

        if deadletter {
            if let Some(shadow) = &self.deadletter_url {
                if let Err(error) = self
                    .client
                    .send_message(shadow, &delivery.body, &delivery.attributes)
                    .await
                {
                    warn!(
                        "Failed to shadow dead-letter message {} from {}: {}",
                        delivery.message_id,
                        self.registration.event_name(),
                        error
                    );
                    return;
                }
            }
        }

        if let Err(error) = self
            .client
            .delete_message(&self.queue_url, &delivery.receipt_handle)
            .await
        {
            warn!(
                "Failed to delete message {} from {}: {}",
                delivery.message_id, self.queue_url, error
            );
        }
    }

    fn describe(&self) -> String {
        format!("SQS queue {}", self.queue_url)
    }
}
