//! Azure Event Hubs transport
//!
//! Events flow through a partitioned hub named after the event; each
//! consumer reads under its own consumer group and acknowledges by
//! checkpointing into the host-provided blob checkpoint store. Hubs are
//! assumed to exist — Event Hubs offers no lightweight on-demand
//! provisioning — and neither scheduling nor cancellation is available.
//! Failed messages are shadow-published to a `-deadletter` hub.

use super::{
    dispatch_message, BrokerDelivery, DeliveryStream, DispatchOutcome, EventTransport,
    OutgoingMessage, ScheduledMarker, SingleFlightCache, TransportError, TransportStartContext,
};
use crate::bus::EventBus;
use crate::constants::DEADLETTER_SUFFIX;
use crate::lifecycle::{ReadinessGate, ShutdownSignal, TaskSet};
use crate::registration::EventRegistration;
use crate::{BoxedError, EmptyResult};
use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Name the Event Hubs transport registers under
pub const NAME: &str = "azure-event-hubs";

/// Producer attached to one hub
#[async_trait]
pub trait EventHubProducer: Send + Sync {
    /// Sends a batch of messages through the hub
    async fn send_batch(&self, messages: &[OutgoingMessage]) -> EmptyResult;
}

/// Operations the transport calls on the Event Hubs namespace
///
/// Checkpointing state lives in the host's blob checkpoint store; the
/// deliveries returned from [`subscribe`](EventHubsClient::subscribe)
/// checkpoint when acknowledged.
#[async_trait]
pub trait EventHubsClient: Send + Sync {
    /// Creates a producer attached to a hub
    async fn create_producer(&self, hub: &str) -> Result<Arc<dyn EventHubProducer>, BoxedError>;

    /// Starts processing a hub under a consumer group
    async fn subscribe(
        &self,
        hub: &str,
        consumer_group: &str,
    ) -> Result<DeliveryStream, BoxedError>;

    /// Cheap reachability probe against the namespace
    async fn ping(&self) -> EmptyResult;
}

struct Runtime {
    bus: EventBus,
    tasks: Arc<TaskSet>,
}

/// Transport over Azure Event Hubs
pub struct EventHubsTransport {
    client: Arc<dyn EventHubsClient>,
    producers: SingleFlightCache<String, Arc<dyn EventHubProducer>>,
    runtime: Mutex<Option<Arc<Runtime>>>,
}

impl EventHubsTransport {
    /// Creates a transport on top of a namespace client
    pub fn new(client: Arc<dyn EventHubsClient>) -> Self {
        Self {
            client,
            producers: SingleFlightCache::new(),
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

    async fn producer(&self, hub: &str) -> Result<Arc<dyn EventHubProducer>, TransportError> {
        let client = self.client.clone();
        let key = hub.to_owned();

        Ok(self
            .producers
            .get_or_create(&key.clone(), || async move { client.create_producer(&key).await })
            .await?)
    }
}

#[async_trait]
impl EventTransport for EventHubsTransport {
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
                "Event Hubs cannot schedule deliveries, event {} is published immediately",
                message.event_id
            );
        }

        let producer = self.producer(registration.event_name()).await?;
        producer.send_batch(std::slice::from_ref(&message)).await?;

        Ok(None)
    }

    async fn send_many(
        &self,
        messages: Vec<OutgoingMessage>,
        registration: &EventRegistration,
    ) -> Result<Vec<Option<ScheduledMarker>>, TransportError> {
        self.runtime()?;

        if messages.iter().any(|m| m.scheduled.is_some()) {
            warn!("Event Hubs cannot schedule deliveries, batch is published immediately");
        }

        let count = messages.len();
        let producer = self.producer(registration.event_name()).await?;
        producer.send_batch(&messages).await?;

        Ok(vec![None; count])
    }

    async fn start(&self, context: TransportStartContext) -> EmptyResult {
        let runtime = Arc::new(Runtime {
            bus: context.bus,
            tasks: TaskSet::new(),
        });
        *self.runtime.lock().unwrap() = Some(runtime.clone());

        for registration in context.registrations {
            let deadletter = if registration.wants_deadletter() {
                let hub = format!("{}{}", registration.event_name(), DEADLETTER_SUFFIX);
                Some(self.producer(&hub).await?)
            } else {
                None
            };

            for (index, consumer) in registration.consumers().iter().enumerate() {
                debug!(
                    "Processing hub {} under consumer group {}",
                    registration.event_name(),
                    consumer.consumer_name()
                );

                runtime
                    .tasks
                    .spawn(receive_loop(
                        self.client.clone(),
                        registration.clone(),
                        index,
                        deadletter.clone(),
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
        let runtime = self.runtime.lock().unwrap().take();

        if let Some(runtime) = runtime {
            let outstanding = runtime.tasks.stop(grace).await;
            if outstanding > 0 {
                warn!(
                    "{} Event Hubs processor(s) outlived the grace window",
                    outstanding
                );
            }
        }

        self.producers.clear().await;
        Ok(())
    }

    async fn check_health(&self) -> Result<bool, TransportError> {
        match self.client.ping().await {
            Ok(()) => Ok(true),
            Err(error) => {
                warn!("Event Hubs health probe failed: {}", error);
                Ok(false)
            }
        }
    }
}

async fn receive_loop(
    client: Arc<dyn EventHubsClient>,
    registration: Arc<EventRegistration>,
    consumer_index: usize,
    deadletter: Option<Arc<dyn EventHubProducer>>,
    bus: EventBus,
    gate: ReadinessGate,
    shutdown: ShutdownSignal,
) {
    gate.opened().await;

    let consumer_group = registration.consumers()[consumer_index]
        .consumer_name()
        .to_owned();

    let mut stream = match client
        .subscribe(registration.event_name(), &consumer_group)
        .await
    {
        Ok(stream) => stream,
        Err(error) => {
            warn!(
                "Failed to start processing hub {}: {}",
                registration.event_name(),
                error
            );
            return;
        }
    };

    loop {
        tokio::select! {
            _ = shutdown.requested() => break,
            item = stream.next() => match item {
                Some(Ok(mut delivery)) => {
                    let consumer = &registration.consumers()[consumer_index];
                    let outcome =
                        dispatch_message(delivery.message(), &registration, consumer, &bus).await;

                    settle(&registration, &deadletter, &mut *delivery, outcome).await;
                }
                Some(Err(error)) => {
                    warn!(
                        "Processing hub {} faulted: {}",
                        registration.event_name(),
                        error
                    );
                }
                None => {
                    warn!("Delivery stream for hub {} ended", registration.event_name());
                    break;
                }
            }
        }
    }
}

async fn settle(
    registration: &Arc<EventRegistration>,
    deadletter: &Option<Arc<dyn EventHubProducer>>,
    delivery: &mut dyn BrokerDelivery,
    outcome: DispatchOutcome,
) {
    let result = match outcome {
        DispatchOutcome::Acknowledge | DispatchOutcome::Discard(_) => {
            delivery.acknowledge().await
        }
        DispatchOutcome::DeadLetter(_) => {
            if let Some(shadow) = deadletter {
                let message = delivery.message();
                let copy = OutgoingMessage {
                    event_id: String::new(),
                    body: message.body,
                    content_type: message.content_type.unwrap_or_default(),
                    headers: message.headers,
                    expires: None,
                    scheduled: None,
                };

                if let Err(error) = shadow.send_batch(std::slice::from_ref(&copy)).await {
                    warn!(
                        "Failed to shadow dead-letter a message from hub {}: {}",
                        registration.event_name(),
                        error
                    );
                    // Not checkpointing keeps the message eligible for
                    // redelivery once the processor restarts.
                    return;
                }
            }

            delivery.acknowledge().await
        }
        DispatchOutcome::Fail(_) => {
            // Event Hubs has no negative acknowledgement; skipping the
            // checkpoint leaves the message in the stream.
            Ok(())
        }
    };

    if let Err(error) = result {
        warn!("Failed to checkpoint a delivery: {}", error);
    }
}
