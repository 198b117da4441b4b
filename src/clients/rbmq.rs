use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use futures_util::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    error::Result,
    models::{
        event::{Event, EventType},
        topology::{QueueSpec, Topology},
    },
};

pub async fn connect_broker(url: &str) -> Result<Connection> {
    let connection = Connection::connect(url, ConnectionProperties::default()).await?;

    info!("RabbitMQ connection established");

    Ok(connection)
}

/// Declares every exchange, queue and binding in the topology. Safe to run
/// from any component at any time: all declarations are idempotent as long
/// as the arguments stay identical, which they do because everyone builds
/// the same `Topology` from config.
pub async fn declare_topology(channel: &Channel, topology: &Topology) -> Result<()> {
    for exchange in &topology.exchanges {
        channel
            .exchange_declare(
                &exchange.name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
    }

    for queue in &topology.queues {
        channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                queue_arguments(queue),
            )
            .await?;
    }

    for binding in &topology.bindings {
        channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
    }

    info!(
        exchanges = topology.exchanges.len(),
        queues = topology.queues.len(),
        bindings = topology.bindings.len(),
        "Broker topology declared"
    );

    Ok(())
}

pub fn queue_arguments(spec: &QueueSpec) -> FieldTable {
    let mut arguments = FieldTable::default();

    if let Some(ttl_ms) = spec.message_ttl_ms {
        arguments.insert("x-message-ttl".into(), AMQPValue::LongUInt(ttl_ms));
    }

    if let Some(dlx) = &spec.dead_letter_exchange {
        arguments.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(dlx.as_str().into()),
        );
    }

    arguments
}

pub fn event_properties(ttl: Option<Duration>) -> BasicProperties {
    let properties = BasicProperties::default()
        .with_content_type("application/json".into())
        .with_delivery_mode(2);

    match ttl {
        Some(ttl) => properties.with_expiration(ttl.as_millis().to_string().into()),
        None => properties,
    }
}

/// Properties for messages re-emitted by the retry daemon. Never carries an
/// expiration: a republished message that could expire would fall back into
/// the dead-letter queue and be republished again, growing the queue without
/// bound under a downstream outage.
pub fn republish_properties() -> BasicProperties {
    BasicProperties::default()
        .with_content_type("application/json".into())
        .with_delivery_mode(2)
}

pub struct EventPublisher {
    url: String,
    exchange: String,
    connection: Connection,
    channel: Channel,
}

impl EventPublisher {
    pub async fn connect(config: &Config) -> Result<Self> {
        let connection = connect_broker(&config.rabbitmq_url).await?;
        let channel = connection.create_channel().await?;

        channel
            .exchange_declare(
                &config.main_exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(Self {
            url: config.rabbitmq_url.clone(),
            exchange: config.main_exchange.clone(),
            connection,
            channel,
        })
    }

    /// Publishes a persistent event, routed by `routing_key` if given, else
    /// by the event's own type.
    pub async fn publish(&mut self, event: &Event, routing_key: Option<&str>) -> Result<()> {
        self.publish_with_ttl(event, None, routing_key).await
    }

    /// Like `publish`, with a per-message expiration. Only first-time
    /// publishes may carry one; the retry path goes through `republish`.
    pub async fn publish_with_ttl(
        &mut self,
        event: &Event,
        ttl: Option<Duration>,
        routing_key: Option<&str>,
    ) -> Result<()> {
        let payload = serde_json::to_vec(event)?;
        let key = match routing_key {
            Some(key) => key.to_string(),
            None => event.routing_key().to_string(),
        };

        self.publish_raw(&payload, &key, event_properties(ttl))
            .await?;

        debug!(
            event_id = %event.event_id,
            routing_key = %key,
            "Event published"
        );

        Ok(())
    }

    /// Republishes raw message bytes under the given routing key. The
    /// properties are fixed by `republish_properties`, so this path cannot
    /// attach an expiration.
    pub async fn republish(&mut self, payload: &[u8], routing_key: &str) -> Result<()> {
        self.publish_raw(payload, routing_key, republish_properties())
            .await
    }

    async fn publish_raw(
        &mut self,
        payload: &[u8],
        routing_key: &str,
        properties: BasicProperties,
    ) -> Result<()> {
        if !self.channel.status().connected() {
            warn!("Publisher channel closed, reconnecting");
            self.reopen().await?;
        }

        match self
            .try_publish(payload, routing_key, properties.clone())
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, "Publish failed, reconnecting once");
                self.reopen().await?;
                self.try_publish(payload, routing_key, properties).await
            }
        }
    }

    async fn try_publish(
        &self,
        payload: &[u8],
        routing_key: &str,
        properties: BasicProperties,
    ) -> Result<()> {
        self.channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?;

        Ok(())
    }

    async fn reopen(&mut self) -> Result<()> {
        let connection = connect_broker(&self.url).await?;
        let channel = connection.create_channel().await?;

        self.connection = connection;
        self.channel = channel;

        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.channel.close(200, "publisher shutdown").await?;
        self.connection.close(200, "publisher shutdown").await?;

        Ok(())
    }
}

type EventHandler =
    Box<dyn Fn(Event) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;

pub struct EventConsumer {
    connection: Connection,
    channel: Channel,
    queue: String,
    exchange: String,
    handlers: HashMap<EventType, EventHandler>,
}

impl EventConsumer {
    /// Opens a channel and declares the named durable queue with the
    /// arguments the topology assigns it (TTL and dead-letter exchange for
    /// primary queues).
    pub async fn connect(config: &Config, queue: &str) -> Result<Self> {
        let connection = connect_broker(&config.rabbitmq_url).await?;
        let channel = connection.create_channel().await?;

        channel
            .basic_qos(config.prefetch_count, BasicQosOptions::default())
            .await?;

        channel
            .exchange_declare(
                &config.main_exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let topology = config.topology();
        let arguments = match topology.queue(queue) {
            Some(spec) => queue_arguments(spec),
            None => FieldTable::default(),
        };

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await?;

        Ok(Self {
            connection,
            channel,
            queue: queue.to_string(),
            exchange: config.main_exchange.clone(),
            handlers: HashMap::new(),
        })
    }

    /// Adds one more pattern binding to the queue. A queue may hold several,
    /// e.g. `game.*` plus `game.updated.#` for a fan-in consumer.
    pub async fn bind(&self, routing_key_pattern: &str) -> Result<()> {
        self.channel
            .queue_bind(
                &self.queue,
                &self.exchange,
                routing_key_pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(())
    }

    pub fn register_handler<F, Fut>(&mut self, event_type: EventType, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handlers
            .insert(event_type, Box::new(move |event| Box::pin(handler(event))));
    }

    /// Spawns the delivery loop for this queue. Every delivery is
    /// acknowledged, including handler failures and undecodable bodies: a
    /// poison message must not block the queue. Handler errors are logged
    /// and otherwise the handler's own problem to report.
    pub fn start_consuming(self) -> JoinHandle<()> {
        // The task takes ownership of self so the connection stays alive
        // for as long as the consumer stream runs.
        tokio::spawn(async move {
            let mut consumer = match self
                .channel
                .basic_consume(
                    &self.queue,
                    &format!("{}_consumer", self.queue),
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
            {
                Ok(consumer) => consumer,
                Err(e) => {
                    warn!(queue = %self.queue, error = %e, "Failed to start consumer");
                    return;
                }
            };

            info!(queue = %self.queue, "Consumer started");

            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        warn!(queue = %self.queue, error = %e, "Consumer stream error");
                        continue;
                    }
                };

                match serde_json::from_slice::<Event>(&delivery.data) {
                    Ok(event) => match self.handlers.get(&event.event_type) {
                        Some(handler) => {
                            let event_id = event.event_id;
                            if let Err(e) = handler(event).await {
                                warn!(
                                    queue = %self.queue,
                                    event_id = %event_id,
                                    error = %e,
                                    "Event handler failed"
                                );
                            }
                        }
                        None => {
                            debug!(
                                queue = %self.queue,
                                event_type = %event.event_type,
                                "No handler registered for event type"
                            );
                        }
                    },
                    Err(e) => {
                        warn!(queue = %self.queue, error = %e, "Discarding undecodable event");
                    }
                }

                if let Err(e) = self
                    .channel
                    .basic_ack(delivery.delivery_tag, BasicAckOptions::default())
                    .await
                {
                    warn!(queue = %self.queue, error = %e, "Failed to acknowledge delivery");
                }
            }

            info!(queue = %self.queue, "Consumer stream ended");
        })
    }

    pub async fn close(&self) -> Result<()> {
        self.channel.close(200, "consumer shutdown").await?;
        self.connection.close(200, "consumer shutdown").await?;

        Ok(())
    }
}
