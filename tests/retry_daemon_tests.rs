use std::sync::{Arc, atomic::AtomicBool};
use std::time::Duration;

use anyhow::{Result, anyhow};
use events_service::{
    clients::rbmq::{connect_broker, declare_topology},
    config::Config,
    daemons::retry::{RetryDaemon, RetryStats},
    models::event::{Event, EventType},
};
use lapin::{
    BasicProperties, Channel,
    options::{
        BasicAckOptions, BasicGetOptions, BasicPublishOptions, QueueDeclareOptions,
        QueuePurgeOptions,
    },
    types::{AMQPValue, FieldArray, FieldTable},
};
use tokio::time::sleep;

/// Test: A dead-lettered reminder is republished without the TTL that expired it
#[tokio::test]
async fn test_republished_message_sheds_its_ttl() -> Result<()> {
    let config = match load_config() {
        Some(config) => config,
        None => return Ok(()),
    };

    let connection = connect_broker(&config.rabbitmq_url).await?;
    let channel = connection.create_channel().await?;
    declare_topology(&channel, &config.topology()).await?;
    purge(&channel, &["notifications", "notifications.dlq"]).await?;

    let event = Event::new(
        EventType::NotificationDue,
        &serde_json::json!({ "game_id": "5f3c3c1e-0000-4000-8000-000000000001" }),
    )?;
    seed_dead_letter(
        &channel,
        "notifications.dlq",
        &event,
        "notifications",
        &config.main_exchange,
        "notification_due",
        Some("60000"),
    )
    .await?;

    let stats = Arc::new(RetryStats::new(config.retry_failure_threshold));
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut daemon = RetryDaemon::new(&config, stats.clone(), shutdown).await?;
    daemon.run_cycle().await?;

    wait_for_queue_count(&channel, "notifications.dlq", 0, Duration::from_secs(5)).await?;
    wait_for_queue_count(&channel, "notifications", 1, Duration::from_secs(5)).await?;

    let message = channel
        .basic_get("notifications", BasicGetOptions::default())
        .await?
        .ok_or_else(|| anyhow!("No republished message in notifications"))?;

    assert!(
        message.delivery.properties.expiration().is_none(),
        "A republished message must never carry an expiration again"
    );
    assert_eq!(message.delivery.routing_key.as_str(), "notification_due");

    let republished: Event = serde_json::from_slice(&message.delivery.data)?;
    assert_eq!(republished.event_id, event.event_id);

    channel
        .basic_ack(message.delivery.delivery_tag, BasicAckOptions::default())
        .await?;
    assert!(stats.is_healthy());

    Ok(())
}

/// Test: Repeated cycles move a dead-lettered event exactly once, on its original key
#[tokio::test]
async fn test_retry_cycles_do_not_multiply_messages() -> Result<()> {
    let config = match load_config() {
        Some(config) => config,
        None => return Ok(()),
    };

    let connection = connect_broker(&config.rabbitmq_url).await?;
    let channel = connection.create_channel().await?;
    declare_topology(&channel, &config.topology()).await?;
    purge(&channel, &["game_updates", "game_updates.dlq"]).await?;

    let event = Event::new(
        EventType::GameStatusTransition,
        &serde_json::json!({ "from_status": "open", "to_status": "running" }),
    )?;
    seed_dead_letter(
        &channel,
        "game_updates.dlq",
        &event,
        "game_updates",
        &config.main_exchange,
        "game.status_transition",
        None,
    )
    .await?;

    let stats = Arc::new(RetryStats::new(config.retry_failure_threshold));
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut daemon = RetryDaemon::new(&config, stats.clone(), shutdown).await?;

    daemon.run_cycle().await?;
    wait_for_queue_count(&channel, "game_updates.dlq", 0, Duration::from_secs(5)).await?;
    wait_for_queue_count(&channel, "game_updates", 1, Duration::from_secs(5)).await?;

    // A second pass over the drained queue must not invent a duplicate.
    daemon.run_cycle().await?;
    sleep(Duration::from_millis(500)).await;
    assert_eq!(queue_count(&channel, "game_updates.dlq").await?, 0);
    assert_eq!(
        queue_count(&channel, "game_updates").await?,
        1,
        "Primary queue must hold exactly one copy"
    );

    let message = channel
        .basic_get("game_updates", BasicGetOptions::default())
        .await?
        .ok_or_else(|| anyhow!("No republished message in game_updates"))?;

    assert_eq!(
        message.delivery.routing_key.as_str(),
        "game.status_transition",
        "Routing key must be recovered from the death metadata"
    );
    assert!(message.delivery.properties.expiration().is_none());

    channel
        .basic_ack(message.delivery.delivery_tag, BasicAckOptions::default())
        .await?;
    assert!(stats.is_healthy());

    Ok(())
}

fn load_config() -> Option<Config> {
    match Config::load() {
        Ok(config) => Some(config),
        Err(_) => {
            eprintln!("RABBITMQ_URL / DATABASE_URL not configured; skipping integration test");
            None
        }
    }
}

async fn purge(channel: &Channel, queues: &[&str]) -> Result<()> {
    for queue in queues {
        channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await?;
    }

    Ok(())
}

/// Publishes straight into a DLQ through the default exchange, with the
/// x-death header a broker would have stamped on the way in.
async fn seed_dead_letter(
    channel: &Channel,
    dlq: &str,
    event: &Event,
    primary_queue: &str,
    exchange: &str,
    routing_key: &str,
    expiration_ms: Option<&str>,
) -> Result<()> {
    let payload = serde_json::to_vec(event)?;

    let mut properties = BasicProperties::default()
        .with_delivery_mode(2)
        .with_content_type("application/json".into())
        .with_headers(death_headers(primary_queue, exchange, routing_key));
    if let Some(ms) = expiration_ms {
        properties = properties.with_expiration(ms.into());
    }

    channel
        .basic_publish(
            "",
            dlq,
            BasicPublishOptions::default(),
            &payload,
            properties,
        )
        .await?;

    Ok(())
}

fn death_headers(queue: &str, exchange: &str, routing_key: &str) -> FieldTable {
    let mut death = FieldTable::default();
    death.insert("count".into(), AMQPValue::LongLongInt(1));
    death.insert("reason".into(), AMQPValue::LongString("expired".into()));
    death.insert("queue".into(), AMQPValue::LongString(queue.into()));
    death.insert("exchange".into(), AMQPValue::LongString(exchange.into()));
    death.insert(
        "routing-keys".into(),
        AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::LongString(
            routing_key.into(),
        )])),
    );

    let mut headers = FieldTable::default();
    headers.insert(
        "x-death".into(),
        AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::FieldTable(death)])),
    );

    headers
}

async fn queue_count(channel: &Channel, queue: &str) -> Result<u32> {
    let declared = channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                passive: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    Ok(declared.message_count())
}

async fn wait_for_queue_count(
    channel: &Channel,
    queue: &str,
    expected: u32,
    timeout: Duration,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let count = queue_count(channel, queue).await?;
        if count == expected {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow!(
                "queue {queue} stuck at {count}, expected {expected}"
            ));
        }
        sleep(Duration::from_millis(200)).await;
    }
}
