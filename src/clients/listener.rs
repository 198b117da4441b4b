use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_postgres::{AsyncMessage, Client, NoTls, Notification};
use tracing::{debug, info, warn};

use crate::error::Result;

/// A decoded `NOTIFY` delivery. The payload is advisory: triggers attach a
/// small JSON object, but callers must re-query the schedule table rather
/// than trust it, since notifications can be dropped on reconnect.
#[derive(Debug, Clone)]
pub struct ChannelNotification {
    pub channel: String,
    pub payload: Option<Value>,
}

/// Dedicated LISTEN/NOTIFY connection. tokio-postgres only surfaces
/// notifications through the connection future, so the driver task forwards
/// them into an in-process channel the listener reads from.
///
/// Postgres delivers notifications immediately only outside transactions;
/// this client never opens one.
pub struct NotificationListener {
    conn_str: String,
    client: Client,
    rx: UnboundedReceiver<Notification>,
    channels: Vec<String>,
}

impl NotificationListener {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let (client, rx) = Self::open(database_url).await?;

        info!("Notification listener connected");

        Ok(Self {
            conn_str: database_url.to_string(),
            client,
            rx,
            channels: Vec::new(),
        })
    }

    async fn open(conn_str: &str) -> Result<(Client, UnboundedReceiver<Notification>)> {
        let (client, mut connection) = tokio_postgres::connect(conn_str, NoTls).await?;
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                match std::future::poll_fn(|cx| connection.poll_message(cx)).await {
                    Some(Ok(AsyncMessage::Notification(notification))) => {
                        if tx.send(notification).is_err() {
                            break;
                        }
                    }
                    Some(Ok(AsyncMessage::Notice(notice))) => {
                        debug!(notice = %notice, "Database notice");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "Notification connection error");
                        break;
                    }
                    None => break,
                }
            }
            // tx drops here; the receiver sees a closed channel and the
            // listener reconnects on its next wait.
        });

        Ok((client, rx))
    }

    /// Issues `LISTEN` on the channel and remembers it for re-issue after a
    /// reconnect.
    pub async fn listen(&mut self, channel: &str) -> Result<()> {
        self.client
            .batch_execute(&format!("LISTEN \"{channel}\""))
            .await?;

        if !self.channels.iter().any(|c| c == channel) {
            self.channels.push(channel.to_string());
        }

        info!(channel = %channel, "Listening for database notifications");

        Ok(())
    }

    /// Waits up to `timeout` for the next notification on any subscribed
    /// channel. Returns `Ok(None)` when the timeout elapses. A dead
    /// connection is replaced transparently within the same wait, with every
    /// subscribed channel re-LISTENed.
    pub async fn wait_for_notification(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<ChannelNotification>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.client.is_closed() {
                self.reconnect().await?;
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            match tokio::time::timeout(remaining, self.rx.recv()).await {
                Ok(Some(notification)) => {
                    debug!(
                        channel = %notification.channel(),
                        "Database notification received"
                    );
                    return Ok(Some(Self::decode(&notification)));
                }
                Ok(None) => {
                    // Driver task ended: the connection died under us.
                    self.reconnect().await?;
                }
                Err(_) => return Ok(None),
            }
        }
    }

    fn decode(notification: &Notification) -> ChannelNotification {
        ChannelNotification {
            channel: notification.channel().to_string(),
            payload: parse_payload(notification.payload()),
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        warn!("Notification listener connection lost, reconnecting");

        let (client, rx) = Self::open(&self.conn_str).await?;
        self.client = client;
        self.rx = rx;

        for channel in &self.channels {
            self.client
                .batch_execute(&format!("LISTEN \"{channel}\""))
                .await?;
        }

        Ok(())
    }

    pub fn close(self) {
        info!("Notification listener closed");
    }
}

fn parse_payload(raw: &str) -> Option<Value> {
    if raw.is_empty() {
        return None;
    }

    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!(error = %e, "Notification payload is not JSON");
            None
        }
    }
}
