/// Default exchange names; overridable through configuration.
pub const MAIN_EXCHANGE: &str = "game_events";
pub const DEAD_LETTER_EXCHANGE: &str = "game_events.dlx";

/// One hour. Messages that sit unconsumed this long fall into the
/// per-queue dead-letter queue.
pub const DEFAULT_QUEUE_TTL_MS: u32 = 3_600_000;

pub const NOTIFICATIONS_QUEUE: &str = "notifications";
pub const GAME_UPDATES_QUEUE: &str = "game_updates";

const DLQ_SUFFIX: &str = ".dlq";

pub fn dlq_name(primary: &str) -> String {
    format!("{primary}{DLQ_SUFFIX}")
}

/// Both exchanges are declared topic and durable, so the name is all a
/// declaration needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    /// Primary queues carry a TTL; dead-letter queues must not, so parked
    /// messages cannot re-expire while waiting for the retry daemon.
    pub message_ttl_ms: Option<u32>,
    pub dead_letter_exchange: Option<String>,
}

impl QueueSpec {
    pub fn is_dead_letter(&self) -> bool {
        self.message_ttl_ms.is_none() && self.dead_letter_exchange.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSpec {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

/// The full static broker layout, declared idempotently at startup by any
/// component. Each primary queue gets a `<name>.dlq` twin bound on the
/// dead-letter exchange with the same patterns, so an expired message lands
/// in the DLQ matching the queue it fell out of.
#[derive(Debug, Clone)]
pub struct Topology {
    pub exchanges: Vec<ExchangeSpec>,
    pub queues: Vec<QueueSpec>,
    pub bindings: Vec<BindingSpec>,
}

impl Topology {
    pub fn standard(main_exchange: &str, dead_letter_exchange: &str, queue_ttl_ms: u32) -> Self {
        let mut topology = Self {
            exchanges: vec![
                ExchangeSpec { name: main_exchange.to_string() },
                ExchangeSpec { name: dead_letter_exchange.to_string() },
            ],
            queues: Vec::new(),
            bindings: Vec::new(),
        };

        topology.add_queue_pair(
            NOTIFICATIONS_QUEUE,
            &["notification_due"],
            main_exchange,
            dead_letter_exchange,
            queue_ttl_ms,
        );
        topology.add_queue_pair(
            GAME_UPDATES_QUEUE,
            &["game.*", "game.updated.#"],
            main_exchange,
            dead_letter_exchange,
            queue_ttl_ms,
        );

        topology
    }

    fn add_queue_pair(
        &mut self,
        name: &str,
        patterns: &[&str],
        main_exchange: &str,
        dead_letter_exchange: &str,
        queue_ttl_ms: u32,
    ) {
        self.queues.push(QueueSpec {
            name: name.to_string(),
            message_ttl_ms: Some(queue_ttl_ms),
            dead_letter_exchange: Some(dead_letter_exchange.to_string()),
        });

        let dlq = dlq_name(name);
        self.queues.push(QueueSpec {
            name: dlq.clone(),
            message_ttl_ms: None,
            dead_letter_exchange: None,
        });

        for pattern in patterns {
            self.bindings.push(BindingSpec {
                queue: name.to_string(),
                exchange: main_exchange.to_string(),
                routing_key: (*pattern).to_string(),
            });
            self.bindings.push(BindingSpec {
                queue: dlq.clone(),
                exchange: dead_letter_exchange.to_string(),
                routing_key: (*pattern).to_string(),
            });
        }
    }

    pub fn queue(&self, name: &str) -> Option<&QueueSpec> {
        self.queues.iter().find(|q| q.name == name)
    }

    pub fn dead_letter_queues(&self) -> Vec<String> {
        self.queues
            .iter()
            .filter(|q| q.is_dead_letter())
            .map(|q| q.name.clone())
            .collect()
    }
}
