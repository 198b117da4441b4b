use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub checks: HashMap<String, ServiceHealth>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub status: HealthStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServiceHealth {
    pub fn healthy(response_time_ms: u64) -> Self {
        Self {
            status: HealthStatus::Healthy,
            response_time_ms: Some(response_time_ms),
            error: None,
        }
    }

    pub fn unhealthy(error: String) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            response_time_ms: None,
            error: Some(error),
        }
    }

    pub fn degraded(error: String) -> Self {
        Self {
            status: HealthStatus::Degraded,
            response_time_ms: None,
            error: Some(error),
        }
    }
}

/// Point-in-time view of the retry daemon, embedded in the health response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySnapshot {
    pub healthy: bool,
    pub broker_reachable: bool,
    pub queues: Vec<RetryQueueReport>,
    pub cycle_duration: DurationStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryQueueReport {
    pub queue: String,
    pub depth: u32,
    pub processed_total: u64,
    pub failed_total: u64,
    pub consecutive_failures: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,
}

/// Running distribution of observed durations. Kept as totals rather than a
/// sample buffer so it stays O(1) regardless of uptime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DurationStats {
    pub samples: u64,
    pub total_ms: u64,
    pub max_ms: u64,
}

impl DurationStats {
    pub fn record(&mut self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        self.samples += 1;
        self.total_ms += ms;
        self.max_ms = self.max_ms.max(ms);
    }

    pub fn average_ms(&self) -> u64 {
        if self.samples == 0 {
            0
        } else {
            self.total_ms / self.samples
        }
    }
}
