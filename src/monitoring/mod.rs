use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Aggregate health derived from backend reachability and queue depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Process-wide counters. Everything is a relaxed atomic: the numbers
/// feed dashboards, not control flow.
#[derive(Debug, Default)]
pub struct Metrics {
    start: Option<Instant>,

    pub webhooks_received: AtomicU64,
    pub webhooks_rejected_signature: AtomicU64,
    pub webhooks_ignored: AtomicU64,
    pub webhooks_throttled: AtomicU64,

    pub tasks_created: AtomicU64,
    pub tasks_deduplicated: AtomicU64,
    pub tasks_completed: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub tasks_rejected: AtomicU64,

    pub commands_parsed: AtomicU64,
    pub commands_unknown: AtomicU64,

    pub runner_invocations: AtomicU64,
    pub runner_timeouts: AtomicU64,
    pub runner_cancellations: AtomicU64,
    pub runner_wall_time_millis: AtomicU64,

    pub usage_input_tokens: AtomicU64,
    pub usage_output_tokens: AtomicU64,
    /// Tracked in whole microdollars to stay atomic.
    pub usage_cost_microdollars: AtomicU64,

    pub queue_dead_letters: AtomicU64,
    pub cache_acquisitions: AtomicU64,
    pub cache_recreates: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn record_usage(&self, input_tokens: u64, output_tokens: u64, cost_usd: f64) {
        Self::add(&self.usage_input_tokens, input_tokens);
        Self::add(&self.usage_output_tokens, output_tokens);
        Self::add(
            &self.usage_cost_microdollars,
            (cost_usd * 1_000_000.0).max(0.0) as u64,
        );
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.start.map(|s| s.elapsed().as_secs_f64()).unwrap_or(0.0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            uptime_seconds: self.uptime_seconds(),
            webhooks_received: load(&self.webhooks_received),
            webhooks_rejected_signature: load(&self.webhooks_rejected_signature),
            webhooks_ignored: load(&self.webhooks_ignored),
            webhooks_throttled: load(&self.webhooks_throttled),
            tasks_created: load(&self.tasks_created),
            tasks_deduplicated: load(&self.tasks_deduplicated),
            tasks_completed: load(&self.tasks_completed),
            tasks_failed: load(&self.tasks_failed),
            tasks_rejected: load(&self.tasks_rejected),
            commands_parsed: load(&self.commands_parsed),
            commands_unknown: load(&self.commands_unknown),
            runner_invocations: load(&self.runner_invocations),
            runner_timeouts: load(&self.runner_timeouts),
            runner_cancellations: load(&self.runner_cancellations),
            runner_wall_time_seconds: load(&self.runner_wall_time_millis) as f64 / 1000.0,
            usage_input_tokens: load(&self.usage_input_tokens),
            usage_output_tokens: load(&self.usage_output_tokens),
            usage_cost_usd: load(&self.usage_cost_microdollars) as f64 / 1_000_000.0,
            queue_dead_letters: load(&self.queue_dead_letters),
            cache_acquisitions: load(&self.cache_acquisitions),
            cache_recreates: load(&self.cache_recreates),
        }
    }
}

/// Serializable counter snapshot, served by `GET /metrics`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: f64,
    pub webhooks_received: u64,
    pub webhooks_rejected_signature: u64,
    pub webhooks_ignored: u64,
    pub webhooks_throttled: u64,
    pub tasks_created: u64,
    pub tasks_deduplicated: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_rejected: u64,
    pub commands_parsed: u64,
    pub commands_unknown: u64,
    pub runner_invocations: u64,
    pub runner_timeouts: u64,
    pub runner_cancellations: u64,
    pub runner_wall_time_seconds: f64,
    pub usage_input_tokens: u64,
    pub usage_output_tokens: u64,
    pub usage_cost_usd: f64,
    pub queue_dead_letters: u64,
    pub cache_acquisitions: u64,
    pub cache_recreates: u64,
}
