//! Order processor configuration.

use std::time::Duration;

use serde::Deserialize;

/// Order processor configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Duration of the simulated unit of work per order.
    pub work_duration_ms: u64,
    /// What happens to a message after a failed attempt.
    pub redelivery: RedeliveryConfig,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            work_duration_ms: 2000,
            redelivery: RedeliveryConfig::default(),
        }
    }
}

impl ProcessorConfig {
    pub fn work_duration(&self) -> Duration {
        Duration::from_millis(self.work_duration_ms)
    }
}

/// Redelivery policy configuration.
///
/// The default requeues immediately and forever.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedeliveryConfig {
    /// Attempts before a message is dead-lettered. Unset retries forever.
    pub max_attempts: Option<u32>,
    /// Delay before requeueing after the first failed attempt.
    pub base_delay_ms: u64,
    /// Cap on the requeue delay.
    pub max_delay_ms: u64,
    /// Add a random extra delay of up to 100% to each requeue.
    pub jitter: bool,
}

impl Default for RedeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            base_delay_ms: 0,
            max_delay_ms: 30_000,
            jitter: false,
        }
    }
}
