//! Engine configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for an [`Engine`](crate::Engine) instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite connection string (e.g. `sqlite:pipelit.db`, `sqlite::memory:`)
    pub database_url: String,

    /// Workers consuming the execution queues
    pub worker_count: usize,

    /// Executions still `running` past this many seconds are reaped
    pub zombie_threshold_secs: u64,

    /// How often the zombie sweeper scans
    pub zombie_sweep_interval_secs: u64,

    /// Grace period for in-flight work after a cancel request (ms)
    pub cancellation_grace_ms: u64,

    /// TTL for ephemeral interrupt checkpoints; must exceed the longest
    /// expected interrupt horizon
    pub ephemeral_checkpoint_ttl_secs: u64,

    /// Maximum sub-workflow nesting depth before `RECURSION_LIMIT`
    pub recursion_ceiling: u32,

    /// Raise template failures instead of rendering leniently
    pub strict_templates: bool,

    /// Event bus lag buffer per channel
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            worker_count: 4,
            zombie_threshold_secs: 3600,
            zombie_sweep_interval_secs: 60,
            cancellation_grace_ms: 5_000,
            ephemeral_checkpoint_ttl_secs: 7 * 24 * 3600,
            recursion_ceiling: 8,
            strict_templates: false,
            event_buffer: 256,
        }
    }
}

impl EngineConfig {
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_zombie_threshold(mut self, secs: u64) -> Self {
        self.zombie_threshold_secs = secs;
        self
    }

    pub fn with_recursion_ceiling(mut self, ceiling: u32) -> Self {
        self.recursion_ceiling = ceiling;
        self
    }

    pub fn cancellation_grace(&self) -> Duration {
        Duration::from_millis(self.cancellation_grace_ms)
    }

    pub fn ephemeral_ttl(&self) -> Duration {
        Duration::from_secs(self.ephemeral_checkpoint_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = EngineConfig::default();
        assert!(config.worker_count >= 1);
        assert!(config.ephemeral_ttl() > Duration::from_secs(3600));
    }

    #[test]
    fn test_builder_overrides() {
        let config = EngineConfig::default()
            .with_worker_count(2)
            .with_zombie_threshold(10)
            .with_recursion_ceiling(3);
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.zombie_threshold_secs, 10);
        assert_eq!(config.recursion_ceiling, 3);
    }
}
