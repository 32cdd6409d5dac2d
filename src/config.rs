//! Engine configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::anomaly::AnomalyConfig;

/// Tunables for the credit engine.
///
/// Durations are plain milliseconds so the struct deserializes from any
/// config source without custom formats. Every field has a default; a
/// deserialized config only needs to name what it overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long a placed hold stays reservable before the sweeper may
    /// reclaim it.
    pub hold_ttl_ms: u64,
    /// Interval the external scheduler should run the sweeper at. The
    /// engine itself never schedules anything.
    pub sweep_interval_ms: u64,
    pub anomaly: AnomalyConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hold_ttl_ms: 30_000,
            sweep_interval_ms: 2 * 60 * 60 * 1_000,
            anomaly: AnomalyConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn hold_ttl(&self) -> Duration {
        Duration::from_millis(self.hold_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}
