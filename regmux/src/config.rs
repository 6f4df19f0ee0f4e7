//! Runtime configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Interval between re-reads of a polled register.
pub const DEFAULT_POLL_INTERVAL_US: u64 = 100;

/// Queue depth at which a client's event queue starts logging warnings.
pub const DEFAULT_EVENT_QUEUE_WARN_DEPTH: usize = 1024;

/// Configuration for a [`Runtime`](crate::runtime::Runtime).
///
/// The defaults match the behavior of the production configuration; tests
/// override individual fields when they need tighter timing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Interval between re-reads while servicing a `Poll` io-entry.
    #[serde(with = "duration_us", default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// Event-queue depth that triggers a slow-consumer warning.
    #[serde(default = "default_event_queue_warn_depth")]
    pub event_queue_warn_depth: usize,
}

fn default_poll_interval() -> Duration {
    Duration::from_micros(DEFAULT_POLL_INTERVAL_US)
}

fn default_event_queue_warn_depth() -> usize {
    DEFAULT_EVENT_QUEUE_WARN_DEPTH
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            event_queue_warn_depth: default_event_queue_warn_depth(),
        }
    }
}

mod duration_us {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_micros() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_micros(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = RuntimeConfig::default();
        assert_eq!(config.poll_interval, Duration::from_micros(100));
        assert_eq!(config.event_queue_warn_depth, 1024);
    }
}
