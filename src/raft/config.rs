use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::RaftError;

/// Election timeout is this many heartbeat intervals plus up to one more of jitter.
pub const ELECTION_TIMEOUT_HEARTBEATS: u64 = 10;

/// Upper bound for both intervals: one day.
pub const MAX_INTERVAL_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    pub heartbeat_interval_ms: u64,
    pub leader_job_interval_ms: u64,
    /// Capacity of the buffer between the receive task and the coordination loop.
    pub message_buffer: usize,
}

impl RaftConfig {
    pub fn new(message_buffer: usize, leader_job_interval: Duration) -> Self {
        Self {
            message_buffer,
            leader_job_interval_ms: leader_job_interval.as_millis() as u64,
            ..Self::default()
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn leader_job_interval(&self) -> Duration {
        Duration::from_millis(self.leader_job_interval_ms)
    }

    /// Fresh randomized election timeout, re-rolled on every call.
    pub fn election_timeout(&self) -> Duration {
        let base = self
            .heartbeat_interval_ms
            .saturating_mul(ELECTION_TIMEOUT_HEARTBEATS);
        let mut rng = rand::rng();
        let jitter = rng.random_range(0..=self.heartbeat_interval_ms);
        Duration::from_millis(base.saturating_add(jitter))
    }

    pub fn validate(&self) -> Result<(), RaftError> {
        if self.heartbeat_interval_ms == 0 {
            return Err(RaftError::InvalidConfig(
                "heartbeat_interval_ms must be positive".to_string(),
            ));
        }
        if self.leader_job_interval_ms == 0 {
            return Err(RaftError::InvalidConfig(
                "leader_job_interval_ms must be positive".to_string(),
            ));
        }
        for (name, value) in [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("leader_job_interval_ms", self.leader_job_interval_ms),
        ] {
            if value > MAX_INTERVAL_MS {
                return Err(RaftError::InvalidConfig(format!(
                    "{name} must not exceed {MAX_INTERVAL_MS} (got {value})"
                )));
            }
        }
        if self.message_buffer == 0 {
            return Err(RaftError::InvalidConfig(
                "message_buffer must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 100,
            leader_job_interval_ms: 1000,
            message_buffer: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn election_timeout_stays_within_jitter_window() {
        let cfg = RaftConfig::default().with_heartbeat_interval(Duration::from_millis(100));
        for _ in 0..200 {
            let timeout = cfg.election_timeout();
            assert!(timeout >= Duration::from_millis(1000), "{timeout:?}");
            assert!(timeout <= Duration::from_millis(1100), "{timeout:?}");
        }
    }

    #[test]
    fn new_keeps_default_heartbeat() {
        let cfg = RaftConfig::new(16, Duration::from_secs(2));
        assert_eq!(cfg.message_buffer, 16);
        assert_eq!(cfg.leader_job_interval(), Duration::from_secs(2));
        assert_eq!(cfg.heartbeat_interval(), Duration::from_millis(100));
    }

    #[test]
    fn validate_rejects_zero_values() {
        assert!(RaftConfig::default().validate().is_ok());

        let cfg = RaftConfig {
            heartbeat_interval_ms: 0,
            ..RaftConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(RaftError::InvalidConfig(_))));

        let cfg = RaftConfig {
            message_buffer: 0,
            ..RaftConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(RaftError::InvalidConfig(_))));
    }

    #[test]
    fn validate_rejects_intervals_past_one_day() {
        let cfg: RaftConfig =
            serde_json::from_str(r#"{"heartbeat_interval_ms": 18446744073709551615}"#)
                .expect("parse");
        assert!(matches!(cfg.validate(), Err(RaftError::InvalidConfig(_))));

        let cfg = RaftConfig {
            leader_job_interval_ms: MAX_INTERVAL_MS + 1,
            ..RaftConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(RaftError::InvalidConfig(_))));

        let cfg = RaftConfig {
            heartbeat_interval_ms: MAX_INTERVAL_MS,
            leader_job_interval_ms: MAX_INTERVAL_MS,
            ..RaftConfig::default()
        };
        assert!(cfg.validate().is_ok());
        assert!(cfg.election_timeout() >= Duration::from_millis(MAX_INTERVAL_MS * 10));
    }

    #[test]
    fn election_timeout_saturates_instead_of_overflowing() {
        let cfg = RaftConfig {
            heartbeat_interval_ms: u64::MAX,
            ..RaftConfig::default()
        };
        assert_eq!(cfg.election_timeout(), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let cfg: RaftConfig =
            serde_json::from_str(r#"{"heartbeat_interval_ms": 50}"#).expect("parse");
        assert_eq!(cfg.heartbeat_interval_ms, 50);
        assert_eq!(cfg.leader_job_interval_ms, 1000);
        assert_eq!(cfg.message_buffer, 100);
    }
}
