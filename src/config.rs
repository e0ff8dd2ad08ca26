use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::RetryPolicy;
use crate::raft::RaftConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of nodes started by the in-memory simulation.
    pub cluster_size: usize,
    pub raft: RaftConfig,
    pub retry: RetryPolicy,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster_size == 0 {
            return Err(ConfigError::Invalid(
                "cluster_size must be at least 1".to_string(),
            ));
        }
        self.raft
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster_size: 3,
            raft: RaftConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn config_default_values_are_sensible() {
        let cfg = Config::default();
        assert_eq!(cfg.cluster_size, 3);
        assert_eq!(cfg.raft.heartbeat_interval_ms, 100);
        assert_eq!(cfg.raft.leader_job_interval_ms, 1000);
        assert_eq!(cfg.raft.message_buffer, 100);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn from_file_fills_missing_sections() {
        let mut file = NamedTempFile::new().expect("tempfile");
        write!(file, r#"{{"cluster_size": 5, "raft": {{"heartbeat_interval_ms": 20}}}}"#)
            .expect("write config");

        let cfg = Config::from_file(file.path()).expect("load config");
        assert_eq!(cfg.cluster_size, 5);
        assert_eq!(cfg.raft.heartbeat_interval_ms, 20);
        assert_eq!(cfg.raft.leader_job_interval_ms, 1000);
        assert_eq!(cfg.retry, RetryPolicy::default());
    }

    #[test]
    fn from_file_rejects_invalid_values() {
        let mut file = NamedTempFile::new().expect("tempfile");
        write!(file, r#"{{"cluster_size": 0}}"#).expect("write config");

        assert!(matches!(
            Config::from_file(file.path()),
            Err(ConfigError::Invalid(_))
        ));

        let mut file = NamedTempFile::new().expect("tempfile");
        write!(
            file,
            r#"{{"raft": {{"heartbeat_interval_ms": 18446744073709551615}}}}"#
        )
        .expect("write config");

        assert!(matches!(
            Config::from_file(file.path()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn from_file_reports_parse_and_io_errors() {
        let mut file = NamedTempFile::new().expect("tempfile");
        write!(file, "cluster_size = 3").expect("write config");
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ConfigError::Parse(_))
        ));

        assert!(matches!(
            Config::from_file("/definitely/not/here.json"),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn pretty_json_round_trips_through_file_loader() {
        let cfg = Config::default();
        let mut file = NamedTempFile::new().expect("tempfile");
        file.write_all(cfg.to_json_pretty().expect("json").as_bytes())
            .expect("write config");
        assert_eq!(Config::from_file(file.path()).expect("load"), cfg);
    }
}
