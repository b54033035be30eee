use std::path::Path;
use std::time::Duration;

use ::log::warn;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{RaftError, ReplicaId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    pub id: ReplicaId,
    pub replicas: usize,               // cluster size, this replica included
    pub election_timeout_min: u64,     // in milliseconds
    pub election_timeout_max: u64,     // in milliseconds
    pub heartbeat_interval: u64,       // in milliseconds
    pub rpc_timeout: u64,              // in milliseconds
    pub max_entries_per_append: usize, // per AppendEntries call
    pub pre_vote: bool,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self::new(0, 1)
    }
}

impl RaftConfig {
    pub fn new(id: ReplicaId, replicas: usize) -> Self {
        Self {
            id,
            replicas,
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            rpc_timeout: 100,
            max_entries_per_append: 64,
            pre_vote: false,
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, RaftError> {
        let raw = std::fs::read_to_string(path)?;
        let config: RaftConfig = serde_json::from_str(&raw)
            .map_err(|e| RaftError::SerializationError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RaftError> {
        if self.replicas == 0 {
            return Err(RaftError::InvalidConfig(
                "cluster needs at least one replica".to_string(),
            ));
        }
        if self.id >= self.replicas {
            return Err(RaftError::InvalidConfig(format!(
                "replica id {} out of range for {} replicas",
                self.id, self.replicas
            )));
        }
        if self.election_timeout_min == 0 || self.election_timeout_min > self.election_timeout_max
        {
            return Err(RaftError::InvalidConfig(format!(
                "bad election timeout range {}..={}ms",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval == 0 || self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::InvalidConfig(format!(
                "heartbeat interval {}ms must be below the election floor {}ms",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        if self.max_entries_per_append == 0 {
            return Err(RaftError::InvalidConfig(
                "max_entries_per_append must be positive".to_string(),
            ));
        }
        if self.heartbeat_interval.saturating_mul(3) > self.election_timeout_min {
            warn!(
                "heartbeat interval {}ms is close to the election floor {}ms; expect spurious elections",
                self.heartbeat_interval, self.election_timeout_min
            );
        }
        Ok(())
    }

    /// Strict majority of the configured replicas.
    pub fn quorum(&self) -> usize {
        self.replicas / 2 + 1
    }

    /// A fresh randomized election timeout.
    pub fn election_timeout(&self) -> Duration {
        let mut rng = rand::rng();
        let timeout_ms = rng.random_range(self.election_timeout_min..=self.election_timeout_max);
        Duration::from_millis(timeout_ms)
    }

    pub fn election_floor(&self) -> Duration {
        Duration::from_millis(self.election_timeout_min)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn rpc_deadline(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout)
    }

    /// Every replica id except this one.
    pub fn peers(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        (0..self.replicas).filter(move |p| *p != self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn default_values_are_sensible() {
        let cfg = RaftConfig::new(2, 5);
        assert_eq!(cfg.election_timeout_min, 150);
        assert_eq!(cfg.election_timeout_max, 300);
        assert_eq!(cfg.heartbeat_interval, 50);
        assert!(!cfg.pre_vote);
        assert_eq!(cfg.quorum(), 3);
        assert_eq!(cfg.peers().collect::<Vec<_>>(), vec![0, 1, 3, 4]);
        cfg.validate().expect("defaults validate");
    }

    #[test]
    fn quorum_is_strict_majority() {
        assert_eq!(RaftConfig::new(0, 1).quorum(), 1);
        assert_eq!(RaftConfig::new(0, 2).quorum(), 2);
        assert_eq!(RaftConfig::new(0, 3).quorum(), 2);
        assert_eq!(RaftConfig::new(0, 4).quorum(), 3);
    }

    #[test]
    fn election_timeout_stays_in_range() {
        let cfg = RaftConfig::new(0, 3);
        for _ in 0..100 {
            let t = cfg.election_timeout();
            assert!(t >= Duration::from_millis(150) && t <= Duration::from_millis(300));
        }
    }

    #[test]
    fn validate_rejects_bad_settings() {
        let mut cfg = RaftConfig::new(3, 3);
        assert!(matches!(cfg.validate(), Err(RaftError::InvalidConfig(_))));

        cfg = RaftConfig::new(0, 0);
        assert!(cfg.validate().is_err());

        cfg = RaftConfig::new(0, 3);
        cfg.election_timeout_min = 400;
        assert!(cfg.validate().is_err());

        cfg = RaftConfig::new(0, 3);
        cfg.heartbeat_interval = 150;
        assert!(cfg.validate().is_err());

        cfg = RaftConfig::new(0, 3);
        cfg.max_entries_per_append = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_handles_huge_timings() {
        let mut cfg = RaftConfig::new(0, 3);
        cfg.election_timeout_min = u64::MAX - 1;
        cfg.election_timeout_max = u64::MAX;
        cfg.heartbeat_interval = u64::MAX / 2;
        cfg.validate().expect("huge but ordered timings validate");
    }

    #[test]
    fn from_json_file_fills_missing_fields_with_defaults() {
        let mut file = NamedTempFile::new().expect("tempfile");
        write!(file, r#"{{"id": 1, "replicas": 3, "heartbeat_interval": 20}}"#).expect("write");

        let cfg = RaftConfig::from_json_file(file.path()).expect("load");
        assert_eq!(cfg.id, 1);
        assert_eq!(cfg.replicas, 3);
        assert_eq!(cfg.heartbeat_interval, 20);
        assert_eq!(cfg.election_timeout_max, 300);
    }

    #[test]
    fn from_json_file_rejects_invalid_config() {
        let mut file = NamedTempFile::new().expect("tempfile");
        write!(file, r#"{{"id": 7, "replicas": 3}}"#).expect("write");

        assert!(matches!(
            RaftConfig::from_json_file(file.path()),
            Err(RaftError::InvalidConfig(_))
        ));
    }
}
