//! Engine configuration.
//!
//! Configuration is loaded with the following priority:
//! 1. `GRADSYNC_*` environment variables (set by the job launcher)
//! 2. Default values

use std::str::FromStr;

use serde::Deserialize;

use crate::error::{EngineError, Result};

/// Default partition bound: tensors are sliced into 4 MiB pipeline units.
pub const DEFAULT_PARTITION_BYTES: usize = 4 << 20;

/// Default number of collective calls batched under one group.
pub const DEFAULT_GROUP_SIZE: usize = 4;

/// Process topology and pipeline tuning knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of local ranks (GPUs) on this host.
    pub local_size: usize,
    /// This process's rank on the host (0..local_size).
    pub local_rank: usize,
    /// Index of this worker among all hosts.
    pub worker_id: usize,
    /// Total number of worker hosts.
    pub num_workers: usize,
    /// Whether the job spans hosts through the parameter-server fabric.
    pub distributed: bool,
    /// Partition bound in bytes; every slice is at most this long.
    pub partition_bytes: usize,
    /// Maximum tasks drained per collective op into one group.
    pub group_size: usize,
    /// Number of parameter servers keys are sharded over.
    pub num_servers: usize,
    /// Device ordinal handed to GPU backends.
    pub device_id: i32,
    /// Per-queue credit window in bytes. `None` disables admission gating.
    pub credit_bytes: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            local_size: 1,
            local_rank: 0,
            worker_id: 0,
            num_workers: 1,
            distributed: false,
            partition_bytes: DEFAULT_PARTITION_BYTES,
            group_size: DEFAULT_GROUP_SIZE,
            num_servers: 1,
            device_id: 0,
            credit_bytes: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `GRADSYNC_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(v) = env_parse("GRADSYNC_LOCAL_SIZE")? {
            cfg.local_size = v;
        }
        if let Some(v) = env_parse("GRADSYNC_LOCAL_RANK")? {
            cfg.local_rank = v;
        }
        if let Some(v) = env_parse("GRADSYNC_WORKER_ID")? {
            cfg.worker_id = v;
        }
        if let Some(v) = env_parse("GRADSYNC_NUM_WORKERS")? {
            cfg.num_workers = v;
        }
        if let Some(v) = env_parse::<usize>("GRADSYNC_ENABLE_DISTRIBUTED")? {
            cfg.distributed = v != 0;
        }
        if let Some(v) = env_parse("GRADSYNC_PARTITION_BYTES")? {
            cfg.partition_bytes = v;
        }
        if let Some(v) = env_parse("GRADSYNC_GROUP_SIZE")? {
            cfg.group_size = v;
        }
        if let Some(v) = env_parse("GRADSYNC_NUM_SERVERS")? {
            cfg.num_servers = v;
        }
        if let Some(v) = env_parse("GRADSYNC_DEVICE_ID")? {
            cfg.device_id = v;
        }
        if let Some(v) = env_parse("GRADSYNC_CREDIT_BYTES")? {
            cfg.credit_bytes = Some(v);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject topologies and bounds that cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.local_size == 0 {
            return Err(EngineError::InvalidConfig("local_size must be > 0".into()));
        }
        if self.local_rank >= self.local_size {
            return Err(EngineError::InvalidConfig(format!(
                "local_rank {} out of range (local_size={})",
                self.local_rank, self.local_size
            )));
        }
        if self.num_workers == 0 {
            return Err(EngineError::InvalidConfig("num_workers must be > 0".into()));
        }
        if self.partition_bytes == 0 {
            return Err(EngineError::InvalidConfig(
                "partition_bytes must be > 0".into(),
            ));
        }
        if self.group_size == 0 {
            return Err(EngineError::InvalidConfig("group_size must be > 0".into()));
        }
        if self.num_servers == 0 {
            return Err(EngineError::InvalidConfig("num_servers must be > 0".into()));
        }
        Ok(())
    }

    /// Local rank that drives collectives and PS I/O on this host.
    pub fn root(&self) -> usize {
        0
    }

    /// Whether this process is the host's root rank.
    pub fn is_root(&self) -> bool {
        self.local_rank == self.root()
    }

    /// Global rank across all hosts.
    pub fn rank(&self) -> usize {
        self.worker_id * self.local_size + self.local_rank
    }

    /// Global number of ranks across all hosts.
    pub fn size(&self) -> usize {
        self.num_workers * self.local_size
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| EngineError::InvalidConfig(format!("{key}={raw:?} failed to parse"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_single_rank() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.local_size, 1);
        assert!(cfg.is_root());
        assert!(!cfg.distributed);
        assert_eq!(cfg.partition_bytes, DEFAULT_PARTITION_BYTES);
        assert_eq!(cfg.size(), 1);
        cfg.validate().unwrap();
    }

    #[test]
    fn global_rank_composes_worker_and_local() {
        let cfg = EngineConfig {
            local_size: 4,
            local_rank: 2,
            worker_id: 3,
            num_workers: 8,
            ..Default::default()
        };
        assert_eq!(cfg.rank(), 14);
        assert_eq!(cfg.size(), 32);
        assert!(!cfg.is_root());
    }

    #[test]
    fn validate_rejects_out_of_range_rank() {
        let cfg = EngineConfig {
            local_size: 2,
            local_rank: 2,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn validate_rejects_zero_bound() {
        let cfg = EngineConfig {
            partition_bytes: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn deserializes_partial_config() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{ "local_size": 8, "distributed": true, "group_size": 2 }"#)
                .unwrap();
        assert_eq!(cfg.local_size, 8);
        assert!(cfg.distributed);
        assert_eq!(cfg.group_size, 2);
        assert_eq!(cfg.num_servers, 1);
    }
}
