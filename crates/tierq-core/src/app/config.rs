//! Engine configuration.
//!
//! Everything the handler needs is fixed at construction: the tier to
//! queue bindings, the wire format, ledger TTLs and key prefixes. There is
//! no way to change the topology of a running handler.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::WireFormat;
use crate::domain::{DEFAULT_MAX_RETRIES, PriorityTier, TaskId};
use crate::queue::RetryPolicy;

pub const DEFAULT_RETRY_TTL_SECS: u64 = 86_400;
pub const DEFAULT_DEAD_LETTER_TTL_SECS: u64 = 604_800;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("tier '{0}' is bound more than once")]
    DuplicateTier(PriorityTier),

    #[error("queue '{0}' is bound to more than one tier")]
    DuplicateQueue(String),

    #[error("tier '{0}' has an empty queue name")]
    EmptyQueueName(PriorityTier),

    #[error("no tier is bound to a queue")]
    NoTiers,

    #[error("retry policy max_delay must be at least 1 (got {0})")]
    InvalidMaxDelay(u64),

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

/// Which broker queue serves a tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierBinding {
    pub tier: PriorityTier,
    pub queue: String,
}

impl TierBinding {
    pub fn new(tier: PriorityTier, queue: impl Into<String>) -> Self {
        Self {
            tier,
            queue: queue.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Defaults to one queue per tier, named after the tier.
    pub tiers: Vec<TierBinding>,
    pub wire_format: WireFormat,
    pub retry_ttl_secs: u64,
    pub dead_letter_ttl_secs: u64,
    pub retry_key_prefix: String,
    pub dead_letter_key_prefix: String,
    pub retry_policy: RetryPolicy,
    /// Retry budget given to tasks created by callers that do not pick one.
    pub default_max_retries: u32,
    pub cleanup_horizon_hours: u64,
    pub sweep_interval_secs: u64,
    /// Per-job execution timeout handed to the broker, if any.
    pub job_timeout_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tiers: PriorityTier::ALL
                .iter()
                .map(|&tier| TierBinding::new(tier, tier.as_str()))
                .collect(),
            wire_format: WireFormat::default(),
            retry_ttl_secs: DEFAULT_RETRY_TTL_SECS,
            dead_letter_ttl_secs: DEFAULT_DEAD_LETTER_TTL_SECS,
            retry_key_prefix: "retry:".to_string(),
            dead_letter_key_prefix: "failed:".to_string(),
            retry_policy: RetryPolicy::default(),
            default_max_retries: DEFAULT_MAX_RETRIES,
            cleanup_horizon_hours: 24,
            sweep_interval_secs: 3_600,
            job_timeout_secs: None,
        }
    }
}

impl EngineConfig {
    /// Load a JSON config file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tiers.is_empty() {
            return Err(ConfigError::NoTiers);
        }

        let mut tiers = HashSet::new();
        let mut queues = HashSet::new();
        for binding in &self.tiers {
            if binding.queue.trim().is_empty() {
                return Err(ConfigError::EmptyQueueName(binding.tier));
            }
            if !tiers.insert(binding.tier) {
                return Err(ConfigError::DuplicateTier(binding.tier));
            }
            if !queues.insert(binding.queue.as_str()) {
                return Err(ConfigError::DuplicateQueue(binding.queue.clone()));
            }
        }

        if self.retry_policy.max_delay < 1 {
            return Err(ConfigError::InvalidMaxDelay(self.retry_policy.max_delay));
        }

        for (name, value) in [
            ("retry_ttl_secs", self.retry_ttl_secs),
            ("dead_letter_ttl_secs", self.dead_letter_ttl_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        Ok(())
    }

    pub fn topology(&self) -> QueueTopology {
        QueueTopology::from_bindings(&self.tiers)
    }

    pub fn retry_ttl(&self) -> Duration {
        Duration::from_secs(self.retry_ttl_secs)
    }

    pub fn dead_letter_ttl(&self) -> Duration {
        Duration::from_secs(self.dead_letter_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs.map(Duration::from_secs)
    }

    pub fn retry_key(&self, task_id: TaskId) -> String {
        format!("{}{task_id}", self.retry_key_prefix)
    }

    pub fn dead_letter_key(&self, task_id: TaskId) -> String {
        format!("{}{task_id}", self.dead_letter_key_prefix)
    }
}

/// Immutable tier to queue mapping, walked highest tier first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    queues: [Option<String>; PriorityTier::ALL.len()],
}

impl QueueTopology {
    pub fn from_bindings(bindings: &[TierBinding]) -> Self {
        let mut queues: [Option<String>; PriorityTier::ALL.len()] = Default::default();
        for binding in bindings {
            queues[binding.tier.rank()] = Some(binding.queue.clone());
        }
        Self { queues }
    }

    pub fn queue_for(&self, tier: PriorityTier) -> Option<&str> {
        self.queues[tier.rank()].as_deref()
    }

    /// Bound tiers with their queues, highest tier first.
    pub fn iter(&self) -> impl Iterator<Item = (PriorityTier, &str)> + '_ {
        PriorityTier::ALL
            .iter()
            .filter_map(|&tier| self.queue_for(tier).map(|queue| (tier, queue)))
    }
}
