//! Configuration types.
//!
//! Layered with figment: built-in defaults, then `DOCKET_*` environment
//! variables with `__` between nested sections
//! (`DOCKET_QUEUE__CLAIM_TIMEOUT_MS` -> `queue.claim_timeout_ms`).
//! `validate` checks the cross-field constraints afterwards.

use std::collections::HashMap;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Serialized};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::app::retry::RetryPolicy;
use crate::domain::{MAX_IN_FLIGHT_PROGRESS, PayloadLimits, TaskKind};
use crate::error::ConfigError;

const ENV_PREFIX: &str = "DOCKET_";

/// Durations are configured as whole milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// How task kinds map onto queue streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueTopology {
    /// One stream per task kind (`tasks:document-parse`, ...).
    #[default]
    PerKind,
    /// Every kind shares the `tasks` stream.
    Shared,
}

impl QueueTopology {
    pub fn stream_for(self, kind: TaskKind) -> String {
        match self {
            QueueTopology::PerKind => format!("tasks:{kind}"),
            QueueTopology::Shared => "tasks".to_string(),
        }
    }

    /// Distinct streams covering `kinds`, in kind order.
    pub fn streams(self, kinds: &[TaskKind]) -> Vec<String> {
        let mut streams: Vec<String> = Vec::new();
        for kind in kinds {
            let stream = self.stream_for(*kind);
            if !streams.contains(&stream) {
                streams.push(stream);
            }
        }
        streams
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Consumer group all workers join.
    pub group: String,
    pub topology: QueueTopology,
    /// Unacknowledged entries become reclaimable after this long without a touch.
    #[serde(rename = "claim_timeout_ms", with = "millis")]
    pub claim_timeout: Duration,
    /// How long one claim call waits for a new entry.
    #[serde(rename = "block_timeout_ms", with = "millis")]
    pub block_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            group: "task-workers".to_string(),
            topology: QueueTopology::PerKind,
            claim_timeout: Duration::from_secs(300), // 5 minutes
            block_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub pool_size: usize,
    /// Wall-clock bound for one attempt; expiry counts as a transient failure.
    #[serde(rename = "task_timeout_ms", with = "millis")]
    pub task_timeout: Duration,
    /// Highest progress stored while a task is still processing.
    pub progress_ceiling: u8,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            task_timeout: Duration::from_secs(600), // 10 minutes
            progress_ceiling: MAX_IN_FLIGHT_PROGRESS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    pub default_ceiling: Decimal,
    pub per_kind: HashMap<TaskKind, Decimal>,
}

impl CostConfig {
    pub fn ceiling_for(&self, kind: TaskKind) -> Decimal {
        self.per_kind
            .get(&kind)
            .copied()
            .unwrap_or(self.default_ceiling)
    }
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            default_ceiling: Decimal::new(500, 2),
            per_kind: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Hard timeout around every provider call.
    #[serde(rename = "call_timeout_ms", with = "millis")]
    pub call_timeout: Duration,
    /// Provider name enabled per kind at startup.
    pub enabled: HashMap<TaskKind, String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(120),
            enabled: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// How often a relay re-reads the store while the live channel is quiet.
    #[serde(rename = "store_poll_interval_ms", with = "millis")]
    pub store_poll_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            store_poll_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    #[serde(rename = "interval_ms", with = "millis")]
    pub interval: Duration,
    /// Processing tasks with no progress for this long are flagged as stuck.
    #[serde(rename = "stuck_threshold_ms", with = "millis")]
    pub stuck_threshold: Duration,
    /// Pending tasks without a queue entry are re-queued after this long.
    #[serde(rename = "orphan_grace_ms", with = "millis")]
    pub orphan_grace: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            stuck_threshold: Duration::from_secs(900), // 15 minutes
            orphan_grace: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub retry: RetryPolicy,
    pub cost: CostConfig,
    pub gateway: GatewayConfig,
    pub payload: PayloadLimits,
    pub relay: RelayConfig,
    pub reaper: ReaperConfig,
}

impl OrchestratorConfig {
    /// Defaults with the `DOCKET_*` environment layered on top.
    ///
    /// Public so tests and embedders can add providers of their own.
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Defaults overridden by `DOCKET_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::figment().extract()?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.group.trim().is_empty() {
            return Err(ConfigError::Invalid("consumer group name is empty".into()));
        }
        if self.worker.pool_size == 0 {
            return Err(ConfigError::Invalid("worker pool size must be > 0".into()));
        }
        if self.worker.progress_ceiling > MAX_IN_FLIGHT_PROGRESS {
            return Err(ConfigError::Invalid(format!(
                "progress ceiling must be <= {MAX_IN_FLIGHT_PROGRESS}"
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry max_attempts must be > 0".into()));
        }
        if !(self.retry.multiplier.is_finite() && self.retry.multiplier >= 1.0) {
            return Err(ConfigError::Invalid("retry multiplier must be >= 1.0".into()));
        }
        if self.cost.default_ceiling <= Decimal::ZERO
            || self.cost.per_kind.values().any(|c| *c <= Decimal::ZERO)
        {
            return Err(ConfigError::Invalid("cost ceilings must be positive".into()));
        }
        if self.payload.max_content_bytes == 0 {
            return Err(ConfigError::Invalid("max_content_bytes must be > 0".into()));
        }
        // claim は provider 呼び出し中・backoff 中に期限切れになってはいけない
        if self.queue.claim_timeout <= self.gateway.call_timeout {
            return Err(ConfigError::Invalid(format!(
                "claim timeout {:?} must exceed provider call timeout {:?}",
                self.queue.claim_timeout, self.gateway.call_timeout
            )));
        }
        if self.queue.claim_timeout <= self.retry.max_delay {
            return Err(ConfigError::Invalid(format!(
                "claim timeout {:?} must exceed max retry delay {:?}",
                self.queue.claim_timeout, self.retry.max_delay
            )));
        }
        Ok(())
    }

    /// Streams the worker pool listens on.
    pub fn streams(&self) -> Vec<String> {
        self.queue.topology.streams(&TaskKind::ALL)
    }
}
