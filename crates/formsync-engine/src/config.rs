use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::time::Duration;

pub const DEFAULT_ROOT_PATH: &str = "Formsync/Initial Sync";

/// Sizing and timeouts for one kind of concurrent batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub width: usize,
    pub item_timeout: Duration,
    pub stall_timeout: Duration,
    pub progress_every: usize,
    pub progress_interval: Duration,
    pub refresh_check_every: usize,
}

impl PoolConfig {
    pub fn assets() -> Self {
        Self {
            width: 5,
            item_timeout: Duration::from_secs(120),
            stall_timeout: Duration::from_secs(300),
            progress_every: 100,
            progress_interval: Duration::from_secs(60),
            refresh_check_every: 100,
        }
    }

    pub fn exports() -> Self {
        Self {
            item_timeout: Duration::from_secs(60),
            ..Self::assets()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalConfig {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Self-imposed wall-clock ceiling, kept below the external execution window.
    pub run_deadline: Duration,
    pub entity_attempts: u32,
    pub entity_retry_delay: Duration,
    pub asset_pool: PoolConfig,
    pub export_pool: PoolConfig,
    pub extra_batch_rounds: usize,
    pub resumable_threshold: usize,
    pub ledger_flush_every: usize,
    pub credential_refresh_interval: Duration,
    pub retry: RetryPolicy,
    pub approval: ApprovalConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            run_deadline: Duration::from_secs(5 * 3600 + 45 * 60),
            entity_attempts: 3,
            entity_retry_delay: Duration::from_secs(5),
            asset_pool: PoolConfig::assets(),
            export_pool: PoolConfig::exports(),
            extra_batch_rounds: 3,
            resumable_threshold: 5 * 1024 * 1024,
            ledger_flush_every: 100,
            credential_refresh_interval: Duration::from_secs(30 * 60),
            retry: RetryPolicy::default(),
            approval: ApprovalConfig::default(),
        }
    }
}

/// Per-run policy chosen by the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub root_path: String,
    pub skip_deletions: bool,
    pub auto_delete: bool,
    pub quick_check: bool,
    pub pre_approved: BTreeSet<String>,
    pub test_limit: Option<usize>,
    pub since: Option<DateTime<Utc>>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            root_path: DEFAULT_ROOT_PATH.to_string(),
            skip_deletions: false,
            auto_delete: false,
            quick_check: false,
            pre_approved: BTreeSet::new(),
            test_limit: None,
            since: None,
        }
    }
}
