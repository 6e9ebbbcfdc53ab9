use anyhow::{Context, Result};
use formsync_engine::EngineConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "formsync.toml";
pub const DEFAULT_STATE_DIR: &str = ".formsync";
pub const DEFAULT_LOG_DIR: &str = ".formsync/logs";

/// Optional `formsync.toml`. Every key may be omitted.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub source_dir: Option<PathBuf>,
    pub target_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub root_path: Option<String>,
    pub approval: ApprovalSection,
    pub tuning: TuningSection,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ApprovalSection {
    pub outbox: Option<PathBuf>,
    pub inbox: Option<PathBuf>,
    pub poll_interval_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TuningSection {
    pub run_deadline_minutes: Option<u64>,
    pub asset_workers: Option<usize>,
    pub export_workers: Option<usize>,
    pub asset_timeout_secs: Option<u64>,
    pub export_timeout_secs: Option<u64>,
    pub stall_timeout_secs: Option<u64>,
    pub extra_batch_rounds: Option<usize>,
    pub entity_attempts: Option<u32>,
    pub credential_refresh_minutes: Option<u64>,
    pub ledger_flush_every: Option<usize>,
}

impl FileConfig {
    /// Built-in defaults overlaid with whatever the file sets.
    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::default();
        let tuning = &self.tuning;
        if let Some(minutes) = tuning.run_deadline_minutes {
            config.run_deadline = Duration::from_secs(minutes * 60);
        }
        if let Some(width) = tuning.asset_workers {
            config.asset_pool.width = width.max(1);
        }
        if let Some(width) = tuning.export_workers {
            config.export_pool.width = width.max(1);
        }
        if let Some(secs) = tuning.asset_timeout_secs {
            config.asset_pool.item_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = tuning.export_timeout_secs {
            config.export_pool.item_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = tuning.stall_timeout_secs {
            config.asset_pool.stall_timeout = Duration::from_secs(secs);
            config.export_pool.stall_timeout = Duration::from_secs(secs);
        }
        if let Some(rounds) = tuning.extra_batch_rounds {
            config.extra_batch_rounds = rounds;
        }
        if let Some(attempts) = tuning.entity_attempts {
            config.entity_attempts = attempts.max(1);
        }
        if let Some(minutes) = tuning.credential_refresh_minutes {
            config.credential_refresh_interval = Duration::from_secs(minutes * 60);
        }
        if let Some(every) = tuning.ledger_flush_every {
            config.ledger_flush_every = every.max(1);
        }
        if let Some(secs) = self.approval.poll_interval_secs {
            config.approval.poll_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = self.approval.timeout_secs {
            config.approval.timeout = Duration::from_secs(secs);
        }
        config
    }
}

/// A missing file is not an error; a malformed one is.
pub fn load_file_config(path: &Path) -> Result<FileConfig> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn env_true(key: &str) -> bool {
    env_value(key)
        .map(|value| {
            matches!(
                value.to_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(false)
}

/// Flag, then environment, then config file.
pub fn first_of<T>(flag: Option<T>, env: Option<T>, file: Option<T>) -> Option<T> {
    flag.or(env).or(file)
}

pub fn resolve_path(
    flag: Option<PathBuf>,
    env_key: &str,
    file: Option<PathBuf>,
    default: &str,
) -> PathBuf {
    first_of(flag, env_value(env_key).map(PathBuf::from), file)
        .unwrap_or_else(|| PathBuf::from(default))
}

pub fn resolve_config_path(flag: Option<PathBuf>) -> PathBuf {
    first_of(flag, env_value("FORMSYNC_CONFIG").map(PathBuf::from), None)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_beats_env_beats_file() {
        assert_eq!(first_of(Some(1), Some(2), Some(3)), Some(1));
        assert_eq!(first_of(None, Some(2), Some(3)), Some(2));
        assert_eq!(first_of(None, None, Some(3)), Some(3));
        assert_eq!(first_of::<u8>(None, None, None), None);
    }

    #[test]
    fn file_tuning_overrides_defaults() {
        let file: FileConfig = toml::from_str(
            r#"
            source_dir = "snapshot"
            root_path = "Exports/Forms"

            [approval]
            inbox = "inbox.jsonl"
            timeout_secs = 60

            [tuning]
            asset_workers = 8
            run_deadline_minutes = 30
            "#,
        )
        .expect("parse config");

        assert_eq!(file.source_dir, Some(PathBuf::from("snapshot")));
        assert_eq!(file.root_path.as_deref(), Some("Exports/Forms"));
        let config = file.engine_config();
        assert_eq!(config.asset_pool.width, 8);
        assert_eq!(config.export_pool.width, 5);
        assert_eq!(config.run_deadline, Duration::from_secs(30 * 60));
        assert_eq!(config.approval.timeout, Duration::from_secs(60));
        assert_eq!(config.approval.poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_file_config(&dir.path().join("absent.toml")).expect("load");
        assert_eq!(config, FileConfig::default());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("formsync.toml");
        std::fs::write(&path, "tuning = [").expect("write");
        assert!(load_file_config(&path).is_err());
    }
}
