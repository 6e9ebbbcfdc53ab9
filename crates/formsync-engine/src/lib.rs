pub mod config;
pub mod export;
pub mod ledger;
pub mod location;
pub mod orchestrator;
pub mod orphans;
pub mod pool;
pub mod retry;
pub mod session;
pub mod summary;
pub mod transfer;

pub use config::{ApprovalConfig, EngineConfig, PoolConfig, RunOptions};
pub use orchestrator::{Collaborators, Orchestrator, RunReport};

use formsync_core::contracts::{FailureClass, SourceError, TargetError};
use formsync_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("source error: {0}")]
    Source(#[from] SourceError),
    #[error("target error: {0}")]
    Target(#[from] TargetError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("export encoding error: {0}")]
    Export(String),
    #[error("run cancelled")]
    Cancelled,
}

impl SyncError {
    /// Network-class failures that justify retrying a whole entity.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Source(err) => err.is_transient(),
            SyncError::Target(err) => err.class() == FailureClass::Connection,
            SyncError::Storage(_) | SyncError::Export(_) | SyncError::Cancelled => false,
        }
    }
}
