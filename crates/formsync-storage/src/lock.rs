use chrono::{DateTime, Utc};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("state directory {0} is locked by another run")]
    Held(PathBuf),
    #[error("lock io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Exclusive advisory lock over a state directory. Released on drop.
pub struct StateLock {
    file: File,
    path: PathBuf,
}

impl StateLock {
    pub fn acquire(path: &Path, now: DateTime<Utc>) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(LockError::Held(path.to_path_buf()));
        }

        let holder = format!(
            "owner_pid={}\nacquired_at={}\n",
            std::process::id(),
            now.to_rfc3339(),
        );
        file.set_len(0)?;
        file.write_all(holder.as_bytes())?;
        file.flush()?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
