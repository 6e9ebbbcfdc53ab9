use async_trait::async_trait;
use formsync_core::contracts::{
    EnsuredContainer, EntryKind, TargetEntry, TargetError, TargetSessionFactory, TargetStore,
    UploadMode,
};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const ROOT_ID: &str = ".";
const PARTIAL_SUFFIX: &str = ".part";

/// Target store over a local directory tree. Containers are directories and ids are
/// `/`-separated paths relative to the base directory.
#[derive(Debug, Clone)]
pub struct LocalDirTarget {
    base: PathBuf,
}

impl LocalDirTarget {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn path_of(&self, id: &str) -> Result<PathBuf, TargetError> {
        if id == ROOT_ID {
            return Ok(self.base.clone());
        }
        let mut path = self.base.clone();
        for segment in id.split('/') {
            check_name(segment)?;
            path.push(segment);
        }
        Ok(path)
    }
}

fn child_id(parent: &str, name: &str) -> String {
    if parent == ROOT_ID {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

fn check_name(name: &str) -> Result<(), TargetError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(TargetError::Status {
            status: 400,
            message: format!("invalid name {name:?}"),
        });
    }
    Ok(())
}

fn io_error(err: io::Error, id: &str) -> TargetError {
    match err.kind() {
        io::ErrorKind::NotFound => TargetError::NotFound(id.to_string()),
        io::ErrorKind::Interrupted | io::ErrorKind::TimedOut => {
            TargetError::Network(err.to_string())
        }
        _ => TargetError::Io(format!("{id}: {err}")),
    }
}

#[async_trait]
impl TargetStore for LocalDirTarget {
    fn root_id(&self) -> String {
        ROOT_ID.to_string()
    }

    async fn ensure_container(
        &self,
        name: &str,
        parent: &str,
    ) -> Result<EnsuredContainer, TargetError> {
        check_name(name)?;
        let id = child_id(parent, name);
        let path = self.path_of(&id)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => Ok(EnsuredContainer { id, created: false }),
            Ok(_) => Err(TargetError::Status {
                status: 409,
                message: format!("{id} exists and is not a container"),
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(&path)
                    .await
                    .map_err(|err| io_error(err, &id))?;
                debug!(event = "container_created", id = %id);
                Ok(EnsuredContainer { id, created: true })
            }
            Err(err) => Err(io_error(err, &id)),
        }
    }

    async fn list_children(&self, container: &str) -> Result<Vec<TargetEntry>, TargetError> {
        let path = self.path_of(container)?;
        let mut dir = tokio::fs::read_dir(&path)
            .await
            .map_err(|err| io_error(err, container))?;
        let mut entries = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|err| io_error(err, container))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(PARTIAL_SUFFIX) {
                continue;
            }
            let file_type = entry
                .file_type()
                .await
                .map_err(|err| io_error(err, container))?;
            entries.push(TargetEntry {
                id: child_id(container, &name),
                name,
                kind: if file_type.is_dir() {
                    EntryKind::Container
                } else {
                    EntryKind::Object
                },
            });
        }
        entries.sort_by(|left, right| left.name.cmp(&right.name));
        Ok(entries)
    }

    async fn create_object(
        &self,
        parent: &str,
        name: &str,
        bytes: Vec<u8>,
        _content_type: &str,
        mode: UploadMode,
    ) -> Result<String, TargetError> {
        check_name(name)?;
        let parent_path = self.path_of(parent)?;
        if !tokio::fs::metadata(&parent_path)
            .await
            .map_err(|err| io_error(err, parent))?
            .is_dir()
        {
            return Err(TargetError::NotFound(parent.to_string()));
        }

        let id = child_id(parent, name);
        let path = parent_path.join(name);
        match mode {
            UploadMode::Simple => tokio::fs::write(&path, &bytes)
                .await
                .map_err(|err| io_error(err, &id))?,
            UploadMode::Resumable => {
                let partial = parent_path.join(format!("{name}{PARTIAL_SUFFIX}"));
                tokio::fs::write(&partial, &bytes)
                    .await
                    .map_err(|err| io_error(err, &id))?;
                tokio::fs::rename(&partial, &path)
                    .await
                    .map_err(|err| io_error(err, &id))?;
            }
        }
        Ok(id)
    }

    async fn delete_object(&self, id: &str) -> Result<(), TargetError> {
        if id == ROOT_ID {
            return Err(TargetError::Status {
                status: 400,
                message: "refusing to delete the root container".to_string(),
            });
        }
        let path = self.path_of(id)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|err| io_error(err, id))?;
        let removed = if meta.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        removed.map_err(|err| io_error(err, id))
    }
}

impl TargetSessionFactory for LocalDirTarget {
    fn open_session(&self) -> Result<Arc<dyn TargetStore>, TargetError> {
        Ok(Arc::new(self.clone()))
    }
}
