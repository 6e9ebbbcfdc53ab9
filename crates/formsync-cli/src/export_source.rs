use async_trait::async_trait;
use chrono::{DateTime, Utc};
use formsync_core::contracts::{EntitySchema, SourceError, SourceLayer, SourceSystem};
use formsync_core::{AssetMetadata, Entity, Record};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
struct EntityRow {
    #[serde(flatten)]
    entity: Entity,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

/// Source snapshot on disk:
///
/// ```text
/// entities.json            [{"id", "name", "active", "updated_at"}]
/// schemas/<entity>.json    {"elements": [...]}
/// records/<entity>.json    [record, ...]
/// assets/<entity>.json     [asset metadata, ...]
/// blobs/<asset_id>         raw bytes
/// layers.json              optional [{"id", "name", "document"}]
/// ```
#[derive(Debug, Clone)]
pub struct ExportDirSource {
    root: PathBuf,
}

impl ExportDirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn read_json<T: DeserializeOwned>(&self, relative: &str) -> Result<Option<T>, SourceError> {
        let path = self.root.join(relative);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(err, relative)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| SourceError::Decode(format!("{relative}: {err}")))
    }
}

fn io_error(err: io::Error, relative: &str) -> SourceError {
    match err.kind() {
        io::ErrorKind::NotFound => SourceError::NotFound(relative.to_string()),
        _ => SourceError::Network(format!("{relative}: {err}")),
    }
}

/// Ids become file names, so anything that could leave the snapshot directory is refused.
fn file_key(id: &str) -> Result<&str, SourceError> {
    if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
        return Err(SourceError::NotFound(id.to_string()));
    }
    Ok(id)
}

#[async_trait]
impl SourceSystem for ExportDirSource {
    async fn list_entities(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Entity>, SourceError> {
        let rows: Vec<EntityRow> = self
            .read_json("entities.json")
            .await?
            .ok_or_else(|| SourceError::NotFound("entities.json".to_string()))?;
        Ok(rows
            .into_iter()
            .filter(|row| match (since, row.updated_at) {
                (Some(since), Some(updated_at)) => updated_at >= since,
                _ => true,
            })
            .map(|row| row.entity)
            .collect())
    }

    async fn list_records(&self, entity_id: &str) -> Result<Vec<Record>, SourceError> {
        let key = file_key(entity_id)?;
        Ok(self
            .read_json(&format!("records/{key}.json"))
            .await?
            .unwrap_or_default())
    }

    async fn get_schema(&self, entity_id: &str) -> Result<EntitySchema, SourceError> {
        let key = file_key(entity_id)?;
        Ok(self
            .read_json(&format!("schemas/{key}.json"))
            .await?
            .unwrap_or_default())
    }

    async fn asset_metadata_batch(
        &self,
        entity_id: &str,
    ) -> Result<BTreeMap<String, AssetMetadata>, SourceError> {
        let key = file_key(entity_id)?;
        let rows: Vec<AssetMetadata> = self
            .read_json(&format!("assets/{key}.json"))
            .await?
            .unwrap_or_default();
        Ok(rows
            .into_iter()
            .map(|meta| (meta.asset_id.clone(), meta))
            .collect())
    }

    async fn fetch_asset_bytes(&self, asset_id: &str) -> Result<Vec<u8>, SourceError> {
        let relative = format!("blobs/{}", file_key(asset_id)?);
        tokio::fs::read(self.root.join(&relative))
            .await
            .map_err(|err| io_error(err, &relative))
    }

    async fn list_layers(&self) -> Result<Vec<SourceLayer>, SourceError> {
        Ok(self.read_json("layers.json").await?.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs;

    fn snapshot() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        for sub in ["records", "assets", "blobs"] {
            fs::create_dir_all(root.join(sub)).expect("mkdir");
        }
        fs::write(
            root.join("entities.json"),
            r#"[
                {"id": "f1", "name": "Parcels", "updated_at": "2024-03-01T00:00:00Z"},
                {"id": "f2", "name": "Roads", "active": false, "updated_at": "2024-01-01T00:00:00Z"}
            ]"#,
        )
        .expect("write entities");
        fs::write(
            root.join("records/f1.json"),
            r#"[{"id": "r1", "form_values": {"photos": [{"photo_id": "p1"}]}}]"#,
        )
        .expect("write records");
        fs::write(
            root.join("assets/f1.json"),
            r#"[{"asset_id": "p1", "content_type": "image/png"}]"#,
        )
        .expect("write assets");
        fs::write(root.join("blobs/p1"), b"png").expect("write blob");
        dir
    }

    #[tokio::test]
    async fn reads_entities_records_and_assets() {
        let dir = snapshot();
        let source = ExportDirSource::new(dir.path());

        let entities = source.list_entities(None).await.expect("entities");
        assert_eq!(entities.len(), 2);
        assert!(!entities[1].active);

        let records = source.list_records("f1").await.expect("records");
        assert_eq!(records[0].id, "r1");
        assert!(source.list_records("f2").await.expect("records").is_empty());

        let metadata = source.asset_metadata_batch("f1").await.expect("metadata");
        assert_eq!(metadata["p1"].content_type.as_deref(), Some("image/png"));
        assert_eq!(source.fetch_asset_bytes("p1").await.expect("bytes"), b"png");
        assert!(source.list_layers().await.expect("layers").is_empty());
    }

    #[tokio::test]
    async fn since_filter_keeps_recent_entities() {
        let dir = snapshot();
        let source = ExportDirSource::new(dir.path());
        let since = Utc
            .with_ymd_and_hms(2024, 2, 1, 0, 0, 0)
            .single()
            .expect("valid timestamp");

        let entities = source.list_entities(Some(since)).await.expect("entities");
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].name, "Parcels");
    }

    #[tokio::test]
    async fn missing_blobs_are_not_found() {
        let dir = snapshot();
        let source = ExportDirSource::new(dir.path());

        assert!(matches!(
            source.fetch_asset_bytes("p9").await,
            Err(SourceError::NotFound(_))
        ));
        assert!(matches!(
            source.fetch_asset_bytes("../entities.json").await,
            Err(SourceError::NotFound(_))
        ));
    }
}
