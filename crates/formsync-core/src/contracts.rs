use crate::{AssetMetadata, Entity, Record};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// How a failed call should be treated by retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Network or TLS failure; retried with linear backoff on a fresh session.
    Connection,
    /// Rate limiting or transient server failure; retried with exponential backoff.
    Throttled,
    Permanent,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Connection => "connection",
            FailureClass::Throttled => "throttled",
            FailureClass::Permanent => "permanent",
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureClass::Permanent)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("source network error: {0}")]
    Network(String),
    #[error("source returned status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("source payload could not be decoded: {0}")]
    Decode(String),
    #[error("source object not found: {0}")]
    NotFound(String),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Network(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetError {
    #[error("target network error: {0}")]
    Network(String),
    #[error("target returned status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("target object not found: {0}")]
    NotFound(String),
    #[error("target io error: {0}")]
    Io(String),
}

impl TargetError {
    pub fn class(&self) -> FailureClass {
        match self {
            TargetError::Network(_) => FailureClass::Connection,
            TargetError::Status { status, .. } => classify_status(*status),
            TargetError::NotFound(_) | TargetError::Io(_) => FailureClass::Permanent,
        }
    }
}

/// 403 is included because hosted stores report per-user quota exhaustion with it.
pub fn classify_status(status: u16) -> FailureClass {
    match status {
        403 | 429 => FailureClass::Throttled,
        500..=599 => FailureClass::Throttled,
        _ => FailureClass::Permanent,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("credential refresh failed: {0}")]
    Refresh(String),
    #[error("credentials unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("approval channel send failed: {0}")]
    Send(String),
    #[error("approval channel poll failed: {0}")]
    Poll(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Container,
    Object,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetEntry {
    pub id: String,
    pub name: String,
    pub kind: EntryKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsuredContainer {
    pub id: String,
    pub created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    /// Single round trip.
    Simple,
    /// Chunked upload that survives a dropped connection part way through.
    Resumable,
}

impl UploadMode {
    pub fn for_size(len: usize, resumable_threshold: usize) -> Self {
        if len >= resumable_threshold {
            UploadMode::Resumable
        } else {
            UploadMode::Simple
        }
    }
}

/// Schema element as published by the source system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub data_name: Option<String>,
    #[serde(default)]
    pub label: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub elements: Vec<FieldDefinition>,
}

impl FieldDefinition {
    pub fn field_key(&self) -> Option<&str> {
        self.key
            .as_deref()
            .filter(|key| !key.is_empty())
            .or_else(|| self.data_name.as_deref().filter(|key| !key.is_empty()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntitySchema {
    #[serde(default)]
    pub elements: Vec<FieldDefinition>,
}

/// Auxiliary reference document exported once per fresh run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceLayer {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub document: Value,
}

#[async_trait]
pub trait SourceSystem: Send + Sync {
    async fn list_entities(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Entity>, SourceError>;

    /// All records of an entity; pagination is the implementation's concern.
    async fn list_records(&self, entity_id: &str) -> Result<Vec<Record>, SourceError>;

    async fn get_schema(&self, entity_id: &str) -> Result<EntitySchema, SourceError>;

    async fn asset_metadata_batch(
        &self,
        entity_id: &str,
    ) -> Result<BTreeMap<String, AssetMetadata>, SourceError>;

    async fn fetch_asset_bytes(&self, asset_id: &str) -> Result<Vec<u8>, SourceError>;

    /// Single-asset lookup used when the bulk map lacks an entry.
    async fn asset_metadata(&self, _asset_id: &str) -> Result<Option<AssetMetadata>, SourceError> {
        Ok(None)
    }

    async fn list_layers(&self) -> Result<Vec<SourceLayer>, SourceError> {
        Ok(Vec::new())
    }
}

/// One session against the hierarchical target store.
#[async_trait]
pub trait TargetStore: Send + Sync {
    fn root_id(&self) -> String;

    async fn ensure_container(
        &self,
        name: &str,
        parent: &str,
    ) -> Result<EnsuredContainer, TargetError>;

    async fn list_children(&self, container: &str) -> Result<Vec<TargetEntry>, TargetError>;

    async fn create_object(
        &self,
        parent: &str,
        name: &str,
        bytes: Vec<u8>,
        content_type: &str,
        mode: UploadMode,
    ) -> Result<String, TargetError>;

    async fn delete_object(&self, id: &str) -> Result<(), TargetError>;
}

/// Opens independent target sessions, one per worker.
pub trait TargetSessionFactory: Send + Sync {
    fn open_session(&self) -> Result<Arc<dyn TargetStore>, TargetError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub value: String,
    pub issued_at: DateTime<Utc>,
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn token(&self) -> Result<SessionToken, CredentialError>;

    async fn refresh(&self) -> Result<(), CredentialError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageHandle(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub handle: MessageHandle,
    pub text: String,
    #[serde(default)]
    pub sender_is_self: bool,
}

#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    async fn send(&self, text: &str) -> Result<MessageHandle, ChannelError>;

    /// Messages posted after `since`, oldest first.
    async fn poll_since(&self, since: &MessageHandle) -> Result<Vec<ChannelMessage>, ChannelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_matches_retry_taxonomy() {
        assert_eq!(classify_status(429), FailureClass::Throttled);
        assert_eq!(classify_status(403), FailureClass::Throttled);
        assert_eq!(classify_status(500), FailureClass::Throttled);
        assert_eq!(classify_status(503), FailureClass::Throttled);
        assert_eq!(classify_status(400), FailureClass::Permanent);
        assert_eq!(classify_status(404), FailureClass::Permanent);
    }

    #[test]
    fn target_errors_map_to_failure_classes() {
        assert_eq!(
            TargetError::Network("reset".to_string()).class(),
            FailureClass::Connection
        );
        assert_eq!(
            TargetError::Io("disk full".to_string()).class(),
            FailureClass::Permanent
        );
        assert!(!FailureClass::Permanent.is_retryable());
        assert!(SourceError::Network("tls".to_string()).is_transient());
        assert!(!SourceError::Decode("bad json".to_string()).is_transient());
    }

    #[test]
    fn upload_mode_switches_at_threshold() {
        assert_eq!(UploadMode::for_size(10, 11), UploadMode::Simple);
        assert_eq!(UploadMode::for_size(11, 11), UploadMode::Resumable);
    }

    #[test]
    fn field_definition_falls_back_to_data_name() {
        let definition: FieldDefinition = serde_json::from_str(
            r#"{"key": "", "data_name": "inspector", "label": "Inspector", "type": "TextField"}"#,
        )
        .expect("parse definition");
        assert_eq!(definition.field_key(), Some("inspector"));
        let definition: FieldDefinition =
            serde_json::from_str(r#"{"label": "Notes", "type": "Label"}"#)
                .expect("parse definition");
        assert_eq!(definition.field_key(), None);
    }
}
