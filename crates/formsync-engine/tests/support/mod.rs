#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use formsync_core::contracts::{
    ApprovalChannel, ChannelError, ChannelMessage, CredentialError, CredentialProvider,
    EnsuredContainer, EntitySchema, EntryKind, MessageHandle, SessionToken, SourceError,
    SourceSystem, TargetEntry, TargetError, TargetSessionFactory, TargetStore, UploadMode,
};
use formsync_core::{AssetMetadata, Entity, FieldValue, Geolocation, Record};
use formsync_engine::orchestrator::{Collaborators, ACTIVE_CONTAINER};
use formsync_engine::retry::RetryPolicy;
use formsync_engine::{ApprovalConfig, EngineConfig};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const ROOT_PATH: &str = "Sync";

pub fn fast_config() -> EngineConfig {
    EngineConfig {
        entity_retry_delay: Duration::from_millis(5),
        retry: RetryPolicy {
            max_attempts: 3,
            linear_step: Duration::from_millis(1),
            exponential_base: 1.0,
            exponential_step: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        },
        approval: ApprovalConfig {
            poll_interval: Duration::from_millis(10),
            timeout: Duration::from_millis(100),
        },
        ..EngineConfig::default()
    }
}

fn record(id: &str, assets: &[&str]) -> Record {
    let photos = assets
        .iter()
        .map(|asset_id| {
            FieldValue::Mapping(BTreeMap::from([(
                "photo_id".to_string(),
                FieldValue::text(*asset_id),
            )]))
        })
        .collect();
    Record {
        id: id.to_string(),
        status: Some("complete".to_string()),
        created_at: None,
        updated_at: None,
        created_by: None,
        updated_by: None,
        geolocation: Geolocation::default(),
        form_values: BTreeMap::from([("photos".to_string(), FieldValue::Sequence(photos))]),
    }
}

/// Source with one record per entity holding every asset of that entity.
#[derive(Default)]
pub struct MemorySource {
    entities: Vec<Entity>,
    records: BTreeMap<String, Vec<Record>>,
    metadata: BTreeMap<String, BTreeMap<String, AssetMetadata>>,
    missing: BTreeSet<String>,
    fetches: Mutex<Vec<String>>,
    cancel_at: Mutex<Option<(String, CancellationToken)>>,
    record_failures: Mutex<BTreeMap<String, usize>>,
    listing_delays: BTreeMap<String, Duration>,
    listings: Mutex<Vec<String>>,
    since_seen: Mutex<Vec<Option<DateTime<Utc>>>>,
}

impl MemorySource {
    pub fn with_entity(mut self, id: &str, name: &str, assets: &[&str]) -> Self {
        self.entities.push(Entity {
            id: id.to_string(),
            name: name.to_string(),
            active: true,
        });
        let records = if assets.is_empty() {
            Vec::new()
        } else {
            vec![record(&format!("{id}-r1"), assets)]
        };
        self.records.insert(id.to_string(), records);
        self.metadata.insert(
            id.to_string(),
            assets
                .iter()
                .map(|asset_id| (asset_id.to_string(), AssetMetadata::new(*asset_id)))
                .collect(),
        );
        self
    }

    /// The asset stays referenced but its bytes can never be fetched.
    pub fn with_missing_asset(mut self, asset_id: &str) -> Self {
        self.missing.insert(asset_id.to_string());
        self
    }

    /// Cancels `token` the first time records of `entity_id` are listed.
    pub fn cancel_when_listing(&self, entity_id: &str, token: CancellationToken) {
        *self.cancel_at.lock().expect("cancel lock") = Some((entity_id.to_string(), token));
    }

    /// The next `times` record listings of `entity_id` fail with a network error.
    pub fn failing_records(self, entity_id: &str, times: usize) -> Self {
        self.record_failures
            .lock()
            .expect("failure lock")
            .insert(entity_id.to_string(), times);
        self
    }

    /// Record listings of `entity_id` take `delay` before answering.
    pub fn slow_records(mut self, entity_id: &str, delay: Duration) -> Self {
        self.listing_delays.insert(entity_id.to_string(), delay);
        self
    }

    pub fn record_listings(&self, entity_id: &str) -> usize {
        self.listings
            .lock()
            .expect("listing lock")
            .iter()
            .filter(|listed| listed.as_str() == entity_id)
            .count()
    }

    /// Watermarks passed to `list_entities`, one per call.
    pub fn since_seen(&self) -> Vec<Option<DateTime<Utc>>> {
        self.since_seen.lock().expect("since lock").clone()
    }

    pub fn fetches(&self) -> Vec<String> {
        self.fetches.lock().expect("fetch lock").clone()
    }
}

#[async_trait]
impl SourceSystem for MemorySource {
    async fn list_entities(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Entity>, SourceError> {
        self.since_seen.lock().expect("since lock").push(since);
        Ok(self.entities.clone())
    }

    async fn list_records(&self, entity_id: &str) -> Result<Vec<Record>, SourceError> {
        self.listings
            .lock()
            .expect("listing lock")
            .push(entity_id.to_string());
        if let Some(delay) = self.listing_delays.get(entity_id) {
            tokio::time::sleep(*delay).await;
        }
        {
            let mut cancel_at = self.cancel_at.lock().expect("cancel lock");
            if cancel_at.as_ref().map(|(id, _)| id.as_str()) == Some(entity_id) {
                if let Some((_, token)) = cancel_at.take() {
                    token.cancel();
                }
            }
        }
        if let Some(remaining) = self
            .record_failures
            .lock()
            .expect("failure lock")
            .get_mut(entity_id)
            .filter(|remaining| **remaining > 0)
        {
            *remaining -= 1;
            return Err(SourceError::Network("connection reset by peer".to_string()));
        }
        Ok(self.records.get(entity_id).cloned().unwrap_or_default())
    }

    async fn get_schema(&self, _entity_id: &str) -> Result<EntitySchema, SourceError> {
        Ok(EntitySchema::default())
    }

    async fn asset_metadata_batch(
        &self,
        entity_id: &str,
    ) -> Result<BTreeMap<String, AssetMetadata>, SourceError> {
        Ok(self.metadata.get(entity_id).cloned().unwrap_or_default())
    }

    async fn fetch_asset_bytes(&self, asset_id: &str) -> Result<Vec<u8>, SourceError> {
        self.fetches
            .lock()
            .expect("fetch lock")
            .push(asset_id.to_string());
        if self.missing.contains(asset_id) {
            return Err(SourceError::NotFound(asset_id.to_string()));
        }
        Ok(format!("bytes of {asset_id}").into_bytes())
    }
}

#[derive(Debug, Clone)]
struct Node {
    parent: String,
    name: String,
    kind: EntryKind,
    bytes: Vec<u8>,
}

#[derive(Debug, Default)]
struct TargetState {
    next_id: u64,
    nodes: BTreeMap<String, Node>,
    created: Vec<String>,
}

impl TargetState {
    fn insert(&mut self, parent: &str, name: &str, kind: EntryKind, bytes: Vec<u8>) -> String {
        self.next_id += 1;
        let id = format!("n{}", self.next_id);
        self.nodes.insert(
            id.clone(),
            Node {
                parent: parent.to_string(),
                name: name.to_string(),
                kind,
                bytes,
            },
        );
        id
    }

    fn find(&self, parent: &str, name: &str, kind: EntryKind) -> Option<String> {
        self.nodes
            .iter()
            .find(|(_, node)| node.parent == parent && node.name == name && node.kind == kind)
            .map(|(id, _)| id.clone())
    }

    fn ensure_path(&mut self, path: &[&str]) -> String {
        let mut current = "root".to_string();
        for segment in path {
            current = match self.find(&current, segment, EntryKind::Container) {
                Some(id) => id,
                None => self.insert(&current, segment, EntryKind::Container, Vec::new()),
            };
        }
        current
    }

    fn lookup_path(&self, path: &[&str]) -> Option<String> {
        let mut current = "root".to_string();
        for segment in path {
            current = self.find(&current, segment, EntryKind::Container)?;
        }
        Some(current)
    }
}

/// Hierarchical store shared by every session it opens.
#[derive(Clone, Default)]
pub struct MemoryTarget {
    state: Arc<Mutex<TargetState>>,
}

impl MemoryTarget {
    fn state(&self) -> std::sync::MutexGuard<'_, TargetState> {
        self.state.lock().expect("target lock")
    }

    pub fn seed_object(&self, path: &[&str], name: &str, text: &str) {
        let mut state = self.state();
        let parent = state.ensure_path(path);
        state.insert(&parent, name, EntryKind::Object, text.as_bytes().to_vec());
    }

    pub fn object_names(&self, path: &[&str]) -> BTreeSet<String> {
        let state = self.state();
        let Some(container) = state.lookup_path(path) else {
            return BTreeSet::new();
        };
        state
            .nodes
            .values()
            .filter(|node| node.parent == container && node.kind == EntryKind::Object)
            .map(|node| node.name.clone())
            .collect()
    }

    pub fn read(&self, path: &[&str], name: &str) -> Option<String> {
        let state = self.state();
        let container = state.lookup_path(path)?;
        let id = state.find(&container, name, EntryKind::Object)?;
        state
            .nodes
            .get(&id)
            .map(|node| String::from_utf8_lossy(&node.bytes).into_owned())
    }

    /// How many times an object called `name` was created, anywhere.
    pub fn creates_of(&self, name: &str) -> usize {
        self.state()
            .created
            .iter()
            .filter(|created| created.as_str() == name)
            .count()
    }
}

#[async_trait]
impl TargetStore for MemoryTarget {
    fn root_id(&self) -> String {
        "root".to_string()
    }

    async fn ensure_container(
        &self,
        name: &str,
        parent: &str,
    ) -> Result<EnsuredContainer, TargetError> {
        let mut state = self.state();
        if let Some(id) = state.find(parent, name, EntryKind::Container) {
            return Ok(EnsuredContainer { id, created: false });
        }
        let id = state.insert(parent, name, EntryKind::Container, Vec::new());
        Ok(EnsuredContainer { id, created: true })
    }

    async fn list_children(&self, container: &str) -> Result<Vec<TargetEntry>, TargetError> {
        Ok(self
            .state()
            .nodes
            .iter()
            .filter(|(_, node)| node.parent == container)
            .map(|(id, node)| TargetEntry {
                id: id.clone(),
                name: node.name.clone(),
                kind: node.kind,
            })
            .collect())
    }

    async fn create_object(
        &self,
        parent: &str,
        name: &str,
        bytes: Vec<u8>,
        _content_type: &str,
        _mode: UploadMode,
    ) -> Result<String, TargetError> {
        let mut state = self.state();
        state.created.push(name.to_string());
        Ok(state.insert(parent, name, EntryKind::Object, bytes))
    }

    async fn delete_object(&self, id: &str) -> Result<(), TargetError> {
        match self.state().nodes.remove(id) {
            Some(_) => Ok(()),
            None => Err(TargetError::NotFound(id.to_string())),
        }
    }
}

impl TargetSessionFactory for MemoryTarget {
    fn open_session(&self) -> Result<Arc<dyn TargetStore>, TargetError> {
        Ok(Arc::new(self.clone()))
    }
}

/// Hands out one queued batch of replies per poll.
#[derive(Default)]
pub struct ScriptedChannel {
    sent: Mutex<Vec<String>>,
    replies: Mutex<VecDeque<Vec<String>>>,
    polls: AtomicUsize,
}

impl ScriptedChannel {
    pub fn replying(replies: &[&str]) -> Self {
        let channel = Self::default();
        *channel.replies.lock().expect("replies lock") =
            replies.iter().map(|reply| vec![reply.to_string()]).collect();
        channel
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().expect("sent lock").clone()
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ApprovalChannel for ScriptedChannel {
    async fn send(&self, text: &str) -> Result<MessageHandle, ChannelError> {
        let mut sent = self.sent.lock().expect("sent lock");
        sent.push(text.to_string());
        Ok(MessageHandle(format!("out-{}", sent.len())))
    }

    async fn poll_since(&self, _since: &MessageHandle) -> Result<Vec<ChannelMessage>, ChannelError> {
        let poll = self.polls.fetch_add(1, Ordering::SeqCst);
        let batch = self
            .replies
            .lock()
            .expect("replies lock")
            .pop_front()
            .unwrap_or_default();
        Ok(batch
            .into_iter()
            .map(|text| ChannelMessage {
                handle: MessageHandle(format!("in-{poll}")),
                text,
                sender_is_self: false,
            })
            .collect())
    }
}

#[derive(Default)]
pub struct StaticCredentials {
    refreshes: AtomicUsize,
}

impl StaticCredentials {
    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn token(&self) -> Result<SessionToken, CredentialError> {
        Ok(SessionToken {
            value: "token".to_string(),
            issued_at: Utc::now(),
        })
    }

    async fn refresh(&self) -> Result<(), CredentialError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn collaborators(
    source: Arc<MemorySource>,
    target: &MemoryTarget,
    approvals: Option<Arc<ScriptedChannel>>,
) -> Collaborators {
    Collaborators {
        source,
        sessions: Arc::new(target.clone()),
        credentials: Arc::new(StaticCredentials::default()),
        approvals: approvals.map(|channel| channel as Arc<dyn ApprovalChannel>),
    }
}

/// Path segments of an active entity's folder below the sync root.
pub fn entity_path(folder: &str) -> Vec<&str> {
    vec![ROOT_PATH, ACTIVE_CONTAINER, folder]
}

pub fn assets_path(folder: &str) -> Vec<&str> {
    vec![ROOT_PATH, ACTIVE_CONTAINER, folder, "assets"]
}
