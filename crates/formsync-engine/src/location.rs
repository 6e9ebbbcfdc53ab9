use crate::retry::{classify_target, retry_with, RetryPolicy};
use formsync_core::contracts::{EntryKind, TargetEntry, TargetError, TargetStore, UploadMode};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Memoizes container ids and child listings for the orchestrator's own session. Only the
/// orchestrator touches it, between concurrent batches.
pub struct LocationCache {
    store: Arc<dyn TargetStore>,
    retry: RetryPolicy,
    containers: HashMap<(String, String), String>,
    listings: HashMap<String, Vec<TargetEntry>>,
    known_empty: HashSet<String>,
    listing_calls: u64,
}

impl LocationCache {
    pub fn new(store: Arc<dyn TargetStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            containers: HashMap::new(),
            listings: HashMap::new(),
            known_empty: HashSet::new(),
            listing_calls: 0,
        }
    }

    pub fn listing_calls(&self) -> u64 {
        self.listing_calls
    }

    /// Container id for `name` under `parent`, created when absent.
    pub async fn resolve(&mut self, name: &str, parent: &str) -> Result<String, TargetError> {
        let key = (parent.to_string(), name.to_string());
        if let Some(id) = self.containers.get(&key) {
            return Ok(id.clone());
        }

        if let Some(entries) = self.listings.get(parent) {
            if let Some(entry) = entries
                .iter()
                .find(|entry| entry.kind == EntryKind::Container && entry.name == name)
            {
                let id = entry.id.clone();
                self.containers.insert(key, id.clone());
                return Ok(id);
            }
        }

        let store = self.store.clone();
        let ensured = retry_with(&self.retry, "ensure_container", classify_target, || {
            store.ensure_container(name, parent)
        })
        .await?;
        if ensured.created {
            self.known_empty.insert(ensured.id.clone());
            self.invalidate(parent);
        }
        self.containers.insert(key, ensured.id.clone());
        Ok(ensured.id)
    }

    /// Resolves a `/`-separated path from the store root.
    pub async fn resolve_path(&mut self, path: &str) -> Result<String, TargetError> {
        let mut current = self.store.root_id();
        for segment in path.split('/').map(str::trim).filter(|segment| !segment.is_empty()) {
            current = self.resolve(segment, &current).await?;
        }
        Ok(current)
    }

    pub async fn entries(
        &mut self,
        container: &str,
        use_cache: bool,
    ) -> Result<Vec<TargetEntry>, TargetError> {
        if use_cache {
            if self.known_empty.contains(container) {
                return Ok(Vec::new());
            }
            if let Some(entries) = self.listings.get(container) {
                return Ok(entries.clone());
            }
        }

        let store = self.store.clone();
        let entries = retry_with(&self.retry, "list_children", classify_target, || {
            store.list_children(container)
        })
        .await?;
        self.listing_calls += 1;
        self.known_empty.remove(container);
        self.listings.insert(container.to_string(), entries.clone());
        Ok(entries)
    }

    pub async fn list_children(
        &mut self,
        container: &str,
        use_cache: bool,
    ) -> Result<BTreeSet<String>, TargetError> {
        Ok(self
            .entries(container, use_cache)
            .await?
            .into_iter()
            .map(|entry| entry.name)
            .collect())
    }

    pub fn invalidate(&mut self, container: &str) {
        self.listings.remove(container);
        self.known_empty.remove(container);
    }

    /// Seeds child container ids of `parent` from one listing. Returns how many were seen.
    pub async fn preload(&mut self, parent: &str) -> Result<usize, TargetError> {
        let entries = self.entries(parent, false).await?;
        let mut seen = 0;
        for entry in entries {
            if entry.kind == EntryKind::Container {
                self.containers
                    .insert((parent.to_string(), entry.name), entry.id);
                seen += 1;
            }
        }
        debug!(event = "containers_preloaded", parent, count = seen);
        Ok(seen)
    }

    /// True when the container is already known without any round trip.
    pub fn has_container(&self, parent: &str, name: &str) -> bool {
        self.containers
            .contains_key(&(parent.to_string(), name.to_string()))
    }

    /// Writes an object, first removing any same-named objects so the result is a replacement.
    pub async fn replace_object(
        &mut self,
        parent: &str,
        name: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, TargetError> {
        self.delete_named(parent, name).await?;
        self.put_object(parent, name, bytes, content_type).await
    }

    /// Writes an object without looking for an existing copy.
    pub async fn put_object(
        &mut self,
        parent: &str,
        name: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, TargetError> {
        let store = self.store.clone();
        let id = retry_with(&self.retry, "create_object", classify_target, || {
            store.create_object(parent, name, bytes.clone(), content_type, UploadMode::Simple)
        })
        .await?;
        self.invalidate(parent);
        Ok(id)
    }

    /// Deletes every object called `name` in `parent`. Returns the number removed.
    pub async fn delete_named(&mut self, parent: &str, name: &str) -> Result<usize, TargetError> {
        let matching: Vec<String> = self
            .entries(parent, true)
            .await?
            .into_iter()
            .filter(|entry| entry.kind == EntryKind::Object && entry.name == name)
            .map(|entry| entry.id)
            .collect();
        if matching.is_empty() {
            return Ok(0);
        }
        for id in &matching {
            self.delete_by_id(id).await?;
        }
        self.invalidate(parent);
        Ok(matching.len())
    }

    pub async fn delete_by_id(&self, id: &str) -> Result<(), TargetError> {
        let store = self.store.clone();
        retry_with(&self.retry, "delete_object", classify_target, || {
            store.delete_object(id)
        })
        .await
    }

    /// Removes everything inside a container, descending into child containers.
    pub async fn clear_container(&mut self, container: &str) -> Result<usize, TargetError> {
        let mut removed = 0usize;
        let mut pending = vec![container.to_string()];
        let mut emptied = Vec::new();
        while let Some(current) = pending.pop() {
            for entry in self.entries(&current, false).await? {
                match entry.kind {
                    EntryKind::Container => pending.push(entry.id),
                    EntryKind::Object => {
                        self.delete_by_id(&entry.id).await?;
                        removed += 1;
                    }
                }
            }
            emptied.push(current);
        }
        for child in emptied.iter().rev() {
            if child.as_str() != container {
                self.delete_by_id(child).await?;
            }
            self.invalidate(child);
        }
        let emptied: HashSet<String> = emptied.into_iter().collect();
        self.containers
            .retain(|(parent, _), _| !emptied.contains(parent));
        Ok(removed)
    }
}
