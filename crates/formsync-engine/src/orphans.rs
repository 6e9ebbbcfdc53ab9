use crate::config::{ApprovalConfig, RunOptions};
use crate::location::LocationCache;
use chrono::Utc;
use formsync_core::contracts::{ApprovalChannel, EntryKind, MessageHandle, TargetError};
use formsync_core::{
    asset_id_from_object_name, ApprovalDecision, AssetMetadata, ReplayEntry, ReplayReason,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Asset ids that may legitimately exist in the target: every known asset not deleted at the source.
pub fn valid_asset_ids(metadata: &BTreeMap<String, AssetMetadata>) -> BTreeSet<String> {
    metadata
        .values()
        .filter(|asset| !asset.is_deleted())
        .map(|asset| asset.asset_id.clone())
        .collect()
}

/// Target filenames whose encoded asset id is not in `valid`. Names without an id are never orphans.
pub fn find_orphans(listing: &BTreeSet<String>, valid: &BTreeSet<String>) -> BTreeSet<String> {
    listing
        .iter()
        .filter(|name| {
            asset_id_from_object_name(name)
                .map(|asset_id| !valid.contains(asset_id))
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Pending,
    SkipPolicy,
    AutoDeletePolicy,
    PreApproved,
    NoChannel,
    AwaitingResponse,
}

impl GateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateState::Pending => "pending",
            GateState::SkipPolicy => "skip_policy",
            GateState::AutoDeletePolicy => "auto_delete_policy",
            GateState::PreApproved => "pre_approved",
            GateState::NoChannel => "no_channel",
            GateState::AwaitingResponse => "awaiting_response",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionPolicy {
    pub skip_all: bool,
    pub auto_delete_all: bool,
    pub pre_approved: BTreeSet<String>,
}

impl DeletionPolicy {
    pub fn from_options(options: &RunOptions) -> Self {
        Self {
            skip_all: options.skip_deletions,
            auto_delete_all: options.auto_delete,
            pre_approved: options.pre_approved.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateResolution {
    /// The branch taken out of `Pending`.
    pub state: GateState,
    pub decision: ApprovalDecision,
    /// Set when the orphans stay in place and the entity needs re-approval later.
    pub replay_reason: Option<ReplayReason>,
}

/// Approve / skip / end vocabulary. Anything else is ignored.
pub fn parse_reply(text: &str) -> Option<ApprovalDecision> {
    match text.trim().to_lowercase().as_str() {
        "y" | "yes" => Some(ApprovalDecision::Approved),
        "s" | "skip" => Some(ApprovalDecision::Skipped),
        "e" | "end" => Some(ApprovalDecision::Ended),
        _ => None,
    }
}

fn approval_request(entity_name: &str, orphan_count: usize, timeout_minutes: u64) -> String {
    format!(
        "Deletion approval required\n\
         Entity: {entity_name}\n\
         Files to delete: {orphan_count}\n\n\
         These assets no longer exist at the source and will be removed from the target.\n\
         Reply within {timeout_minutes} minutes:\n\
         - y / yes: delete and continue\n\
         - s / skip: keep the files and continue\n\
         - e / end: stop the run after this entity"
    )
}

/// Gates destructive orphan cleanup behind run policy or a human reply on the approval channel.
pub struct ApprovalGate {
    channel: Option<Arc<dyn ApprovalChannel>>,
    config: ApprovalConfig,
    cancel: CancellationToken,
}

impl ApprovalGate {
    pub fn new(
        channel: Option<Arc<dyn ApprovalChannel>>,
        config: ApprovalConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            channel,
            config,
            cancel,
        }
    }

    pub fn entry_state(&self, policy: &DeletionPolicy, entity_name: &str) -> GateState {
        if policy.skip_all {
            GateState::SkipPolicy
        } else if policy.auto_delete_all {
            GateState::AutoDeletePolicy
        } else if policy.pre_approved.contains(entity_name) {
            GateState::PreApproved
        } else if self.channel.is_none() {
            GateState::NoChannel
        } else {
            GateState::AwaitingResponse
        }
    }

    pub async fn decide(
        &self,
        policy: &DeletionPolicy,
        entity_name: &str,
        orphan_count: usize,
    ) -> GateResolution {
        let state = self.entry_state(policy, entity_name);
        let resolve = |decision, replay_reason| GateResolution {
            state,
            decision,
            replay_reason,
        };
        match state {
            GateState::SkipPolicy => {
                debug!(event = "orphan_deletion_skipped", entity = entity_name, orphan_count);
                resolve(ApprovalDecision::Skipped, Some(ReplayReason::SkipPolicy))
            }
            GateState::AutoDeletePolicy => {
                self.notify(&format!(
                    "Auto-delete: removing {orphan_count} orphaned files from {entity_name}"
                ))
                .await;
                resolve(ApprovalDecision::AutoApproved, None)
            }
            GateState::PreApproved => {
                self.notify(&format!(
                    "Pre-approved: deleting {orphan_count} files from {entity_name}"
                ))
                .await;
                resolve(ApprovalDecision::PreApproved, None)
            }
            GateState::NoChannel | GateState::Pending => {
                warn!(
                    event = "approval_channel_unavailable",
                    entity = entity_name,
                    orphan_count
                );
                GateResolution {
                    state: GateState::NoChannel,
                    decision: ApprovalDecision::Approved,
                    replay_reason: None,
                }
            }
            GateState::AwaitingResponse => self.await_approval(entity_name, orphan_count).await,
        }
    }

    async fn await_approval(&self, entity_name: &str, orphan_count: usize) -> GateResolution {
        let Some(channel) = self.channel.clone() else {
            return GateResolution {
                state: GateState::NoChannel,
                decision: ApprovalDecision::Approved,
                replay_reason: None,
            };
        };
        let request = approval_request(
            entity_name,
            orphan_count,
            self.config.timeout.as_secs().div_ceil(60),
        );
        let handle = match channel.send(&request).await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(
                    event = "approval_request_failed",
                    entity = entity_name,
                    error = %err
                );
                return GateResolution {
                    state: GateState::NoChannel,
                    decision: ApprovalDecision::Approved,
                    replay_reason: None,
                };
            }
        };
        info!(event = "approval_requested", entity = entity_name, orphan_count);

        let (decision, replay_reason) = self.poll_reply(channel.as_ref(), &handle).await;
        let acknowledgement = match decision {
            ApprovalDecision::Approved => {
                format!("Deleting {orphan_count} files from {entity_name}")
            }
            ApprovalDecision::Skipped => format!("Skipped deletion for {entity_name}"),
            ApprovalDecision::Ended => "Run ended by user request".to_string(),
            _ => format!(
                "Timeout: skipped deletion for {entity_name} ({orphan_count} files)"
            ),
        };
        if replay_reason != Some(ReplayReason::Interrupted) {
            self.notify(&acknowledgement).await;
        }
        info!(
            event = "approval_resolved",
            entity = entity_name,
            decision = decision.as_str()
        );
        GateResolution {
            state: GateState::AwaitingResponse,
            decision,
            replay_reason,
        }
    }

    async fn poll_reply(
        &self,
        channel: &dyn ApprovalChannel,
        handle: &MessageHandle,
    ) -> (ApprovalDecision, Option<ReplayReason>) {
        let deadline = Instant::now() + self.config.timeout;
        loop {
            match channel.poll_since(handle).await {
                Ok(messages) => {
                    let reply = messages
                        .iter()
                        .filter(|message| !message.sender_is_self && &message.handle != handle)
                        .find_map(|message| parse_reply(&message.text));
                    match reply {
                        Some(ApprovalDecision::Skipped) => {
                            return (ApprovalDecision::Skipped, Some(ReplayReason::UserRequested))
                        }
                        Some(decision) => return (decision, None),
                        None => {}
                    }
                }
                Err(err) => warn!(event = "approval_poll_failed", error = %err),
            }

            let now = Instant::now();
            if now >= deadline {
                return (ApprovalDecision::TimedOut, Some(ReplayReason::NoResponse));
            }
            let wait = self.config.poll_interval.min(deadline - now);
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return (ApprovalDecision::TimedOut, Some(ReplayReason::Interrupted));
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Best-effort message on the channel; failures are logged and otherwise ignored.
    pub async fn notify(&self, text: &str) {
        if let Some(channel) = &self.channel {
            if let Err(err) = channel.send(text).await {
                debug!(event = "notification_failed", error = %err);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub deleted: usize,
    pub decision: ApprovalDecision,
    pub replay: Option<ReplayEntry>,
}

pub struct OrphanReconciler {
    gate: ApprovalGate,
    policy: DeletionPolicy,
}

impl OrphanReconciler {
    pub fn new(gate: ApprovalGate, policy: DeletionPolicy) -> Self {
        Self { gate, policy }
    }

    pub fn gate(&self) -> &ApprovalGate {
        &self.gate
    }

    pub async fn reconcile(
        &self,
        cache: &mut LocationCache,
        container: &str,
        orphans: &BTreeSet<String>,
        entity_name: &str,
    ) -> Result<ReconcileOutcome, TargetError> {
        if orphans.is_empty() {
            return Ok(ReconcileOutcome {
                deleted: 0,
                decision: ApprovalDecision::Approved,
                replay: None,
            });
        }

        let resolution = self
            .gate
            .decide(&self.policy, entity_name, orphans.len())
            .await;
        let replay = resolution.replay_reason.map(|reason| ReplayEntry {
            entity_name: entity_name.to_string(),
            reason,
            orphan_count: orphans.len(),
            recorded_at: Utc::now(),
        });
        let deleted = if resolution.decision.permits_deletion() {
            delete_orphans(cache, container, orphans).await?
        } else {
            0
        };
        info!(
            event = "orphans_reconciled",
            entity = entity_name,
            state = resolution.state.as_str(),
            decision = resolution.decision.as_str(),
            orphans = orphans.len(),
            deleted
        );
        Ok(ReconcileOutcome {
            deleted,
            decision: resolution.decision,
            replay,
        })
    }
}

/// Resolves names to ids with one fresh listing, deletes by id, then drops the cached listing.
pub async fn delete_orphans(
    cache: &mut LocationCache,
    container: &str,
    orphans: &BTreeSet<String>,
) -> Result<usize, TargetError> {
    let ids: HashMap<String, Vec<String>> =
        cache
            .entries(container, false)
            .await?
            .into_iter()
            .filter(|entry| entry.kind == EntryKind::Object && orphans.contains(&entry.name))
            .fold(HashMap::new(), |mut ids, entry| {
                ids.entry(entry.name).or_default().push(entry.id);
                ids
            });

    let mut deleted = 0;
    for (name, entry_ids) in &ids {
        for id in entry_ids {
            match cache.delete_by_id(id).await {
                Ok(()) => deleted += 1,
                Err(err) => {
                    warn!(event = "orphan_delete_failed", container, name = %name, error = %err)
                }
            }
        }
    }
    cache.invalidate(container);
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;
    use formsync_core::contracts::{
        ChannelError, ChannelMessage, EnsuredContainer, TargetEntry, TargetStore, UploadMode,
    };
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replies with queued messages one poll at a time.
    struct ScriptedChannel {
        sent: Mutex<Vec<String>>,
        replies: Mutex<VecDeque<Vec<ChannelMessage>>>,
        polls: AtomicUsize,
        fail_send: bool,
    }

    impl ScriptedChannel {
        fn new(replies: Vec<Vec<&str>>) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                replies: Mutex::new(
                    replies
                        .into_iter()
                        .map(|batch| {
                            batch
                                .into_iter()
                                .map(|text| ChannelMessage {
                                    handle: MessageHandle(format!("reply-{text}")),
                                    text: text.to_string(),
                                    sender_is_self: false,
                                })
                                .collect()
                        })
                        .collect(),
                ),
                polls: AtomicUsize::new(0),
                fail_send: false,
            }
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().expect("sent lock").clone()
        }
    }

    #[async_trait]
    impl ApprovalChannel for ScriptedChannel {
        async fn send(&self, text: &str) -> Result<MessageHandle, ChannelError> {
            if self.fail_send {
                return Err(ChannelError::Send("offline".to_string()));
            }
            let mut sent = self.sent.lock().expect("sent lock");
            sent.push(text.to_string());
            Ok(MessageHandle(format!("msg-{}", sent.len())))
        }

        async fn poll_since(
            &self,
            _since: &MessageHandle,
        ) -> Result<Vec<ChannelMessage>, ChannelError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .replies
                .lock()
                .expect("replies lock")
                .pop_front()
                .unwrap_or_default())
        }
    }

    fn gate(channel: Option<Arc<ScriptedChannel>>) -> ApprovalGate {
        ApprovalGate::new(
            channel.map(|channel| channel as Arc<dyn ApprovalChannel>),
            ApprovalConfig::default(),
            CancellationToken::new(),
        )
    }

    fn names(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn orphans_are_listed_names_without_a_valid_id() {
        let listing = names(&["A.jpg", "B.jpg", "C.png"]);
        let valid = names(&["A", "C"]);
        assert_eq!(find_orphans(&listing, &valid), names(&["B.jpg"]));
    }

    #[test]
    fn names_without_an_extension_are_never_orphans() {
        let listing = names(&["README", ".hidden", "X.jpg"]);
        assert_eq!(find_orphans(&listing, &BTreeSet::new()), names(&["X.jpg"]));
    }

    #[test]
    fn deleted_metadata_is_not_valid() {
        let mut deleted = AssetMetadata::new("gone");
        deleted.deleted_at = Some("2024-01-01T00:00:00Z".to_string());
        let metadata = BTreeMap::from([
            ("kept".to_string(), AssetMetadata::new("kept")),
            ("gone".to_string(), deleted),
        ]);
        assert_eq!(valid_asset_ids(&metadata), names(&["kept"]));
    }

    #[test]
    fn reply_vocabulary_is_case_insensitive() {
        assert_eq!(parse_reply(" YES "), Some(ApprovalDecision::Approved));
        assert_eq!(parse_reply("s"), Some(ApprovalDecision::Skipped));
        assert_eq!(parse_reply("End"), Some(ApprovalDecision::Ended));
        assert_eq!(parse_reply("maybe later"), None);
    }

    #[test]
    fn policy_precedence_picks_entry_state() {
        let gate = gate(None);
        let mut policy = DeletionPolicy {
            skip_all: true,
            auto_delete_all: true,
            pre_approved: names(&["Parcels"]),
        };
        assert_eq!(gate.entry_state(&policy, "Parcels"), GateState::SkipPolicy);
        policy.skip_all = false;
        assert_eq!(gate.entry_state(&policy, "Parcels"), GateState::AutoDeletePolicy);
        policy.auto_delete_all = false;
        assert_eq!(gate.entry_state(&policy, "Parcels"), GateState::PreApproved);
        assert_eq!(gate.entry_state(&policy, "Roads"), GateState::NoChannel);
    }

    #[tokio::test]
    async fn missing_channel_fails_open() {
        let resolution = gate(None)
            .decide(&DeletionPolicy::default(), "Parcels", 4)
            .await;
        assert_eq!(resolution.state, GateState::NoChannel);
        assert_eq!(resolution.decision, ApprovalDecision::Approved);
        assert_eq!(resolution.replay_reason, None);
    }

    #[tokio::test]
    async fn skip_policy_records_replay() {
        let policy = DeletionPolicy {
            skip_all: true,
            ..DeletionPolicy::default()
        };
        let resolution = gate(None).decide(&policy, "Parcels", 4).await;
        assert_eq!(resolution.decision, ApprovalDecision::Skipped);
        assert_eq!(resolution.replay_reason, Some(ReplayReason::SkipPolicy));
    }

    #[tokio::test(start_paused = true)]
    async fn yes_reply_approves_after_ignoring_noise() {
        let channel = Arc::new(ScriptedChannel::new(vec![vec![], vec!["what?"], vec!["yes"]]));
        let resolution = gate(Some(channel.clone()))
            .decide(&DeletionPolicy::default(), "Parcels", 4)
            .await;

        assert_eq!(resolution.state, GateState::AwaitingResponse);
        assert_eq!(resolution.decision, ApprovalDecision::Approved);
        assert_eq!(channel.polls.load(Ordering::SeqCst), 3);
        let sent = channel.sent();
        assert!(sent[0].contains("Parcels"));
        assert!(sent[0].contains("Files to delete: 4"));
    }

    #[tokio::test(start_paused = true)]
    async fn skip_reply_records_user_requested() {
        let channel = Arc::new(ScriptedChannel::new(vec![vec!["skip"]]));
        let resolution = gate(Some(channel))
            .decide(&DeletionPolicy::default(), "Parcels", 4)
            .await;
        assert_eq!(resolution.decision, ApprovalDecision::Skipped);
        assert_eq!(resolution.replay_reason, Some(ReplayReason::UserRequested));
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out_with_no_response() {
        let channel = Arc::new(ScriptedChannel::new(Vec::new()));
        let started = Instant::now();
        let resolution = gate(Some(channel.clone()))
            .decide(&DeletionPolicy::default(), "Parcels", 4)
            .await;

        assert_eq!(resolution.decision, ApprovalDecision::TimedOut);
        assert_eq!(resolution.replay_reason, Some(ReplayReason::NoResponse));
        assert!(started.elapsed() >= Duration::from_secs(300));
        assert_eq!(channel.polls.load(Ordering::SeqCst), 61);
    }

    #[tokio::test]
    async fn failed_request_falls_back_to_approval() {
        let mut channel = ScriptedChannel::new(Vec::new());
        channel.fail_send = true;
        let resolution = gate(Some(Arc::new(channel)))
            .decide(&DeletionPolicy::default(), "Parcels", 4)
            .await;
        assert_eq!(resolution.state, GateState::NoChannel);
        assert_eq!(resolution.decision, ApprovalDecision::Approved);
    }

    #[derive(Default)]
    struct ListingStore {
        entries: Mutex<Vec<TargetEntry>>,
        list_calls: AtomicUsize,
    }

    #[async_trait]
    impl TargetStore for ListingStore {
        fn root_id(&self) -> String {
            "root".to_string()
        }

        async fn ensure_container(
            &self,
            name: &str,
            _parent: &str,
        ) -> Result<EnsuredContainer, TargetError> {
            Ok(EnsuredContainer {
                id: name.to_string(),
                created: false,
            })
        }

        async fn list_children(&self, _container: &str) -> Result<Vec<TargetEntry>, TargetError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.entries.lock().expect("entries lock").clone())
        }

        async fn create_object(
            &self,
            _parent: &str,
            name: &str,
            _bytes: Vec<u8>,
            _content_type: &str,
            _mode: UploadMode,
        ) -> Result<String, TargetError> {
            Ok(name.to_string())
        }

        async fn delete_object(&self, id: &str) -> Result<(), TargetError> {
            self.entries
                .lock()
                .expect("entries lock")
                .retain(|entry| entry.id != id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn approved_reconcile_deletes_with_one_listing() {
        let store = Arc::new(ListingStore::default());
        for (id, name) in [("1", "A.jpg"), ("2", "B.jpg"), ("3", "C.png")] {
            store.entries.lock().expect("entries lock").push(TargetEntry {
                id: id.to_string(),
                name: name.to_string(),
                kind: EntryKind::Object,
            });
        }
        let mut cache = LocationCache::new(store.clone(), RetryPolicy::default());
        let reconciler = OrphanReconciler::new(
            gate(None),
            DeletionPolicy {
                auto_delete_all: true,
                ..DeletionPolicy::default()
            },
        );

        let outcome = reconciler
            .reconcile(&mut cache, "assets", &names(&["A.jpg", "B.jpg"]), "Parcels")
            .await
            .expect("reconcile");

        assert_eq!(outcome.deleted, 2);
        assert_eq!(outcome.decision, ApprovalDecision::AutoApproved);
        assert_eq!(outcome.replay, None);
        assert_eq!(store.list_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            cache.list_children("assets", true).await.expect("list"),
            names(&["C.png"])
        );
    }

    #[tokio::test]
    async fn skipped_reconcile_keeps_files_and_returns_replay() {
        let store = Arc::new(ListingStore::default());
        let mut cache = LocationCache::new(store.clone(), RetryPolicy::default());
        let reconciler = OrphanReconciler::new(
            gate(None),
            DeletionPolicy {
                skip_all: true,
                ..DeletionPolicy::default()
            },
        );

        let outcome = reconciler
            .reconcile(&mut cache, "assets", &names(&["A.jpg"]), "Parcels")
            .await
            .expect("reconcile");

        assert_eq!(outcome.deleted, 0);
        let replay = outcome.replay.expect("replay entry");
        assert_eq!(replay.entity_name, "Parcels");
        assert_eq!(replay.orphan_count, 1);
        assert_eq!(store.list_calls.load(Ordering::SeqCst), 0);
    }
}
