use crate::config::{EngineConfig, RunOptions};
use crate::export::{
    asset_csvs, data_csv, data_file_name, layer_document, layer_file_name, layers_manifest,
    record_document, record_file_name, ASSETS_CONTAINER, LAYERS_CONTAINER, LAYERS_MANIFEST,
    NO_RECORDS_MARKER, NO_RECORDS_TEXT, RECORDS_CONTAINER,
};
use crate::ledger::TransferLedger;
use crate::location::LocationCache;
use crate::orphans::{find_orphans, valid_asset_ids, ApprovalGate, DeletionPolicy, OrphanReconciler};
use crate::pool::{JobResult, WorkerPool};
use crate::retry::{classify_source, classify_target, retry_with};
use crate::session::{SessionRefresher, WorkerSession};
use crate::summary::{
    render_entity_summary, render_failure_summary, EntitySummary, ENTITY_SUMMARY, FAILURE_SUMMARY,
};
use crate::transfer::{plan_backlog, AssetTransferPipeline};
use crate::SyncError;
use chrono::Utc;
use formsync_core::contracts::{
    ApprovalChannel, CredentialProvider, SourceSystem, TargetSessionFactory, UploadMode,
};
use formsync_core::field_map::{build_field_mapping, flatten_record, unique_asset_refs, FlatRecord};
use formsync_core::{
    entity_list_fingerprint, sort_entities, Entity, ReplayEntry, RunCounters, RunStatus,
};
use formsync_storage::{EntityFailure, RunCheckpoint, StateStore};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const ACTIVE_CONTAINER: &str = "active_entities";
pub const INACTIVE_CONTAINER: &str = "inactive_entities";

/// External systems the orchestrator talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn SourceSystem>,
    pub sessions: Arc<dyn TargetSessionFactory>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub approvals: Option<Arc<dyn ApprovalChannel>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub status: RunStatus,
    pub counters: RunCounters,
    /// Index of the next entity a resumed run would start at.
    pub cursor: usize,
    pub total_entities: usize,
    pub resumed_from: Option<usize>,
    /// Entities whose turn completed in this segment, in order.
    pub processed: Vec<String>,
    pub failed_entities: Vec<String>,
    pub replay: Vec<ReplayEntry>,
}

struct EntityOutcome {
    counters: RunCounters,
    ended: bool,
    failure: Option<EntityFailure>,
    replay: Option<ReplayEntry>,
}

/// Per-run state owned by the orchestrator's task and mutated only between batches.
struct RunContext {
    cache: LocationCache,
    ledger: TransferLedger,
    pipeline: AssetTransferPipeline,
    asset_pool: WorkerPool,
    export_pool: WorkerPool,
    reconciler: OrphanReconciler,
    refresher: Arc<SessionRefresher>,
    root: String,
    active_root: String,
    inactive_root: String,
}

pub struct Orchestrator {
    config: EngineConfig,
    options: RunOptions,
    collaborators: Collaborators,
    store: StateStore,
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), SyncError> {
    if cancel.is_cancelled() {
        Err(SyncError::Cancelled)
    } else {
        Ok(())
    }
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        options: RunOptions,
        collaborators: Collaborators,
        store: StateStore,
    ) -> Self {
        Self {
            config,
            options,
            collaborators,
            store,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn into_store(self) -> StateStore {
        self.store
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<RunReport, SyncError> {
        let started = Instant::now();
        let resume = self
            .store
            .load_checkpoint()?
            .filter(|checkpoint| checkpoint.needs_continuation);
        let mut counters = RunCounters::default();
        let start_cursor = match &resume {
            Some(checkpoint) => {
                counters = checkpoint.counters.clone();
                info!(
                    event = "run_resuming",
                    cursor = checkpoint.cursor,
                    total = checkpoint.total_entities
                );
                checkpoint.cursor
            }
            None => {
                self.store.clear_checkpoint()?;
                self.store.clear_entity_failures()?;
                info!(event = "run_starting", root = %self.options.root_path);
                0
            }
        };

        let mut ctx = self.prepare(&cancel).await?;
        let source = self.collaborators.source.clone();
        let since = self.options.since;
        let mut entities = retry_with(&self.config.retry, "list_entities", classify_source, || {
            source.list_entities(since)
        })
        .await?;
        sort_entities(&mut entities);
        if let Some(limit) = self.options.test_limit {
            entities.truncate(limit);
        }
        let total = entities.len();
        let fingerprint = entity_list_fingerprint(&entities);
        if let Some(checkpoint) = &resume {
            if checkpoint.entity_fingerprint != fingerprint {
                warn!(
                    event = "entity_list_changed",
                    saved_total = checkpoint.total_entities,
                    total,
                    cursor = checkpoint.cursor
                );
            }
        }

        match &resume {
            Some(_) => {
                ctx.reconciler
                    .gate()
                    .notify(&format!("Sync resuming from entity {start_cursor}/{total}"))
                    .await
            }
            None => {
                ctx.reconciler.gate().notify("Sync started").await;
                counters.layers_uploaded += self.export_layers(&mut ctx).await;
            }
        }

        let mut status = RunStatus::Complete;
        let mut cursor = start_cursor.min(total);
        let mut processed = Vec::new();
        let mut failed_entities = Vec::new();

        for (index, entity) in entities.iter().enumerate().skip(start_cursor) {
            cursor = index;
            if cancel.is_cancelled() {
                status = RunStatus::Interrupted;
                break;
            }
            if started.elapsed() >= self.config.run_deadline {
                warn!(event = "run_deadline_reached", cursor = index, total);
                ctx.reconciler
                    .gate()
                    .notify(&format!(
                        "Sync paused at entity {index}/{total} due to the run deadline. {} entities remaining. Re-run to continue.",
                        total - index
                    ))
                    .await;
                status = RunStatus::Paused;
                break;
            }
            ctx.refresher.refresh_if_due().await;

            let parent = if entity.active {
                &ctx.active_root
            } else {
                &ctx.inactive_root
            };
            if self.options.quick_check && ctx.cache.has_container(parent, &entity.folder_name()) {
                debug!(event = "entity_quick_skipped", entity = %entity.name);
                counters.entities_processed += 1;
                processed.push(entity.name.clone());
                cursor = index + 1;
                self.save_checkpoint(cursor, total, &fingerprint, &counters);
                continue;
            }

            info!(
                event = "entity_start",
                position = index + 1,
                total,
                entity = %entity.name
            );
            match self.sync_entity_with_retries(&mut ctx, entity, &cancel).await {
                Ok(outcome) => {
                    counters.merge(&outcome.counters);
                    processed.push(entity.name.clone());
                    self.record_entity_reports(&mut ctx, entity, outcome.failure, outcome.replay)
                        .await;
                    if outcome.ended {
                        status = RunStatus::EndedEarly;
                        cursor = index + 1;
                        break;
                    }
                }
                Err(SyncError::Cancelled) => {
                    info!(event = "entity_cancelled", entity = %entity.name);
                    status = RunStatus::Interrupted;
                    break;
                }
                Err(err) => {
                    error!(event = "entity_failed", entity = %entity.name, error = %err);
                    counters.entities_failed += 1;
                    failed_entities.push(entity.name.clone());
                    self.record_unsynced_entity(&mut ctx, entity, &err).await;
                }
            }

            cursor = index + 1;
            self.flush_ledger(&ctx.ledger);
            self.save_checkpoint(cursor, total, &fingerprint, &counters);
        }

        self.flush_ledger(&ctx.ledger);
        if status == RunStatus::Complete {
            cursor = total;
            if let Err(err) = self.store.clear_checkpoint() {
                warn!(event = "checkpoint_clear_failed", error = %err);
            }
        } else {
            self.save_checkpoint(cursor, total, &fingerprint, &counters);
        }
        self.publish_failure_summary(&mut ctx).await;

        let replay = match self.store.replay_entries() {
            Ok(entries) => entries,
            Err(err) => {
                warn!(event = "replay_read_failed", error = %err);
                Vec::new()
            }
        };
        ctx.reconciler
            .gate()
            .notify(&completion_message(status, &counters, &replay))
            .await;
        info!(
            event = "run_finished",
            status = status.as_str(),
            cursor,
            total,
            listings = ctx.cache.listing_calls(),
            stats = %counters.stats_line()
        );
        if counters.assets_failed > 0 || counters.entities_failed > 0 {
            warn!(
                event = "run_failures",
                assets_failed = counters.assets_failed,
                entities_failed = counters.entities_failed
            );
        }

        Ok(RunReport {
            status,
            counters,
            cursor,
            total_entities: total,
            resumed_from: resume.map(|checkpoint| checkpoint.cursor),
            processed,
            failed_entities,
            replay,
        })
    }

    async fn prepare(&self, cancel: &CancellationToken) -> Result<RunContext, SyncError> {
        let ledger = TransferLedger::with_transferred(self.store.transferred_asset_ids()?);
        let refresher = Arc::new(SessionRefresher::new(
            self.collaborators.credentials.clone(),
            self.config.credential_refresh_interval,
        ));

        let main = self.collaborators.sessions.open_session()?;
        let mut cache = LocationCache::new(main, self.config.retry.clone());
        let root = cache.resolve_path(&self.options.root_path).await?;
        let active_root = cache.resolve(ACTIVE_CONTAINER, &root).await?;
        let inactive_root = cache.resolve(INACTIVE_CONTAINER, &root).await?;
        cache.preload(&active_root).await?;
        cache.preload(&inactive_root).await?;

        let pipeline = AssetTransferPipeline::new(
            self.collaborators.source.clone(),
            ledger.clone(),
            self.config.retry.clone(),
            self.config.resumable_threshold,
        );
        let asset_pool = WorkerPool::new(
            "assets",
            self.config.asset_pool.clone(),
            self.collaborators.sessions.clone(),
            cancel.clone(),
        )
        .with_refresher(refresher.clone());
        let export_pool = WorkerPool::new(
            "records",
            self.config.export_pool.clone(),
            self.collaborators.sessions.clone(),
            cancel.clone(),
        )
        .with_refresher(refresher.clone());
        let gate = ApprovalGate::new(
            self.collaborators.approvals.clone(),
            self.config.approval.clone(),
            cancel.clone(),
        );
        let reconciler = OrphanReconciler::new(gate, DeletionPolicy::from_options(&self.options));

        Ok(RunContext {
            cache,
            ledger,
            pipeline,
            asset_pool,
            export_pool,
            reconciler,
            refresher,
            root,
            active_root,
            inactive_root,
        })
    }

    /// Network-class failures get a fresh attempt at the whole entity after a growing pause.
    async fn sync_entity_with_retries(
        &self,
        ctx: &mut RunContext,
        entity: &Entity,
        cancel: &CancellationToken,
    ) -> Result<EntityOutcome, SyncError> {
        let mut attempt = 1u32;
        loop {
            match self.sync_entity(ctx, entity, cancel).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_transient() && attempt < self.config.entity_attempts => {
                    let delay = self.config.entity_retry_delay.saturating_mul(attempt);
                    warn!(
                        event = "entity_retry",
                        entity = %entity.name,
                        attempt,
                        max_attempts = self.config.entity_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    ctx.refresher.force_refresh().await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn sync_entity(
        &self,
        ctx: &mut RunContext,
        entity: &Entity,
        cancel: &CancellationToken,
    ) -> Result<EntityOutcome, SyncError> {
        let folder_name = entity.folder_name();
        let (parent, parent_name) = if entity.active {
            (ctx.active_root.clone(), ACTIVE_CONTAINER)
        } else {
            (ctx.inactive_root.clone(), INACTIVE_CONTAINER)
        };
        let folder = ctx.cache.resolve(&folder_name, &parent).await?;
        // Source reads here are covered by the whole-entity retry.
        let source = self.collaborators.source.clone();

        let records = source.list_records(&entity.id).await?;
        check_cancelled(cancel)?;
        let mut counters = RunCounters {
            entities_processed: 1,
            records_total: records.len() as u64,
            ..RunCounters::default()
        };

        if records.is_empty() {
            let cleared = ctx.cache.clear_container(&folder).await?;
            if cleared > 0 {
                info!(event = "empty_entity_cleared", entity = %entity.name, cleared);
            }
            ctx.cache
                .put_object(
                    &folder,
                    NO_RECORDS_MARKER,
                    NO_RECORDS_TEXT.as_bytes().to_vec(),
                    "text/plain",
                )
                .await?;
            return Ok(EntityOutcome {
                counters,
                ended: false,
                failure: None,
                replay: None,
            });
        }

        let schema = source.get_schema(&entity.id).await?;
        let mapping = build_field_mapping(&schema);
        let flat: Vec<FlatRecord> = records
            .iter()
            .map(|record| flatten_record(record, &mapping))
            .collect();
        let data_name = data_file_name(&folder_name);
        ctx.cache
            .replace_object(&folder, &data_name, data_csv(&flat, &mapping)?, "text/csv")
            .await?;
        let mut files = vec![data_name];

        let records_container = ctx.cache.resolve(RECORDS_CONTAINER, &folder).await?;
        let existing = ctx.cache.list_children(&records_container, true).await?;
        let mut documents = Vec::new();
        for record in &records {
            let name = record_file_name(&record.id);
            if !existing.contains(&name) {
                documents.push((name, record_document(record)?));
            }
        }
        counters.record_docs_uploaded = self
            .upload_documents(ctx, &records_container, documents)
            .await;
        files.push(format!("{RECORDS_CONTAINER}/ ({} JSON files)", records.len()));
        check_cancelled(cancel)?;

        let refs = unique_asset_refs(&records);
        let metadata = source.asset_metadata_batch(&entity.id).await?;
        let assets_container = ctx.cache.resolve(ASSETS_CONTAINER, &folder).await?;
        let listing = ctx.cache.list_children(&assets_container, true).await?;
        let backlog = plan_backlog(&refs, &listing, &ctx.ledger);
        debug!(
            event = "asset_backlog",
            entity = %entity.name,
            referenced = refs.len(),
            pending = backlog.pending.len(),
            present = backlog.already_present
        );

        let ledger = ctx.ledger.clone();
        let report = ctx
            .pipeline
            .run_batches(
                &ctx.asset_pool,
                &mut ctx.cache,
                &assets_container,
                backlog.pending,
                &metadata,
                self.config.extra_batch_rounds,
                |_| {
                    if ledger.unflushed_len() >= self.config.ledger_flush_every {
                        self.flush_ledger(&ledger);
                    }
                },
            )
            .await?;
        if report.cancelled > 0 {
            return Err(SyncError::Cancelled);
        }
        check_cancelled(cancel)?;
        counters.assets_uploaded = report.stored.len() as u64;
        counters.assets_skipped =
            (backlog.already_present + report.already_present + report.rejected.len()) as u64;
        counters.assets_failed = report.failed.len() as u64;

        let listing = ctx.cache.list_children(&assets_container, false).await?;
        let mut valid = valid_asset_ids(&metadata);
        valid.extend(
            report
                .stored
                .iter()
                .map(|stored| stored.reference.asset_id.clone()),
        );
        let orphans = find_orphans(&listing, &valid);
        let reconciled = ctx
            .reconciler
            .reconcile(&mut ctx.cache, &assets_container, &orphans, &entity.name)
            .await?;
        counters.assets_deleted = reconciled.deleted as u64;

        for csv in asset_csvs(&report.stored)? {
            let name = csv.group.file_name(&folder_name);
            ctx.cache
                .replace_object(&folder, &name, csv.bytes, "text/csv")
                .await?;
            files.push(format!("{name} ({} assets)", csv.rows));
        }

        let assets_in_target = ctx.cache.list_children(&assets_container, false).await?.len();
        files.push(format!("{ASSETS_CONTAINER}/ ({assets_in_target} files)"));
        let summary = render_entity_summary(
            &EntitySummary {
                entity,
                folder: folder_name.clone(),
                records: records.len(),
                assets_in_source: refs.len(),
                assets_in_target,
                files,
                failed: &report.failed,
            },
            Utc::now(),
        );
        ctx.cache
            .replace_object(&folder, ENTITY_SUMMARY, summary.into_bytes(), "text/plain")
            .await?;

        let failure = (!report.failed.is_empty()).then(|| EntityFailure {
            entity_id: entity.id.clone(),
            entity_name: entity.name.clone(),
            active: entity.active,
            container_path: format!("{parent_name}/{folder_name}"),
            assets_in_source: refs.len() as u64,
            assets_in_target: assets_in_target as u64,
            assets_failed: report.failed.len() as u64,
            error: None,
            updated_at: Utc::now(),
        });
        info!(
            event = "entity_synced",
            entity = %entity.name,
            records = records.len(),
            uploaded = counters.assets_uploaded,
            skipped = counters.assets_skipped,
            failed = counters.assets_failed,
            deleted = counters.assets_deleted,
            rounds = report.rounds
        );

        Ok(EntityOutcome {
            counters,
            ended: reconciled.decision.ends_run(),
            failure,
            replay: reconciled.replay,
        })
    }

    async fn upload_documents(
        &self,
        ctx: &mut RunContext,
        container: &str,
        documents: Vec<(String, Vec<u8>)>,
    ) -> u64 {
        if documents.is_empty() {
            return 0;
        }
        let retry = self.config.retry.clone();
        let target = container.to_string();
        let completions = ctx
            .export_pool
            .run(
                documents,
                move |session: Arc<WorkerSession>, (name, bytes): (String, Vec<u8>)| {
                    let retry = retry.clone();
                    let target = target.clone();
                    async move {
                        let store = session.store();
                        retry_with(&retry, "upload_record", classify_target, || {
                            store.create_object(
                                &target,
                                &name,
                                bytes.clone(),
                                "application/json",
                                UploadMode::Simple,
                            )
                        })
                        .await
                    }
                },
                |_| {},
            )
            .await;
        ctx.cache.invalidate(container);

        let mut uploaded = 0u64;
        for completion in completions {
            match completion.result {
                JobResult::Done(Ok(_)) => uploaded += 1,
                JobResult::Done(Err(err)) => {
                    debug!(event = "record_upload_failed", name = %completion.job.0, error = %err)
                }
                other => {
                    let reason = other.failure_reason().unwrap_or_default();
                    debug!(event = "record_upload_failed", name = %completion.job.0, error = %reason)
                }
            }
        }
        uploaded
    }

    /// Reference layers are exported on fresh runs only; failures are logged and never fatal.
    async fn export_layers(&self, ctx: &mut RunContext) -> u64 {
        match self.try_export_layers(ctx).await {
            Ok(uploaded) => uploaded,
            Err(err) => {
                warn!(event = "layers_export_failed", error = %err);
                0
            }
        }
    }

    async fn try_export_layers(&self, ctx: &mut RunContext) -> Result<u64, SyncError> {
        let source = self.collaborators.source.clone();
        let layers = retry_with(&self.config.retry, "list_layers", classify_source, || {
            source.list_layers()
        })
        .await?;
        if layers.is_empty() {
            return Ok(0);
        }

        let container = ctx.cache.resolve(LAYERS_CONTAINER, &ctx.root).await?;
        let existing = ctx.cache.list_children(&container, true).await?;
        let mut uploaded = 0u64;
        for layer in &layers {
            let name = layer_file_name(layer);
            if existing.contains(&name) {
                continue;
            }
            match ctx
                .cache
                .put_object(&container, &name, layer_document(layer)?, "application/json")
                .await
            {
                Ok(_) => uploaded += 1,
                Err(err) => debug!(event = "layer_upload_failed", name = %name, error = %err),
            }
        }
        ctx.cache
            .replace_object(
                &container,
                LAYERS_MANIFEST,
                layers_manifest(&layers, Utc::now())?,
                "application/json",
            )
            .await?;
        info!(event = "layers_exported", total = layers.len(), uploaded);
        Ok(uploaded)
    }

    async fn record_entity_reports(
        &self,
        ctx: &mut RunContext,
        entity: &Entity,
        failure: Option<EntityFailure>,
        replay: Option<ReplayEntry>,
    ) {
        let failures_changed = match &failure {
            Some(failure) => self.store.upsert_entity_failure(failure).map(|()| true),
            None => self.store.remove_entity_failure(&entity.id),
        };
        match failures_changed {
            Ok(true) => self.publish_failure_summary(ctx).await,
            Ok(false) => {}
            Err(err) => warn!(event = "failure_report_write_failed", error = %err),
        }

        let replay_written = match &replay {
            Some(entry) => self.store.upsert_replay_entry(entry),
            None => self.store.remove_replay_entry(&entity.name).map(|_| ()),
        };
        if let Err(err) = replay_written {
            warn!(event = "replay_write_failed", entity = %entity.name, error = %err);
        }
    }

    async fn record_unsynced_entity(
        &self,
        ctx: &mut RunContext,
        entity: &Entity,
        cause: &SyncError,
    ) {
        let parent_name = if entity.active {
            ACTIVE_CONTAINER
        } else {
            INACTIVE_CONTAINER
        };
        let failure = EntityFailure {
            entity_id: entity.id.clone(),
            entity_name: entity.name.clone(),
            active: entity.active,
            container_path: format!("{parent_name}/{}", entity.folder_name()),
            assets_in_source: 0,
            assets_in_target: 0,
            assets_failed: 0,
            error: Some(cause.to_string()),
            updated_at: Utc::now(),
        };
        match self.store.upsert_entity_failure(&failure) {
            Ok(()) => self.publish_failure_summary(ctx).await,
            Err(err) => warn!(event = "failure_report_write_failed", error = %err),
        }
    }

    async fn publish_failure_summary(&self, ctx: &mut RunContext) {
        let failures = match self.store.entity_failures() {
            Ok(failures) => failures,
            Err(err) => {
                warn!(event = "failure_report_read_failed", error = %err);
                return;
            }
        };
        let root = ctx.root.clone();
        let published = match render_failure_summary(&failures, Utc::now()) {
            Some(text) => ctx
                .cache
                .replace_object(&root, FAILURE_SUMMARY, text.into_bytes(), "text/plain")
                .await
                .map(|_| ()),
            None => ctx.cache.delete_named(&root, FAILURE_SUMMARY).await.map(|_| ()),
        };
        if let Err(err) = published {
            warn!(event = "failure_summary_publish_failed", error = %err);
        }
    }

    fn flush_ledger(&self, ledger: &TransferLedger) {
        let pending = ledger.take_unflushed();
        if pending.is_empty() {
            return;
        }
        match self.store.record_transferred(&pending, Utc::now()) {
            Ok(inserted) => debug!(event = "ledger_flushed", inserted),
            Err(err) => {
                warn!(event = "ledger_flush_failed", pending = pending.len(), error = %err);
                ledger.requeue(pending);
            }
        }
    }

    fn save_checkpoint(
        &self,
        cursor: usize,
        total: usize,
        fingerprint: &str,
        counters: &RunCounters,
    ) {
        let checkpoint = RunCheckpoint {
            cursor,
            total_entities: total,
            entity_fingerprint: fingerprint.to_string(),
            counters: counters.clone(),
            needs_continuation: true,
            updated_at: Utc::now(),
        };
        if let Err(err) = self.store.save_checkpoint(&checkpoint) {
            warn!(event = "checkpoint_save_failed", cursor, error = %err);
        }
    }
}

pub fn completion_message(
    status: RunStatus,
    counters: &RunCounters,
    replay: &[ReplayEntry],
) -> String {
    let title = match status {
        RunStatus::Paused => "Sync paused (deadline reached, re-run to continue)",
        RunStatus::Interrupted => "Sync interrupted (re-run to continue)",
        RunStatus::EndedEarly => "Sync ended early",
        RunStatus::Complete if !replay.is_empty() => "Sync complete (with skipped deletions)",
        RunStatus::Complete => "Sync complete",
    };
    let mut message = format!(
        "{title}\n- Entities processed: {}\n- Entities failed: {}\n- Records: {}\n- Assets uploaded: {}\n- Assets deleted: {}",
        counters.entities_processed,
        counters.entities_failed,
        counters.records_total,
        counters.assets_uploaded,
        counters.assets_deleted
    );
    if !replay.is_empty() {
        message.push_str("\n\nEntities with skipped deletions:");
        for (index, entry) in replay.iter().enumerate() {
            message.push_str(&format!(
                "\n{}. {} ({} files, {})",
                index + 1,
                entry.entity_name,
                entry.orphan_count,
                entry.reason
            ));
        }
        message.push_str("\n\nRe-run with --pre-approved 1,2,3 to approve them.");
    }
    message
}
