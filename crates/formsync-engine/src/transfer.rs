use crate::ledger::TransferLedger;
use crate::location::LocationCache;
use crate::pool::{JobResult, WorkerPool};
use crate::retry::{classify_source, retry_with, BatchRounds, RetryPolicy};
use crate::session::WorkerSession;
use formsync_core::contracts::{FailureClass, SourceSystem, TargetError, UploadMode};
use formsync_core::{
    asset_object_candidates, asset_object_name, AssetMetadata, AssetReference, AssetRejection,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome {
    Stored {
        asset_id: String,
        object_name: String,
        metadata: AssetMetadata,
    },
    /// Already recorded in the ledger; nothing was fetched or written.
    AlreadyPresent { asset_id: String },
    /// Terminal at the source. Counted as skipped, never retried.
    Rejected {
        asset_id: String,
        rejection: AssetRejection,
    },
    Failed {
        asset_id: String,
        reason: String,
        class: FailureClass,
    },
}

/// Fetches one asset from the source and writes it to the target under its deterministic name.
#[derive(Clone)]
pub struct AssetTransferPipeline {
    source: Arc<dyn SourceSystem>,
    ledger: TransferLedger,
    retry: RetryPolicy,
    resumable_threshold: usize,
}

impl AssetTransferPipeline {
    pub fn new(
        source: Arc<dyn SourceSystem>,
        ledger: TransferLedger,
        retry: RetryPolicy,
        resumable_threshold: usize,
    ) -> Self {
        Self {
            source,
            ledger,
            retry,
            resumable_threshold,
        }
    }

    pub fn ledger(&self) -> &TransferLedger {
        &self.ledger
    }

    pub async fn transfer(
        &self,
        session: &WorkerSession,
        container: &str,
        asset: &AssetReference,
        metadata: Option<AssetMetadata>,
    ) -> TransferOutcome {
        let asset_id = asset.asset_id.clone();
        if self.ledger.contains(&asset_id) {
            return TransferOutcome::AlreadyPresent { asset_id };
        }

        let metadata = match metadata {
            Some(metadata) => metadata,
            None => match self.lookup_metadata(&asset_id).await {
                Some(metadata) => metadata,
                None => {
                    return TransferOutcome::Failed {
                        asset_id,
                        reason: "metadata unavailable".to_string(),
                        class: FailureClass::Permanent,
                    }
                }
            },
        };
        if let Some(rejection) = metadata.rejection() {
            return TransferOutcome::Rejected {
                asset_id,
                rejection,
            };
        }

        let format = metadata.format();
        let object_name = asset_object_name(&asset_id, format);

        let source = self.source.clone();
        let fetched = retry_with(&self.retry, "fetch_asset", classify_source, || {
            source.fetch_asset_bytes(&asset_id)
        })
        .await;
        let bytes = match fetched {
            Ok(bytes) => bytes,
            Err(err) => {
                return TransferOutcome::Failed {
                    reason: format!("fetch failed: {err}"),
                    class: classify_source(&err),
                    asset_id,
                }
            }
        };

        let mode = UploadMode::for_size(bytes.len(), self.resumable_threshold);
        let uploaded = self
            .upload(session, container, &object_name, bytes, format.content_type(), mode)
            .await;
        if let Err(err) = uploaded {
            return TransferOutcome::Failed {
                reason: format!("upload failed: {err}"),
                class: err.class(),
                asset_id,
            };
        }

        self.ledger.record(&asset_id);
        TransferOutcome::Stored {
            asset_id,
            object_name,
            metadata,
        }
    }

    async fn lookup_metadata(&self, asset_id: &str) -> Option<AssetMetadata> {
        let source = self.source.clone();
        match retry_with(&self.retry, "asset_metadata", classify_source, || {
            source.asset_metadata(asset_id)
        })
        .await
        {
            Ok(found) => found,
            Err(err) => {
                debug!(event = "asset_metadata_lookup_failed", asset_id, error = %err);
                None
            }
        }
    }

    /// Connection-class failures swap the worker onto a fresh session before the next attempt.
    async fn upload(
        &self,
        session: &WorkerSession,
        container: &str,
        object_name: &str,
        bytes: Vec<u8>,
        content_type: &str,
        mode: UploadMode,
    ) -> Result<(), TargetError> {
        let mut attempt = 0u32;
        loop {
            let store = session.store();
            match store
                .create_object(container, object_name, bytes.clone(), content_type, mode)
                .await
            {
                Ok(_) => return Ok(()),
                Err(err) => {
                    let class = err.class();
                    let Some(delay) = self.retry.delay_for(class, attempt) else {
                        return Err(err);
                    };
                    warn!(
                        event = "asset_upload_retry",
                        object_name,
                        attempt = attempt + 1,
                        class = class.as_str(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err
                    );
                    if class == FailureClass::Connection {
                        if let Err(reopen_err) = session.reopen() {
                            warn!(event = "worker_session_reopen_failed", error = %reopen_err);
                        }
                    }
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Backlog {
    pub pending: Vec<AssetReference>,
    pub already_present: usize,
}

/// Drops assets already in the target listing under any candidate name, or already in the ledger.
pub fn plan_backlog(
    refs: &[AssetReference],
    listing: &BTreeSet<String>,
    ledger: &TransferLedger,
) -> Backlog {
    let mut backlog = Backlog::default();
    for asset in refs {
        let listed = asset_object_candidates(&asset.asset_id)
            .iter()
            .any(|name| listing.contains(name));
        if listed || ledger.contains(&asset.asset_id) {
            backlog.already_present += 1;
        } else {
            backlog.pending.push(asset.clone());
        }
    }
    backlog
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredAsset {
    pub reference: AssetReference,
    pub object_name: String,
    pub metadata: AssetMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedAsset {
    pub reference: AssetReference,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub stored: Vec<StoredAsset>,
    pub already_present: usize,
    pub rejected: Vec<(AssetReference, AssetRejection)>,
    pub failed: Vec<FailedAsset>,
    pub cancelled: usize,
    pub rounds: usize,
}

struct Retryable {
    reference: AssetReference,
    reason: String,
}

impl AssetTransferPipeline {
    /// Runs the backlog through the pool, then re-submits retryable failures as whole rounds while
    /// each round fails fewer assets than the one before.
    pub async fn run_batches<P>(
        &self,
        pool: &WorkerPool,
        cache: &mut LocationCache,
        container: &str,
        backlog: Vec<AssetReference>,
        metadata: &BTreeMap<String, AssetMetadata>,
        max_extra_rounds: usize,
        mut on_progress: P,
    ) -> Result<BatchReport, TargetError>
    where
        P: FnMut(usize),
    {
        let mut report = BatchReport::default();
        let mut rounds = BatchRounds::new(max_extra_rounds);
        let mut pending = backlog;

        while !pending.is_empty() {
            let jobs: Vec<(AssetReference, Option<AssetMetadata>)> = pending
                .iter()
                .map(|asset| (asset.clone(), metadata.get(&asset.asset_id).cloned()))
                .collect();
            let pipeline = self.clone();
            let target = container.to_string();
            let completions = pool
                .run(
                    jobs,
                    move |session: Arc<WorkerSession>, (asset, meta): (AssetReference, Option<AssetMetadata>)| {
                        let pipeline = pipeline.clone();
                        let target = target.clone();
                        async move { pipeline.transfer(&session, &target, &asset, meta).await }
                    },
                    &mut on_progress,
                )
                .await;

            let mut retryable = Vec::new();
            for completion in completions {
                let (asset, _) = completion.job;
                match completion.result {
                    JobResult::Done(TransferOutcome::Stored {
                        object_name,
                        metadata,
                        ..
                    }) => report.stored.push(StoredAsset {
                        reference: asset,
                        object_name,
                        metadata,
                    }),
                    JobResult::Done(TransferOutcome::AlreadyPresent { .. }) => {
                        report.already_present += 1
                    }
                    JobResult::Done(TransferOutcome::Rejected { rejection, .. }) => {
                        report.rejected.push((asset, rejection))
                    }
                    JobResult::Done(TransferOutcome::Failed { reason, class, .. }) => {
                        if class.is_retryable() {
                            retryable.push(Retryable {
                                reference: asset,
                                reason,
                            });
                        } else {
                            report.failed.push(FailedAsset {
                                reference: asset,
                                reason,
                            });
                        }
                    }
                    JobResult::Cancelled => report.cancelled += 1,
                    other => retryable.push(Retryable {
                        reference: asset,
                        reason: other.failure_reason().unwrap_or_default(),
                    }),
                }
            }

            let another = rounds.record_round(retryable.len());
            info!(
                event = "asset_round_finished",
                container,
                round = rounds.rounds_run(),
                stored = report.stored.len(),
                failed = retryable.len() + report.failed.len(),
            );
            if !another || report.cancelled > 0 {
                report.failed.extend(retryable.into_iter().map(|item| FailedAsset {
                    reference: item.reference,
                    reason: item.reason,
                }));
                break;
            }

            let listing = cache.list_children(container, false).await?;
            let backlog = plan_backlog(
                &retryable
                    .iter()
                    .map(|item| item.reference.clone())
                    .collect::<Vec<_>>(),
                &listing,
                &self.ledger,
            );
            report.already_present += backlog.already_present;
            pending = backlog.pending;
        }

        report.rounds = rounds.rounds_run();
        if !report.stored.is_empty() {
            cache.invalidate(container);
        }
        Ok(report)
    }
}
