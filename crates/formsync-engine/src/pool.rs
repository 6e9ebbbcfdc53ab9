use crate::config::PoolConfig;
use crate::session::{SessionRefresher, WorkerSession};
use formsync_core::contracts::TargetSessionFactory;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult<O> {
    Done(O),
    /// The job ran past the per-item timeout and was dropped.
    TimedOut,
    /// The batch saw no completion within the stall timeout while this job was outstanding.
    Stalled,
    /// Never started because the run was cancelled.
    Cancelled,
    Crashed(String),
}

impl<O> JobResult<O> {
    pub fn output(&self) -> Option<&O> {
        match self {
            JobResult::Done(output) => Some(output),
            _ => None,
        }
    }

    pub fn failure_reason(&self) -> Option<String> {
        match self {
            JobResult::Done(_) => None,
            JobResult::TimedOut => Some("timed out".to_string()),
            JobResult::Stalled => Some("stalled (worker hung)".to_string()),
            JobResult::Cancelled => Some("cancelled".to_string()),
            JobResult::Crashed(reason) => Some(format!("worker failed: {reason}")),
        }
    }
}

#[derive(Debug)]
pub struct Completion<J, O> {
    pub job: J,
    pub result: JobResult<O>,
}

/// Bounded pool of workers, each holding its own target session. Jobs are pulled from a shared
/// queue; results flow back to the dispatcher, which is the only place that observes progress.
pub struct WorkerPool {
    label: &'static str,
    config: PoolConfig,
    sessions: Arc<dyn TargetSessionFactory>,
    refresher: Option<Arc<SessionRefresher>>,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        label: &'static str,
        config: PoolConfig,
        sessions: Arc<dyn TargetSessionFactory>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            label,
            config,
            sessions,
            refresher: None,
            cancel,
        }
    }

    pub fn with_refresher(mut self, refresher: Arc<SessionRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Runs every job and returns one completion per job, in submission order. `on_progress`
    /// is called on the dispatcher with the running completion count.
    pub async fn run<J, O, H, Fut, P>(
        &self,
        jobs: Vec<J>,
        handler: H,
        mut on_progress: P,
    ) -> Vec<Completion<J, O>>
    where
        J: Clone + Send + 'static,
        O: Send + 'static,
        H: Fn(Arc<WorkerSession>, J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + Send + 'static,
        P: FnMut(usize),
    {
        let total = jobs.len();
        if total == 0 {
            return Vec::new();
        }

        let width = self.config.width.max(1).min(total);
        let mut sessions = Vec::with_capacity(width);
        let mut last_open_error = None;
        for _ in 0..width {
            match WorkerSession::open(self.sessions.clone()) {
                Ok(session) => sessions.push(Arc::new(session)),
                Err(err) => {
                    warn!(event = "worker_session_failed", pool = self.label, error = %err);
                    last_open_error = Some(err.to_string());
                }
            }
        }
        if sessions.is_empty() {
            let reason = last_open_error.unwrap_or_else(|| "no session".to_string());
            return jobs
                .into_iter()
                .map(|job| Completion {
                    job,
                    result: JobResult::Crashed(reason.clone()),
                })
                .collect();
        }

        let queue: Arc<Mutex<VecDeque<(usize, J)>>> =
            Arc::new(Mutex::new(jobs.iter().cloned().enumerate().collect()));
        let handler = Arc::new(handler);
        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, JobResult<O>)>();
        let mut workers = JoinSet::new();

        for session in sessions {
            let queue = queue.clone();
            let handler = handler.clone();
            let tx = tx.clone();
            let cancel = self.cancel.clone();
            let item_timeout = self.config.item_timeout;
            workers.spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let next = match queue.lock() {
                        Ok(mut guard) => guard.pop_front(),
                        Err(poisoned) => poisoned.into_inner().pop_front(),
                    };
                    let Some((index, job)) = next else {
                        break;
                    };
                    let result =
                        match tokio::time::timeout(item_timeout, handler(session.clone(), job))
                            .await
                        {
                            Ok(output) => JobResult::Done(output),
                            Err(_) => JobResult::TimedOut,
                        };
                    if tx.send((index, result)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        let mut results: Vec<Option<JobResult<O>>> = (0..total).map(|_| None).collect();
        let mut completed = 0usize;
        let mut stalled = false;
        let mut last_log = Instant::now();

        loop {
            match tokio::time::timeout(self.config.stall_timeout, rx.recv()).await {
                Ok(Some((index, result))) => {
                    if let Some(slot) = results.get_mut(index) {
                        *slot = Some(result);
                    }
                    completed += 1;
                    on_progress(completed);

                    if completed % self.config.progress_every.max(1) == 0
                        || last_log.elapsed() >= self.config.progress_interval
                    {
                        info!(event = "batch_progress", pool = self.label, completed, total);
                        last_log = Instant::now();
                    }
                    if completed % self.config.refresh_check_every.max(1) == 0 {
                        if let Some(refresher) = &self.refresher {
                            refresher.refresh_if_due().await;
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    stalled = true;
                    warn!(
                        event = "batch_stalled",
                        pool = self.label,
                        outstanding = total - completed,
                        stall_timeout_ms = self.config.stall_timeout.as_millis() as u64
                    );
                    break;
                }
            }
        }

        workers.shutdown().await;
        while let Ok((index, result)) = rx.try_recv() {
            if let Some(slot) = results.get_mut(index) {
                if slot.is_none() {
                    *slot = Some(result);
                }
            }
        }

        let cancelled = self.cancel.is_cancelled();
        jobs.into_iter()
            .zip(results)
            .map(|(job, result)| {
                let result = result.unwrap_or_else(|| {
                    if stalled {
                        JobResult::Stalled
                    } else if cancelled {
                        JobResult::Cancelled
                    } else {
                        JobResult::Crashed("worker exited".to_string())
                    }
                });
                Completion { job, result }
            })
            .collect()
    }
}
