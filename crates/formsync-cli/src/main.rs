mod credentials;
mod export_source;
mod file_channel;
mod local_target;
mod settings;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use credentials::StaticCredentials;
use export_source::ExportDirSource;
use file_channel::FileApprovalChannel;
use formsync_core::contracts::ApprovalChannel;
use formsync_core::resolve_pre_approved;
use formsync_engine::config::DEFAULT_ROOT_PATH;
use formsync_engine::{Collaborators, Orchestrator, RunOptions};
use formsync_storage::{StateLock, StateStore};
use local_target::LocalDirTarget;
use settings::{
    env_true, env_value, first_of, load_file_config, resolve_config_path, resolve_path,
    FileConfig, DEFAULT_LOG_DIR, DEFAULT_STATE_DIR,
};
use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const STATE_DB: &str = "state.sqlite";
const LOCK_FILE: &str = "formsync.lock";
const LOG_FILE: &str = "formsync.log";

#[derive(Parser, Debug)]
#[command(name = "formsync")]
#[command(about = "Reconcile a form-data source into a hierarchical file store", long_about = None)]
struct Cli {
    /// TOML config file (default: formsync.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a sync, resuming from the saved checkpoint when one exists
    Run(RunArgs),
    /// Show the saved checkpoint and transfer ledger
    Status,
    /// List entities whose orphan deletion is waiting for re-approval
    Replay,
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Source snapshot directory
    #[arg(long)]
    source_dir: Option<PathBuf>,
    /// Directory the target tree is written under
    #[arg(long)]
    target_dir: Option<PathBuf>,
    /// `/`-separated container path of the sync root inside the target
    #[arg(long)]
    root_path: Option<String>,
    /// Only process the first N entities
    #[arg(long = "test", value_name = "N")]
    test_limit: Option<usize>,
    /// Delete every orphan without asking
    #[arg(long, default_value_t = false)]
    auto_delete: bool,
    /// Never delete orphans; record them for replay instead
    #[arg(long, default_value_t = false)]
    skip_deletions: bool,
    /// Skip entities whose target folder already exists
    #[arg(long, default_value_t = false)]
    quick_check: bool,
    /// Comma-separated entity names or replay-list numbers, e.g. `1,3,Parcels`
    #[arg(long)]
    pre_approved: Option<String>,
    /// Only entities changed at or after this RFC 3339 timestamp
    #[arg(long)]
    since: Option<DateTime<Utc>>,
    #[arg(long)]
    approval_outbox: Option<PathBuf>,
    #[arg(long)]
    approval_inbox: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let file = load_file_config(&resolve_config_path(cli.config.clone()))?;
    let state_dir = resolve_path(
        cli.state_dir.clone(),
        "FORMSYNC_STATE_DIR",
        file.state_dir.clone(),
        DEFAULT_STATE_DIR,
    );
    let log_dir = resolve_path(
        cli.log_dir.clone(),
        "FORMSYNC_LOG_DIR",
        file.log_dir.clone(),
        DEFAULT_LOG_DIR,
    );
    let debug = cli.debug || env_true("FORMSYNC_DEBUG");
    let _log_guard = init_logging(debug, file.log_level.as_deref(), &log_dir);

    match cli.command {
        Commands::Run(args) => run_sync(args, &file, &state_dir).await,
        Commands::Status => print_status(&state_dir),
        Commands::Replay => print_replay(&state_dir),
    }
}

async fn run_sync(args: RunArgs, file: &FileConfig, state_dir: &Path) -> Result<()> {
    let _lock = StateLock::acquire(&state_dir.join(LOCK_FILE), Utc::now())
        .context("failed to lock the state directory")?;
    let store = StateStore::open(state_dir.join(STATE_DB)).context("failed to open state store")?;

    let Some(source_dir) = first_of(
        args.source_dir.clone(),
        env_value("FORMSYNC_SOURCE_DIR").map(PathBuf::from),
        file.source_dir.clone(),
    ) else {
        bail!("no source directory; pass --source-dir or set FORMSYNC_SOURCE_DIR");
    };
    let Some(target_dir) = first_of(
        args.target_dir.clone(),
        env_value("FORMSYNC_TARGET_DIR").map(PathBuf::from),
        file.target_dir.clone(),
    ) else {
        bail!("no target directory; pass --target-dir or set FORMSYNC_TARGET_DIR");
    };
    std::fs::create_dir_all(&target_dir)
        .with_context(|| format!("failed to create {}", target_dir.display()))?;

    let options = resolve_run_options(&args, file, &store)?;
    let approvals = resolve_approval_channel(&args, file);
    if approvals.is_none() && !options.skip_deletions && !options.auto_delete {
        warn!(event = "approval_channel_unconfigured");
    }

    let target = LocalDirTarget::new(target_dir);
    let collaborators = Collaborators {
        source: Arc::new(ExportDirSource::new(source_dir)),
        sessions: Arc::new(target),
        credentials: Arc::new(StaticCredentials::new(
            env_value("FORMSYNC_TOKEN").unwrap_or_else(|| "local".to_string()),
        )),
        approvals,
    };
    let orchestrator = Orchestrator::new(file.engine_config(), options, collaborators, store);

    let cancel = CancellationToken::new();
    tokio::spawn(watch_signals(cancel.clone()));
    let report = orchestrator.run(cancel).await.context("sync failed")?;

    println!(
        "{} ({}/{}) {}",
        report.status.as_str(),
        report.cursor,
        report.total_entities,
        report.counters.stats_line()
    );
    if !report.failed_entities.is_empty() {
        println!("Entities that failed: {}", report.failed_entities.join(", "));
    }
    Ok(())
}

fn resolve_run_options(args: &RunArgs, file: &FileConfig, store: &StateStore) -> Result<RunOptions> {
    let pre_approved = match first_of(args.pre_approved.clone(), env_value("FORMSYNC_PRE_APPROVED"), None) {
        Some(input) => {
            let replay = store.replay_entries().context("failed to read replay list")?;
            resolve_pre_approved(&input, &replay)
        }
        None => BTreeSet::new(),
    };
    let since = match args.since {
        Some(since) => Some(since),
        None => env_value("FORMSYNC_SINCE")
            .map(|raw| {
                DateTime::parse_from_rfc3339(&raw)
                    .map(|parsed| parsed.with_timezone(&Utc))
                    .with_context(|| format!("FORMSYNC_SINCE is not RFC 3339: {raw}"))
            })
            .transpose()?,
    };
    let test_limit = match args.test_limit {
        Some(limit) => Some(limit),
        None => env_value("FORMSYNC_TEST_LIMIT")
            .map(|raw| {
                raw.parse::<usize>()
                    .with_context(|| format!("FORMSYNC_TEST_LIMIT is not a number: {raw}"))
            })
            .transpose()?,
    };

    Ok(RunOptions {
        root_path: first_of(
            args.root_path.clone(),
            env_value("FORMSYNC_ROOT_PATH"),
            file.root_path.clone(),
        )
        .unwrap_or_else(|| DEFAULT_ROOT_PATH.to_string()),
        skip_deletions: args.skip_deletions || env_true("FORMSYNC_SKIP_DELETIONS"),
        auto_delete: args.auto_delete || env_true("FORMSYNC_AUTO_DELETE"),
        quick_check: args.quick_check || env_true("FORMSYNC_QUICK_CHECK"),
        pre_approved,
        test_limit,
        since,
    })
}

fn resolve_approval_channel(args: &RunArgs, file: &FileConfig) -> Option<Arc<dyn ApprovalChannel>> {
    let outbox = first_of(
        args.approval_outbox.clone(),
        env_value("FORMSYNC_APPROVAL_OUTBOX").map(PathBuf::from),
        file.approval.outbox.clone(),
    )?;
    let inbox = first_of(
        args.approval_inbox.clone(),
        env_value("FORMSYNC_APPROVAL_INBOX").map(PathBuf::from),
        file.approval.inbox.clone(),
    )?;
    Some(Arc::new(FileApprovalChannel::new(outbox, inbox)))
}

/// Turns Ctrl-C or SIGTERM into cancellation; the run loop writes the checkpoint on its way out.
async fn watch_signals(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                warn!(event = "signal_handler_failed", error = %err);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!(event = "shutdown_requested");
    cancel.cancel();
}

fn open_store(state_dir: &Path) -> Result<StateStore> {
    let path = state_dir.join(STATE_DB);
    if !path.exists() {
        bail!("no state store at {}", path.display());
    }
    StateStore::open(&path).context("failed to open state store")
}

fn print_status(state_dir: &Path) -> Result<()> {
    let store = open_store(state_dir)?;
    match store.load_checkpoint()? {
        Some(checkpoint) => {
            println!(
                "Checkpoint: entity {}/{} ({})",
                checkpoint.cursor,
                checkpoint.total_entities,
                if checkpoint.needs_continuation {
                    "resumable"
                } else {
                    "finished"
                }
            );
            println!("Updated: {}", checkpoint.updated_at.to_rfc3339());
            println!("Counters: {}", checkpoint.counters.stats_line());
        }
        None => println!("No checkpoint saved"),
    }
    println!("Transferred assets recorded: {}", store.transferred_count()?);
    let failures = store.entity_failures()?;
    if !failures.is_empty() {
        println!("Entities with failures: {}", failures.len());
        for failure in &failures {
            match &failure.error {
                Some(error) => println!(
                    "- {} (not synced: {error}, {})",
                    failure.entity_name, failure.container_path
                ),
                None => println!(
                    "- {} ({} failed, {})",
                    failure.entity_name, failure.assets_failed, failure.container_path
                ),
            }
        }
    }
    Ok(())
}

fn print_replay(state_dir: &Path) -> Result<()> {
    let store = open_store(state_dir)?;
    let replay = store.replay_entries()?;
    if replay.is_empty() {
        println!("No entities awaiting deletion approval");
        return Ok(());
    }
    for (index, entry) in replay.iter().enumerate() {
        println!(
            "{}. {} ({} files, {}, {})",
            index + 1,
            entry.entity_name,
            entry.orphan_count,
            entry.reason,
            entry.recorded_at.to_rfc3339()
        );
    }
    println!("Approve with: formsync run --pre-approved 1,2,...");
    Ok(())
}

fn init_logging(debug: bool, file_level: Option<&str>, log_dir: &Path) -> Option<LogGuard> {
    let level = if debug {
        "debug".to_string()
    } else if let Some(level) = env_value("FORMSYNC_LOG_LEVEL") {
        level
    } else {
        file_level.unwrap_or("info").to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &Path) -> io::Result<LogGuard> {
    if log_dir.as_os_str().is_empty() {
        return Ok(LogGuard { file: None });
    }
    if std::fs::create_dir_all(log_dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(LOG_FILE))?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}
