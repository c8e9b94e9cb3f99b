//! archnews server binary: NNTP listener, fetch/ingest processor, and the
//! admin-tool CLI surface (§6 collaborator RPCs exposed as subcommands for
//! operators without a separate admin service).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use archnews::active;
use archnews::config::{AppConfig, DEFAULT_CONFIG_PATH, DEFAULT_FETCH_SLEEP_SECS, DEFAULT_LOG_FILTER, UPDATE_SENTINEL_POLL_SECS};
use archnews::error::EngineError;
use archnews::fetch::pool::ProviderPool;
use archnews::fetch::processor::FetchProcessor;
use archnews::fetch::progress::ProgressStore;
use archnews::history::HistoryStore;
use archnews::nntp::auth::AuthGuard;
use archnews::nntp::engine::Engine;
use archnews::nntp::listener;
use archnews::storage::catalog::Catalog;
use archnews::storage::pool::ShardPool;

#[derive(Parser)]
#[command(name = "archnewsd", about = "Usenet (NNTP) archive engine")]
struct Cli {
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    #[arg(long, value_enum, default_value = "json")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the NNTP server and fetch/ingest processor until shutdown.
    Serve,
    /// Load an active file (§6), creating any newsgroup not already known.
    ImportActive {
        path: PathBuf,
    },
    /// Recompute the thread tree for one newsgroup from its overview rows.
    RebuildThreads {
        group: String,
    },
    /// Walk every group shard and report orphaned thread rows.
    Check,
    /// Re-parse stored `Date:` headers for one group and rewrite `date_sent`
    /// where the re-parsed value disagrees by more than the repair threshold.
    RepairDates {
        group: String,
    },
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Pretty => subscriber.init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), EngineError> {
    let config = Arc::new(AppConfig::load(&cli.config)?);

    let catalog = Arc::new(Catalog::open(std::path::Path::new(&config.engine.data_dir))?);
    catalog.lock_short_hash_width(config.history.short_hash_width)?;

    match cli.command {
        Command::ImportActive { path } => {
            let report = active::import_file(&catalog, &path)?;
            info!(
                lines_read = report.lines_read,
                groups_created = report.groups_created,
                groups_skipped = report.groups_skipped,
                "active file import complete"
            );
            Ok(())
        }

        Command::RebuildThreads { group } => {
            let shards = ShardPool::new(
                std::path::Path::new(&config.engine.data_dir).join("shards"),
                config.storage.shard_pool_soft_cap,
                config.storage.shard_pool_hard_cap,
            );
            let handle = shards.get_shard(&group).await?;
            let count = archnews::overview::thread::rebuild(&handle.shard, 1000)?;
            info!(%group, threaded = count, "thread rebuild complete");
            Ok(())
        }

        Command::Check => {
            let shards = ShardPool::new(
                std::path::Path::new(&config.engine.data_dir).join("shards"),
                config.storage.shard_pool_soft_cap,
                config.storage.shard_pool_hard_cap,
            );
            let groups = catalog.list_active_groups()?;
            let mut total_orphans = 0usize;
            for group in &groups {
                let handle = shards.get_shard(&group.name).await?;
                let orphans = handle.shard.find_orphaned_children()?;
                if !orphans.is_empty() {
                    error!(group = %group.name, count = orphans.len(), "orphaned thread rows found");
                    total_orphans += orphans.len();
                }
            }
            info!(groups_checked = groups.len(), orphans_found = total_orphans, "consistency check complete");
            Ok(())
        }

        Command::RepairDates { group } => {
            let shards = ShardPool::new(
                std::path::Path::new(&config.engine.data_dir).join("shards"),
                config.storage.shard_pool_soft_cap,
                config.storage.shard_pool_hard_cap,
            );
            let handle = shards.get_shard(&group).await?;
            let repaired = archnews::storage::date::repair_shard_dates(
                &handle.shard,
                archnews::config::DATE_REPAIR_AUTHORITY_THRESHOLD_SECS,
            )?;
            info!(%group, repaired, "date repair complete");
            Ok(())
        }

        Command::Serve => serve(config, catalog).await,
    }
}

async fn serve(config: Arc<AppConfig>, catalog: Arc<Catalog>) -> Result<(), EngineError> {
    config.engine.require_hostname()?;

    let data_dir = std::path::Path::new(&config.engine.data_dir);
    let shards = ShardPool::new(data_dir.join("shards"), config.storage.shard_pool_soft_cap, config.storage.shard_pool_hard_cap);
    let history = HistoryStore::open(&data_dir.join("history"), config.history.short_hash_width).await?;
    let progress = Arc::new(ProgressStore::open(&data_dir.join("progress"))?);

    let engine = Engine::new(Arc::clone(&config), Arc::clone(&catalog), Arc::clone(&shards), Arc::clone(&history));
    let auth = Arc::new(AuthGuard::new(Arc::clone(&catalog)));

    let shutdown = CancellationToken::new();
    listener::install_signal_handlers(shutdown.clone());
    spawn_update_sentinel_watcher(data_dir.to_path_buf(), shutdown.clone());

    let providers: Vec<Arc<ProviderPool>> = config.provider.iter().cloned().map(ProviderPool::new).collect();
    let fetch_task = if providers.is_empty() {
        None
    } else {
        let processor = FetchProcessor::new(Arc::clone(&engine), Arc::clone(&catalog), Arc::clone(&progress), providers);
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            processor.run_forever(std::time::Duration::from_secs(DEFAULT_FETCH_SLEEP_SECS), shutdown).await;
        }))
    };

    let listen_result = listener::serve(Arc::clone(&config), Arc::clone(&engine), auth, shutdown.clone()).await;

    if let Some(task) = fetch_task {
        let _ = task.await;
    }
    history.close().await;

    listen_result.map_err(|e| EngineError::Invariant(format!("nntp listener failed: {e}")))
}

/// Poll for an `.update` sentinel file every `UPDATE_SENTINEL_POLL_SECS`;
/// when present, rename it to `.update.todo` and trigger shutdown (§6, used
/// by external updaters that want the process to restart cleanly).
fn spawn_update_sentinel_watcher(data_dir: PathBuf, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let sentinel = data_dir.join(".update");
        let todo = data_dir.join(".update.todo");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(std::time::Duration::from_secs(UPDATE_SENTINEL_POLL_SECS)) => {}
            }
            if sentinel.exists() {
                if let Err(e) = std::fs::rename(&sentinel, &todo) {
                    error!(error = %e, "failed to rename .update sentinel");
                    continue;
                }
                info!("update sentinel observed, shutting down");
                shutdown.cancel();
                break;
            }
        }
    });
}
