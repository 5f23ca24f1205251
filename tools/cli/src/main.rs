//! Strata CLI - inspect and drive failover storage replication.
//!
//! This tool lists the replication queue, runs the queue worker and
//! reconciles the backends of a failover storage.

mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

use strata_common::StorageName;
use strata_failover::{FailoverRegistry, StrataConfig};
use strata_queue::{FindCriteria, MessageQueue, SqliteQueue, DEFAULT_LIMIT, DEFAULT_PAGE};
use strata_storage::create_default_registry;
use strata_sync::{
    ExtraFilesStrategy, HandlerOutcome, HandlerTable, QueueWorker, Reconciler, SyncEvent,
    SyncOptions,
};

use output::OutputFormat;

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Strata - Failover storage replication")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file.
    #[arg(short, long, default_value = "strata.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List pending replication messages.
    ListQueue {
        /// Only list messages of this storage.
        #[arg(short, long)]
        storage: Option<String>,

        /// Messages per page.
        #[arg(short, long, default_value_t = DEFAULT_LIMIT)]
        limit: usize,

        /// Page to display, starting at 1.
        #[arg(short, long, default_value_t = DEFAULT_PAGE)]
        page: usize,

        /// Print machine readable output instead of a table.
        #[arg(short, long, value_enum)]
        format: Option<OutputFormat>,

        /// Pretty-print JSON output.
        #[arg(long)]
        pretty: bool,
    },

    /// Apply pending replication messages.
    ProcessQueue {
        /// Stop after this many messages (default: run until interrupted).
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Compare the backends of a storage and queue the missing replications.
    Sync {
        /// Storage to reconcile (default: the first configured storage).
        storage: Option<String>,

        /// What to do with files only found on secondary backends:
        /// "ignore", "copy" or "delete".
        #[arg(short, long, default_value = "ignore")]
        extra_files: String,

        /// Only look for missing files, never compare modification dates.
        #[arg(long)]
        ignore_modification_dates: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::ListQueue {
            storage,
            limit,
            page,
            format,
            pretty,
        } => cmd_list_queue(&cli.config, storage, limit, page, format, pretty).await,

        Commands::ProcessQueue { limit } => cmd_process_queue(&cli.config, limit).await,

        Commands::Sync {
            storage,
            extra_files,
            ignore_modification_dates,
        } => cmd_sync(&cli.config, storage, &extra_files, ignore_modification_dates).await,
    }
}

/// Storages and queue described by the configuration file.
struct Setup {
    storages: Arc<FailoverRegistry>,
    queue: Arc<SqliteQueue>,
}

/// Load the configuration and build the storages it declares.
fn load(config_path: &Path) -> Result<Setup> {
    let config = StrataConfig::load(config_path)
        .with_context(|| format!("Failed to load configuration {}", config_path.display()))?;

    let queue = Arc::new(
        config
            .open_queue()
            .context("Failed to open the replication queue")?,
    );
    let storages = config
        .build_registry(&create_default_registry(), queue.clone())
        .context("Failed to build failover storages")?;
    debug!("Loaded storages: {}", storages.names().join(", "));

    Ok(Setup {
        storages: Arc::new(storages),
        queue,
    })
}

/// List pending replication messages.
async fn cmd_list_queue(
    config_path: &Path,
    storage: Option<String>,
    limit: usize,
    page: usize,
    format: Option<OutputFormat>,
    pretty: bool,
) -> Result<()> {
    let ctx = load(config_path)?;

    let mut criteria = FindCriteria::new().with_limit(limit).with_page(page);
    if let Some(name) = &storage {
        // Fail early on a typo rather than printing an empty queue.
        ctx.storages.get(name)?;
        criteria = criteria.with_storage(StorageName::new(name.as_str())?);
    }

    let results = ctx
        .queue
        .find_by(&criteria)
        .await
        .context("Failed to list the replication queue")?;

    match format {
        Some(OutputFormat::Json) => output::write_json(&mut io::stdout().lock(), &results, pretty)?,
        Some(OutputFormat::Csv) => output::write_csv(&mut io::stdout().lock(), &results)?,
        None => {
            if !results.is_empty() {
                println!("{}", output::queue_table(&results, storage.is_none()));
                println!();
            }
            println!("{}", output::queue_footer(&results));
        }
    }

    Ok(())
}

/// Apply pending replication messages until `limit` is reached or the
/// process is interrupted.
async fn cmd_process_queue(config_path: &Path, limit: Option<usize>) -> Result<()> {
    let ctx = load(config_path)?;
    let queue: Arc<dyn MessageQueue> = ctx.queue.clone();
    let worker = QueueWorker::new(queue, HandlerTable::with_default_handlers(ctx.storages));

    match limit {
        Some(limit) => info!("Processing {} message(s)", limit),
        None => info!("Processing messages, press Ctrl-C to stop"),
    }

    // A popped message is only in memory, so Ctrl-C lets it finish.
    let stop = CancellationToken::new();
    let interrupt = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping after the current message");
            interrupt.cancel();
        }
    });

    let count = worker
        .run(limit, &stop, |processed| {
            println!("{}", processed.record.message);
            match processed.outcome {
                HandlerOutcome::Completed => println!("Message successfully processed"),
                HandlerOutcome::Requeued => println!("Message failed, a retry has been queued"),
            }
        })
        .await
        .context("Failed to process the replication queue")?;
    println!("{} message(s) processed", count);

    Ok(())
}

/// Reconcile the backends of a storage.
async fn cmd_sync(
    config_path: &Path,
    storage: Option<String>,
    extra_files: &str,
    ignore_modification_dates: bool,
) -> Result<()> {
    let extra_files: ExtraFilesStrategy = extra_files
        .parse()
        .context("Invalid --extra-files value")?;
    let ctx = load(config_path)?;

    let storage_name = match storage {
        Some(name) => name,
        None => ctx
            .storages
            .first()
            .context("No failover storage is configured")?
            .storage_name()
            .to_string(),
    };

    let reconciler = Reconciler::new(ctx.storages).with_listener(Box::new(print_event));
    let options = SyncOptions {
        extra_files,
        ignore_modification_dates,
    };
    let report = reconciler
        .sync(&storage_name, &options)
        .await
        .with_context(|| format!("Failed to sync storage {}", storage_name))?;

    let show_deleted = extra_files == ExtraFilesStrategy::Delete;
    println!();
    println!("{}", output::sync_summary(&report, show_deleted));
    println!();
    println!("{}", output::sync_table(&report, show_deleted));

    Ok(())
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::ListingStarted { backend } => {
            println!("Listing files of backend {}...", backend)
        }
        SyncEvent::ListingSucceeded { backend, files } => {
            println!("  Backend {}: {} file(s) found", backend, files)
        }
        SyncEvent::ListingFailed { backend, error } => {
            println!("  Backend {}: listing failed, treated as empty ({})", backend, error)
        }
        SyncEvent::SearchingStarted => println!("Searching for files to replicate..."),
        SyncEvent::BeforeDispatch { message } => debug!("Queueing: {}", message),
        SyncEvent::Dispatched { message, outcome } => {
            debug!("Queued ({:?}): {}", outcome, message)
        }
    }
}
