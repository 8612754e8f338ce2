//! WikiSync: load the latest revision of every page in a Wikimedia dump into SQLite.

use anyhow::{Context, Result};
use clap::Parser;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use wikisync::{
    config::{Config, LogFormat, LoggingConfig},
    import::{print_summary, IngestCheckpoint, IngestCoordinatorBuilder, IngestEnd, IngestStats, WikimediaSource},
};

#[derive(Parser)]
#[command(name = "wikisync")]
#[command(about = "Incrementally load a Wikimedia dump into a SQLite page table")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "wikisync.toml")]
    config: PathBuf,

    /// SQLite database filename
    #[arg(long)]
    db: Option<PathBuf>,

    /// Wikimedia dump XML file (possibly .bz2)
    #[arg(long)]
    file: Option<PathBuf>,

    /// Optional SQLite database receiving every change
    #[arg(long)]
    diff_db: Option<PathBuf>,

    /// Records per committed transaction
    #[arg(long)]
    batch_size: Option<usize>,

    /// Checkpoint file updated after every commit
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Skip records already committed according to the checkpoint
    #[arg(long)]
    resume: bool,

    /// Quiet mode (no progress output)
    #[arg(short, long)]
    quiet: bool,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load_or_default(&cli.config)?;
    if let Some(db) = cli.db {
        config.store.db_path = db;
    }
    if cli.diff_db.is_some() {
        config.store.diff_db_path = cli.diff_db;
    }
    if let Some(batch_size) = cli.batch_size {
        config.ingest.batch_size = batch_size;
    }
    if cli.checkpoint.is_some() {
        config.ingest.checkpoint_path = cli.checkpoint;
    }
    config.validate()?;

    init_logging(&config.logging, cli.verbose)?;

    // Input problems are reported, not treated as failures
    let Some(file) = cli.file else {
        println!("Must specify Wikimedia dump file");
        return Ok(());
    };
    if !file.exists() {
        println!("File not found: {}", file.display());
        return Ok(());
    }

    let checkpoint = if cli.resume {
        load_checkpoint(&config)
    } else {
        None
    };

    let cancel = Arc::new(AtomicBool::new(false));
    let task_cancel = cancel.clone();
    let quiet = cli.quiet;
    let task = tokio::task::spawn_blocking(move || {
        run_ingest(config, file, checkpoint, task_cancel, quiet)
    });

    let stats = match supervise(task, &cancel, interrupt).await? {
        Supervised::Finished(result) => result?,
        Supervised::Forced => std::process::exit(130),
    };

    if let IngestEnd::ParseError(ref msg) = stats.end {
        warn!("Dump reading stopped early: {}", msg);
    }
    print_summary(&stats);

    Ok(())
}

/// Outcome of waiting on the ingestion task
enum Supervised<T> {
    Finished(T),
    /// Second interrupt while the in-flight batch was still committing
    Forced,
}

/// Wait for the ingestion task. The first interrupt raises the cancel flag so
/// the in-flight batch commits; a second one gives up on the task.
async fn supervise<T, F, Fut>(
    mut task: JoinHandle<T>,
    cancel: &AtomicBool,
    mut interrupted: F,
) -> Result<Supervised<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    tokio::select! {
        joined = &mut task => {
            return Ok(Supervised::Finished(joined.context("ingestion task panicked")?));
        }
        _ = interrupted() => {
            warn!("Interrupt received, committing the in-flight batch (interrupt again to exit now)");
            cancel.store(true, Ordering::Relaxed);
        }
    }

    tokio::select! {
        joined = &mut task => Ok(Supervised::Finished(joined.context("ingestion task panicked")?)),
        _ = interrupted() => {
            warn!("Second interrupt, exiting without waiting for the commit");
            Ok(Supervised::Forced)
        }
    }
}

/// Resolves on Ctrl-C; never resolves if the handler cannot be installed
async fn interrupt() {
    if let Err(e) = signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

fn run_ingest(
    config: Config,
    file: PathBuf,
    checkpoint: Option<IngestCheckpoint>,
    cancel: Arc<AtomicBool>,
    quiet: bool,
) -> Result<IngestStats> {
    let source = WikimediaSource::open(&file)
        .with_context(|| format!("Failed to open dump {}", file.display()))?;

    let mut coordinator = IngestCoordinatorBuilder::from_config(&config)
        .with_cancel_flag(cancel)
        .with_quiet(quiet)
        .build()
        .context("Failed to open page store")?;

    let stats = match checkpoint {
        Some(cp) => coordinator.resume(source, &cp),
        None => coordinator.ingest(source),
    }
    .context("Ingestion failed")?;

    Ok(stats)
}

fn load_checkpoint(config: &Config) -> Option<IngestCheckpoint> {
    let Some(ref path) = config.ingest.checkpoint_path else {
        warn!("--resume given without a checkpoint path, starting from the beginning");
        return None;
    };
    if !path.exists() {
        info!("No checkpoint at {}, starting from the beginning", path.display());
        return None;
    }
    match IngestCheckpoint::load(path) {
        Ok(cp) => Some(cp),
        Err(e) => {
            warn!("Ignoring unreadable checkpoint {}: {}", path.display(), e);
            None
        }
    }
}

fn init_logging(logging: &LoggingConfig, verbose: u8) -> Result<()> {
    let log_level = match verbose {
        0 => logging.level.to_tracing(),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let builder = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Text => tracing::subscriber::set_global_default(builder.finish())?,
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
    }
    Ok(())
}
