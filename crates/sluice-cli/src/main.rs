//! Sluice CLI
//!
//! Resumable, parallel-hashed chunked uploads

mod config;
mod progress;
mod transport;

use anyhow::Context;
use clap::{Parser, Subcommand};
use console::style;
use sluice_core::TaskState;
use sluice_files::resume::{JsonTaskStore, TaskStore};
use sluice_files::{
    Blake3, ChunkSizePolicy, ContentId, FileSource, ParallelHasher, UploadSession, plan_chunks,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use config::Config;
use progress::{UploadProgress, format_bytes, format_duration, format_throughput, hashing_spinner};
use transport::DirTransport;

/// Sluice - resumable chunked uploads with parallel content hashing
#[derive(Parser)]
#[command(name = "sluice")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (default: ~/.config/sluice/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute the content id of a file
    Hash {
        /// File to hash
        #[arg(required = true)]
        file: PathBuf,

        /// Number of hash workers
        #[arg(short, long)]
        workers: Option<usize>,

        /// Chunk size in MiB
        #[arg(long)]
        chunk_size_mb: Option<f64>,

        /// Also print the partial digest of every worker
        #[arg(long)]
        partials: bool,
    },

    /// Show the chunk plan of a file
    Plan {
        /// File to plan
        #[arg(required = true)]
        file: PathBuf,

        /// Chunk size in MiB
        #[arg(long)]
        chunk_size_mb: Option<f64>,
    },

    /// Upload a file chunk by chunk into a directory
    Upload {
        /// File to upload
        #[arg(required = true)]
        file: PathBuf,

        /// Destination directory
        #[arg(short, long, required = true)]
        dest: PathBuf,

        /// Maximum concurrent chunk uploads
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,

        /// Retries per chunk
        #[arg(long)]
        retries: Option<u32>,
    },

    /// Manage interrupted uploads
    Resume {
        #[command(subcommand)]
        action: ResumeAction,
    },

    /// Print a random content id
    RandomId,
}

#[derive(Subcommand)]
enum ResumeAction {
    /// List interrupted uploads
    List,

    /// Forget an interrupted upload
    Forget {
        /// Content id of the upload
        #[arg(required = true)]
        content_id: String,
    },

    /// Remove records older than the configured maximum age
    Cleanup,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::load_or_default()?,
    };

    // Validate configuration
    config.validate()?;

    // Initialize logging
    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    match cli.command {
        Commands::Hash {
            file,
            workers,
            chunk_size_mb,
            partials,
        } => {
            hash_file(file, workers, chunk_size_mb, partials, &config).await?;
        }
        Commands::Plan {
            file,
            chunk_size_mb,
        } => {
            show_plan(file, chunk_size_mb, &config)?;
        }
        Commands::Upload {
            file,
            dest,
            concurrency,
            retries,
        } => {
            upload_file(file, dest, concurrency, retries, &config).await?;
        }
        Commands::Resume { action } => {
            manage_records(action, &config).await?;
        }
        Commands::RandomId => {
            println!("{}", ContentId::random()?);
        }
    }

    Ok(())
}

fn chunk_policy(chunk_size_mb: Option<f64>, config: &Config) -> ChunkSizePolicy {
    match chunk_size_mb {
        Some(mb) => ChunkSizePolicy::Custom(mb),
        None => config.hasher_config().chunk_policy,
    }
}

fn file_name(file: &std::path::Path) -> String {
    file.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.display().to_string())
}

/// Compute and print the content id of a file
async fn hash_file(
    file: PathBuf,
    workers: Option<usize>,
    chunk_size_mb: Option<f64>,
    partials: bool,
    config: &Config,
) -> anyhow::Result<()> {
    let mut hasher_config = config.hasher_config();
    if let Some(workers) = workers {
        hasher_config.workers = workers;
    }
    hasher_config.chunk_policy = chunk_policy(chunk_size_mb, config);

    tracing::info!(
        "Hashing {:?} with {} workers ({:?})",
        file,
        hasher_config.workers,
        hasher_config.chunk_policy
    );

    let hasher = Arc::new(ParallelHasher::<Blake3>::new(hasher_config)?);
    let spinner = hashing_spinner(&file_name(&file));
    let started = Instant::now();

    let hash = hasher.hash_file_async(file.clone()).await;
    spinner.finish_and_clear();
    let hash = hash.with_context(|| format!("Failed to hash {}", file.display()))?;
    let elapsed = started.elapsed();

    println!("{}", style(hash.content_id).bold());
    println!("File: {}", file.display());
    println!("Size: {}", format_bytes(hash.total_size));
    println!(
        "Chunks: {} x {}",
        hash.chunks.len(),
        format_bytes(hash.chunk_size)
    );
    println!("Workers: {}", hash.workers());
    println!(
        "Time: {} ({})",
        format_duration(elapsed),
        format_throughput(hash.total_size, elapsed)
    );

    if partials {
        println!();
        for partial in &hash.partials {
            println!("  worker {:>2}: {}", partial.worker_index, partial.to_hex());
        }
    }

    Ok(())
}

/// Print the chunk plan of a file
fn show_plan(file: PathBuf, chunk_size_mb: Option<f64>, config: &Config) -> anyhow::Result<()> {
    let size = std::fs::metadata(&file)
        .with_context(|| format!("File not found: {}", file.display()))?
        .len();
    let policy = chunk_policy(chunk_size_mb, config);
    let chunks = plan_chunks(size, policy)?;

    println!("File: {}", file.display());
    println!("Size: {}", format_bytes(size));
    println!("Chunk size: {}", format_bytes(policy.chunk_size(size)));
    println!("Chunks: {}", chunks.len());
    println!();

    const SHOWN: usize = 5;
    for chunk in chunks.iter().take(SHOWN) {
        println!("  #{:<6} {:>14}..{:<14}", chunk.index, chunk.offset, chunk.end());
    }
    if chunks.len() > 2 * SHOWN {
        println!("  ...");
    }
    for chunk in chunks.iter().skip(SHOWN.max(chunks.len().saturating_sub(SHOWN))) {
        println!("  #{:<6} {:>14}..{:<14}", chunk.index, chunk.offset, chunk.end());
    }

    Ok(())
}

/// Upload a file into a directory, resuming earlier attempts
async fn upload_file(
    file: PathBuf,
    dest: PathBuf,
    concurrency: Option<usize>,
    retries: Option<u32>,
    config: &Config,
) -> anyhow::Result<()> {
    let source = FileSource::open(&file).with_context(|| format!("File not found: {}", file.display()))?;
    let name = source.name();

    let mut scheduler_config = config.scheduler_config();
    if let Some(concurrency) = concurrency {
        scheduler_config.max_concurrent_tasks = concurrency;
    }
    if let Some(retries) = retries {
        scheduler_config.max_retries = retries;
    }

    let store = JsonTaskStore::new(config.storage.state_dir.clone(), config.storage.max_age_days);
    store.initialize().await?;
    let store: Arc<dyn TaskStore> = Arc::new(store);

    let hasher = Arc::new(ParallelHasher::<Blake3>::new(config.hasher_config())?);
    let spinner = hashing_spinner(&name);
    let started = Instant::now();
    let session = UploadSession::prepare(Arc::new(source), name.clone(), hasher, store, scheduler_config).await;
    spinner.finish_and_clear();
    let session = session?;

    let record = session.record().await;
    println!("Upload: {}", style(session.content_id()).bold());
    println!("File: {} ({})", file.display(), format_bytes(record.file_size));
    println!("Destination: {}", dest.display());
    if session.resumed_chunks() > 0 {
        println!(
            "Resuming: {}/{} chunks already delivered",
            session.resumed_chunks(),
            record.total_chunks
        );
    }

    let progress = UploadProgress::new(record.total_chunks as u64, session.resumed_chunks() as u64, &name);
    let bar = progress.bar();
    let base = session.resumed_chunks() as u64;
    session
        .scheduler()
        .on_progress_change(move |done| bar.set_position(base + done as u64));

    let transport = Arc::new(DirTransport::new(&dest));

    let outcome = tokio::select! {
        outcome = session.run(transport) => outcome?,
        _ = tokio::signal::ctrl_c() => {
            let scheduler = session.scheduler();
            if scheduler.state() == TaskState::Running {
                scheduler.pause()?;
            }
            session.save_progress().await?;
            scheduler.clear();

            let record = session.record().await;
            progress.abandon_with_message(format!(
                "Interrupted at {}/{} chunks, run the same command again to resume",
                record.completed_chunks.len(),
                record.total_chunks
            ));
            return Ok(());
        }
    };

    let elapsed = started.elapsed();
    if outcome.complete {
        progress.finish_with_message(format!(
            "Upload complete in {} ({})",
            format_duration(elapsed),
            format_throughput(record.file_size, elapsed)
        ));
        println!(
            "Chunks in {}",
            dest.join(outcome.content_id.to_string()).display()
        );
        Ok(())
    } else {
        progress.abandon_with_message(format!("{} chunks failed", outcome.failed.len()));
        anyhow::bail!(
            "Upload {} incomplete: {} chunks failed, run the same command again to resume",
            outcome.content_id,
            outcome.failed.len()
        )
    }
}

/// List, forget or clean up upload records
async fn manage_records(action: ResumeAction, config: &Config) -> anyhow::Result<()> {
    let store = JsonTaskStore::new(config.storage.state_dir.clone(), config.storage.max_age_days);

    match action {
        ResumeAction::List => {
            let records = store.list().await?;
            if records.is_empty() {
                println!("No interrupted uploads");
                return Ok(());
            }

            println!("Interrupted uploads:");
            println!();
            for record in records {
                println!(
                    "  {}  {:>6.1}%  {}/{} chunks  {}  {}",
                    style(record.content_id).bold(),
                    record.progress(),
                    record.completed_chunks.len(),
                    record.total_chunks,
                    format_bytes(record.file_size),
                    record.file_name
                );
            }
        }
        ResumeAction::Forget { content_id } => {
            let id: ContentId = content_id.parse()?;
            if store.load(&id).await?.is_none() {
                anyhow::bail!("No upload record for {}", id);
            }
            store.delete(&id).await?;
            println!("Forgot upload {}", id);
        }
        ResumeAction::Cleanup => {
            let removed = store.cleanup_stale().await?;
            println!(
                "Removed {} records older than {} days",
                removed, config.storage.max_age_days
            );
        }
    }

    Ok(())
}
