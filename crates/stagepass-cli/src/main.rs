//! Stagepass CLI - operational tool for the offline sync engine
//!
//! Inspect the mutation queue, run sync passes, and settle conflicts from
//! a terminal on gate-scanner and vendor devices.

mod error;
mod http;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::sync::Mutex;

use stagepass_core::config::{
    BackoffConfig, BatchConfig, EntityRegistration, SyncConfig,
};
use stagepass_core::db::Database;
use stagepass_core::handler::OfflineMutationHandler;
use stagepass_core::models::{
    ConflictResolution, ConflictStrategy, EntityConflictConfig, MutationId, QueueItemStatus,
};
use stagepass_core::queue::MutationQueue;
use stagepass_core::sync::SyncManager;
use stagepass_core::transport::{EntityStore, EntityTransport};

use error::CliError;
use http::{HttpAuthProvider, HttpTransport};
use store::FileEntityStore;

#[derive(Parser)]
#[command(name = "stagepass")]
#[command(about = "Operate the Stagepass offline sync engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Optional path to the local sync database file
    #[arg(long, value_name = "PATH")]
    db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and manage the mutation queue
    #[command(subcommand)]
    Queue(QueueCommands),
    /// Run and inspect sync passes
    #[command(subcommand)]
    Sync(SyncCommands),
    /// List and resolve pending conflicts
    #[command(subcommand)]
    Conflicts(ConflictCommands),
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Show queue counters
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List queue items
    List {
        /// Filter by status
        #[arg(long, value_enum)]
        status: Option<StatusFilter>,
        /// Number of items to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Re-arm failed items (all whose backoff elapsed, or one by ID)
    Retry {
        /// Mutation ID to re-arm regardless of backoff
        id: Option<String>,
    },
    /// Cancel a pending or failed item
    Cancel {
        /// Mutation ID
        id: String,
    },
}

#[derive(Subcommand)]
enum SyncCommands {
    /// Run a full sync pass now
    Run {
        /// Reclaim a stale pass marker left by a crashed process
        #[arg(long)]
        force: bool,
        /// Re-run only the entities whose last task failed
        #[arg(long)]
        retry_failed: bool,
    },
    /// Show the last pass result and per-entity cursors
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ConflictCommands {
    /// List conflicts awaiting resolution
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve one conflict
    Resolve {
        /// Mutation ID
        id: String,
        /// Which side wins: local, server, or merge
        resolution: String,
        /// Merged JSON payload (required with merge)
        #[arg(long, value_name = "JSON")]
        data: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StatusFilter {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl From<StatusFilter> for QueueItemStatus {
    fn from(filter: StatusFilter) -> Self {
        match filter {
            StatusFilter::Pending => Self::Pending,
            StatusFilter::Processing => Self::Processing,
            StatusFilter::Completed => Self::Completed,
            StatusFilter::Failed => Self::Failed,
        }
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(error) = run(cli).await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let data_dir = match &cli.db_path {
        Some(path) => path
            .parent()
            .map_or_else(|| PathBuf::from("."), PathBuf::from),
        None => store::default_data_dir()?,
    };
    let db_path = cli
        .db_path
        .clone()
        .unwrap_or_else(|| data_dir.join("sync.db"));

    tracing::debug!(db_path = %db_path.display(), "Opening sync database");
    let db = Arc::new(Mutex::new(Database::open(&db_path)?));
    let queue = Arc::new(MutationQueue::new(Arc::clone(&db), BackoffConfig::default()));

    match cli.command {
        Commands::Queue(command) => run_queue(command, &queue).await,
        Commands::Sync(command) => {
            let engine = build_engine(db, Arc::clone(&queue), &data_dir)?;
            run_sync(command, &engine).await
        }
        Commands::Conflicts(command) => {
            let engine = build_engine(db, Arc::clone(&queue), &data_dir)?;
            run_conflicts(command, &engine).await
        }
    }
}

struct Engine {
    handler: Arc<OfflineMutationHandler>,
    manager: SyncManager,
}

/// Wire the full engine from environment configuration.
///
/// Entity registrations mirror the platform's dependency order: cashless
/// transactions settle against tickets, so tickets sync first.
fn build_engine(
    db: Arc<Mutex<Database>>,
    queue: Arc<MutationQueue>,
    data_dir: &std::path::Path,
) -> Result<Engine, CliError> {
    let api_url = std::env::var("STAGEPASS_API_URL").map_err(|_| CliError::SyncNotConfigured)?;
    let token = std::env::var("STAGEPASS_API_TOKEN").map_err(|_| CliError::SyncNotConfigured)?;
    let festival_id =
        std::env::var("STAGEPASS_FESTIVAL_ID").unwrap_or_else(|_| "default".to_string());
    let device_id = std::env::var("STAGEPASS_DEVICE_ID").unwrap_or_else(|_| "cli".to_string());

    let config = SyncConfig {
        festival_id,
        device_id,
        entities: vec![
            EntityRegistration::new("lineup")
                .with_conflict(EntityConflictConfig::new(ConflictStrategy::ServerWins)),
            EntityRegistration::new("tickets")
                .with_conflict(EntityConflictConfig::new(ConflictStrategy::LastWriteWins)),
            EntityRegistration::new("cashless_transactions")
                .depends_on(&["tickets"])
                .with_conflict(EntityConflictConfig::new(ConflictStrategy::ServerWins)),
            EntityRegistration::new("favorites")
                .with_conflict(EntityConflictConfig::new(ConflictStrategy::ClientWins)),
        ],
        batch: BatchConfig::default(),
        backoff: BackoffConfig::default(),
    };
    config.validate().map_err(CliError::Core)?;

    let transport: Arc<dyn EntityTransport> =
        Arc::new(HttpTransport::new(&api_url, &token).map_err(CliError::Core)?);
    let auth = Arc::new(HttpAuthProvider::new(&api_url, &token).map_err(CliError::Core)?);
    let store: Arc<dyn EntityStore> =
        Arc::new(FileEntityStore::new(store::records_dir(data_dir)));

    let handler = Arc::new(OfflineMutationHandler::new(
        Arc::clone(&db),
        Arc::clone(&queue),
        Arc::clone(&store),
        Arc::clone(&transport),
        config.clone(),
    ));
    let manager = SyncManager::new(
        db,
        queue,
        Arc::clone(&handler),
        store,
        transport,
        auth,
        config,
    );

    Ok(Engine { handler, manager })
}

#[derive(Serialize)]
struct QueueItemLine {
    id: String,
    entity_type: String,
    entity_id: String,
    operation: String,
    status: String,
    priority: String,
    attempts: u32,
    last_error: Option<String>,
}

async fn run_queue(command: QueueCommands, queue: &MutationQueue) -> Result<(), CliError> {
    match command {
        QueueCommands::Stats { json } => {
            let stats = queue.stats().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("pending:    {}", stats.pending);
                println!("processing: {}", stats.processing);
                println!("failed:     {}", stats.failed);
                println!("completed:  {}", stats.completed);
            }
        }
        QueueCommands::List {
            status,
            limit,
            json,
        } => {
            let items = queue.list(status.map(Into::into), limit).await?;
            let lines: Vec<QueueItemLine> = items
                .iter()
                .map(|item| QueueItemLine {
                    id: item.id.as_str(),
                    entity_type: item.entity_type.clone(),
                    entity_id: item.entity_id.clone(),
                    operation: item.operation.as_str().to_string(),
                    status: item.status.as_str().to_string(),
                    priority: format!("{:?}", item.priority).to_lowercase(),
                    attempts: item.attempt_count,
                    last_error: item.last_error.clone(),
                })
                .collect();

            if json {
                println!("{}", serde_json::to_string_pretty(&lines)?);
            } else if lines.is_empty() {
                println!("Queue is empty.");
            } else {
                for line in lines {
                    println!(
                        "{}  {:10} {}/{} {} (attempts: {}){}",
                        line.id,
                        line.status,
                        line.entity_type,
                        line.entity_id,
                        line.operation,
                        line.attempts,
                        line.last_error
                            .map(|e| format!("  last error: {e}"))
                            .unwrap_or_default()
                    );
                }
            }
        }
        QueueCommands::Retry { id } => match id {
            Some(id) => {
                queue.retry_item(&parse_mutation_id(&id)?).await?;
                println!("Re-armed {id}");
            }
            None => {
                let rearmed = queue.retry_failed().await?;
                println!("Re-armed {rearmed} failed item(s)");
            }
        },
        QueueCommands::Cancel { id } => {
            queue.cancel(&parse_mutation_id(&id)?).await?;
            println!("Cancelled {id}");
        }
    }
    Ok(())
}

async fn run_sync(command: SyncCommands, engine: &Engine) -> Result<(), CliError> {
    match command {
        SyncCommands::Run {
            force,
            retry_failed,
        } => {
            let result = if retry_failed {
                engine.manager.retry_failed_sync().await?
            } else {
                engine.manager.start_sync(force).await?
            };

            if result.success {
                println!(
                    "Sync completed: pulled {}, pushed {} in {}ms",
                    result.pulled, result.pushed, result.duration_ms
                );
            } else {
                println!(
                    "Sync did not complete: {}",
                    result.reason.as_deref().unwrap_or("unknown reason")
                );
            }
            for error in &result.errors {
                println!(
                    "  [{}] {}: {}",
                    error.phase.as_str(),
                    error.entity_type,
                    error.message
                );
            }
        }
        SyncCommands::Status { json } => {
            let last = engine.manager.persisted_last_result().await?;
            let statuses = engine.manager.entity_statuses().await?;

            if json {
                let payload = serde_json::json!({
                    "last_result": last,
                    "entities": statuses,
                });
                println!("{}", serde_json::to_string_pretty(&payload)?);
                return Ok(());
            }

            match last {
                Some(result) => {
                    let when = chrono::DateTime::from_timestamp_millis(result.started_at)
                        .map_or_else(|| result.started_at.to_string(), |dt| dt.to_rfc3339());
                    println!(
                        "Last pass: {} at {} (pulled {}, pushed {}, {} error(s))",
                        if result.success { "ok" } else { "failed" },
                        when,
                        result.pulled,
                        result.pushed,
                        result.errors.len()
                    );
                }
                None => println!("No sync pass recorded yet."),
            }

            for status in statuses {
                println!(
                    "  {:24} last_sync_at={} pending={}{}",
                    status.entity_type,
                    status
                        .last_sync_at
                        .map_or_else(|| "never".to_string(), |at| at.to_string()),
                    status.pending_changes,
                    status
                        .last_error
                        .map(|e| format!("  last error: {e}"))
                        .unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

async fn run_conflicts(command: ConflictCommands, engine: &Engine) -> Result<(), CliError> {
    match command {
        ConflictCommands::List { json } => {
            let conflicts = engine.handler.pending_conflicts().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&conflicts)?);
            } else if conflicts.is_empty() {
                println!("No pending conflicts.");
            } else {
                for conflict in conflicts {
                    println!(
                        "{}  {}/{} fields: {}",
                        conflict.mutation_id,
                        conflict.detail.entity_type,
                        conflict.detail.entity_id,
                        conflict.detail.conflicting_fields.join(", ")
                    );
                }
            }
        }
        ConflictCommands::Resolve {
            id,
            resolution,
            data,
        } => {
            let resolution = parse_resolution(&resolution)?;
            let merged = match (resolution, data) {
                (ConflictResolution::Merge, None) => return Err(CliError::MergeDataRequired),
                (_, Some(raw)) => Some(serde_json::from_str(&raw)?),
                (_, None) => None,
            };

            let mutation = engine
                .handler
                .resolve_conflict(&parse_mutation_id(&id)?, resolution, merged)
                .await?;
            println!("Resolved {id}: now {}", mutation.status.as_str());
        }
    }
    Ok(())
}

fn parse_mutation_id(raw: &str) -> Result<MutationId, CliError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CliError::EmptyMutationId);
    }
    trimmed
        .parse()
        .map_err(|_| CliError::InvalidMutationId(trimmed.to_string()))
}

fn parse_resolution(raw: &str) -> Result<ConflictResolution, CliError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "local" => Ok(ConflictResolution::KeepLocal),
        "server" => Ok(ConflictResolution::KeepServer),
        "merge" => Ok(ConflictResolution::Merge),
        other => Err(CliError::InvalidResolution(other.to_string())),
    }
}
