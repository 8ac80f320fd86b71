use bizcache::cache::{
  with_retry, CacheBackend, CacheStore, KeyPattern, PatternInvalidator, SqliteBackend,
};
use bizcache::company::COMPANIES_TABLE;
use bizcache::config::Config;
use bizcache::db::Database;
use bizcache::offline::{Connectivity, OfflineQueue, QueuedOperation, SqliteLocalStorage};
use bizcache::service::{apply_queued, RestDataService};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "bizcache")]
#[command(about = "Inspect and maintain the local business data cache and offline queue")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/bizcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show cache statistics
  Stats,
  /// Remove every cache entry
  Flush,
  /// Remove cache entries whose key matches a glob pattern
  Invalidate {
    /// e.g. "*:company:acme:*" or "reports:*"
    pattern: String,
  },
  /// Remove every cache entry of one company
  InvalidateCompany { tenant: String },
  /// Inspect or replay the offline write queue
  Queue {
    #[command(subcommand)]
    action: QueueAction,
  },
}

#[derive(Subcommand, Debug)]
enum QueueAction {
  /// List pending operations, oldest first
  List,
  /// Drop all pending operations
  Clear,
  /// Replay pending operations against the data service
  Drain,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _guard = bizcache::logging::init_logging(&config.log, &config.log_dir()?)?;

  let db = Arc::new(Database::open_at(&config.database_path()?)?);
  let store = Arc::new(open_store(&config, &db));

  match args.command {
    Command::Stats => {
      let stats = store.stats().await;
      println!("{}", serde_json::to_string_pretty(&stats)?);
    }
    Command::Flush => {
      store.flush().await;
      println!("Cache flushed");
    }
    Command::Invalidate { pattern } => {
      let removed = PatternInvalidator::new(store)
        .invalidate_pattern(KeyPattern::parse(pattern.as_str()))
        .await;
      println!("Removed {} entries matching {}", removed, pattern);
    }
    Command::InvalidateCompany { tenant } => {
      let removed = PatternInvalidator::new(store)
        .invalidate_company_cache(&tenant)
        .await;
      println!("Removed {} entries for company {}", removed, tenant);
    }
    Command::Queue { action } => {
      let storage = Arc::new(SqliteLocalStorage::new(Arc::clone(&db)));
      let queue = OfflineQueue::load(storage, Connectivity::default())?;
      run_queue_action(action, &config, &queue, store).await?;
    }
  }

  Ok(())
}

fn open_store(config: &Config, db: &Arc<Database>) -> CacheStore {
  if config.cache.persistent {
    let backend: Arc<dyn CacheBackend> = Arc::new(SqliteBackend::new(Arc::clone(db)));
    CacheStore::with_backend(backend)
  } else {
    CacheStore::in_memory()
  }
}

async fn run_queue_action(
  action: QueueAction,
  config: &Config,
  queue: &OfflineQueue,
  store: Arc<CacheStore>,
) -> Result<()> {
  match action {
    QueueAction::List => {
      let operations = queue.operations_snapshot();
      if operations.is_empty() {
        println!("Offline queue is empty");
      }
      for op in operations {
        let queued_at = op
          .queued_at()
          .map(|t| t.to_rfc3339())
          .unwrap_or_else(|| op.timestamp.to_string());
        println!("{}  {:<6} {:<20} {}  {}", op.id, op.kind.as_str(), op.table, queued_at, op.data);
      }
    }
    QueueAction::Clear => {
      let pending = queue.len();
      queue.clear()?;
      println!("Dropped {} queued operations", pending);
    }
    QueueAction::Drain => {
      let service = RestDataService::new(
        &config.service.url,
        Config::get_api_key(),
        config.service_timeout(),
      )?;
      let retry = config.retry_policy();

      let report = queue
        .drain(|op| {
          let service = service.clone();
          async move { with_retry(retry, || apply_queued(&service, &op)).await }
        })
        .await?;

      let invalidator = PatternInvalidator::new(store);
      for op in &report.applied {
        if let Some(tenant) = affected_tenant(op) {
          invalidator.invalidate_company_cache(&tenant).await;
        }
      }

      info!(applied = report.applied.len(), remaining = report.remaining, "Drain finished");
      println!(
        "Applied {} operations, {} remaining",
        report.applied.len(),
        report.remaining
      );
      if let Some((op, e)) = report.failed {
        return Err(eyre!("Operation {} on {} failed: {}", op.id, op.table, e));
      }
    }
  }
  Ok(())
}

/// Company whose cached data a replayed mutation makes stale.
fn affected_tenant(op: &QueuedOperation) -> Option<String> {
  let field = if op.table == COMPANIES_TABLE { "id" } else { "company_id" };
  op.data.get(field)?.as_str().map(str::to_string)
}
