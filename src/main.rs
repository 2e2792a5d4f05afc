mod cache;
mod config;
mod db;
mod event;
mod http;
mod logging;
mod platform;
mod push;
mod queue;
mod scheduler;
mod sync;
mod worker;

use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::{CacheStorage, FetchOutcome, SqliteCacheStorage};
use crate::config::Config;
use crate::db::Database;
use crate::http::{Fetcher, HttpFetcher, Request};
use crate::platform::HostPlatform;
use crate::queue::{OfflineQueue, PendingComplaint, SqliteQueue};
use crate::scheduler::{SyncRegistry, SyncScheduler};
use crate::worker::ServiceWorker;

#[derive(Parser, Debug)]
#[command(name = "cityseva-sw")]
#[command(about = "Offline cache, background sync and push agent for CitySeva")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/cityseva-sw/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install and activate, then run background sync until interrupted
  Run,
  /// Populate the cache for the configured version
  Install,
  /// Delete old caches and claim clients
  Activate,
  /// Request a URL through the worker
  Fetch {
    url: String,
  },
  /// Queue a complaint (JSON) submitted while offline
  Enqueue {
    /// File to read from (default: stdin)
    file: Option<PathBuf>,
  },
  /// List queued complaints
  Queue,
  /// Fire a sync event now
  Sync {
    #[arg(long)]
    tag: Option<String>,
  },
  /// Deliver a push message
  Push {
    payload: Option<String>,
    /// Click the notification once shown
    #[arg(long)]
    click: bool,
  },
  /// List caches and their entry counts
  Caches,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let _guard = logging::init(&config::data_dir()?.join("logs"), args.verbose)?;

  let db = Arc::new(Database::open(&config.database_path()?)?);

  match args.command {
    Command::Run => run(&config, db).await,
    Command::Install => {
      let (worker, _) = start_worker(&config, Arc::clone(&db))?;
      worker.install().await
    }
    Command::Activate => {
      let (worker, _) = start_worker(&config, Arc::clone(&db))?;
      worker.activate().await
    }
    Command::Fetch { url } => {
      let (worker, fetcher) = start_worker(&config, Arc::clone(&db))?;
      fetch(&worker, fetcher.as_ref(), config.resolve(&url)?).await
    }
    Command::Enqueue { file } => enqueue(&config, &db, file),
    Command::Queue => {
      let queue = SqliteQueue::new(Arc::clone(&db));
      eprintln!("{} pending complaint(s)", queue.len()?);
      for registration in SyncRegistry::new(db).registrations()? {
        eprintln!(
          "sync tag {} registered {} ({} failed attempts)",
          registration.tag, registration.registered_at, registration.attempts
        );
      }
      for complaint in queue.get_all()? {
        println!("{}", serde_json::to_string(&complaint)?);
      }
      Ok(())
    }
    Command::Sync { tag } => {
      let (worker, _) = start_worker(&config, Arc::clone(&db))?;
      let tag = tag.unwrap_or_else(|| config.sync.tag.clone());
      worker.sync(&tag, false).await
    }
    Command::Push { payload, click } => {
      let (worker, _) = start_worker(&config, Arc::clone(&db))?;
      let notification = worker.push(payload.map(String::into_bytes)).await?;
      println!("{}", serde_json::to_string_pretty(&notification)?);
      if click {
        worker.notification_click(notification).await?;
      }
      Ok(())
    }
    Command::Caches => {
      let storage = SqliteCacheStorage::new(db);
      for name in storage.cache_names()? {
        let marker = if name == config.cache.version { "*" } else { " " };
        println!("{} {} ({} entries)", marker, name, storage.entry_count(&name)?);
      }
      Ok(())
    }
  }
}

fn start_worker(
  config: &Config,
  db: Arc<Database>,
) -> Result<(event::WorkerHandle, Arc<HttpFetcher>)> {
  let fetcher = Arc::new(HttpFetcher::new()?);
  let platform = Arc::new(HostPlatform::new());
  let worker = ServiceWorker::new(config, db, Arc::clone(&fetcher), platform)?;
  Ok((worker.spawn(), fetcher))
}

async fn run(config: &Config, db: Arc<Database>) -> Result<()> {
  let (worker, fetcher) = start_worker(config, Arc::clone(&db))?;

  // A failed install leaves the previous version serving
  match worker.install().await {
    Ok(()) => worker.activate().await?,
    Err(e) => warn!("Keeping previous cache version: {}", e),
  }

  info!(origin = %config.origin, "Agent running");
  let scheduler = SyncScheduler::new(config, db, worker, fetcher);
  scheduler
    .run(async {
      if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
      }
    })
    .await;

  info!("Agent stopped");
  Ok(())
}

async fn fetch(worker: &event::WorkerHandle, fetcher: &HttpFetcher, url: url::Url) -> Result<()> {
  let (response, source) = match worker.fetch(Request::get(url.clone())).await? {
    // Not intercepted: behave like the host and go to the network directly
    FetchOutcome::Passthrough => (fetcher.fetch(&Request::get(url)).await?, "passthrough".to_string()),
    FetchOutcome::Respond { response, source } => (response, format!("{:?}", source)),
    FetchOutcome::Unavailable(message) => return Err(eyre!("{} is unavailable: {}", url, message)),
  };

  eprintln!(
    "{} status {} ({})",
    source,
    response.status,
    response.header("content-type").unwrap_or("unknown type")
  );
  std::io::stdout().write_all(&response.body)?;
  Ok(())
}

/// Stand-in for the page code that queues a submission made offline.
fn enqueue(config: &Config, db: &Arc<Database>, file: Option<PathBuf>) -> Result<()> {
  let contents = match file {
    Some(path) => std::fs::read_to_string(&path)
      .map_err(|e| eyre!("Failed to read {}: {}", path.display(), e))?,
    None => {
      let mut buf = String::new();
      std::io::stdin().read_to_string(&mut buf)?;
      buf
    }
  };

  let mut value: Value =
    serde_json::from_str(&contents).map_err(|e| eyre!("Complaint is not valid JSON: {}", e))?;
  let object = value
    .as_object_mut()
    .ok_or_else(|| eyre!("Complaint must be a JSON object"))?;

  if !object.contains_key("id") {
    let digest = hex::encode(Sha256::digest(contents.as_bytes()));
    let id = format!("{}-{}", Utc::now().timestamp_millis(), &digest[..8]);
    object.insert("id".to_string(), Value::String(id));
  }

  let complaint: PendingComplaint = serde_json::from_value(value)?;
  SqliteQueue::new(Arc::clone(db)).put(&complaint)?;
  SyncRegistry::new(Arc::clone(db)).register(&config.sync.tag)?;

  info!(id = %complaint.id, "Complaint queued for sync");
  println!("{}", complaint.id);
  Ok(())
}
