//! The worker: owns every handler and dispatches lifecycle events to them.

use color_eyre::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{CacheManager, FetchOutcome, SqliteCacheStorage};
use crate::config::Config;
use crate::db::Database;
use crate::event::{self, EventHandler, WorkerEvent, WorkerHandle};
use crate::http::{Fetcher, Request};
use crate::platform::Platform;
use crate::push::{Notification, PushHandler};
use crate::queue::SqliteQueue;
use crate::sync::SyncAgent;

pub struct ServiceWorker<F: Fetcher, P: Platform> {
  cache: CacheManager<SqliteCacheStorage, F>,
  sync: SyncAgent<SqliteQueue, F>,
  push: PushHandler<P>,
  platform: Arc<P>,
}

impl<F: Fetcher, P: Platform> ServiceWorker<F, P> {
  pub fn new(config: &Config, db: Arc<Database>, fetcher: Arc<F>, platform: Arc<P>) -> Result<Self> {
    let storage = Arc::new(SqliteCacheStorage::new(Arc::clone(&db)));
    let queue = Arc::new(SqliteQueue::new(db));

    Ok(Self {
      cache: CacheManager::new(config, storage, Arc::clone(&fetcher))?,
      sync: SyncAgent::new(config, queue, fetcher)?,
      push: PushHandler::new(config, Arc::clone(&platform)),
      platform,
    })
  }

  /// Start the dispatch loop and return a handle for delivering events.
  pub fn spawn(self) -> WorkerHandle {
    let (handle, events) = event::channel();
    tokio::spawn(Arc::new(self).run(events));
    handle
  }

  /// Dispatch events until every handle is dropped.
  ///
  /// Each event runs in its own task, so a long sync never holds up fetches.
  pub async fn run(self: Arc<Self>, mut events: EventHandler) {
    while let Some(event) = events.next().await {
      debug!(event = event.name(), "Dispatching event");
      let worker = Arc::clone(&self);
      tokio::spawn(async move { worker.dispatch(event).await });
    }
    debug!("Event channel closed, worker stopping");
  }

  async fn dispatch(&self, event: WorkerEvent) {
    // A dropped receiver means the host stopped waiting; nothing to report to.
    match event {
      WorkerEvent::Install { done } => {
        let _ = done.send(self.install().await);
      }
      WorkerEvent::Activate { done } => {
        let _ = done.send(self.activate());
      }
      WorkerEvent::Fetch {
        request,
        respond_with,
      } => {
        let _ = respond_with.send(self.fetch(&request).await);
      }
      WorkerEvent::Sync {
        tag,
        last_chance,
        done,
      } => {
        let _ = done.send(self.sync(&tag, last_chance).await);
      }
      WorkerEvent::Push { payload, done } => {
        let _ = done.send(self.push.handle_push(payload.as_deref()));
      }
      WorkerEvent::NotificationClick { notification, done } => {
        let _ = done.send(self.notification_click(&notification));
      }
    }
  }

  pub async fn install(&self) -> Result<()> {
    match self.cache.install().await {
      Ok(_) => self.platform.skip_waiting(),
      Err(e) => {
        warn!(cache = self.cache.version(), "Install failed: {}", e);
        Err(e)
      }
    }
  }

  pub fn activate(&self) -> Result<()> {
    let deleted = self.cache.activate()?;
    info!(
      cache = self.cache.version(),
      deleted = deleted.len(),
      "Worker activated"
    );
    self.platform.claim_clients()
  }

  pub async fn fetch(&self, request: &Request) -> FetchOutcome {
    self.cache.handle_fetch(request).await
  }

  pub async fn sync(&self, tag: &str, last_chance: bool) -> Result<()> {
    let result = self.sync.handle_sync(tag).await;
    if let Err(e) = &result {
      if last_chance {
        warn!(tag, "Final sync attempt failed: {}", e);
      }
    }
    result
  }

  pub fn notification_click(&self, notification: &Notification) -> Result<()> {
    self.push.handle_click(notification)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheStorage, ResponseSource};
  use crate::http::testing::{MockFetcher, Reply};
  use crate::platform::HostPlatform;
  use crate::queue::{OfflineQueue, PendingComplaint};
  use serde_json::json;
  use url::Url;

  struct Harness {
    handle: WorkerHandle,
    fetcher: Arc<MockFetcher>,
    platform: Arc<HostPlatform>,
    db: Arc<Database>,
    config: Config,
  }

  fn harness() -> Harness {
    let mut config = Config::default();
    config.cache.manifest = vec!["/".to_string(), "/static/offline.html".to_string()];

    let db = Arc::new(Database::open_in_memory().unwrap());
    let fetcher = Arc::new(MockFetcher::new());
    let platform = Arc::new(HostPlatform::new());
    let worker = ServiceWorker::new(
      &config,
      Arc::clone(&db),
      Arc::clone(&fetcher),
      Arc::clone(&platform),
    )
    .unwrap();

    Harness {
      handle: worker.spawn(),
      fetcher,
      platform,
      db,
      config,
    }
  }

  impl Harness {
    fn url(&self, path: &str) -> Url {
      self.config.resolve(path).unwrap()
    }

    fn route(&self, path: &str, reply: Reply) {
      self.fetcher.route(self.url(path).as_str(), reply);
    }
  }

  #[tokio::test]
  async fn test_install_then_activate() {
    let h = harness();
    h.route("/", Reply::Status(200, "home"));
    h.route("/static/offline.html", Reply::Status(200, "offline"));
    SqliteCacheStorage::new(Arc::clone(&h.db))
      .put("cityseva-v0", &h.url("/"), &crate::http::Response::new(200, "old"))
      .unwrap();

    h.handle.install().await.unwrap();
    assert!(h.platform.state().unwrap().skip_waiting);

    h.handle.activate().await.unwrap();
    assert!(h.platform.state().unwrap().clients_claimed);
    assert_eq!(
      SqliteCacheStorage::new(Arc::clone(&h.db)).cache_names().unwrap(),
      vec!["cityseva-v1".to_string()]
    );
  }

  #[tokio::test]
  async fn test_failed_install_does_not_skip_waiting() {
    let h = harness();
    h.route("/", Reply::Status(200, "home"));

    assert!(h.handle.install().await.is_err());
    assert!(!h.platform.state().unwrap().skip_waiting);
  }

  #[tokio::test]
  async fn test_fetch_after_going_offline() {
    let h = harness();
    h.route("/", Reply::Status(200, "home"));
    h.route("/static/offline.html", Reply::Status(200, "offline"));
    h.handle.install().await.unwrap();

    h.route("/", Reply::NetworkError);
    let outcome = h.handle.fetch(Request::get(h.url("/"))).await.unwrap();
    assert_eq!(outcome.source(), Some(ResponseSource::Cache));

    let outcome = h
      .handle
      .fetch(Request::get(h.url("/citizen/dashboard")))
      .await
      .unwrap();
    assert_eq!(outcome.source(), Some(ResponseSource::OfflinePage));
  }

  #[tokio::test]
  async fn test_sync_event_drains_queue() {
    let h = harness();
    let queue = SqliteQueue::new(Arc::clone(&h.db));
    let complaint: PendingComplaint =
      serde_json::from_value(json!({"id": "c1", "category": "roads"})).unwrap();
    queue.put(&complaint).unwrap();

    h.route("/api/complaints", Reply::Status(500, "down"));
    assert!(h.handle.sync("sync-complaints", false).await.is_err());
    assert_eq!(queue.len().unwrap(), 1);

    h.route("/api/complaints", Reply::Status(201, "created"));
    h.handle.sync("sync-complaints", true).await.unwrap();
    assert_eq!(queue.len().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_push_and_click() {
    let h = harness();

    let notification = h
      .handle
      .push(Some(br#"{"title":"Status update","body":"Resolved","url":"/citizen/complaints"}"#.to_vec()))
      .await
      .unwrap();
    assert_eq!(notification.title, "Status update");

    h.handle.notification_click(notification).await.unwrap();
    let state = h.platform.state().unwrap();
    assert_eq!(state.opened_windows, vec![h.url("/citizen/complaints")]);
  }

  #[tokio::test]
  async fn test_handle_fails_once_worker_is_gone() {
    let (handle, events) = event::channel();
    drop(events);
    assert!(handle.install().await.is_err());
  }
}
