use color_eyre::{eyre::eyre, Result};
use tokio::sync::{mpsc, oneshot};

use crate::cache::FetchOutcome;
use crate::http::Request;
use crate::push::Notification;

/// Completion slot of an extendable event. The event stays open until the
/// handler sends its result.
pub type Completion<T = ()> = oneshot::Sender<Result<T>>;

/// Lifecycle events delivered to the worker
#[derive(Debug)]
pub enum WorkerEvent {
  /// Populate the cache for a new version
  Install { done: Completion },
  /// Retire old caches and take control of clients
  Activate { done: Completion },
  /// A client request to answer
  Fetch {
    request: Request,
    respond_with: oneshot::Sender<FetchOutcome>,
  },
  /// Connectivity is available for a registered sync tag
  Sync {
    tag: String,
    /// No further retries follow if this attempt fails
    last_chance: bool,
    done: Completion,
  },
  /// A push message arrived
  Push {
    payload: Option<Vec<u8>>,
    done: Completion<Notification>,
  },
  /// The user clicked a notification
  NotificationClick {
    notification: Notification,
    done: Completion,
  },
}

impl WorkerEvent {
  pub fn name(&self) -> &'static str {
    match self {
      Self::Install { .. } => "install",
      Self::Activate { .. } => "activate",
      Self::Fetch { .. } => "fetch",
      Self::Sync { .. } => "sync",
      Self::Push { .. } => "push",
      Self::NotificationClick { .. } => "notificationclick",
    }
  }
}

/// Create a connected handle/receiver pair.
pub fn channel() -> (WorkerHandle, EventHandler) {
  let (tx, rx) = mpsc::unbounded_channel();
  (WorkerHandle { tx }, EventHandler { rx })
}

/// Receiving end consumed by the worker dispatch loop
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<WorkerEvent>,
}

impl EventHandler {
  /// Receive the next event. Returns `None` once every handle is dropped.
  pub async fn next(&mut self) -> Option<WorkerEvent> {
    self.rx.recv().await
  }
}

/// Sending side used by the host to deliver events.
///
/// Every method resolves only after the worker has finished handling the
/// event, including all of its asynchronous work.
#[derive(Clone)]
pub struct WorkerHandle {
  tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl WorkerHandle {
  pub async fn install(&self) -> Result<()> {
    self.extend(|done| WorkerEvent::Install { done }).await
  }

  pub async fn activate(&self) -> Result<()> {
    self.extend(|done| WorkerEvent::Activate { done }).await
  }

  pub async fn fetch(&self, request: Request) -> Result<FetchOutcome> {
    let (respond_with, rx) = oneshot::channel();
    self.send(WorkerEvent::Fetch {
      request,
      respond_with,
    })?;
    rx.await
      .map_err(|_| eyre!("Worker dropped fetch event without responding"))
  }

  pub async fn sync(&self, tag: &str, last_chance: bool) -> Result<()> {
    let tag = tag.to_string();
    self
      .extend(|done| WorkerEvent::Sync {
        tag,
        last_chance,
        done,
      })
      .await
  }

  pub async fn push(&self, payload: Option<Vec<u8>>) -> Result<Notification> {
    self.extend(|done| WorkerEvent::Push { payload, done }).await
  }

  pub async fn notification_click(&self, notification: Notification) -> Result<()> {
    self
      .extend(|done| WorkerEvent::NotificationClick { notification, done })
      .await
  }

  async fn extend<T>(&self, build: impl FnOnce(Completion<T>) -> WorkerEvent) -> Result<T> {
    let (done, rx) = oneshot::channel();
    self.send(build(done))?;
    rx.await
      .map_err(|_| eyre!("Worker dropped event before completing it"))?
  }

  fn send(&self, event: WorkerEvent) -> Result<()> {
    let name = event.name();
    self
      .tx
      .send(event)
      .map_err(|_| eyre!("Worker is not running, {} event lost", name))
  }
}
