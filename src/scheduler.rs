//! Background sync: registrations, connectivity monitoring and retries.
//!
//! This is the host side of the sync event. Page code registers a tag when it
//! queues work; the scheduler fires a sync event for that tag whenever the
//! origin is reachable, and backs off between failed attempts.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{Config, SyncConfig};
use crate::db::Database;
use crate::event::WorkerHandle;
use crate::http::{Fetcher, Request};

/// A pending request to run a sync event for `tag`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRegistration {
  pub tag: String,
  /// Failed attempts so far
  pub attempts: u32,
  /// Earliest time of the next attempt; `None` means as soon as possible
  pub next_attempt_at: Option<DateTime<Utc>>,
  pub registered_at: DateTime<Utc>,
  /// Stored `registered_at` text; identifies this registration in updates
  stamp: String,
}

impl SyncRegistration {
  pub fn is_due(&self, now: DateTime<Utc>) -> bool {
    self.next_attempt_at.map_or(true, |at| at <= now)
  }
}

/// Persistent sync registrations, shared between processes via SQLite.
pub struct SyncRegistry {
  db: Arc<Database>,
}

impl SyncRegistry {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  /// Register (or re-arm) a tag. Resets its attempt count.
  pub fn register(&self, tag: &str) -> Result<()> {
    self
      .db
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO sync_registrations (tag, attempts, next_attempt_at, registered_at)
         VALUES (?, 0, NULL, ?)",
        params![tag, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to register sync tag {}: {}", tag, e))?;

    Ok(())
  }

  pub fn registrations(&self) -> Result<Vec<SyncRegistration>> {
    let conn = self.db.conn()?;

    let mut stmt = conn
      .prepare(
        "SELECT tag, attempts, next_attempt_at, registered_at FROM sync_registrations
         ORDER BY registered_at",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, u32>(1)?,
          row.get::<_, Option<String>>(2)?,
          row.get::<_, String>(3)?,
        ))
      })
      .map_err(|e| eyre!("Failed to read sync registrations: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read sync registration: {}", e))?;

    rows
      .into_iter()
      .map(|(tag, attempts, next, registered)| {
        Ok(SyncRegistration {
          tag,
          attempts,
          next_attempt_at: next.as_deref().map(parse_timestamp).transpose()?,
          registered_at: parse_timestamp(&registered)?,
          stamp: registered,
        })
      })
      .collect()
  }

  /// Record a failed attempt and when to try again.
  ///
  /// Returns the new attempt count, or `None` if the tag was re-registered
  /// since `registration` was read.
  pub fn record_failure(
    &self,
    registration: &SyncRegistration,
    next_attempt_at: DateTime<Utc>,
  ) -> Result<Option<u32>> {
    let tag = &registration.tag;
    let updated = self
      .db
      .conn()?
      .execute(
        "UPDATE sync_registrations SET attempts = attempts + 1, next_attempt_at = ?
         WHERE tag = ? AND registered_at = ?",
        params![next_attempt_at.to_rfc3339(), tag, registration.stamp],
      )
      .map_err(|e| eyre!("Failed to update sync tag {}: {}", tag, e))?;

    Ok((updated > 0).then_some(registration.attempts + 1))
  }

  /// Remove `registration` unless the tag was re-registered since it was read.
  /// Returns whether a row was deleted.
  pub fn remove(&self, registration: &SyncRegistration) -> Result<bool> {
    let tag = &registration.tag;
    let deleted = self
      .db
      .conn()?
      .execute(
        "DELETE FROM sync_registrations WHERE tag = ? AND registered_at = ?",
        params![tag, registration.stamp],
      )
      .map_err(|e| eyre!("Failed to remove sync tag {}: {}", tag, e))?;

    Ok(deleted > 0)
  }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse timestamp '{}': {}", s, e))
}

/// Longest delay between two sync attempts.
pub const MAX_BACKOFF_SECS: u64 = 7 * 24 * 60 * 60;

/// Bounded exponential backoff between sync attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub initial_backoff: Duration,
  pub multiplier: u32,
}

impl RetryPolicy {
  pub fn from_config(config: &SyncConfig) -> Self {
    let initial = config.initial_backoff_secs.min(MAX_BACKOFF_SECS);
    Self {
      max_attempts: config.max_attempts,
      initial_backoff: Duration::seconds(i64::try_from(initial).unwrap_or(i64::MAX)),
      multiplier: config.backoff_multiplier,
    }
  }

  /// Delay after the given number of failed attempts (at least one), capped
  /// at `MAX_BACKOFF_SECS`.
  pub fn backoff(&self, failed_attempts: u32) -> Duration {
    let cap = Duration::seconds(MAX_BACKOFF_SECS as i64);
    let exponent = failed_attempts.saturating_sub(1);
    let factor = self.multiplier.max(1).saturating_pow(exponent);

    i32::try_from(factor)
      .ok()
      .and_then(|factor| self.initial_backoff.checked_mul(factor))
      .map_or(cap, |backoff| backoff.min(cap))
  }

  /// Whether the next attempt is the final one.
  pub fn is_last_chance(&self, failed_attempts: u32) -> bool {
    failed_attempts + 1 >= self.max_attempts
  }
}

/// What happened to one registration during a dispatch pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAttempt {
  Succeeded { tag: String },
  Retrying { tag: String, attempts: u32 },
  GaveUp { tag: String, attempts: u32 },
}

/// Fires sync events while the origin is reachable.
pub struct SyncScheduler<F: Fetcher> {
  registry: SyncRegistry,
  worker: WorkerHandle,
  fetcher: Arc<F>,
  policy: RetryPolicy,
  probe_url: Url,
  probe_interval: std::time::Duration,
  online: bool,
}

impl<F: Fetcher> SyncScheduler<F> {
  pub fn new(config: &Config, db: Arc<Database>, worker: WorkerHandle, fetcher: Arc<F>) -> Self {
    Self {
      registry: SyncRegistry::new(db),
      worker,
      fetcher,
      policy: RetryPolicy::from_config(&config.sync),
      probe_url: config.origin.clone(),
      probe_interval: std::time::Duration::from_secs(config.sync.probe_interval_secs.max(1)),
      online: false,
    }
  }

  /// Probe and dispatch until `shutdown` resolves.
  pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
    let mut interval = tokio::time::interval(self.probe_interval);
    tokio::pin!(shutdown);

    loop {
      tokio::select! {
        _ = interval.tick() => {
          if let Err(e) = self.tick().await {
            warn!("Sync scheduler pass failed: {}", e);
          }
        }
        _ = &mut shutdown => break,
      }
    }

    debug!("Sync scheduler stopped");
  }

  async fn tick(&mut self) -> Result<()> {
    let reachable = self.probe().await;

    if !reachable {
      if self.online {
        info!("Connectivity lost");
      }
      self.online = false;
      return Ok(());
    }

    if !self.online {
      info!("Connectivity restored");
      self.online = true;
    }

    for attempt in self.dispatch_due(Utc::now()).await? {
      debug!(?attempt, "Sync dispatched");
    }
    Ok(())
  }

  /// Any HTTP response from the origin counts as being online.
  async fn probe(&self) -> bool {
    self
      .fetcher
      .fetch(&Request::get(self.probe_url.clone()))
      .await
      .is_ok()
  }

  /// Fire a sync event for every registration due at `now`.
  pub async fn dispatch_due(&self, now: DateTime<Utc>) -> Result<Vec<SyncAttempt>> {
    let mut attempts = Vec::new();

    for registration in self.registry.registrations()? {
      if !registration.is_due(now) {
        continue;
      }

      let tag = registration.tag.clone();
      let last_chance = self.policy.is_last_chance(registration.attempts);

      // Only the dispatched registration is cleared; one made while the event
      // ran stays armed.
      match self.worker.sync(&tag, last_chance).await {
        Ok(()) => {
          info!(%tag, "Sync completed");
          if !self.registry.remove(&registration)? {
            debug!(%tag, "Tag re-registered during sync, keeping it");
          }
          attempts.push(SyncAttempt::Succeeded { tag });
        }
        Err(e) => {
          let failed = registration.attempts + 1;
          if failed >= self.policy.max_attempts {
            warn!(%tag, attempts = failed, "Giving up on sync: {}", e);
            if !self.registry.remove(&registration)? {
              debug!(%tag, "Tag re-registered during sync, keeping it");
            }
            attempts.push(SyncAttempt::GaveUp {
              tag,
              attempts: failed,
            });
          } else {
            let next = now
              .checked_add_signed(self.policy.backoff(failed))
              .unwrap_or(now);
            warn!(%tag, attempts = failed, retry_at = %next, "Sync failed, will retry: {}", e);
            match self.registry.record_failure(&registration, next)? {
              Some(recorded) => attempts.push(SyncAttempt::Retrying {
                tag,
                attempts: recorded,
              }),
              None => debug!(%tag, "Tag re-registered during sync, retrying as new"),
            }
          }
        }
      }
    }

    Ok(attempts)
  }
}
