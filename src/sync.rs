//! Re-submission of complaints queued while offline.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Config;
use crate::http::{Fetcher, Request};
use crate::queue::{OfflineQueue, PendingComplaint};

/// Outcome of one drain of the offline queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
  /// Ids acknowledged by the backend and removed from the queue
  pub synced: Vec<String>,
  /// Ids still queued after this pass
  pub failed: Vec<String>,
}

impl SyncReport {
  pub fn is_complete(&self) -> bool {
    self.failed.is_empty()
  }

  /// Fail the sync event if anything is still queued.
  pub fn into_result(self) -> Result<Self> {
    if self.is_complete() {
      Ok(self)
    } else {
      Err(eyre!(
        "{} complaint(s) failed to sync: {}",
        self.failed.len(),
        self.failed.join(", ")
      ))
    }
  }
}

/// Drains the offline queue against the backend.
pub struct SyncAgent<Q: OfflineQueue, F: Fetcher> {
  queue: Arc<Q>,
  fetcher: Arc<F>,
  tag: String,
  endpoint: Url,
}

impl<Q: OfflineQueue, F: Fetcher> SyncAgent<Q, F> {
  pub fn new(config: &Config, queue: Arc<Q>, fetcher: Arc<F>) -> Result<Self> {
    Ok(Self {
      queue,
      fetcher,
      tag: config.sync.tag.clone(),
      endpoint: config.resolve(&config.sync.endpoint)?,
    })
  }

  #[cfg(test)]
  pub fn queue(&self) -> &Q {
    &self.queue
  }

  /// Handle a sync event. Unknown tags complete without doing anything.
  pub async fn handle_sync(&self, tag: &str) -> Result<()> {
    if tag != self.tag {
      debug!(tag, "Ignoring sync event with unknown tag");
      return Ok(());
    }

    self.sync_complaints().await.map(|_| ())
  }

  /// Drain the queue, failing if any complaint is still pending afterwards.
  pub async fn sync_complaints(&self) -> Result<SyncReport> {
    self.drain().await?.into_result()
  }

  /// Attempt every queued complaint once.
  ///
  /// Only a failure to read the queue is an error here; per-record failures
  /// are collected in the report.
  pub async fn drain(&self) -> Result<SyncReport> {
    let pending = self.queue.get_all()?;
    let mut report = SyncReport::default();

    if pending.is_empty() {
      debug!("Offline queue is empty");
      return Ok(report);
    }

    info!(count = pending.len(), "Syncing offline complaints");

    for complaint in pending {
      match self.resubmit(&complaint).await {
        Ok(()) => report.synced.push(complaint.id),
        Err(e) => {
          warn!(id = %complaint.id, "Complaint sync failed: {}", e);
          report.failed.push(complaint.id);
        }
      }
    }

    info!(
      synced = report.synced.len(),
      failed = report.failed.len(),
      "Offline sync pass finished"
    );

    Ok(report)
  }

  /// POST one complaint and drop it from the queue once acknowledged.
  async fn resubmit(&self, complaint: &PendingComplaint) -> Result<()> {
    let request = Request::post_json(self.endpoint.clone(), complaint.to_json()?);
    let response = self.fetcher.fetch(&request).await?;

    if !response.is_success() {
      return Err(eyre!("backend returned status {}", response.status));
    }

    self.queue.delete(&complaint.id)
  }
}
