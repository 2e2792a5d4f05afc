//! Host services the worker calls back into.

use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::info;
use url::Url;

use crate::push::Notification;

/// Lifecycle and UI services provided by the hosting environment.
pub trait Platform: Send + Sync + 'static {
  /// Let a freshly installed version take over without waiting for clients
  /// of the previous version to go away.
  fn skip_waiting(&self) -> Result<()>;

  /// Take control of every open client immediately.
  fn claim_clients(&self) -> Result<()>;

  fn show_notification(&self, notification: &Notification) -> Result<()>;

  fn close_notification(&self, id: &str) -> Result<()>;

  /// Open (or focus) a client window at the given URL.
  fn open_window(&self, url: &Url) -> Result<()>;
}

/// Worker lifecycle state as tracked by the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostState {
  pub skip_waiting: bool,
  pub clients_claimed: bool,
  pub notifications: BTreeMap<String, Notification>,
  pub opened_windows: Vec<Url>,
}

/// Host platform for the standalone agent: records state and logs actions.
#[derive(Default)]
pub struct HostPlatform {
  state: Mutex<HostState>,
}

impl HostPlatform {
  pub fn new() -> Self {
    Self::default()
  }

  #[cfg(test)]
  pub fn state(&self) -> Result<HostState> {
    Ok(self.lock()?.clone())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, HostState>> {
    self.state.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl Platform for HostPlatform {
  fn skip_waiting(&self) -> Result<()> {
    let mut state = self.lock()?;
    state.skip_waiting = true;
    info!(
      clients_claimed = state.clients_claimed,
      "New worker version will activate without waiting"
    );
    Ok(())
  }

  fn claim_clients(&self) -> Result<()> {
    let mut state = self.lock()?;
    state.clients_claimed = true;
    info!(skip_waiting = state.skip_waiting, "Worker claimed all clients");
    Ok(())
  }

  fn show_notification(&self, notification: &Notification) -> Result<()> {
    info!(
      id = %notification.id,
      title = %notification.title,
      url = %notification.data.url,
      "Showing notification"
    );
    self
      .lock()?
      .notifications
      .insert(notification.id.clone(), notification.clone());
    Ok(())
  }

  fn close_notification(&self, id: &str) -> Result<()> {
    self.lock()?.notifications.remove(id);
    Ok(())
  }

  fn open_window(&self, url: &Url) -> Result<()> {
    let mut state = self.lock()?;
    state.opened_windows.push(url.clone());
    info!(%url, opened = state.opened_windows.len(), "Opening window");
    Ok(())
  }
}
