//! Push message normalization and notification clicks.

use chrono::Utc;
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::config::{Config, PushConfig};
use crate::platform::Platform;

/// What a push message asks to show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationIntent {
  pub title: String,
  pub body: String,
  pub target_url: String,
}

impl NotificationIntent {
  /// Build an intent from a raw push payload.
  ///
  /// A JSON object supplies any of `title`, `body`, `url`; each field that is
  /// missing or not a string falls back on its own. Anything else is shown as
  /// plain text under the default title.
  pub fn from_payload(payload: Option<&[u8]>, defaults: &PushConfig) -> Self {
    let parsed = payload.and_then(|bytes| match serde_json::from_slice::<Value>(bytes) {
      Ok(Value::Object(fields)) => Some(fields),
      _ => None,
    });

    match parsed {
      Some(fields) => {
        let field = |name: &str| fields.get(name).and_then(Value::as_str).map(str::to_string);
        Self {
          title: non_empty(field("title")).unwrap_or_else(|| defaults.default_title.clone()),
          body: field("body").unwrap_or_default(),
          target_url: non_empty(field("url")).unwrap_or_else(|| defaults.default_url.clone()),
        }
      }
      None => Self {
        title: defaults.default_title.clone(),
        body: match payload {
          Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
          None => defaults.fallback_body.clone(),
        },
        target_url: defaults.default_url.clone(),
      },
    }
  }
}

fn non_empty(value: Option<String>) -> Option<String> {
  value.filter(|s| !s.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationData {
  pub url: String,
}

/// A notification as handed to the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
  pub id: String,
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  pub data: NotificationData,
}

/// Turns push messages into notifications and routes clicks.
pub struct PushHandler<P: Platform> {
  platform: Arc<P>,
  config: Config,
  counter: AtomicU64,
}

impl<P: Platform> PushHandler<P> {
  pub fn new(config: &Config, platform: Arc<P>) -> Self {
    Self {
      platform,
      config: config.clone(),
      counter: AtomicU64::new(0),
    }
  }

  /// Build the notification for a push payload.
  pub fn notification(&self, payload: Option<&[u8]>) -> Notification {
    let push = &self.config.push;
    let intent = NotificationIntent::from_payload(payload, push);
    let seq = self.counter.fetch_add(1, Ordering::Relaxed);

    Notification {
      id: format!("{}-{}", Utc::now().timestamp_millis(), seq),
      title: intent.title,
      body: intent.body,
      icon: push.icon.clone(),
      badge: push.badge.clone(),
      vibrate: push.vibrate.clone(),
      data: NotificationData {
        url: intent.target_url,
      },
    }
  }

  /// Show a notification for an incoming push message.
  pub fn handle_push(&self, payload: Option<&[u8]>) -> Result<Notification> {
    let notification = self.notification(payload);
    self.platform.show_notification(&notification)?;
    Ok(notification)
  }

  /// Close the clicked notification and open its target.
  pub fn handle_click(&self, notification: &Notification) -> Result<()> {
    self.platform.close_notification(&notification.id)?;

    let url = self.config.resolve(&notification.data.url)?;
    debug!(%url, "Notification clicked");
    self.platform.open_window(&url)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::platform::HostPlatform;

  fn handler() -> (PushHandler<HostPlatform>, Arc<HostPlatform>) {
    let platform = Arc::new(HostPlatform::new());
    (
      PushHandler::new(&Config::default(), Arc::clone(&platform)),
      platform,
    )
  }

  #[test]
  fn test_json_payload() {
    let intent = NotificationIntent::from_payload(
      Some(br#"{"title":"T","body":"B","url":"/x"}"#),
      &PushConfig::default(),
    );
    assert_eq!(
      intent,
      NotificationIntent {
        title: "T".to_string(),
        body: "B".to_string(),
        target_url: "/x".to_string(),
      }
    );
  }

  #[test]
  fn test_malformed_payload_uses_text() {
    let intent = NotificationIntent::from_payload(Some(b"Complaint resolved"), &PushConfig::default());
    assert_eq!(intent.title, "CitySeva Notification");
    assert_eq!(intent.body, "Complaint resolved");
    assert_eq!(intent.target_url, "/");
  }

  #[test]
  fn test_missing_payload() {
    let intent = NotificationIntent::from_payload(None, &PushConfig::default());
    assert_eq!(intent.title, "CitySeva Notification");
    assert_eq!(intent.body, "New update available");
  }

  #[test]
  fn test_partial_object_falls_back_per_field() {
    let intent = NotificationIntent::from_payload(Some(br#"{"body":"Only body"}"#), &PushConfig::default());
    assert_eq!(intent.title, "CitySeva Notification");
    assert_eq!(intent.body, "Only body");
    assert_eq!(intent.target_url, "/");
  }

  #[test]
  fn test_mistyped_field_keeps_the_others() {
    let intent = NotificationIntent::from_payload(
      Some(br#"{"title":"T","body":"B","url":5}"#),
      &PushConfig::default(),
    );
    assert_eq!(intent.title, "T");
    assert_eq!(intent.body, "B");
    assert_eq!(intent.target_url, "/");
  }

  #[test]
  fn test_non_object_json_is_plain_text() {
    let intent = NotificationIntent::from_payload(Some(b"42"), &PushConfig::default());
    assert_eq!(intent.title, "CitySeva Notification");
    assert_eq!(intent.body, "42");
  }

  #[test]
  fn test_push_then_click_opens_target() {
    let (handler, platform) = handler();

    let notification = handler
      .handle_push(Some(br#"{"title":"T","body":"B","url":"/x"}"#))
      .unwrap();
    assert_eq!(notification.icon, "/static/img/icon-192.png");
    assert_eq!(notification.badge, "/static/img/notification-badge.png");
    assert_eq!(notification.vibrate, vec![100, 50, 100]);
    assert!(platform.state().unwrap().notifications.contains_key(&notification.id));

    handler.handle_click(&notification).unwrap();
    let state = platform.state().unwrap();
    assert!(state.notifications.is_empty());
    assert_eq!(state.opened_windows.len(), 1);
    assert_eq!(state.opened_windows[0].path(), "/x");
  }

  #[test]
  fn test_notification_ids_are_unique() {
    let (handler, _platform) = handler();
    let a = handler.notification(None);
    let b = handler.notification(None);
    assert_ne!(a.id, b.id);
  }
}
