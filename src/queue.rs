//! Persistent store of complaints submitted while offline.

use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::db::Database;

/// A complaint waiting to be re-submitted.
///
/// Only `id` is interpreted; every other field is carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingComplaint {
  #[serde(deserialize_with = "deserialize_id")]
  pub id: String,
  #[serde(flatten)]
  pub payload: Map<String, Value>,
}

/// Accept string or numeric ids, normalizing to a string.
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
  D: Deserializer<'de>,
{
  match Value::deserialize(deserializer)? {
    Value::String(s) if !s.is_empty() => Ok(s),
    Value::Number(n) => Ok(n.to_string()),
    other => Err(serde::de::Error::custom(format!(
      "complaint id must be a non-empty string or number, got {}",
      other
    ))),
  }
}

impl PendingComplaint {
  pub fn new(id: impl Into<String>, payload: Map<String, Value>) -> Self {
    Self {
      id: id.into(),
      payload,
    }
  }

  /// JSON body sent to the backend, including the id.
  pub fn to_json(&self) -> Result<Vec<u8>> {
    serde_json::to_vec(self).map_err(|e| eyre!("Failed to serialize complaint {}: {}", self.id, e))
  }
}

/// Trait for offline queue backends.
pub trait OfflineQueue: Send + Sync + 'static {
  /// Insert or overwrite a record keyed by its id.
  fn put(&self, complaint: &PendingComplaint) -> Result<()>;

  /// Every stored record.
  fn get_all(&self) -> Result<Vec<PendingComplaint>>;

  /// Remove a record. Absent ids are a no-op.
  fn delete(&self, id: &str) -> Result<()>;

  fn len(&self) -> Result<usize>;
}

/// SQLite-backed offline queue.
pub struct SqliteQueue {
  db: Arc<Database>,
}

impl SqliteQueue {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

impl OfflineQueue for SqliteQueue {
  fn put(&self, complaint: &PendingComplaint) -> Result<()> {
    let data = complaint.to_json()?;

    self
      .db
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO offline_complaints (id, data, queued_at)
         VALUES (?, ?, datetime('now'))",
        params![complaint.id, data],
      )
      .map_err(|e| eyre!("Failed to queue complaint {}: {}", complaint.id, e))?;

    Ok(())
  }

  fn get_all(&self) -> Result<Vec<PendingComplaint>> {
    let conn = self.db.conn()?;

    let mut stmt = conn
      .prepare("SELECT data FROM offline_complaints ORDER BY queued_at, rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| row.get::<_, Vec<u8>>(0))
      .map_err(|e| eyre!("Failed to read offline complaints: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read offline complaint: {}", e))?;

    rows
      .iter()
      .map(|data| {
        serde_json::from_slice(data).map_err(|e| eyre!("Failed to deserialize complaint: {}", e))
      })
      .collect()
  }

  fn delete(&self, id: &str) -> Result<()> {
    self
      .db
      .conn()?
      .execute("DELETE FROM offline_complaints WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete complaint {}: {}", id, e))?;

    Ok(())
  }

  fn len(&self) -> Result<usize> {
    let count: i64 = self
      .db
      .conn()?
      .query_row("SELECT COUNT(*) FROM offline_complaints", [], |row| {
        row.get(0)
      })
      .map_err(|e| eyre!("Failed to count offline complaints: {}", e))?;

    Ok(count as usize)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn queue() -> SqliteQueue {
    SqliteQueue::new(Arc::new(Database::open_in_memory().unwrap()))
  }

  fn complaint(id: &str) -> PendingComplaint {
    serde_json::from_value(json!({
      "id": id,
      "category": "roads",
      "description": "Pothole near the market",
      "latitude": 22.57,
      "longitude": 88.36
    }))
    .unwrap()
  }

  #[test]
  fn test_put_and_get_all() {
    let queue = queue();
    queue.put(&complaint("a")).unwrap();
    queue.put(&complaint("b")).unwrap();

    let all = queue.get_all().unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0], complaint("a"));
    assert_eq!(all[0].payload["category"], "roads");
  }

  #[test]
  fn test_put_overwrites_same_id() {
    let queue = queue();
    queue.put(&complaint("a")).unwrap();
    let mut updated = complaint("a");
    updated
      .payload
      .insert("category".to_string(), json!("water"));
    queue.put(&updated).unwrap();

    let all = queue.get_all().unwrap();
    assert_eq!(all, vec![updated]);
  }

  #[test]
  fn test_delete_absent_id_is_noop() {
    let queue = queue();
    queue.put(&complaint("a")).unwrap();

    queue.delete("missing").unwrap();
    assert_eq!(queue.len().unwrap(), 1);

    queue.delete("a").unwrap();
    assert_eq!(queue.len().unwrap(), 0);
  }

  #[test]
  fn test_numeric_id_is_normalized() {
    let parsed: PendingComplaint =
      serde_json::from_value(json!({"id": 1700000000123u64, "category": "waste"})).unwrap();
    assert_eq!(parsed.id, "1700000000123");
  }

  #[test]
  fn test_missing_id_is_rejected() {
    let parsed = serde_json::from_value::<PendingComplaint>(json!({"category": "waste"}));
    assert!(parsed.is_err());
  }

  #[test]
  fn test_json_body_includes_id_and_payload() {
    let body = complaint("a").to_json().unwrap();
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["id"], "a");
    assert_eq!(value["description"], "Pothole near the market");
  }
}
