//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use url::Url;

use super::types::CachedResponse;
use crate::db::Database;
use crate::http::Response;

/// Trait for resource cache backends.
pub trait CacheStorage: Send + Sync + 'static {
  /// Store a response under the request URL, replacing any prior entry.
  fn put(&self, cache_name: &str, url: &Url, response: &Response) -> Result<()>;

  /// Store several responses atomically: either all land or none do.
  fn put_all(&self, cache_name: &str, entries: &[(Url, Response)]) -> Result<()>;

  /// Look a request up across every cache, preferring `preferred_cache`.
  fn match_request(&self, url: &Url, preferred_cache: &str) -> Result<Option<CachedResponse>>;

  /// Names of every cache holding at least one entry.
  fn cache_names(&self) -> Result<Vec<String>>;

  /// Delete a whole cache. Returns whether it existed.
  fn delete_cache(&self, cache_name: &str) -> Result<bool>;

  /// Number of entries in a cache.
  fn entry_count(&self, cache_name: &str) -> Result<usize>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteCacheStorage {
  db: Arc<Database>,
}

impl SqliteCacheStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

/// Stable, fixed-length cache key for a request URL.
///
/// Fragments never reach the network, so they are not part of the key.
pub fn request_key(url: &Url) -> String {
  let mut url = url.clone();
  url.set_fragment(None);

  let mut hasher = Sha256::new();
  hasher.update(url.as_str().as_bytes());
  hex::encode(hasher.finalize())
}

const INSERT_ENTRY: &str =
  "INSERT OR REPLACE INTO resource_cache (cache_name, request_key, url, status, headers, body, cached_at)
   VALUES (?, ?, ?, ?, ?, ?, datetime('now'))";

impl CacheStorage for SqliteCacheStorage {
  fn put(&self, cache_name: &str, url: &Url, response: &Response) -> Result<()> {
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    self
      .db
      .conn()?
      .execute(
        INSERT_ENTRY,
        params![
          cache_name,
          request_key(url),
          url.as_str(),
          response.status,
          headers,
          response.body
        ],
      )
      .map_err(|e| eyre!("Failed to store {} in {}: {}", url, cache_name, e))?;

    Ok(())
  }

  fn put_all(&self, cache_name: &str, entries: &[(Url, Response)]) -> Result<()> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for (url, response) in entries {
      let headers = serde_json::to_string(&response.headers)
        .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

      tx.execute(
        INSERT_ENTRY,
        params![
          cache_name,
          request_key(url),
          url.as_str(),
          response.status,
          headers,
          response.body
        ],
      )
      .map_err(|e| eyre!("Failed to store {} in {}: {}", url, cache_name, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn match_request(&self, url: &Url, preferred_cache: &str) -> Result<Option<CachedResponse>> {
    let conn = self.db.conn()?;

    let mut stmt = conn
      .prepare(
        "SELECT cache_name, status, headers, body, cached_at FROM resource_cache
         WHERE request_key = ?
         ORDER BY cache_name = ? DESC, cached_at DESC
         LIMIT 1",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(String, u16, String, Vec<u8>, String)> = stmt
      .query_row(params![request_key(url), preferred_cache], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
      })
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", url, e))?;

    match row {
      Some((cache_name, status, headers, body, cached_at)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        Ok(Some(CachedResponse {
          response: Response {
            status,
            headers,
            body,
          },
          cache_name,
          cached_at: parse_datetime(&cached_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self.db.conn()?;

    let mut stmt = conn
      .prepare("SELECT DISTINCT cache_name FROM resource_cache ORDER BY cache_name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }

  fn delete_cache(&self, cache_name: &str) -> Result<bool> {
    let deleted = self
      .db
      .conn()?
      .execute(
        "DELETE FROM resource_cache WHERE cache_name = ?",
        params![cache_name],
      )
      .map_err(|e| eyre!("Failed to delete cache {}: {}", cache_name, e))?;

    Ok(deleted > 0)
  }

  fn entry_count(&self, cache_name: &str) -> Result<usize> {
    let count: i64 = self
      .db
      .conn()?
      .query_row(
        "SELECT COUNT(*) FROM resource_cache WHERE cache_name = ?",
        params![cache_name],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries in {}: {}", cache_name, e))?;

    Ok(count as usize)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
