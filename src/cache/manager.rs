//! Cache manager that orchestrates install, activation and request serving.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use super::storage::CacheStorage;
use super::types::{FetchOutcome, ResponseSource};
use crate::config::Config;
use crate::http::{Fetcher, Method, Request, Response};

/// Manages the versioned resource cache.
///
/// The manager sits between clients and the network, answering GET requests
/// network-first and falling back to cached copies when the network fails.
pub struct CacheManager<S: CacheStorage, F: Fetcher> {
  storage: Arc<S>,
  fetcher: Arc<F>,
  /// Current cache name
  version: String,
  /// Manifest entries resolved against the origin
  manifest: Vec<Url>,
  offline_page: Url,
  bypass_paths: Vec<String>,
  bypass_hosts: Vec<String>,
}

impl<S: CacheStorage, F: Fetcher> CacheManager<S, F> {
  pub fn new(config: &Config, storage: Arc<S>, fetcher: Arc<F>) -> Result<Self> {
    let manifest = config
      .cache
      .manifest
      .iter()
      .map(|entry| config.resolve(entry))
      .collect::<Result<Vec<_>>>()?;

    Ok(Self {
      storage,
      fetcher,
      version: config.cache.version.clone(),
      manifest,
      offline_page: config.resolve(&config.cache.offline_page)?,
      bypass_paths: config.cache.bypass_paths.clone(),
      bypass_hosts: config.cache.bypass_hosts.clone(),
    })
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  #[cfg(test)]
  pub fn storage(&self) -> &S {
    &self.storage
  }

  /// Whether the fetch handler answers this request at all.
  ///
  /// Only GET requests are handled; API calls and map tiles always go
  /// straight to the network.
  pub fn intercepts(&self, request: &Request) -> bool {
    if request.method != Method::GET {
      return false;
    }

    let url = request.url.as_str();
    if self.bypass_paths.iter().any(|p| url.contains(p.as_str())) {
      return false;
    }

    match request.url.host_str() {
      Some(host) => !self
        .bypass_hosts
        .iter()
        .any(|h| host == h || host.ends_with(&format!(".{}", h))),
      None => true,
    }
  }

  /// Populate the current cache from the manifest.
  ///
  /// Every entry must fetch with a 2xx status; otherwise nothing is stored
  /// and the install fails. Returns the number of cached entries.
  pub async fn install(&self) -> Result<usize> {
    info!(cache = %self.version, entries = self.manifest.len(), "Installing cache");

    let fetches = self.manifest.iter().map(|url| self.fetch_manifest_entry(url));

    let entries = try_join_all(fetches)
      .await
      .map_err(|e| eyre!("Install of {} failed: {}", self.version, e))?;

    self.storage.put_all(&self.version, &entries)?;
    info!(cache = %self.version, "Cache installed");

    Ok(entries.len())
  }

  async fn fetch_manifest_entry(&self, url: &Url) -> Result<(Url, Response)> {
    let response = self.fetcher.fetch(&Request::get(url.clone())).await?;
    if !response.is_success() {
      return Err(eyre!(
        "Manifest entry {} returned status {}",
        url,
        response.status
      ));
    }
    Ok((url.clone(), response))
  }

  /// Delete every cache other than the current version.
  ///
  /// Returns the names of the deleted caches.
  pub fn activate(&self) -> Result<Vec<String>> {
    let mut deleted = Vec::new();

    for name in self.storage.cache_names()? {
      if name != self.version {
        info!(cache = %name, "Deleting old cache");
        self.storage.delete_cache(&name)?;
        deleted.push(name);
      }
    }

    Ok(deleted)
  }

  /// Answer a request network-first.
  ///
  /// 1. Fetch from network; on 2xx, store a copy and return it
  /// 2. On network error or non-2xx, return the cached response
  /// 3. Without a cached response, return the offline page
  pub async fn handle_fetch(&self, request: &Request) -> FetchOutcome {
    if !self.intercepts(request) {
      return FetchOutcome::Passthrough;
    }

    let failure = match self.fetcher.fetch(request).await {
      Ok(response) if response.is_success() => {
        // Caching is best-effort
        if let Err(e) = self.storage.put(&self.version, &request.url, &response) {
          warn!(url = %request.url, "Failed to cache response: {}", e);
        }
        return FetchOutcome::respond(response, ResponseSource::Network);
      }
      Ok(response) => {
        debug!(url = %request.url, status = response.status, "Non-2xx response, trying cache");
        Failure::Status(response)
      }
      Err(e) => {
        debug!(url = %request.url, "Network failed, trying cache: {}", e);
        Failure::Network(e.to_string())
      }
    };

    if let Some(cached) = self.lookup(&request.url) {
      return FetchOutcome::respond(cached, ResponseSource::Cache);
    }

    if let Some(offline) = self.lookup(&self.offline_page) {
      return FetchOutcome::respond(offline, ResponseSource::OfflinePage);
    }

    warn!(url = %request.url, "Offline page missing from cache");
    match failure {
      Failure::Status(response) => FetchOutcome::respond(response, ResponseSource::Network),
      Failure::Network(message) => FetchOutcome::Unavailable(message),
    }
  }

  fn lookup(&self, url: &Url) -> Option<Response> {
    match self.storage.match_request(url, &self.version) {
      Ok(Some(cached)) => {
        debug!(%url, cache = %cached.cache_name, cached_at = %cached.cached_at, "Cache hit");
        Some(cached.response)
      }
      Ok(None) => None,
      Err(e) => {
        warn!(%url, "Cache lookup failed: {}", e);
        None
      }
    }
  }
}

/// Why the network path did not produce a cacheable response.
enum Failure {
  Status(Response),
  Network(String),
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteCacheStorage;
  use crate::db::Database;
  use crate::http::testing::{MockFetcher, Reply};

  const ORIGIN: &str = "http://127.0.0.1:5000";

  fn config() -> Config {
    let mut config = Config::default();
    config.cache.manifest = vec![
      "/".to_string(),
      "/static/offline.html".to_string(),
      "https://cdn.jsdelivr.net/npm/chart.js".to_string(),
    ];
    config
  }

  fn manager(config: &Config) -> (CacheManager<SqliteCacheStorage, MockFetcher>, Arc<MockFetcher>) {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let storage = Arc::new(SqliteCacheStorage::new(db));
    let fetcher = Arc::new(MockFetcher::new());
    let manager = CacheManager::new(config, storage, Arc::clone(&fetcher)).unwrap();
    (manager, fetcher)
  }

  fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
  }

  fn route_manifest(fetcher: &MockFetcher) {
    fetcher.route(&url("/").to_string(), Reply::Status(200, "home"));
    fetcher.route(
      &url("/static/offline.html").to_string(),
      Reply::Status(200, "offline"),
    );
    fetcher.route(
      "https://cdn.jsdelivr.net/npm/chart.js",
      Reply::Status(200, "chart"),
    );
  }

  #[tokio::test]
  async fn test_install_caches_every_manifest_entry() {
    let config = config();
    let (manager, fetcher) = manager(&config);
    route_manifest(&fetcher);

    assert_eq!(manager.install().await.unwrap(), 3);
    for entry in &config.cache.manifest {
      let u = config.resolve(entry).unwrap();
      assert!(manager
        .storage()
        .match_request(&u, "cityseva-v1")
        .unwrap()
        .is_some());
    }
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let config = config();
    let (manager, fetcher) = manager(&config);
    route_manifest(&fetcher);
    fetcher.route(
      "https://cdn.jsdelivr.net/npm/chart.js",
      Reply::Status(404, "missing"),
    );

    assert!(manager.install().await.is_err());
    assert_eq!(manager.storage().entry_count("cityseva-v1").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_activate_removes_other_versions() {
    let config = config();
    let (manager, fetcher) = manager(&config);
    route_manifest(&fetcher);
    manager
      .storage()
      .put("cityseva-v0", &url("/"), &Response::new(200, "stale"))
      .unwrap();
    manager.install().await.unwrap();

    let deleted = manager.activate().unwrap();
    assert_eq!(deleted, vec!["cityseva-v0".to_string()]);
    assert_eq!(
      manager.storage().cache_names().unwrap(),
      vec!["cityseva-v1".to_string()]
    );
  }

  #[tokio::test]
  async fn test_network_success_is_returned_and_cached() {
    let config = config();
    let (manager, fetcher) = manager(&config);
    fetcher.route(&url("/citizen/profile").to_string(), Reply::Status(200, "profile"));

    let outcome = manager.handle_fetch(&Request::get(url("/citizen/profile"))).await;
    assert_eq!(outcome.source(), Some(ResponseSource::Network));
    assert_eq!(outcome.response().unwrap().body, b"profile");

    let cached = manager
      .storage()
      .match_request(&url("/citizen/profile"), "cityseva-v1")
      .unwrap()
      .unwrap();
    assert_eq!(cached.response.body, b"profile");
  }

  #[tokio::test]
  async fn test_network_failure_serves_cached_copy() {
    let config = config();
    let (manager, _fetcher) = manager(&config);
    manager
      .storage()
      .put("cityseva-v1", &url("/citizen/profile"), &Response::new(200, "cached"))
      .unwrap();

    let outcome = manager.handle_fetch(&Request::get(url("/citizen/profile"))).await;
    assert_eq!(outcome.source(), Some(ResponseSource::Cache));
    assert_eq!(outcome.response().unwrap().body, b"cached");
  }

  #[tokio::test]
  async fn test_non_success_status_falls_back_without_caching() {
    let config = config();
    let (manager, fetcher) = manager(&config);
    fetcher.route(&url("/citizen/profile").to_string(), Reply::Status(500, "boom"));
    manager
      .storage()
      .put("cityseva-v1", &url("/citizen/profile"), &Response::new(200, "cached"))
      .unwrap();

    let outcome = manager.handle_fetch(&Request::get(url("/citizen/profile"))).await;
    assert_eq!(outcome.source(), Some(ResponseSource::Cache));
    assert_eq!(outcome.response().unwrap().body, b"cached");
  }

  #[tokio::test]
  async fn test_offline_page_is_last_resort() {
    let config = config();
    let (manager, _fetcher) = manager(&config);
    manager
      .storage()
      .put(
        "cityseva-v1",
        &url("/static/offline.html"),
        &Response::new(200, "offline"),
      )
      .unwrap();

    let outcome = manager.handle_fetch(&Request::get(url("/never-seen"))).await;
    assert_eq!(outcome.source(), Some(ResponseSource::OfflinePage));
    assert_eq!(outcome.response().unwrap().body, b"offline");
  }

  #[tokio::test]
  async fn test_unavailable_without_offline_page() {
    let config = config();
    let (manager, _fetcher) = manager(&config);

    let outcome = manager.handle_fetch(&Request::get(url("/never-seen"))).await;
    assert!(matches!(outcome, FetchOutcome::Unavailable(_)));
  }

  #[tokio::test]
  async fn test_excluded_requests_pass_through() {
    let config = config();
    let (manager, fetcher) = manager(&config);

    let post = Request::post_json(url("/citizen/complaints"), b"{}".to_vec());
    let api = Request::get(url("/api/stats/overview"));
    let maps = Request::get(Url::parse("https://maps.googleapis.com/maps/api/js").unwrap());
    let tiles = Request::get(Url::parse("https://khms0.maps.googleapis.com/kh?v=979").unwrap());

    for request in [post, api, maps, tiles] {
      let outcome = manager.handle_fetch(&request).await;
      assert!(matches!(outcome, FetchOutcome::Passthrough));
    }
    assert!(fetcher.calls().is_empty());
    assert!(manager.storage().cache_names().unwrap().is_empty());
  }

  #[test]
  fn test_bypass_host_does_not_match_lookalike_domain() {
    let config = config();
    let (manager, _fetcher) = manager(&config);

    let lookalike = Url::parse("https://notmaps.googleapis.com.example/tile.png").unwrap();
    assert!(manager.intercepts(&Request::get(lookalike)));
    let subdomain = Url::parse("https://mt1.maps.googleapis.com/vt").unwrap();
    assert!(!manager.intercepts(&Request::get(subdomain)));
  }
}
