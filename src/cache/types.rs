//! Core types for the resource cache.

use chrono::{DateTime, Utc};

use crate::http::Response;

/// A response read back from a named cache.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  /// Cache the entry was found in
  pub cache_name: String,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh response from the network
  Network,
  /// Network failed, previously cached response for the same request
  Cache,
  /// Neither network nor cache could answer, offline document served
  OfflinePage,
}

/// Result of handing a request to the fetch handler.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
  /// Not intercepted; the host performs the request itself
  Passthrough,
  /// The worker answered the request
  Respond {
    response: Response,
    source: ResponseSource,
  },
  /// Nothing to serve (network failed and the offline page is not cached)
  Unavailable(String),
}

impl FetchOutcome {
  pub fn respond(response: Response, source: ResponseSource) -> Self {
    Self::Respond { response, source }
  }

  #[cfg(test)]
  pub fn response(&self) -> Option<&Response> {
    match self {
      Self::Respond { response, .. } => Some(response),
      _ => None,
    }
  }

  #[cfg(test)]
  pub fn source(&self) -> Option<ResponseSource> {
    match self {
      Self::Respond { source, .. } => Some(*source),
      _ => None,
    }
  }
}
