//! Provenance of a response served by the cache layer.

use chrono::{DateTime, Utc};

/// A served value tagged with where it came from.
///
/// `cached_at` is set whenever the value was read from a generation, which
/// includes stand-ins like the offline page.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  pub data: T,
  pub source: CacheSource,
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Live response straight off the wire.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Stored copy of exactly the requested resource.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
      data,
    }
  }

  /// Something other than the requested resource: offline page, placeholder
  /// image or the built-in 503.
  pub fn fallback(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      source: CacheSource::Fallback,
      cached_at,
      data,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  Network,
  Cache,
  /// Offline stand-in
  Fallback,
}

impl CacheSource {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::Fallback => "fallback",
    }
  }
}
