//! Cache layer that orchestrates caching strategies with network fetching.

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::generations::{CacheRole, Generations};
use super::result::CacheResult;
use super::storage::{CacheStorage, CachedEntry};
use crate::http::{Request, Response};
use crate::network::FetchError;

/// Cache layer that manages caching strategies and network fetching.
///
/// Reads only ever consult the live generations. Writes go to the live
/// runtime generation in a background task, so a read issued right after a
/// response was served may not see the mirrored copy yet.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  generations: Arc<Generations>,
  /// Mirror tasks that have not been awaited yet
  pending: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl<S: CacheStorage + 'static> CacheLayer<S> {
  /// Create a new cache layer over the given storage backend.
  pub fn new(storage: Arc<S>, generations: Arc<Generations>) -> Self {
    Self {
      storage,
      generations,
      pending: Arc::new(Mutex::new(Vec::new())),
    }
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  /// Find a cached copy of `request` in the live generations.
  ///
  /// Storage errors are logged and treated as a miss.
  pub fn lookup(&self, request: &Request) -> Option<CachedEntry> {
    let key = request.cache_key()?;
    match self.storage.match_in(&self.generations.live_names(), &key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(url = %request.url, error = %e, "Cache lookup failed");
        None
      }
    }
  }

  /// Copy a successful GET response into the runtime generation.
  ///
  /// Fire-and-forget: the write runs in its own task and its failure is only
  /// logged, never reported to whoever is waiting on the response.
  pub fn mirror(&self, request: &Request, response: &Response) {
    let Some(key) = request.cache_key() else {
      return;
    };
    if !response.is_cacheable() {
      debug!(url = %request.url, status = response.status, "Not mirroring response");
      return;
    }

    let storage = Arc::clone(&self.storage);
    let generation = self.generations.live(CacheRole::Runtime).to_string();
    let response = response.clone();
    let url = request.url.to_string();

    let handle = tokio::spawn(async move {
      match storage.put(&generation, &key, &response) {
        Ok(()) => debug!(%url, %generation, "Mirrored response into cache"),
        Err(e) => warn!(%url, %generation, error = %e, "Failed to mirror response into cache"),
      }
    });

    match self.pending.lock() {
      Ok(mut pending) => {
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
      }
      // The task still runs; it just can't be awaited by `settle`
      Err(e) => warn!("Lock poisoned: {}", e),
    }
  }

  /// Wait for every mirror task spawned so far.
  pub async fn settle(&self) {
    let handles: Vec<JoinHandle<()>> = match self.pending.lock() {
      Ok(mut pending) => pending.drain(..).collect(),
      Err(e) => {
        warn!("Lock poisoned: {}", e);
        return;
      }
    };

    for handle in handles {
      if let Err(e) = handle.await {
        warn!(error = %e, "Cache mirror task did not complete");
      }
    }
  }

  /// Network-first strategy.
  ///
  /// 1. Try the network; on success mirror and return the live response
  /// 2. On network failure, return the cached copy
  /// 3. Without a cached copy, the network error is returned
  pub async fn network_first<F, Fut>(
    &self,
    request: &Request,
    fetcher: F,
  ) -> Result<CacheResult<Response>, FetchError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response, FetchError>>,
  {
    match fetcher().await {
      Ok(response) => {
        self.mirror(request, &response);
        Ok(CacheResult::from_network(response))
      }
      Err(err) => {
        warn!(url = %request.url, error = %err, "Network failed, falling back to cache");
        match self.lookup(request) {
          Some(entry) => Ok(CacheResult::from_cache(entry.response, entry.cached_at)),
          None => Err(err),
        }
      }
    }
  }

  /// Cache-first strategy.
  ///
  /// 1. Return the cached copy if there is one, without touching the network
  /// 2. Otherwise fetch, mirror and return the response
  /// 3. Network failure is returned to the caller, who picks a fallback
  pub async fn cache_first<F, Fut>(
    &self,
    request: &Request,
    fetcher: F,
  ) -> Result<CacheResult<Response>, FetchError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response, FetchError>>,
  {
    if let Some(entry) = self.lookup(request) {
      return Ok(CacheResult::from_cache(entry.response, entry.cached_at));
    }

    let response = fetcher().await?;
    self.mirror(request, &response);
    Ok(CacheResult::from_network(response))
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      generations: Arc::clone(&self.generations),
      pending: Arc::clone(&self.pending),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::result::CacheSource;
  use crate::cache::storage::SqliteStorage;
  use crate::db::Database;
  use reqwest::Method;
  use url::Url;

  fn layer() -> CacheLayer<SqliteStorage> {
    let storage = SqliteStorage::new(Database::open_in_memory().unwrap());
    CacheLayer::new(Arc::new(storage), Arc::new(Generations::new("v1")))
  }

  fn request(path: &str) -> Request {
    Request::get(Url::parse("https://app.test").unwrap().join(path).unwrap())
  }

  fn offline() -> Result<Response, FetchError> {
    Err(FetchError::new("https://app.test", "offline"))
  }

  #[tokio::test]
  async fn test_network_first_mirrors_success() {
    let layer = layer();
    let req = request("/api/items");

    let served = layer
      .network_first(&req, || async { Ok(Response::new(200, "[1]")) })
      .await
      .unwrap();
    assert_eq!(served.source, CacheSource::Network);

    layer.settle().await;
    let cached = layer
      .storage()
      .get("runtime-v1", &req.cache_key().unwrap())
      .unwrap()
      .unwrap();
    assert_eq!(cached.response.body, b"[1]");
  }

  #[tokio::test]
  async fn test_network_first_falls_back_to_cache() {
    let layer = layer();
    let req = request("/api/items");
    layer
      .network_first(&req, || async { Ok(Response::new(200, "[1]")) })
      .await
      .unwrap();
    layer.settle().await;

    let served = layer
      .network_first(&req, || async { offline() })
      .await
      .unwrap();
    assert_eq!(served.source, CacheSource::Cache);
    assert_eq!(served.data.body, b"[1]");
    assert!(served.cached_at.is_some());
  }

  #[tokio::test]
  async fn test_network_first_without_cache_fails() {
    let layer = layer();
    let err = layer
      .network_first(&request("/api/items"), || async { offline() })
      .await
      .unwrap_err();
    assert_eq!(err.reason, "offline");
  }

  #[tokio::test]
  async fn test_error_status_is_returned_but_not_cached() {
    let layer = layer();
    let req = request("/api/items");
    let served = layer
      .network_first(&req, || async { Ok(Response::new(500, "boom")) })
      .await
      .unwrap();
    assert_eq!(served.data.status, 500);

    layer.settle().await;
    assert_eq!(layer.storage().entry_count("runtime-v1").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_non_get_is_never_mirrored() {
    let layer = layer();
    let req = request("/api/items").with_method(Method::POST);
    layer
      .network_first(&req, || async { Ok(Response::new(201, "created")) })
      .await
      .unwrap();

    layer.settle().await;
    assert_eq!(layer.storage().entry_count("runtime-v1").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_cache_first_skips_network_on_hit() {
    let layer = layer();
    let req = request("/styles.css");
    layer
      .storage()
      .put("precache-v1", &req.cache_key().unwrap(), &Response::new(200, "body{}"))
      .unwrap();

    let fetched = std::sync::atomic::AtomicBool::new(false);
    let served = layer
      .cache_first(&req, || async {
        fetched.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(Response::new(200, "network"))
      })
      .await
      .unwrap();
    assert!(!fetched.load(std::sync::atomic::Ordering::SeqCst));
    assert_eq!(served.source, CacheSource::Cache);
    assert_eq!(served.data.body, b"body{}");
  }

  #[tokio::test]
  async fn test_cache_first_ignores_stale_generations() {
    let layer = layer();
    let req = request("/styles.css");
    layer
      .storage()
      .put("runtime-v0", &req.cache_key().unwrap(), &Response::new(200, "old"))
      .unwrap();

    let served = layer
      .cache_first(&req, || async { Ok(Response::new(200, "new")) })
      .await
      .unwrap();
    assert_eq!(served.source, CacheSource::Network);
    assert_eq!(served.data.body, b"new");
  }
}
