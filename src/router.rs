//! Request classification and per-class caching strategies.

use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheResult, CacheStorage};
use crate::config::CacheConfig;
use crate::http::{Destination, Request, RequestMode, Response};
use crate::network::{FetchError, Fetcher};

/// How an intercepted request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Cross-origin: straight to the network, never observed or cached
  Passthrough,
  /// Top-level page load: network-first, then cache, then offline page
  Navigation,
  /// API call: network-first, then cache, then failure
  Api,
  /// Everything else: cache-first, then network, then placeholder or offline page
  Asset,
}

/// Routes every outbound request of the host application.
pub struct Router<S: CacheStorage, F: Fetcher> {
  origin: Url,
  api_prefix: String,
  offline_page: Url,
  image_placeholder: Option<Url>,
  cache: CacheLayer<S>,
  fetcher: Arc<F>,
}

impl<S: CacheStorage + 'static, F: Fetcher> Router<S, F> {
  pub fn new(
    origin: Url,
    config: &CacheConfig,
    cache: CacheLayer<S>,
    fetcher: Arc<F>,
  ) -> Result<Self> {
    let offline_page = origin
      .join(&config.offline_page)
      .map_err(|e| eyre!("Invalid offline page {}: {}", config.offline_page, e))?;
    let image_placeholder = config
      .image_placeholder
      .as_deref()
      .map(|path| {
        origin
          .join(path)
          .map_err(|e| eyre!("Invalid image placeholder {}: {}", path, e))
      })
      .transpose()?;

    Ok(Self {
      origin,
      api_prefix: config.api_prefix.clone(),
      offline_page,
      image_placeholder,
      cache,
      fetcher,
    })
  }

  /// Decide how `request` is handled. First match wins.
  pub fn classify(&self, request: &Request) -> Route {
    if request.url.origin() != self.origin.origin() {
      Route::Passthrough
    } else if request.mode == RequestMode::Navigate {
      Route::Navigation
    } else if request.url.path().starts_with(&self.api_prefix) {
      Route::Api
    } else {
      Route::Asset
    }
  }

  /// Resolve a request to a response.
  ///
  /// Navigation and asset requests always resolve to some response. Only API
  /// and pass-through requests can surface a network failure.
  pub async fn handle(&self, request: &Request) -> Result<CacheResult<Response>, FetchError> {
    let route = self.classify(request);
    debug!(method = %request.method, url = %request.url, ?route, "Routing request");

    match route {
      Route::Passthrough => self
        .fetcher
        .fetch(request)
        .await
        .map(CacheResult::from_network),
      Route::Navigation => Ok(self.navigate(request).await),
      Route::Api => {
        self
          .cache
          .network_first(request, || self.fetcher.fetch(request))
          .await
      }
      Route::Asset => Ok(self.asset(request).await),
    }
  }

  /// Wait for background cache writes started by earlier requests.
  pub async fn settle(&self) {
    self.cache.settle().await;
  }

  async fn navigate(&self, request: &Request) -> CacheResult<Response> {
    match self
      .cache
      .network_first(request, || self.fetcher.fetch(request))
      .await
    {
      Ok(served) => served,
      Err(_) => self.offline_page(),
    }
  }

  async fn asset(&self, request: &Request) -> CacheResult<Response> {
    match self
      .cache
      .cache_first(request, || self.fetcher.fetch(request))
      .await
    {
      Ok(served) => served,
      Err(e) => {
        warn!(url = %request.url, error = %e, "Asset unavailable, serving fallback");
        if request.destination == Destination::Image {
          if let Some(placeholder) = self.cached(self.image_placeholder.as_ref()) {
            return placeholder;
          }
        }
        self.offline_page()
      }
    }
  }

  fn offline_page(&self) -> CacheResult<Response> {
    self
      .cached(Some(&self.offline_page))
      .unwrap_or_else(|| {
        warn!(url = %self.offline_page, "Offline page is not cached");
        CacheResult::fallback(Response::offline_stub(), None)
      })
  }

  fn cached(&self, url: Option<&Url>) -> Option<CacheResult<Response>> {
    let entry = self.cache.lookup(&Request::get(url?.clone()))?;
    Some(CacheResult::fallback(entry.response, Some(entry.cached_at)))
  }
}
