//! Install/activate lifecycle of the cache generations.
//!
//! A worker moves `Installing -> Installed -> Activating -> Active`. Install
//! fills the live precache generation from the manifest; activation deletes
//! every generation that is not live, records the version as active and takes
//! control of clients. A failed install leaves the worker `Redundant`.
//!
//! Until then, clients keep being served from the previously activated
//! version (see [`Generations::serving`]).

use std::collections::HashSet;
use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheRole, CacheStorage, Generations};
use crate::http::Request;
use crate::network::Fetcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Installing,
  Installed,
  Activating,
  Active,
  Redundant,
}

/// Messages the host page can post to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  /// Activate as soon as installed, without waiting for old clients to go away
  SkipWaiting,
}

impl ControlMessage {
  /// Parse a JSON message such as `{"type":"SKIP_WAITING"}`.
  pub fn parse(raw: &str) -> Option<Self> {
    serde_json::from_str(raw).ok()
  }
}

pub struct Worker<S: CacheStorage, F: Fetcher> {
  origin: Url,
  manifest: Vec<String>,
  generations: Arc<Generations>,
  storage: Arc<S>,
  fetcher: Arc<F>,
  state: WorkerState,
  skip_waiting: bool,
  controlling: bool,
}

impl<S: CacheStorage, F: Fetcher> Worker<S, F> {
  pub fn new(
    origin: Url,
    manifest: Vec<String>,
    generations: Arc<Generations>,
    storage: Arc<S>,
    fetcher: Arc<F>,
  ) -> Self {
    Self {
      origin,
      manifest,
      generations,
      storage,
      fetcher,
      state: WorkerState::Installing,
      skip_waiting: false,
      controlling: false,
    }
  }

  pub fn state(&self) -> WorkerState {
    self.state
  }

  /// Whether this worker has claimed the clients.
  pub fn controls_clients(&self) -> bool {
    self.controlling
  }

  /// Fetch the whole manifest and store it in the live precache generation.
  ///
  /// All or nothing: if any path fails to fetch or answers with a non-OK
  /// status, nothing is stored and the worker becomes redundant.
  pub async fn install(&mut self) -> Result<usize> {
    if self.state != WorkerState::Installing {
      return Err(eyre!("Cannot install a worker in state {:?}", self.state));
    }

    let generation = self.generations.live(CacheRole::Precache).to_string();
    info!(%generation, paths = self.manifest.len(), "Installing");

    match self.precache(&generation).await {
      Ok(count) => {
        self.state = WorkerState::Installed;
        info!(%generation, count, "Installed");
        Ok(count)
      }
      Err(e) => {
        self.state = WorkerState::Redundant;
        warn!(%generation, error = %e, "Install failed");
        Err(e)
      }
    }
  }

  async fn precache(&self, generation: &str) -> Result<usize> {
    let mut seen = HashSet::new();
    let mut requests = Vec::with_capacity(self.manifest.len());
    for path in &self.manifest {
      let url = self
        .origin
        .join(path)
        .map_err(|e| eyre!("Invalid precache path {}: {}", path, e))?;
      if !seen.insert(url.clone()) {
        return Err(eyre!("Duplicate precache path {}", path));
      }
      requests.push(Request::get(url));
    }

    let fetcher = &self.fetcher;
    let entries = try_join_all(requests.iter().map(|request| async move {
      let response = fetcher
        .fetch(request)
        .await
        .map_err(|e| eyre!("Failed to precache {}: {}", request.url, e))?;
      if !response.is_cacheable() {
        return Err(eyre!(
          "Failed to precache {}: status {}",
          request.url,
          response.status
        ));
      }
      let key = request
        .cache_key()
        .ok_or_else(|| eyre!("Failed to precache {}: not cacheable", request.url))?;
      debug!(url = %request.url, "Fetched precache entry");
      Ok::<_, color_eyre::Report>((key, response))
    }))
    .await?;

    self.storage.put_all(generation, &entries)?;
    Ok(entries.len())
  }

  /// Pick up an install completed by an earlier run.
  ///
  /// Returns true if the live precache generation already exists, in which
  /// case the worker is considered installed.
  pub fn resume_installed(&mut self) -> Result<bool> {
    if self.state != WorkerState::Installing {
      return Ok(false);
    }
    let generation = self.generations.live(CacheRole::Precache).to_string();
    let installed = self
      .storage
      .generation_names()?
      .iter()
      .any(|name| *name == generation);
    if installed {
      self.state = WorkerState::Installed;
    }
    Ok(installed)
  }

  /// Request activation without waiting for clients of the previous version.
  pub fn skip_waiting(&mut self) {
    self.skip_waiting = true;
  }

  /// Handle a message posted by the host page. Unknown messages are ignored.
  pub fn post_message(&mut self, raw: &str) -> Option<ControlMessage> {
    let message = ControlMessage::parse(raw);
    match message {
      Some(ControlMessage::SkipWaiting) => {
        debug!("Received SKIP_WAITING");
        self.skip_waiting();
      }
      None => debug!("Ignoring unknown control message"),
    }
    message
  }

  /// Whether another activated version is still serving clients.
  pub fn has_previous_version(&self) -> Result<bool> {
    let active = self.storage.active_version()?;
    Ok(active.is_some_and(|version| version != self.generations.version()))
  }

  /// Installed, but held back until the previous version lets go.
  pub fn is_waiting(&self) -> Result<bool> {
    if self.state != WorkerState::Installed || self.skip_waiting {
      return Ok(false);
    }
    self.has_previous_version()
  }

  /// Delete every non-live generation and take control of clients.
  ///
  /// Records this version as the active one, so routers built afterwards
  /// serve its generations. Returns the names of the deleted generations.
  pub fn activate(&mut self) -> Result<Vec<String>> {
    if self.state != WorkerState::Installed {
      return Err(eyre!("Cannot activate a worker in state {:?}", self.state));
    }
    self.state = WorkerState::Activating;

    let activated = self.evict_stale().and_then(|deleted| {
      self.storage.set_active_version(self.generations.version())?;
      Ok(deleted)
    });

    match activated {
      Ok(deleted) => {
        self.controlling = true;
        self.state = WorkerState::Active;
        info!(deleted = deleted.len(), "Activated; controller changed");
        Ok(deleted)
      }
      Err(e) => {
        self.state = WorkerState::Installed;
        Err(e)
      }
    }
  }

  fn evict_stale(&self) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    for name in self.storage.generation_names()? {
      if self.generations.is_live(&name) {
        continue;
      }
      if self.storage.delete_generation(&name)? {
        info!(generation = %name, "Deleted stale cache generation");
        deleted.push(name);
      }
    }
    Ok(deleted)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::db::Database;
  use crate::http::Response;
  use crate::network::testing::StubFetcher;

  const ORIGIN: &str = "https://app.test";

  fn url(path: &str) -> String {
    Url::parse(ORIGIN).unwrap().join(path).unwrap().to_string()
  }

  fn manifest(paths: &[&str]) -> Vec<String> {
    paths.iter().map(|p| p.to_string()).collect()
  }

  fn worker(
    version: &str,
    paths: &[&str],
    storage: &Arc<SqliteStorage>,
    fetcher: &Arc<StubFetcher>,
  ) -> Worker<SqliteStorage, StubFetcher> {
    Worker::new(
      Url::parse(ORIGIN).unwrap(),
      manifest(paths),
      Arc::new(Generations::new(version)),
      Arc::clone(storage),
      Arc::clone(fetcher),
    )
  }

  fn setup() -> (Arc<SqliteStorage>, Arc<StubFetcher>) {
    let storage = Arc::new(SqliteStorage::new(Database::open_in_memory().unwrap()));
    let fetcher = Arc::new(StubFetcher::new());
    for path in ["/", "/index.html", "/offline.html"] {
      fetcher.route(&url(path), Response::new(200, path));
    }
    (storage, fetcher)
  }

  #[tokio::test]
  async fn test_install_precaches_manifest() {
    let (storage, fetcher) = setup();
    let mut worker = worker("v1", &["/", "/index.html", "/offline.html"], &storage, &fetcher);

    assert_eq!(worker.install().await.unwrap(), 3);
    assert_eq!(worker.state(), WorkerState::Installed);
    assert_eq!(storage.entry_count("precache-v1").unwrap(), 3);

    let key = Request::get(Url::parse(&url("/offline.html")).unwrap())
      .cache_key()
      .unwrap();
    let entry = storage.get("precache-v1", &key).unwrap().unwrap();
    assert_eq!(entry.response.body, b"/offline.html");
  }

  #[tokio::test]
  async fn test_install_is_atomic() {
    let (storage, fetcher) = setup();
    let mut worker = worker("v1", &["/", "/index.html", "/missing.js"], &storage, &fetcher);

    assert!(worker.install().await.is_err());
    assert_eq!(worker.state(), WorkerState::Redundant);
    assert_eq!(storage.entry_count("precache-v1").unwrap(), 0);
    assert!(storage.generation_names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_install_rejects_error_status() {
    let (storage, fetcher) = setup();
    fetcher.route(&url("/main.js"), Response::new(404, "not found"));
    let mut worker = worker("v1", &["/", "/main.js"], &storage, &fetcher);

    assert!(worker.install().await.is_err());
    assert_eq!(storage.entry_count("precache-v1").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_install_rejects_duplicate_paths() {
    let (storage, fetcher) = setup();
    let mut worker = worker("v1", &["/index.html", "/index.html"], &storage, &fetcher);

    assert!(worker.install().await.is_err());
    assert_eq!(fetcher.calls(), 0);
  }

  #[tokio::test]
  async fn test_first_install_does_not_wait() {
    let (storage, fetcher) = setup();
    let mut worker = worker("v1", &["/"], &storage, &fetcher);
    worker.install().await.unwrap();

    assert!(!worker.is_waiting().unwrap());
    assert!(worker.activate().unwrap().is_empty());
    assert_eq!(worker.state(), WorkerState::Active);
    assert!(worker.controls_clients());
  }

  #[tokio::test]
  async fn test_update_waits_until_skip_waiting() {
    let (storage, fetcher) = setup();
    let mut old = worker("v1", &["/"], &storage, &fetcher);
    old.install().await.unwrap();
    old.activate().unwrap();
    storage
      .put(
        "runtime-v1",
        &Request::get(Url::parse(&url("/api/x")).unwrap()).cache_key().unwrap(),
        &Response::new(200, "x"),
      )
      .unwrap();

    let mut new = worker("v2", &["/", "/index.html"], &storage, &fetcher);
    new.install().await.unwrap();
    assert!(new.is_waiting().unwrap());

    assert_eq!(
      new.post_message(r#"{"type":"SKIP_WAITING"}"#),
      Some(ControlMessage::SkipWaiting)
    );
    assert!(!new.is_waiting().unwrap());

    let mut deleted = new.activate().unwrap();
    deleted.sort();
    assert_eq!(deleted, vec!["precache-v1", "runtime-v1"]);
    assert_eq!(storage.generation_names().unwrap(), vec!["precache-v2"]);
    assert!(!new.has_previous_version().unwrap());
    assert_eq!(storage.active_version().unwrap().as_deref(), Some("v2"));
  }

  #[tokio::test]
  async fn test_leftover_generations_without_activation_do_not_hold_back() {
    let (storage, fetcher) = setup();
    worker("v1", &["/"], &storage, &fetcher)
      .install()
      .await
      .unwrap();

    let mut next = worker("v2", &["/"], &storage, &fetcher);
    next.install().await.unwrap();
    assert!(!next.is_waiting().unwrap());
    assert_eq!(next.activate().unwrap(), vec!["precache-v1"]);
  }

  #[tokio::test]
  async fn test_activate_requires_install() {
    let (storage, fetcher) = setup();
    let mut worker = worker("v1", &["/"], &storage, &fetcher);
    assert!(worker.activate().is_err());
    assert_eq!(worker.state(), WorkerState::Installing);
  }

  #[tokio::test]
  async fn test_resume_installed() {
    let (storage, fetcher) = setup();
    worker("v1", &["/"], &storage, &fetcher)
      .install()
      .await
      .unwrap();

    let mut again = worker("v1", &["/"], &storage, &fetcher);
    assert!(again.resume_installed().unwrap());
    assert_eq!(again.state(), WorkerState::Installed);

    let mut next = worker("v2", &["/"], &storage, &fetcher);
    assert!(!next.resume_installed().unwrap());
    assert_eq!(next.state(), WorkerState::Installing);
  }

  #[test]
  fn test_unknown_messages_are_ignored() {
    assert_eq!(ControlMessage::parse(r#"{"type":"CLAIM"}"#), None);
    assert_eq!(ControlMessage::parse("SKIP_WAITING"), None);
    assert_eq!(
      ControlMessage::parse(r#"{"type":"SKIP_WAITING","extra":1}"#),
      Some(ControlMessage::SkipWaiting)
    );
  }
}
