//! Registry of the live cache generation for each role.

use std::fmt;

use color_eyre::Result;

use super::storage::CacheStorage;

/// What a cache generation is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheRole {
  /// App shell fetched at install time
  Precache,
  /// Responses mirrored while serving requests
  Runtime,
}

impl CacheRole {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Precache => "precache",
      Self::Runtime => "runtime",
    }
  }
}

/// Identifier of one cache generation: a role plus a version tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GenerationName {
  role: CacheRole,
  version: String,
}

impl GenerationName {
  pub fn new(role: CacheRole, version: &str) -> Self {
    Self {
      role,
      version: version.to_string(),
    }
  }

  pub fn role(&self) -> CacheRole {
    self.role
  }

  pub fn version(&self) -> &str {
    &self.version
  }
}

impl fmt::Display for GenerationName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}-{}", self.role.as_str(), self.version)
  }
}

/// The single source of truth for which generations are live.
///
/// Exactly one generation per role is live; every other stored generation is
/// stale and gets deleted on activation. Shared by `Arc` between the router,
/// the cache layer and the worker lifecycle.
#[derive(Debug, Clone)]
pub struct Generations {
  precache: GenerationName,
  runtime: GenerationName,
}

impl Generations {
  pub fn new(version: &str) -> Self {
    Self {
      precache: GenerationName::new(CacheRole::Precache, version),
      runtime: GenerationName::new(CacheRole::Runtime, version),
    }
  }

  /// Generations that answer client requests right now.
  ///
  /// That is the last activated version. A newer version that is installed but
  /// still waiting stays out of reach until it activates. Before any
  /// activation the configured version is used.
  pub fn serving<S: CacheStorage + ?Sized>(storage: &S, configured: &str) -> Result<Self> {
    let version = storage
      .active_version()?
      .unwrap_or_else(|| configured.to_string());
    Ok(Self::new(&version))
  }

  pub fn version(&self) -> &str {
    self.precache.version()
  }

  pub fn live(&self, role: CacheRole) -> &GenerationName {
    match role {
      CacheRole::Precache => &self.precache,
      CacheRole::Runtime => &self.runtime,
    }
  }

  /// Storage names of every live generation, in lookup order.
  pub fn live_names(&self) -> Vec<String> {
    vec![self.precache.to_string(), self.runtime.to_string()]
  }

  pub fn is_live(&self, name: &str) -> bool {
    self.live_names().iter().any(|live| live == name)
  }
}
