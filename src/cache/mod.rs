//! Versioned response cache for offline support.
//!
//! This module provides the storage side of the request router:
//! - Named cache generations, one live generation per role and version
//! - Whole-entry response snapshots keyed by normalized GET requests
//! - Network-first and cache-first strategies with background mirroring
//! - Basic offline mode (serve the cached copy when the network is unavailable)

mod generations;
mod layer;
mod result;
mod storage;

pub use generations::{CacheRole, GenerationName, Generations};
pub use layer::CacheLayer;
pub use result::{CacheResult, CacheSource};
pub use storage::{CacheStorage, CachedEntry, SqliteStorage};
