//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Mutex, MutexGuard};

use crate::db::Database;
use crate::http::{RequestKey, Response};

/// A response snapshot read back from a generation.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  /// The stored response
  pub response: Response,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// Generations are addressed by their storage name (`"runtime-v1"`). Writes
/// replace whole entries; nothing is ever patched in place.
pub trait CacheStorage: Send + Sync {
  /// Create the generation if it does not exist yet.
  fn open_generation(&self, generation: &str) -> Result<()>;

  /// Names of every stored generation, oldest first.
  fn generation_names(&self) -> Result<Vec<String>>;

  /// Delete a generation and all of its entries. Returns whether it existed.
  fn delete_generation(&self, generation: &str) -> Result<bool>;

  /// Store one entry, replacing any previous entry for the same key.
  fn put(&self, generation: &str, key: &RequestKey, response: &Response) -> Result<()>;

  /// Store several entries in one transaction: either all land or none do.
  fn put_all(&self, generation: &str, entries: &[(RequestKey, Response)]) -> Result<()>;

  /// Look up one entry in one generation.
  fn get(&self, generation: &str, key: &RequestKey) -> Result<Option<CachedEntry>>;

  /// Number of entries in a generation.
  fn entry_count(&self, generation: &str) -> Result<usize>;

  /// Version that last completed activation, if any.
  fn active_version(&self) -> Result<Option<String>>;

  /// Record `version` as the one serving clients.
  fn set_active_version(&self, version: &str) -> Result<()>;

  /// First match for `key` across `generations`, searched in the given order.
  fn match_in(&self, generations: &[String], key: &RequestKey) -> Result<Option<CachedEntry>> {
    for generation in generations {
      if let Some(entry) = self.get(generation, key)? {
        return Ok(Some(entry));
      }
    }
    Ok(None)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Use an already migrated database.
  pub fn new(db: Database) -> Self {
    Self {
      conn: Mutex::new(db.into_connection()),
    }
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

fn insert_entry(
  conn: &Connection,
  generation: &str,
  key: &RequestKey,
  response: &Response,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries (generation, request_key, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, datetime('now'))",
      params![generation, key.as_str(), response.status, headers, response.body],
    )
    .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

  Ok(())
}

fn ensure_generation(conn: &Connection, generation: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_generations (name) VALUES (?)",
      params![generation],
    )
    .map_err(|e| eyre!("Failed to create cache generation {}: {}", generation, e))?;
  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open_generation(&self, generation: &str) -> Result<()> {
    let conn = self.conn()?;
    ensure_generation(&conn, generation)
  }

  fn generation_names(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;

    let mut stmt = conn
      .prepare("SELECT name FROM cache_generations ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache generations: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache generation: {}", e))?;

    Ok(names)
  }

  fn delete_generation(&self, generation: &str) -> Result<bool> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE generation = ?",
      params![generation],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", generation, e))?;

    let deleted = tx
      .execute(
        "DELETE FROM cache_generations WHERE name = ?",
        params![generation],
      )
      .map_err(|e| eyre!("Failed to delete cache generation {}: {}", generation, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(deleted > 0)
  }

  fn put(&self, generation: &str, key: &RequestKey, response: &Response) -> Result<()> {
    self.put_all(generation, &[(key.clone(), response.clone())])
  }

  fn put_all(&self, generation: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    ensure_generation(&tx, generation)?;
    for (key, response) in entries {
      insert_entry(&tx, generation, key, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn get(&self, generation: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    let conn = self.conn()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE generation = ? AND request_key = ?",
        params![generation, key.as_str()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache entry: {}", e))?;

    match row {
      Some((status, headers, body, cached_at_str)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        let cached_at = parse_datetime(&cached_at_str)?;
        Ok(Some(CachedEntry {
          response: Response {
            status,
            headers,
            body,
          },
          cached_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn active_version(&self) -> Result<Option<String>> {
    let conn = self.conn()?;

    conn
      .query_row(
        "SELECT active_version FROM cache_state WHERE id = 1",
        [],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read active cache version: {}", e))
  }

  fn set_active_version(&self, version: &str) -> Result<()> {
    let conn = self.conn()?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_state (id, active_version, activated_at)
         VALUES (1, ?, datetime('now'))",
        params![version],
      )
      .map_err(|e| eyre!("Failed to record active cache version {}: {}", version, e))?;

    Ok(())
  }

  fn entry_count(&self, generation: &str) -> Result<usize> {
    let conn = self.conn()?;

    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE generation = ?",
        params![generation],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count cache entries: {}", e))?;

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

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::Request;
  use url::Url;

  fn storage() -> SqliteStorage {
    SqliteStorage::new(Database::open_in_memory().unwrap())
  }

  fn key(path: &str) -> RequestKey {
    let url = Url::parse("https://app.test").unwrap().join(path).unwrap();
    Request::get(url).cache_key().unwrap()
  }

  #[test]
  fn test_put_then_get() {
    let storage = storage();
    let response = Response::new(200, "body").with_header("content-type", "text/plain");
    storage.put("runtime-v1", &key("/a"), &response).unwrap();

    let entry = storage.get("runtime-v1", &key("/a")).unwrap().unwrap();
    assert_eq!(entry.response, response);
    assert!(storage.get("runtime-v1", &key("/b")).unwrap().is_none());
    assert!(storage.get("precache-v1", &key("/a")).unwrap().is_none());
  }

  #[test]
  fn test_put_replaces_whole_entry() {
    let storage = storage();
    storage
      .put("runtime-v1", &key("/a"), &Response::new(200, "old").with_header("etag", "1"))
      .unwrap();
    storage
      .put("runtime-v1", &key("/a"), &Response::new(200, "new"))
      .unwrap();

    let entry = storage.get("runtime-v1", &key("/a")).unwrap().unwrap();
    assert_eq!(entry.response.body, b"new");
    assert!(entry.response.headers.is_empty());
    assert_eq!(storage.entry_count("runtime-v1").unwrap(), 1);
  }

  #[test]
  fn test_generations_listed_in_creation_order() {
    let storage = storage();
    storage.open_generation("precache-v1").unwrap();
    storage
      .put("runtime-v1", &key("/a"), &Response::new(200, ""))
      .unwrap();
    storage.open_generation("precache-v1").unwrap();

    assert_eq!(
      storage.generation_names().unwrap(),
      vec!["precache-v1", "runtime-v1"]
    );
  }

  #[test]
  fn test_delete_generation_drops_entries() {
    let storage = storage();
    storage
      .put("runtime-v1", &key("/a"), &Response::new(200, ""))
      .unwrap();

    assert!(storage.delete_generation("runtime-v1").unwrap());
    assert!(!storage.delete_generation("runtime-v1").unwrap());
    assert!(storage.get("runtime-v1", &key("/a")).unwrap().is_none());
    assert_eq!(storage.entry_count("runtime-v1").unwrap(), 0);
    assert!(storage.generation_names().unwrap().is_empty());
  }

  #[test]
  fn test_match_in_respects_order() {
    let storage = storage();
    storage
      .put("precache-v1", &key("/"), &Response::new(200, "shell"))
      .unwrap();
    storage
      .put("runtime-v1", &key("/"), &Response::new(200, "fresh"))
      .unwrap();
    storage
      .put("runtime-v0", &key("/old"), &Response::new(200, "stale"))
      .unwrap();

    let live = vec!["precache-v1".to_string(), "runtime-v1".to_string()];
    let hit = storage.match_in(&live, &key("/")).unwrap().unwrap();
    assert_eq!(hit.response.body, b"shell");
    assert!(storage.match_in(&live, &key("/old")).unwrap().is_none());
  }

  #[test]
  fn test_put_all_writes_every_entry() {
    let storage = storage();
    let entries = vec![
      (key("/"), Response::new(200, "root")),
      (key("/index.html"), Response::new(200, "index")),
    ];
    storage.put_all("precache-v1", &entries).unwrap();
    assert_eq!(storage.entry_count("precache-v1").unwrap(), 2);
  }

  #[test]
  fn test_active_version_is_replaced() {
    let storage = storage();
    assert!(storage.active_version().unwrap().is_none());

    storage.set_active_version("v1").unwrap();
    storage.set_active_version("v2").unwrap();
    assert_eq!(storage.active_version().unwrap().as_deref(), Some("v2"));
  }
}
