pub mod schema;

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};

/// Database connection wrapper for cache generations and vault records
pub struct Database {
  conn: Connection,
}

impl Database {
  /// Open or create the database at the given location
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    Self::prepare(conn)
  }

  /// Open a private in-memory database
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;

    Self::prepare(conn)
  }

  /// `<data_dir>/haven/haven.db`
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("haven").join("haven.db"))
  }

  fn prepare(conn: Connection) -> Result<Self> {
    // WAL lets the vault read a snapshot while the cache writes
    conn
      .execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
      .map_err(|e| eyre!("Failed to set pragmas: {}", e))?;

    let db = Self { conn };
    db.run_migrations()?;

    Ok(db)
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .conn
      .execute_batch(schema::SCHEMA)
      .map_err(|e| eyre!("Failed to create cache and vault tables: {}", e))
  }

  /// Give up the wrapper and hand the connection to its owner
  pub fn into_connection(self) -> Connection {
    self.conn
  }
}
