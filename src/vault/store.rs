//! Durable store for encrypted vault records.

use rusqlite::{params, Connection};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use crate::db::Database;

#[derive(Error, Debug)]
pub enum StoreError {
  #[error("database error: {0}")]
  Database(#[from] rusqlite::Error),

  #[error("store lock poisoned")]
  Poisoned,
}

/// A record about to be written. The store assigns the id.
#[derive(Debug, Clone)]
pub struct NewRecord<'a> {
  pub salt: &'a [u8],
  pub nonce: &'a [u8],
  pub ciphertext: &'a [u8],
  /// Epoch milliseconds
  pub created_at: i64,
}

/// A record as persisted: nothing in it is readable without the secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultRecord {
  pub id: i64,
  pub salt: Vec<u8>,
  pub nonce: Vec<u8>,
  pub ciphertext: Vec<u8>,
  pub created_at: i64,
}

/// Transactional record storage used by the vault.
pub trait RecordStore: Send + Sync {
  /// Append a record in its own write transaction and return its id once committed.
  fn insert(&self, record: &NewRecord<'_>) -> Result<i64, StoreError>;

  /// Every record in ascending id order, read from one consistent snapshot.
  fn read_all(&self) -> Result<Vec<VaultRecord>, StoreError>;
}

/// SQLite-backed record store.
pub struct SqliteRecordStore {
  conn: Mutex<Connection>,
}

impl SqliteRecordStore {
  pub fn new(db: Database) -> Self {
    Self {
      conn: Mutex::new(db.into_connection()),
    }
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
    self.conn.lock().map_err(|_| StoreError::Poisoned)
  }
}

impl RecordStore for SqliteRecordStore {
  fn insert(&self, record: &NewRecord<'_>) -> Result<i64, StoreError> {
    let mut conn = self.conn()?;
    // Rolled back on drop if anything below fails
    let tx = conn.transaction()?;

    tx.execute(
      "INSERT INTO vault_entries (salt, nonce, ciphertext, created_at) VALUES (?, ?, ?, ?)",
      params![record.salt, record.nonce, record.ciphertext, record.created_at],
    )?;
    let id = tx.last_insert_rowid();

    tx.commit()?;
    Ok(id)
  }

  fn read_all(&self) -> Result<Vec<VaultRecord>, StoreError> {
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;

    let records = {
      let mut stmt = tx.prepare(
        "SELECT id, salt, nonce, ciphertext, created_at FROM vault_entries ORDER BY id",
      )?;
      let rows = stmt.query_map([], |row| {
        Ok(VaultRecord {
          id: row.get(0)?,
          salt: row.get(1)?,
          nonce: row.get(2)?,
          ciphertext: row.get(3)?,
          created_at: row.get(4)?,
        })
      })?;
      rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    tx.commit()?;
    Ok(records)
  }
}
