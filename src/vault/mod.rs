//! Encrypted local vault.
//!
//! Records are encrypted before they reach the durable store:
//! - A key is derived per record from the user secret and a fresh 16-byte salt
//!   (PBKDF2-HMAC-SHA256, 200 000 rounds)
//! - The record is serialized to canonical JSON and sealed with AES-256-GCM
//!   under a fresh 12-byte nonce
//! - Salt, nonce, ciphertext and creation time are persisted; the key and the
//!   plaintext never outlive the call that produced them

mod crypto;
mod error;
mod store;

use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;

use ring::aead::LessSafeKey;
use serde_json::{Map, Value};
use tracing::debug;
use zeroize::Zeroizing;

pub use crypto::{NONCE_LEN, SALT_LEN};
pub use error::VaultError;
pub use store::{NewRecord, RecordStore, SqliteRecordStore, StoreError, VaultRecord};

/// A structured record: any JSON object.
pub type Record = Map<String, Value>;

/// A symmetric key derived from `(secret, salt)`.
///
/// Usable only for encrypt/decrypt; the raw key bytes are wiped as soon as the
/// key is constructed.
pub struct DerivedKey {
  key: LessSafeKey,
  salt: [u8; SALT_LEN],
}

impl DerivedKey {
  /// The salt this key was derived with. Store it next to the ciphertext.
  pub fn salt(&self) -> &[u8; SALT_LEN] {
    &self.salt
  }
}

impl fmt::Debug for DerivedKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DerivedKey")
      .field("salt", &hex::encode(self.salt))
      .finish_non_exhaustive()
  }
}

/// Output of [`encrypt_record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
  pub nonce: [u8; NONCE_LEN],
  /// Ciphertext followed by the authentication tag
  pub ciphertext: Vec<u8>,
}

/// A decrypted record together with its store-assigned id.
#[derive(Debug, Clone, PartialEq)]
pub struct VaultEntry {
  pub id: i64,
  /// Epoch milliseconds
  pub created_at: i64,
  pub record: Record,
}

impl VaultEntry {
  /// The record's fields merged with its id.
  ///
  /// The store-assigned id wins over an `id` field inside the record.
  pub fn to_json(&self) -> Value {
    let mut object = self.record.clone();
    object.insert("id".to_string(), Value::from(self.id));
    Value::Object(object)
  }
}

/// Serialize `record` canonically and seal it under a fresh nonce.
pub fn encrypt_record(key: &DerivedKey, record: &Record) -> Result<EncryptedPayload, VaultError> {
  // serde_json's map is ordered by key, which makes the encoding canonical
  let plaintext = Zeroizing::new(
    serde_json::to_vec(record).map_err(|_| VaultError::Primitive("record encoding failed"))?,
  );
  let (nonce, ciphertext) = crypto::seal(&key.key, &plaintext)?;
  Ok(EncryptedPayload { nonce, ciphertext })
}

/// Verify and decrypt a payload produced by [`encrypt_record`].
pub fn decrypt_record(key: &DerivedKey, payload: &EncryptedPayload) -> Result<Record, VaultError> {
  let plaintext = crypto::open(&key.key, &payload.nonce, &payload.ciphertext)?;
  serde_json::from_slice(&plaintext).map_err(|_| VaultError::Authentication)
}

pub struct Vault<S: RecordStore> {
  store: Arc<S>,
  iterations: NonZeroU32,
}

impl<S: RecordStore> Vault<S> {
  pub fn new(store: Arc<S>) -> Self {
    Self {
      store,
      iterations: crypto::PBKDF2_ITERATIONS,
    }
  }

  /// Vault with a cheap key derivation, so tests don't spend seconds in PBKDF2.
  #[cfg(test)]
  fn with_iterations(store: Arc<S>, iterations: u32) -> Self {
    Self {
      store,
      iterations: NonZeroU32::new(iterations).unwrap(),
    }
  }

  /// Derive the key for `(secret, salt)`, generating a random salt if none is given.
  ///
  /// Runs on the blocking pool.
  pub async fn derive_key(
    &self,
    secret: &str,
    salt: Option<[u8; SALT_LEN]>,
  ) -> Result<DerivedKey, VaultError> {
    let salt = match salt {
      Some(salt) => salt,
      None => crypto::random_bytes::<SALT_LEN>()?,
    };
    let secret = Zeroizing::new(secret.as_bytes().to_vec());
    let iterations = self.iterations;

    let material =
      tokio::task::spawn_blocking(move || crypto::pbkdf2_sha256(&secret, &salt, iterations))
        .await
        .map_err(|_| VaultError::Primitive("key derivation did not complete"))?;

    let key = crypto::aead_key(material.as_slice())?;
    Ok(DerivedKey { key, salt })
  }

  /// Encrypt `record` under a fresh salt and nonce and persist it.
  ///
  /// Returns the store-assigned id once the write transaction has committed.
  pub async fn save_entry(&self, secret: &str, record: &Record) -> Result<i64, VaultError> {
    let key = self.derive_key(secret, None).await?;
    let payload = encrypt_record(&key, record)?;

    let id = self.store.insert(&NewRecord {
      salt: key.salt(),
      nonce: &payload.nonce,
      ciphertext: &payload.ciphertext,
      created_at: chrono::Utc::now().timestamp_millis(),
    })?;

    debug!(id, "Saved vault entry");
    Ok(id)
  }

  /// Decrypt every stored record with `secret`.
  ///
  /// All or nothing: one record that fails to decrypt fails the whole call,
  /// so a corrupted or foreign record can't hide among good ones.
  pub async fn get_all_entries(&self, secret: &str) -> Result<Vec<VaultEntry>, VaultError> {
    let rows = self.store.read_all()?;
    let mut entries = Vec::with_capacity(rows.len());

    for row in rows {
      let salt: [u8; SALT_LEN] = row
        .salt
        .as_slice()
        .try_into()
        .map_err(|_| VaultError::Authentication)?;
      let nonce: [u8; NONCE_LEN] = row
        .nonce
        .as_slice()
        .try_into()
        .map_err(|_| VaultError::Authentication)?;

      let key = self.derive_key(secret, Some(salt)).await?;
      let record = decrypt_record(
        &key,
        &EncryptedPayload {
          nonce,
          ciphertext: row.ciphertext,
        },
      )?;

      entries.push(VaultEntry {
        id: row.id,
        created_at: row.created_at,
        record,
      });
    }

    debug!(count = entries.len(), "Decrypted vault entries");
    Ok(entries)
  }
}
