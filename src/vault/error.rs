//! Vault error types.
//!
//! Every failure propagates to the caller unchanged; the vault never retries
//! and never degrades to returning partial or unencrypted data.

use thiserror::Error;

use super::store::StoreError;

#[derive(Error, Debug)]
pub enum VaultError {
  /// The cryptographic provider rejected an operation
  #[error("cryptographic primitive failed: {0}")]
  Primitive(&'static str),

  /// Integrity check failed. Deliberately does not say whether the secret
  /// was wrong or the record was corrupted.
  #[error("wrong secret or corrupted data")]
  Authentication,

  /// The durable store aborted the transaction
  #[error("vault store failed: {0}")]
  Store(#[from] StoreError),
}
