//! Primitive provider: randomness, PBKDF2 and AES-256-GCM over `ring`.

use std::num::NonZeroU32;

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::Zeroizing;

use super::error::VaultError;

/// 128-bit salt per record
pub const SALT_LEN: usize = 16;
/// 96-bit nonce per encryption
pub const NONCE_LEN: usize = ring::aead::NONCE_LEN;
/// 256-bit AES key
pub const KEY_LEN: usize = 32;
/// PBKDF2-HMAC-SHA256 rounds; records written with one count can only be read with it
pub const PBKDF2_ITERATIONS: NonZeroU32 = match NonZeroU32::new(200_000) {
  Some(n) => n,
  None => panic!("iteration count must be non-zero"),
};

/// Fill an array from the system CSPRNG.
pub fn random_bytes<const N: usize>() -> Result<[u8; N], VaultError> {
  let mut out = [0u8; N];
  SystemRandom::new()
    .fill(&mut out)
    .map_err(|_| VaultError::Primitive("random generator unavailable"))?;
  Ok(out)
}

/// Stretch `secret` into raw key material. Slow on purpose.
pub fn pbkdf2_sha256(
  secret: &[u8],
  salt: &[u8; SALT_LEN],
  iterations: NonZeroU32,
) -> Zeroizing<[u8; KEY_LEN]> {
  let mut out = Zeroizing::new([0u8; KEY_LEN]);
  pbkdf2::derive(
    pbkdf2::PBKDF2_HMAC_SHA256,
    iterations,
    salt,
    secret,
    out.as_mut_slice(),
  );
  out
}

/// Bind raw key material to AES-256-GCM. The result cannot be exported.
pub fn aead_key(material: &[u8]) -> Result<LessSafeKey, VaultError> {
  let unbound = UnboundKey::new(&AES_256_GCM, material)
    .map_err(|_| VaultError::Primitive("key material rejected"))?;
  Ok(LessSafeKey::new(unbound))
}

/// Encrypt under a fresh random nonce.
///
/// Returns the nonce and `ciphertext || tag`.
pub fn seal(key: &LessSafeKey, plaintext: &[u8]) -> Result<([u8; NONCE_LEN], Vec<u8>), VaultError> {
  let nonce_bytes = random_bytes::<NONCE_LEN>()?;
  let mut in_out = plaintext.to_vec();
  key
    .seal_in_place_append_tag(
      Nonce::assume_unique_for_key(nonce_bytes),
      Aad::empty(),
      &mut in_out,
    )
    .map_err(|_| VaultError::Primitive("encryption failed"))?;
  Ok((nonce_bytes, in_out))
}

/// Decrypt and verify `ciphertext || tag`.
pub fn open(
  key: &LessSafeKey,
  nonce: &[u8; NONCE_LEN],
  ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, VaultError> {
  let mut buf = Zeroizing::new(ciphertext.to_vec());
  let len = key
    .open_in_place(
      Nonce::assume_unique_for_key(*nonce),
      Aad::empty(),
      buf.as_mut_slice(),
    )
    .map_err(|_| VaultError::Authentication)?
    .len();
  buf.truncate(len);
  Ok(buf)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn key() -> LessSafeKey {
    aead_key(&random_bytes::<KEY_LEN>().unwrap()).unwrap()
  }

  #[test]
  fn test_seal_open_roundtrip() {
    let key = key();
    let (nonce, ciphertext) = seal(&key, b"secret data").unwrap();
    assert_ne!(&ciphertext[..11], b"secret data");
    assert_eq!(ciphertext.len(), 11 + AES_256_GCM.tag_len());

    let plaintext = open(&key, &nonce, &ciphertext).unwrap();
    assert_eq!(plaintext.as_slice(), b"secret data");
  }

  #[test]
  fn test_tampered_ciphertext_fails() {
    let key = key();
    let (nonce, mut ciphertext) = seal(&key, b"secret data").unwrap();
    ciphertext[0] ^= 0x01;
    assert!(matches!(
      open(&key, &nonce, &ciphertext),
      Err(VaultError::Authentication)
    ));
  }

  #[test]
  fn test_wrong_key_fails() {
    let (nonce, ciphertext) = seal(&key(), b"secret data").unwrap();
    assert!(matches!(
      open(&key(), &nonce, &ciphertext),
      Err(VaultError::Authentication)
    ));
  }

  #[test]
  fn test_truncated_ciphertext_fails() {
    let key = key();
    assert!(open(&key, &[0u8; NONCE_LEN], &[1, 2, 3]).is_err());
  }

  #[test]
  fn test_pbkdf2_is_deterministic_per_salt() {
    let rounds = NonZeroU32::new(10).unwrap();
    let a = pbkdf2_sha256(b"pw", &[1u8; SALT_LEN], rounds);
    let b = pbkdf2_sha256(b"pw", &[1u8; SALT_LEN], rounds);
    let c = pbkdf2_sha256(b"pw", &[2u8; SALT_LEN], rounds);
    assert_eq!(*a, *b);
    assert_ne!(*a, *c);
  }

  #[test]
  fn test_nonces_are_fresh() {
    let key = key();
    let (n1, _) = seal(&key, b"same").unwrap();
    let (n2, _) = seal(&key, b"same").unwrap();
    assert_ne!(n1, n2);
  }
}
