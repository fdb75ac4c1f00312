//! Encryption-at-rest wrapper for any [`KeyStore`].
//!
//! Each value is sealed with AES-256-GCM under a storage key. The record
//! name is bound as associated data, so a sealed blob copied under another
//! name fails to open.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::store::KeyStore;
use crate::CryptoError;

/// Record holding the Argon2 salt. Stored unsealed in the inner store.
pub const KEY_SEAL_SALT: &str = "sealed/salt";

const NONCE_LEN: usize = 12;
const SALT_LEN: usize = 16;

pub struct SealedKeyStore<S> {
    inner: S,
    key: Zeroizing<[u8; 32]>,
}

impl<S: KeyStore> SealedKeyStore<S> {
    /// Wrap `inner` with an already derived 32-byte storage key.
    pub fn new(inner: S, key: [u8; 32]) -> Self {
        Self {
            inner,
            key: Zeroizing::new(key),
        }
    }

    /// Wrap `inner` with a key derived from `passphrase` using `Argon2id`.
    ///
    /// The salt is generated on first use and kept in the inner store.
    /// Test builds use cheap parameters.
    pub fn with_passphrase(inner: S, passphrase: &str) -> Result<Self, CryptoError> {
        let salt = match inner.get(KEY_SEAL_SALT)? {
            Some(salt) => salt,
            None => {
                let mut salt = vec![0u8; SALT_LEN];
                rand::rngs::OsRng.fill_bytes(&mut salt);
                inner.set(KEY_SEAL_SALT, &salt)?;
                salt
            }
        };
        let key = derive_key(passphrase, &salt)?;
        Ok(Self { inner, key })
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn cipher(&self) -> Result<Aes256Gcm, CryptoError> {
        Aes256Gcm::new_from_slice(&self.key[..])
            .map_err(|e| CryptoError::StorageError(format!("seal key: {e}")))
    }
}

impl<S: KeyStore> KeyStore for SealedKeyStore<S> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        let Some(sealed) = self.inner.get(key)? else {
            return Ok(None);
        };
        if sealed.len() < NONCE_LEN {
            return Err(CryptoError::StorageError(format!("sealed record {key} too short")));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher()?
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: key.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::StorageError(format!("cannot open sealed record {key}")))?;
        Ok(Some(plaintext))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher()?
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: value,
                    aad: key.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::StorageError(format!("cannot seal record {key}")))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        self.inner.set(key, &sealed)
    }

    fn delete(&self, key: &str) -> Result<(), CryptoError> {
        self.inner.delete(key)
    }

    fn delete_all(&self, keys: &[String]) -> Result<(), CryptoError> {
        self.inner.delete_all(keys)
    }
}

fn derive_key(passphrase: &str, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    use argon2::{Algorithm, Argon2, Params, Version};

    #[cfg(debug_assertions)]
    let params = Params::new(256, 1, 1, Some(32));
    #[cfg(not(debug_assertions))]
    let params = Params::new(65536, 3, 4, Some(32));
    let params = params.map_err(|e| CryptoError::StorageError(format!("argon2 params: {e}")))?;

    let hasher = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = Zeroizing::new([0u8; 32]);
    hasher
        .hash_password_into(passphrase.as_bytes(), salt, &mut key[..])
        .map_err(|e| CryptoError::StorageError(format!("argon2: {e}")))?;
    Ok(key)
}
