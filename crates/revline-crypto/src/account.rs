//! The device account: identity key pair plus the one-time pre-key pool.
//!
//! Public halves of the pre-keys are published through the directory
//! service (external); each secret half is consumed exactly once when an
//! inbound pairwise session is established against it.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::EncryptionConfig;
use crate::identity::{self, IdentityKeyPair};
use crate::ids::PreKeyId;
use crate::store::{load_record, save_record, KeyStore, KEY_IDENTITY, KEY_PRE_KEYS};
use crate::CryptoError;

/// A single-use X25519 key pair from the local pool.
pub struct OneTimePreKey {
    id: PreKeyId,
    secret: StaticSecret,
}

impl OneTimePreKey {
    pub fn id(&self) -> PreKeyId {
        self.id
    }

    pub fn public_key(&self) -> [u8; 32] {
        X25519Public::from(&self.secret).to_bytes()
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

impl std::fmt::Debug for OneTimePreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OneTimePreKey")
            .field("id", &self.id)
            .field("public_key", &hex::encode(self.public_key()))
            .finish_non_exhaustive()
    }
}

/// Public half of a pre-key as published to the directory service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedPreKey {
    pub id: PreKeyId,
    /// X25519 public key.
    pub public_key: [u8; 32],
    /// Ed25519 signature over `public_key` by the owner's identity key.
    pub signature: Vec<u8>,
}

impl PublishedPreKey {
    /// Check the signature against the owner's Ed25519 identity key.
    pub fn verify(&self, identity_key: &[u8; 32]) -> Result<(), CryptoError> {
        identity::verify_signature(identity_key, &self.public_key, &self.signature)
    }
}

/// Everything a peer needs to start a session with this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicIdentity {
    /// Ed25519 identity public key.
    pub identity_key: [u8; 32],
    /// Unconsumed one-time pre-keys, oldest first.
    pub pre_keys: Vec<PublishedPreKey>,
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct IdentityRecord {
    secret: [u8; 32],
}

#[derive(Clone, Default, Serialize, Deserialize)]
struct PreKeyPool {
    next_id: PreKeyId,
    keys: BTreeMap<PreKeyId, [u8; 32]>,
}

impl Drop for PreKeyPool {
    fn drop(&mut self) {
        for secret in self.keys.values_mut() {
            secret.zeroize();
        }
    }
}

impl PreKeyPool {
    fn generate(&mut self, count: usize) -> Vec<PreKeyId> {
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            self.keys.insert(id, secret.to_bytes());
            ids.push(id);
        }
        ids
    }

    /// Drop the oldest keys until at most `max` remain.
    fn evict_to(&mut self, max: usize) -> usize {
        let mut evicted = 0;
        while self.keys.len() > max {
            if self.keys.pop_first().is_none() {
                break;
            }
            evicted += 1;
        }
        evicted
    }
}

struct AccountState {
    identity: IdentityKeyPair,
    pool: PreKeyPool,
}

impl AccountState {
    fn publish(&self, id: PreKeyId, secret: &[u8; 32]) -> PublishedPreKey {
        let public_key = X25519Public::from(&StaticSecret::from(*secret)).to_bytes();
        PublishedPreKey {
            id,
            public_key,
            signature: self.identity.sign(&public_key).to_bytes().to_vec(),
        }
    }
}

/// Owns the identity key pair and pre-key pool for this device.
pub struct IdentityAccount {
    store: Arc<dyn KeyStore>,
    config: EncryptionConfig,
    state: RwLock<Option<AccountState>>,
}

impl IdentityAccount {
    pub fn new(store: Arc<dyn KeyStore>, config: EncryptionConfig) -> Self {
        Self {
            store,
            config,
            state: RwLock::new(None),
        }
    }

    /// Load the account from storage, or create and persist a fresh one.
    ///
    /// A second call while initialized does nothing.
    pub fn initialize(&self) -> Result<(), CryptoError> {
        let mut state = self.state.write();
        if state.is_some() {
            return Ok(());
        }

        // The identity record is written last; its presence means the pool
        // record was written too.
        let loaded = if let Some(record) = load_record::<IdentityRecord>(&*self.store, KEY_IDENTITY)? {
            let identity = IdentityKeyPair::from_secret_bytes(&record.secret);
            let pool = match load_record::<PreKeyPool>(&*self.store, KEY_PRE_KEYS)? {
                Some(pool) => pool,
                None => {
                    tracing::warn!("pre-key pool missing, generating a fresh one");
                    self.fresh_pool()?
                }
            };
            tracing::debug!(
                identity = %identity.fingerprint(),
                pre_keys = pool.keys.len(),
                "loaded encryption account"
            );
            AccountState { identity, pool }
        } else {
            let identity = IdentityKeyPair::generate();
            let pool = self.fresh_pool()?;
            save_record(
                &*self.store,
                KEY_IDENTITY,
                &IdentityRecord {
                    secret: *identity.secret_key_bytes(),
                },
            )?;
            tracing::info!(
                identity = %identity.fingerprint(),
                pre_keys = pool.keys.len(),
                "created encryption account"
            );
            AccountState { identity, pool }
        };

        *state = Some(loaded);
        Ok(())
    }

    fn fresh_pool(&self) -> Result<PreKeyPool, CryptoError> {
        let mut pool = PreKeyPool::default();
        pool.generate(self.config.initial_pre_keys);
        save_record(&*self.store, KEY_PRE_KEYS, &pool)?;
        Ok(pool)
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read().is_some()
    }

    /// Public identity key and all unconsumed pre-keys.
    pub fn public_identity(&self) -> Result<PublicIdentity, CryptoError> {
        let state = self.state.read();
        let state = state.as_ref().ok_or(CryptoError::NotInitialized)?;
        Ok(PublicIdentity {
            identity_key: state.identity.public_key_bytes(),
            pre_keys: state
                .pool
                .keys
                .iter()
                .map(|(id, secret)| state.publish(*id, secret))
                .collect(),
        })
    }

    /// Hex of the identity public key.
    pub fn fingerprint(&self) -> Result<String, CryptoError> {
        let state = self.state.read();
        let state = state.as_ref().ok_or(CryptoError::NotInitialized)?;
        Ok(state.identity.fingerprint())
    }

    /// Append `count` fresh pre-keys and persist the pool.
    ///
    /// Returns the newly published keys. On a storage failure the pool is
    /// left exactly as it was.
    pub fn generate_pre_keys(&self, count: usize) -> Result<Vec<PublishedPreKey>, CryptoError> {
        let mut guard = self.state.write();
        let state = guard.as_mut().ok_or(CryptoError::NotInitialized)?;

        let mut pool = state.pool.clone();
        let ids = pool.generate(count);
        let evicted = pool.evict_to(self.config.max_pre_keys);
        save_record(&*self.store, KEY_PRE_KEYS, &pool)?;
        state.pool = pool;

        tracing::debug!(generated = count, evicted, total = state.pool.keys.len(), "generated pre-keys");
        Ok(ids
            .into_iter()
            .filter_map(|id| state.pool.keys.get(&id).map(|secret| state.publish(id, secret)))
            .collect())
    }

    /// Remove and return the pre-key `id`.
    ///
    /// Fails with `KeyNotFound` if it was already consumed or never existed,
    /// which callers treat as a replayed or malformed handshake.
    pub fn consume_pre_key(&self, id: PreKeyId) -> Result<OneTimePreKey, CryptoError> {
        let mut guard = self.state.write();
        let state = guard.as_mut().ok_or(CryptoError::NotInitialized)?;

        let mut pool = state.pool.clone();
        let secret = pool
            .keys
            .remove(&id)
            .ok_or_else(|| CryptoError::KeyNotFound(format!("pre-key {id}")))?;
        save_record(&*self.store, KEY_PRE_KEYS, &pool)?;
        state.pool = pool;

        tracing::debug!(pre_key = id, remaining = state.pool.keys.len(), "consumed pre-key");
        Ok(OneTimePreKey {
            id,
            secret: StaticSecret::from(secret),
        })
    }

    /// Look up a pre-key without consuming it.
    pub(crate) fn peek_pre_key(&self, id: PreKeyId) -> Result<OneTimePreKey, CryptoError> {
        let state = self.state.read();
        let state = state.as_ref().ok_or(CryptoError::NotInitialized)?;
        let secret = state
            .pool
            .keys
            .get(&id)
            .ok_or_else(|| CryptoError::KeyNotFound(format!("pre-key {id}")))?;
        Ok(OneTimePreKey {
            id,
            secret: StaticSecret::from(*secret),
        })
    }

    pub fn unconsumed_pre_keys(&self) -> Result<usize, CryptoError> {
        let state = self.state.read();
        let state = state.as_ref().ok_or(CryptoError::NotInitialized)?;
        Ok(state.pool.keys.len())
    }

    /// Whether the pool has dropped below the configured low watermark.
    pub fn needs_more_pre_keys(&self) -> Result<bool, CryptoError> {
        Ok(self.unconsumed_pre_keys()? < self.config.pre_key_low_watermark)
    }

    /// Identity X25519 secret and Ed25519 public key, for key agreement.
    pub(crate) fn identity_keys(&self) -> Result<(StaticSecret, [u8; 32]), CryptoError> {
        let state = self.state.read();
        let state = state.as_ref().ok_or(CryptoError::NotInitialized)?;
        Ok((
            state.identity.agreement_secret(),
            state.identity.public_key_bytes(),
        ))
    }

    /// Wipe the identity and pre-key pool from memory and storage.
    ///
    /// Memory is cleared even if the storage delete fails; the error is
    /// still returned so the caller can retry the wipe.
    pub fn destroy(&self) -> Result<(), CryptoError> {
        let mut state = self.state.write();
        let result = self
            .store
            .delete_all(&[KEY_IDENTITY.to_string(), KEY_PRE_KEYS.to_string()]);
        *state = None;
        match &result {
            Ok(()) => tracing::info!("encryption account destroyed"),
            Err(e) => tracing::warn!(error = %e, "account cleared from memory but storage wipe failed"),
        }
        result
    }
}
