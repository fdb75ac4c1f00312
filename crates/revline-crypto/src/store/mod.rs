//! Durable storage for account keys and session state.
//!
//! The core only ever talks to [`KeyStore`]. Every record is written with
//! a single `set`, so a record is either the old blob or the new blob,
//! never a mix of both.

pub mod file;
pub mod memory;
pub mod sealed;

use std::collections::BTreeSet;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::ids::{InboundGroupKey, RemoteUserId, RoomId};
use crate::CryptoError;

pub use file::FileKeyStore;
pub use memory::MemoryKeyStore;
pub use sealed::SealedKeyStore;

/// Key-value persistence with atomic single-key replace.
///
/// The host app implements this over whatever secure storage the
/// platform offers; the crate ships in-memory, file and sealing backends.
pub trait KeyStore: Send + Sync {
    /// Read a record.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CryptoError>;

    /// Replace a record in one step.
    fn set(&self, key: &str, value: &[u8]) -> Result<(), CryptoError>;

    /// Delete a record. Deleting a missing record is not an error.
    fn delete(&self, key: &str) -> Result<(), CryptoError>;

    /// Delete several records.
    fn delete_all(&self, keys: &[String]) -> Result<(), CryptoError> {
        for key in keys {
            self.delete(key)?;
        }
        Ok(())
    }
}

// Record names used throughout the crate.

/// Serialized identity key pair.
pub const KEY_IDENTITY: &str = "account/identity";
/// Serialized one-time pre-key pool.
pub const KEY_PRE_KEYS: &str = "account/prekeys";
/// Index of every pairwise session record.
pub const KEY_PAIRWISE_INDEX: &str = "pairwise/index";
/// Index of every group session record.
pub const KEY_GROUP_INDEX: &str = "group/index";

// Ids are free-form strings, so each one is hex encoded before it becomes a
// path segment. Otherwise ("a", "b/c") and ("a/b", "c") would share a record.

/// Record name of the pairwise session with `user`.
pub fn pairwise_session_key(user: &RemoteUserId) -> String {
    format!("pairwise/session/{}", hex::encode(user.as_str()))
}

/// Record name of our outbound group session in `room`.
pub fn group_outbound_key(room: &RoomId) -> String {
    format!("group/outbound/{}", hex::encode(room.as_str()))
}

/// Record name of the inbound group session for `key`.
pub fn group_inbound_key(key: &InboundGroupKey) -> String {
    format!(
        "group/inbound/{}/{}",
        hex::encode(key.room.as_str()),
        hex::encode(key.sender.as_str())
    )
}

pub(crate) fn load_record<T: DeserializeOwned>(
    store: &dyn KeyStore,
    key: &str,
) -> Result<Option<T>, CryptoError> {
    match store.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

pub(crate) fn save_record<T: Serialize>(
    store: &dyn KeyStore,
    key: &str,
    record: &T,
) -> Result<(), CryptoError> {
    let bytes = serde_json::to_vec(record)
        .map_err(|e| CryptoError::StorageError(format!("encode {key}: {e}")))?;
    store.set(key, &bytes)
}

#[derive(Default, Serialize, Deserialize)]
struct IndexRecord {
    keys: BTreeSet<String>,
}

/// A persisted list of record names, so a wipe can find every session.
///
/// Callers insert the entry before writing the record it names, so every
/// record on disk is reachable from the index. An entry may outlive its
/// record if the second write fails; readers treat a missing record as
/// absent.
pub(crate) struct RecordIndex {
    key: &'static str,
    lock: Mutex<()>,
}

impl RecordIndex {
    pub(crate) fn new(key: &'static str) -> Self {
        Self {
            key,
            lock: Mutex::new(()),
        }
    }

    pub(crate) fn insert(&self, store: &dyn KeyStore, record: &str) -> Result<(), CryptoError> {
        let _guard = self.lock.lock();
        let mut index: IndexRecord = load_record(store, self.key)?.unwrap_or_default();
        if index.keys.insert(record.to_string()) {
            save_record(store, self.key, &index)?;
        }
        Ok(())
    }

    pub(crate) fn remove(&self, store: &dyn KeyStore, record: &str) -> Result<(), CryptoError> {
        let _guard = self.lock.lock();
        let mut index: IndexRecord = load_record(store, self.key)?.unwrap_or_default();
        if index.keys.remove(record) {
            save_record(store, self.key, &index)?;
        }
        Ok(())
    }

    /// Delete every indexed record and then the index itself.
    pub(crate) fn wipe(&self, store: &dyn KeyStore) -> Result<usize, CryptoError> {
        let _guard = self.lock.lock();
        let index: IndexRecord = load_record(store, self.key)?.unwrap_or_default();
        let mut keys: Vec<String> = index.keys.into_iter().collect();
        let count = keys.len();
        keys.push(self.key.to_string());
        store.delete_all(&keys)?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_names_are_distinct_per_session() {
        let room = RoomId::from("garage");
        let inbound = InboundGroupKey::new(room.clone(), "alice".into());
        assert_eq!(group_outbound_key(&room), "group/outbound/676172616765");
        assert_eq!(
            group_inbound_key(&inbound),
            "group/inbound/676172616765/616c696365"
        );
        assert_eq!(
            pairwise_session_key(&RemoteUserId::from("bob")),
            "pairwise/session/626f62"
        );
    }

    #[test]
    fn slashes_in_ids_do_not_collide() {
        let first = InboundGroupKey::new("a".into(), "b/c".into());
        let second = InboundGroupKey::new("a/b".into(), "c".into());
        assert_ne!(group_inbound_key(&first), group_inbound_key(&second));

        assert_ne!(
            pairwise_session_key(&"x/y".into()),
            pairwise_session_key(&"x".into())
        );
        assert!(!group_outbound_key(&"pit/lane".into())
            .trim_start_matches("group/outbound/")
            .contains('/'));
    }

    #[test]
    fn index_wipe_deletes_listed_records() {
        let store = MemoryKeyStore::new();
        let index = RecordIndex::new(KEY_PAIRWISE_INDEX);

        store.set("pairwise/session/a", b"a").unwrap();
        store.set("pairwise/session/b", b"b").unwrap();
        index.insert(&store, "pairwise/session/a").unwrap();
        index.insert(&store, "pairwise/session/b").unwrap();
        index.insert(&store, "pairwise/session/a").unwrap();

        assert_eq!(index.wipe(&store).unwrap(), 2);
        assert!(store.get("pairwise/session/a").unwrap().is_none());
        assert!(store.get("pairwise/session/b").unwrap().is_none());
        assert!(store.get(KEY_PAIRWISE_INDEX).unwrap().is_none());
    }

    #[test]
    fn index_remove_keeps_other_entries() {
        let store = MemoryKeyStore::new();
        let index = RecordIndex::new(KEY_GROUP_INDEX);
        index.insert(&store, "x").unwrap();
        index.insert(&store, "y").unwrap();
        index.remove(&store, "x").unwrap();

        let record: IndexRecord = load_record(&store, KEY_GROUP_INDEX).unwrap().unwrap();
        assert_eq!(record.keys.into_iter().collect::<Vec<_>>(), vec!["y".to_string()]);
    }
}
