//! In-memory [`KeyStore`].
//!
//! Suitable for tests and for hosts that persist elsewhere. Data is lost
//! on process exit.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::store::KeyStore;
use crate::CryptoError;

#[derive(Default)]
pub struct MemoryKeyStore {
    records: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Names of all records, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.records.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl KeyStore for MemoryKeyStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        Ok(self.records.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), CryptoError> {
        self.records.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), CryptoError> {
        self.records.lock().remove(key);
        Ok(())
    }

    fn delete_all(&self, keys: &[String]) -> Result<(), CryptoError> {
        let mut records = self.records.lock();
        for key in keys {
            records.remove(key);
        }
        Ok(())
    }
}
