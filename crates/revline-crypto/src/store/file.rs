//! Directory-backed [`KeyStore`].
//!
//! One file per record, named by the hex of the record key. Writes land in
//! a temp file that is synced and then renamed over the target, so a reader
//! sees either the previous record or the new one.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::store::KeyStore;
use crate::CryptoError;

pub struct FileKeyStore {
    dir: PathBuf,
    tmp_counter: AtomicU64,
}

impl FileKeyStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CryptoError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|e| CryptoError::StorageError(format!("create {}: {e}", dir.display())))?;
        Ok(Self {
            dir,
            tmp_counter: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.rec", hex::encode(key.as_bytes())))
    }

    fn tmp_path(&self, key: &str) -> PathBuf {
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        self.dir.join(format!(
            "{}.{}.{n}.tmp",
            hex::encode(key.as_bytes()),
            std::process::id()
        ))
    }
}

impl KeyStore for FileKeyStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        match fs::read(self.record_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CryptoError::StorageError(format!("read {key}: {e}"))),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), CryptoError> {
        let tmp = self.tmp_path(key);
        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(value)?;
            file.sync_all()?;
            fs::rename(&tmp, self.record_path(key))
        };
        write().map_err(|e| {
            let _ = fs::remove_file(&tmp);
            CryptoError::StorageError(format!("write {key}: {e}"))
        })
    }

    fn delete(&self, key: &str) -> Result<(), CryptoError> {
        match fs::remove_file(self.record_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CryptoError::StorageError(format!("delete {key}: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn roundtrip_and_replace() {
        let dir = TempDir::new().unwrap();
        let store = FileKeyStore::open(dir.path()).unwrap();

        assert!(store.get("pairwise/session/bob").unwrap().is_none());
        store.set("pairwise/session/bob", b"first").unwrap();
        store.set("pairwise/session/bob", b"second").unwrap();
        assert_eq!(store.get("pairwise/session/bob").unwrap().unwrap(), b"second");
    }

    #[test]
    fn no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = FileKeyStore::open(dir.path()).unwrap();
        store.set("a", b"1").unwrap();
        store.set("b", b"2").unwrap();

        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileKeyStore::open(dir.path()).unwrap();
            store.set("account/identity", &[7u8; 32]).unwrap();
        }
        let store = FileKeyStore::open(dir.path()).unwrap();
        assert_eq!(store.get("account/identity").unwrap().unwrap(), [7u8; 32]);
        store.delete("account/identity").unwrap();
        store.delete("account/identity").unwrap();
        assert!(store.get("account/identity").unwrap().is_none());
    }
}
