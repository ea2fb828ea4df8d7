//! Credential resolution and persistence

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use thiserror::Error;
use tracing::{info, warn};

/// Errors from the credential storage backend
#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("failed to read credential file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to write credential file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// Persistent storage for the user-set key
pub trait CredentialStorage: Send + Sync {
    /// Load the stored key, if any
    fn load(&self) -> Result<Option<String>, CredentialError>;

    /// Persist a key, replacing any previous one
    fn save(&self, key: &str) -> Result<(), CredentialError>;

    /// Remove the stored key
    fn clear(&self) -> Result<(), CredentialError>;
}

/// Default location of the credential file (`<config dir>/treadmill-live/api-key`)
pub fn default_credential_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("treadmill-live").join("api-key"))
}

/// Stores the key in a single file
#[derive(Debug, Clone)]
pub struct FileCredentialStorage {
    path: PathBuf,
}

impl FileCredentialStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStorage for FileCredentialStorage {
    fn load(&self) -> Result<Option<String>, CredentialError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(normalize(Some(contents))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(CredentialError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn save(&self, key: &str) -> Result<(), CredentialError> {
        let write_err = |source| CredentialError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        fs::write(&self.path, key).map_err(write_err)
    }

    fn clear(&self) -> Result<(), CredentialError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CredentialError::Write {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

/// Keeps the key in memory only
#[derive(Debug, Default)]
pub struct MemoryCredentialStorage {
    key: Mutex<Option<String>>,
}

impl MemoryCredentialStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage that already holds `key`
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            key: Mutex::new(Some(key.into())),
        }
    }
}

impl CredentialStorage for MemoryCredentialStorage {
    fn load(&self) -> Result<Option<String>, CredentialError> {
        Ok(self.key.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save(&self, key: &str) -> Result<(), CredentialError> {
        *self.key.lock().unwrap_or_else(|e| e.into_inner()) = Some(key.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<(), CredentialError> {
        *self.key.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}

/// Resolves the effective access key
pub struct CredentialStore {
    default_key: Option<String>,
    storage: Box<dyn CredentialStorage>,
    /// The user-set key, loaded once and kept in sync with `storage`
    stored: RwLock<Option<String>>,
    /// Serializes writes to `storage`
    persisting: Mutex<()>,
}

impl CredentialStore {
    /// Create a store, loading any previously persisted key
    ///
    /// A storage read failure is logged and treated as "no stored key".
    pub fn new(default_key: Option<String>, storage: Box<dyn CredentialStorage>) -> Self {
        let stored = match storage.load() {
            Ok(key) => normalize(key),
            Err(e) => {
                warn!("[CREDENTIAL] {}", e);
                None
            }
        };

        Self {
            default_key: normalize(default_key),
            storage,
            stored: RwLock::new(stored),
            persisting: Mutex::new(()),
        }
    }

    /// Store backed by memory only, with an optional default key
    pub fn in_memory(default_key: Option<String>) -> Self {
        Self::new(default_key, Box::new(MemoryCredentialStorage::new()))
    }

    /// Effective key: the user-set key, else the default
    pub fn resolve(&self) -> Option<String> {
        self.stored().or_else(|| self.default_key.clone())
    }

    /// The user-set key only
    pub fn stored(&self) -> Option<String> {
        self.stored.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Whether any key resolves
    pub fn has_credential(&self) -> bool {
        self.resolve().is_some()
    }

    /// Update or clear the user-set key and write it to storage
    ///
    /// Blank input clears. The new value takes effect even if persisting it fails.
    /// Blocks on storage I/O; async callers use [`update`](Self::update) and run
    /// [`persist`](Self::persist) on a blocking thread.
    pub fn set(&self, key: Option<String>) {
        self.update(key);
        self.persist();
    }

    /// Update or clear the user-set key in memory only
    pub fn update(&self, key: Option<String>) {
        let key = normalize(key);
        info!(
            "[CREDENTIAL] Stored key {}",
            if key.is_some() { "updated" } else { "cleared" }
        );
        *self.stored.write().unwrap_or_else(|e| e.into_inner()) = key;
    }

    /// Write the current user-set key to storage
    ///
    /// Reads the value under the write lock, so overlapping calls leave the
    /// latest key on disk whatever order they run in.
    pub fn persist(&self) {
        let _guard = self.persisting.lock().unwrap_or_else(|e| e.into_inner());

        let persisted = match self.stored() {
            Some(key) => self.storage.save(&key),
            None => self.storage.clear(),
        };
        if let Err(e) = persisted {
            warn!("[CREDENTIAL] {}", e);
        }
    }
}

fn normalize(key: Option<String>) -> Option<String> {
    key.map(|k| k.trim().to_string()).filter(|k| !k.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_key_overrides_default() {
        let store = CredentialStore::new(
            Some("default".into()),
            Box::new(MemoryCredentialStorage::with_key("mine")),
        );
        assert_eq!(store.resolve().as_deref(), Some("mine"));

        store.set(None);
        assert_eq!(store.resolve().as_deref(), Some("default"));
        assert_eq!(store.stored(), None);
    }

    #[test]
    fn test_blank_key_clears() {
        let store = CredentialStore::in_memory(None);
        store.set(Some("abc".into()));
        assert!(store.has_credential());

        store.set(Some("   ".into()));
        assert!(!store.has_credential());
    }

    #[test]
    fn test_blank_default_is_ignored() {
        let store = CredentialStore::in_memory(Some(" ".into()));
        assert_eq!(store.resolve(), None);
    }

    #[test]
    fn test_file_storage_persists_across_stores() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("api-key");

        let store = CredentialStore::new(None, Box::new(FileCredentialStorage::new(&path)));
        assert_eq!(store.resolve(), None);
        store.set(Some("  k-123 \n".into()));

        let reopened = CredentialStore::new(None, Box::new(FileCredentialStorage::new(&path)));
        assert_eq!(reopened.resolve().as_deref(), Some("k-123"));

        reopened.set(None);
        assert!(!path.exists());
        // Clearing twice is fine
        FileCredentialStorage::new(&path).clear().unwrap();
    }

    #[test]
    fn test_update_defers_storage_until_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api-key");
        let store = CredentialStore::new(None, Box::new(FileCredentialStorage::new(&path)));

        store.update(Some("first".into()));
        store.update(Some("second".into()));
        assert_eq!(store.resolve().as_deref(), Some("second"));
        assert!(!path.exists());

        // Two writers racing for the same update both write the newest key
        store.persist();
        store.persist();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
    }

    #[test]
    fn test_unwritable_storage_still_updates_value() {
        let dir = tempfile::tempdir().unwrap();
        // The parent "directory" is a regular file, so writes fail
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "x").unwrap();

        let store = CredentialStore::new(
            None,
            Box::new(FileCredentialStorage::new(blocker.join("api-key"))),
        );
        store.set(Some("k".into()));
        assert_eq!(store.resolve().as_deref(), Some("k"));
    }
}
