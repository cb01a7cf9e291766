use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    sync::{Arc, RwLock},
};

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found")]
    NotFound,
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store backend failure: {0}")]
    Backend(String),
    #[error("stored value could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Small string-keyed persistence surface for client-local state.
pub trait KeyValueStore: Send + Sync {
    fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn get(&self, key: &str) -> Result<String, StoreError>;

    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Clone, Default)]
pub struct InMemoryKeyValueStore {
    data: Arc<RwLock<HashMap<String, String>>>,
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        data.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<String, StoreError> {
        let data = self
            .data
            .read()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        data.get(key).cloned().ok_or(StoreError::NotFound)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        if data.remove(key).is_none() {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

/// One JSON file per store, loaded and rewritten whole.
///
/// Values here are small client preferences; the simplicity beats a
/// database dependency.
#[derive(Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> Result<HashMap<String, String>, StoreError> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(err) => Err(StoreError::Unavailable(err.to_string())),
        }
    }

    fn save(&self, data: &HashMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| StoreError::Backend(err.to_string()))?;
        }
        let encoded =
            serde_json::to_string_pretty(data).map_err(|err| StoreError::Backend(err.to_string()))?;
        fs::write(&self.path, encoded).map_err(|err| StoreError::Backend(err.to_string()))
    }
}

impl KeyValueStore for JsonFileStore {
    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut data = self.load()?;
        data.insert(key.to_owned(), value.to_owned());
        self.save(&data)
    }

    fn get(&self, key: &str) -> Result<String, StoreError> {
        self.load()?.remove(key).ok_or(StoreError::NotFound)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut data = self.load()?;
        if data.remove(key).is_none() {
            return Err(StoreError::NotFound);
        }
        self.save(&data)
    }
}

/// Typed preference access over any key-value store.
#[derive(Clone)]
pub struct LocalPrefs<S: KeyValueStore> {
    inner: S,
}

const DISPLAY_NAME_KEY: &str = "display_name";
const ROOM_LIST_KEY: &str = "cached_rooms";

impl<S: KeyValueStore> LocalPrefs<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn display_name(&self) -> Result<String, StoreError> {
        self.inner.get(DISPLAY_NAME_KEY)
    }

    pub fn set_display_name(&self, name: &str) -> Result<(), StoreError> {
        self.inner.put(DISPLAY_NAME_KEY, name)
    }

    /// Cached room list shown before the first fetch completes.
    pub fn cached_rooms(&self) -> Result<Vec<String>, StoreError> {
        self.get_json(ROOM_LIST_KEY)
    }

    pub fn set_cached_rooms(&self, rooms: &[String]) -> Result<(), StoreError> {
        self.put_json(ROOM_LIST_KEY, &rooms)
    }

    /// Drop everything, including cached conversations. Used by the
    /// panic wipe.
    pub fn wipe(&self) -> Result<(), StoreError> {
        for key in [DISPLAY_NAME_KEY, ROOM_LIST_KEY] {
            match self.inner.remove(key) {
                Ok(()) | Err(StoreError::NotFound) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<T, StoreError> {
        let raw = self.inner.get(key)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let encoded =
            serde_json::to_string(value).map_err(|err| StoreError::Backend(err.to_string()))?;
        self.inner.put(key, &encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_roundtrip() {
        let store = InMemoryKeyValueStore::default();
        store.put("k", "v").expect("put should work");
        assert_eq!(store.get("k").expect("get should work"), "v");

        store.remove("k").expect("remove should work");
        assert!(matches!(store.get("k"), Err(StoreError::NotFound)));
    }

    #[test]
    fn json_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("prefs.json");

        let first = JsonFileStore::new(&path);
        first.put("k", "v").expect("put should work");

        let second = JsonFileStore::new(&path);
        assert_eq!(second.get("k").expect("get should work"), "v");
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path().join("never-written.json"));
        assert!(matches!(store.get("k"), Err(StoreError::NotFound)));
    }

    #[test]
    fn prefs_roundtrip_typed_values() {
        let prefs = LocalPrefs::new(InMemoryKeyValueStore::default());
        prefs.set_display_name("alice").expect("set name");
        prefs
            .set_cached_rooms(&["general".to_owned(), "random".to_owned()])
            .expect("set rooms");

        assert_eq!(prefs.display_name().expect("name"), "alice");
        assert_eq!(
            prefs.cached_rooms().expect("rooms"),
            vec!["general".to_owned(), "random".to_owned()]
        );
    }

    #[test]
    fn wipe_clears_everything_and_is_idempotent() {
        let prefs = LocalPrefs::new(InMemoryKeyValueStore::default());
        prefs.set_display_name("alice").expect("set name");

        prefs.wipe().expect("wipe");
        prefs.wipe().expect("second wipe");
        assert!(matches!(prefs.display_name(), Err(StoreError::NotFound)));
    }
}
