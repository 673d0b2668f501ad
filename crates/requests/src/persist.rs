//! Explicit, scoped persistence of operation state.
//!
//! Nothing is assumed to be resident: a unit of work calls
//! [`Handle::load`] to rehydrate an object, mutates it through the returned
//! [`Loaded`] guard, and releases it at the end, which flushes a dirty value
//! and evicts it from memory. A transient handle has no store behind it:
//! its value stays in memory and flush/evict are no-ops.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::PersistError;

/// How much of an object graph to rehydrate.
///
/// Advisory: stores that always load whole objects ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Depth(pub u8);

impl Depth {
    pub const SHALLOW: Depth = Depth(1);
    pub const FULL: Depth = Depth(u8::MAX);
}

impl fmt::Display for Depth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key-value store of serialised objects.
pub trait ObjectStore: Send + Sync {
    fn load(&self, key: &str, depth: Depth) -> Result<Option<serde_json::Value>, PersistError>;
    fn store(&self, key: &str, value: &serde_json::Value) -> Result<(), PersistError>;
    fn delete(&self, key: &str) -> Result<(), PersistError>;
    /// Every key currently stored.
    fn keys(&self) -> Result<Vec<String>, PersistError>;
}

// ---------------------------------------------------------------------------
// JsonDirStore
// ---------------------------------------------------------------------------

/// Stores each object as `<key>.json` in one directory.
pub struct JsonDirStore {
    dir: PathBuf,
}

impl JsonDirStore {
    /// Opens (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, PersistError> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(PersistError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl ObjectStore for JsonDirStore {
    fn load(&self, key: &str, depth: Depth) -> Result<Option<serde_json::Value>, PersistError> {
        let path = self.path_for(key)?;
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path)?;
        debug!(key, %depth, "loaded object");
        Ok(Some(serde_json::from_str(&data)?))
    }

    fn store(&self, key: &str, value: &serde_json::Value) -> Result<(), PersistError> {
        let path = self.path_for(key)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(value)?)?;
        std::fs::rename(&tmp, &path)?;
        debug!(key, "stored object");
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), PersistError> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> Result<Vec<String>, PersistError> {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "json")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                keys.push(stem.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

// ---------------------------------------------------------------------------
// Handle / Loaded
// ---------------------------------------------------------------------------

/// Capability to rehydrate, flush and evict one stored object.
pub struct Handle<T> {
    key: String,
    store: Option<Arc<dyn ObjectStore>>,
    resident: Mutex<Option<T>>,
}

impl<T> Handle<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    /// A handle with no backing store; `value` stays in memory.
    pub fn transient(key: impl Into<String>, value: T) -> Self {
        Self {
            key: key.into(),
            store: None,
            resident: Mutex::new(Some(value)),
        }
    }

    /// A handle to an object that may already be stored under `key`.
    pub fn attach(store: Arc<dyn ObjectStore>, key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            store: Some(store),
            resident: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_persistent(&self) -> bool {
        self.store.is_some()
    }

    pub fn is_resident(&self) -> bool {
        self.lock().is_some()
    }

    /// Rehydrates the object for the current unit of work.
    pub fn load(&self, depth: Depth) -> Result<Loaded<'_, T>, PersistError> {
        let cached = self.lock().clone();
        let value = match cached {
            Some(v) => v,
            None => {
                let store = self
                    .store
                    .as_ref()
                    .ok_or_else(|| PersistError::Missing(self.key.clone()))?;
                let raw = store
                    .load(&self.key, depth)?
                    .ok_or_else(|| PersistError::Missing(self.key.clone()))?;
                let v: T = serde_json::from_value(raw)?;
                *self.lock() = Some(v.clone());
                v
            }
        };
        Ok(Loaded {
            handle: self,
            value,
            dirty: false,
            released: false,
        })
    }

    /// Writes `value` through to the store.
    pub fn save(&self, value: &T) -> Result<(), PersistError> {
        match &self.store {
            Some(store) => {
                store.store(&self.key, &serde_json::to_value(value)?)?;
                let mut slot = self.lock();
                if slot.is_some() {
                    *slot = Some(value.clone());
                }
            }
            None => *self.lock() = Some(value.clone()),
        }
        Ok(())
    }

    /// Drops the in-memory copy. No-op for transient handles.
    pub fn evict(&self) {
        if self.store.is_some() {
            *self.lock() = None;
        }
    }

    /// Deletes the stored object.
    pub fn remove(&self) -> Result<(), PersistError> {
        if let Some(store) = &self.store {
            store.delete(&self.key)?;
            *self.lock() = None;
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<T>> {
        self.resident.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A rehydrated object, valid for one unit of work.
///
/// Dropping it without [`release`](Self::release) still flushes and evicts,
/// logging any flush error.
pub struct Loaded<'a, T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    handle: &'a Handle<T>,
    value: T,
    dirty: bool,
    released: bool,
}

impl<T> Loaded<'_, T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    /// Schedules the value to be written back on release.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Flushes the value if dirty and evicts it.
    pub fn release(mut self) -> Result<(), PersistError> {
        self.finish()
    }

    fn finish(&mut self) -> Result<(), PersistError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        if self.dirty {
            self.handle.save(&self.value)?;
        }
        self.handle.evict();
        Ok(())
    }
}

impl<T> Deref for Loaded<'_, T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for Loaded<'_, T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T> Drop for Loaded<'_, T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!(key = self.handle.key(), error = %e, "flush on drop failed");
        }
    }
}
