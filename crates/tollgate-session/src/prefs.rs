//! Preference Store
//!
//! A small key-value store for host preferences: routing selection,
//! the "session desired" flag used on boot, and encrypted credential
//! records. Values are JSON so strings, booleans and string sets share
//! one file.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Key-value preference storage
///
/// Mutations are committed before returning, so a successful `put`
/// survives a process restart for persistent implementations.
pub trait PrefStore: Send + Sync {
    /// Read a raw value
    fn get(&self, key: &str) -> Option<Value>;

    /// Write a raw value
    fn put(&self, key: &str, value: Value) -> Result<(), PrefsError>;

    /// Remove a value (removing a missing key succeeds)
    fn remove(&self, key: &str) -> Result<(), PrefsError>;

    /// Read a string value
    fn get_string(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Write a string value
    fn put_string(&self, key: &str, value: &str) -> Result<(), PrefsError> {
        self.put(key, Value::String(value.to_string()))
    }

    /// Read a boolean value
    fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key)?.as_bool()
    }

    /// Write a boolean value
    fn put_bool(&self, key: &str, value: bool) -> Result<(), PrefsError> {
        self.put(key, Value::Bool(value))
    }

    /// Read a set of strings (non-string members are skipped)
    fn get_string_set(&self, key: &str) -> Option<BTreeSet<String>> {
        match self.get(key)? {
            Value::Array(items) => Some(
                items
                    .into_iter()
                    .filter_map(|v| match v {
                        Value::String(s) => Some(s),
                        _ => None,
                    })
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Write a set of strings
    fn put_string_set(&self, key: &str, values: &BTreeSet<String>) -> Result<(), PrefsError> {
        let items = values.iter().cloned().map(Value::String).collect();
        self.put(key, Value::Array(items))
    }
}

/// In-memory preference store
#[derive(Debug, Default)]
pub struct MemoryPrefStore {
    values: Mutex<BTreeMap<String, Value>>,
}

impl MemoryPrefStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PrefStore for MemoryPrefStore {
    fn get(&self, key: &str) -> Option<Value> {
        let values = self.values.lock().ok()?;
        values.get(key).cloned()
    }

    fn put(&self, key: &str, value: Value) -> Result<(), PrefsError> {
        let mut values = self.values.lock().map_err(|_| PrefsError::Poisoned)?;
        values.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PrefsError> {
        let mut values = self.values.lock().map_err(|_| PrefsError::Poisoned)?;
        values.remove(key);
        Ok(())
    }
}

/// JSON-file-backed preference store
///
/// The whole map is rewritten on every mutation through a temporary
/// file and a rename, so readers never observe a half-written file.
#[derive(Debug)]
pub struct JsonPrefStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, Value>>,
}

impl JsonPrefStore {
    /// Open (or lazily create) the store at `path`
    ///
    /// A missing file starts empty. A corrupt file is logged and treated
    /// as empty; it is replaced on the next successful write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PrefsError> {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(values) => values,
                Err(e) => {
                    warn!("Ignoring corrupt preference file {}: {}", path.display(), e);
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(PrefsError::Io(e.to_string())),
        };

        debug!("Opened preference store {} ({} keys)", path.display(), values.len());
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    /// Backing file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn commit(&self, values: &BTreeMap<String, Value>) -> Result<(), PrefsError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PrefsError::Io(e.to_string()))?;
        }
        let content =
            serde_json::to_string_pretty(values).map_err(|e| PrefsError::Encode(e.to_string()))?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content).map_err(|e| PrefsError::Io(e.to_string()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| PrefsError::Io(e.to_string()))?;
        Ok(())
    }

    fn mutate(&self, f: impl FnOnce(&mut BTreeMap<String, Value>)) -> Result<(), PrefsError> {
        let mut values = self.values.lock().map_err(|_| PrefsError::Poisoned)?;
        let mut next = values.clone();
        f(&mut next);
        self.commit(&next)?;
        *values = next;
        Ok(())
    }
}

impl PrefStore for JsonPrefStore {
    fn get(&self, key: &str) -> Option<Value> {
        let values = self.values.lock().ok()?;
        values.get(key).cloned()
    }

    fn put(&self, key: &str, value: Value) -> Result<(), PrefsError> {
        self.mutate(|values| {
            values.insert(key.to_string(), value);
        })
    }

    fn remove(&self, key: &str) -> Result<(), PrefsError> {
        self.mutate(|values| {
            values.remove(key);
        })
    }
}

/// Preference store errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum PrefsError {
    #[error("Preference I/O error: {0}")]
    Io(String),

    #[error("Preference encode error: {0}")]
    Encode(String),

    #[error("Preference store lock poisoned")]
    Poisoned,
}
