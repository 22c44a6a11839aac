//! Failure-safe key-value adapter.
//!
//! Plays the role browser local storage plays for the instrumentation
//! layer: synchronous string-keyed scalar storage that never surfaces a
//! failure to the caller. Backends log and degrade instead of erroring;
//! a failed read is indistinguishable from an absent key.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

/// Storage contract shared by the session and attribute engines.
///
/// All operations are infallible from the caller's perspective. Quota or
/// I/O problems are swallowed at the point of access; subsequent reads
/// simply observe the last value that made it in.
pub trait KvBackend: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

/// Typed convenience accessors layered over the string contract.
pub trait KvExt: KvBackend {
    fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|raw| raw.parse().ok())
    }

    fn set_u64(&self, key: &str, value: u64) {
        self.set(key, &value.to_string());
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|raw| raw.parse().ok())
    }

    fn set_bool(&self, key: &str, value: bool) {
        self.set(key, if value { "true" } else { "false" });
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key, ?err, "discarding unparseable stored value");
                None
            }
        }
    }

    fn set_json<T: Serialize>(&self, key: &str, value: &T) {
        match serde_json::to_string(value) {
            Ok(raw) => self.set(key, &raw),
            Err(err) => warn!(key, ?err, "failed to serialize value; skipping write"),
        }
    }
}

impl<S: KvBackend + ?Sized> KvExt for S {}

/// Purely in-memory backend for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KvBackend for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    fn set(&self, key: &str, value: &str) {
        self.entries.insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.entries.remove(key);
    }
}

/// JSON-file backend mirroring a browser storage scope on disk.
///
/// The whole map is rewritten on every set; the file is small (a few dozen
/// scalar fields) and the write path must stay synchronous to match the
/// storage semantics the engines assume.
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl JsonFileStore {
    /// Open or create the backing file. An unreadable or corrupt file is
    /// treated as an empty scope with a logged warning, matching the
    /// "missing storage means new visitor" rule.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(map) => map,
                Err(err) => {
                    warn!(path = %path.display(), ?err, "corrupt store file; starting empty");
                    HashMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => {
                warn!(path = %path.display(), ?err, "failed to read store file; starting empty");
                HashMap::new()
            }
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    fn persist(&self, entries: &HashMap<String, String>) {
        let raw = match serde_json::to_string_pretty(entries) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(?err, "failed to serialize store contents");
                return;
            }
        };
        if let Err(err) = std::fs::write(&self.path, raw) {
            warn!(path = %self.path.display(), ?err, "failed to persist store; keeping in-memory value");
        }
    }
}

impl KvBackend for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let mut guard = self.entries.lock();
        guard.insert(key.to_string(), value.to_string());
        self.persist(&guard);
    }

    fn remove(&self, key: &str) {
        let mut guard = self.entries.lock();
        guard.remove(key);
        self.persist(&guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryStore::new();
        assert!(store.get("session_id").is_none());
        store.set_u64("session_id", 42);
        assert_eq!(store.get_u64("session_id"), Some(42));
        store.remove("session_id");
        assert!(store.get("session_id").is_none());
    }

    #[test]
    fn typed_accessors_swallow_parse_failures() {
        let store = MemoryStore::new();
        store.set("counter", "not-a-number");
        assert_eq!(store.get_u64("counter"), None);
        store.set("flag", "yes");
        assert_eq!(store.get_bool("flag"), None);
    }

    #[test]
    fn json_helpers_round_trip_structs() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Stats {
            count: u64,
            max_ms: u64,
        }

        let store = MemoryStore::new();
        store.set_json(
            "session_stats",
            &Stats {
                count: 3,
                max_ms: 9_000,
            },
        );
        let loaded: Stats = store.get_json("session_stats").expect("stored stats");
        assert_eq!(
            loaded,
            Stats {
                count: 3,
                max_ms: 9_000
            }
        );
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("visitor.json");
        {
            let store = JsonFileStore::open(&path);
            store.set("visitor_id", "v-1");
            store.set_u64("session_number", 4);
        }
        let reopened = JsonFileStore::open(&path);
        assert_eq!(reopened.get("visitor_id").as_deref(), Some("v-1"));
        assert_eq!(reopened.get_u64("session_number"), Some(4));
    }

    #[test]
    fn corrupt_file_is_treated_as_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("visitor.json");
        std::fs::write(&path, "{ not json").expect("write corrupt file");
        let store = JsonFileStore::open(&path);
        assert!(store.get("anything").is_none());
        store.set("fresh", "value");
        assert_eq!(store.get("fresh").as_deref(), Some("value"));
    }
}
