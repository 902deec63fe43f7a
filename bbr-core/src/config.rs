//! Typed key/value configuration store with schema-declared validation
//! and persistence.
//!
//! Every key the engine reads or writes — wire-protocol tunables,
//! deployment facts (interface names, prefixes), and ambient ones
//! (BBR sequence, permanent MLR set) — is declared once in a
//! [`ConfigSchema`], carrying its type, default, validator, and whether
//! it may be written by an admin surface and/or must survive a restart.
//! There is no path for an ad-hoc `save()` call outside this schema.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{BbrError, Result};

/// A config value. `StringList` covers both the permanent MLR address
/// set and the interior EID cache; anything richer goes through `Json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Str(String),
    Int(i64),
    Bool(bool),
    StringList(Vec<String>),
    Json(serde_json::Value),
}

impl ConfigValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_string_list(&self) -> Option<&[String]> {
        match self {
            Self::StringList(v) => Some(v),
            _ => None,
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        ConfigValue::Str(v.to_string())
    }
}

impl From<i64> for ConfigValue {
    fn from(v: i64) -> Self {
        ConfigValue::Int(v)
    }
}

impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        ConfigValue::Bool(v)
    }
}

/// Validator function stored per key. Kept as a plain function pointer
/// (no captured state) so [`ConfigSchema`] stays `Clone` and `Send`.
pub type Validator = fn(&ConfigValue) -> bool;

#[derive(Clone)]
pub struct SchemaEntry {
    pub default: Option<ConfigValue>,
    pub validator: Validator,
    pub writable: bool,
    pub persistent: bool,
}

fn always_valid(_: &ConfigValue) -> bool {
    true
}

impl SchemaEntry {
    pub fn new(default: Option<ConfigValue>) -> Self {
        Self { default, validator: always_valid, writable: false, persistent: false }
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    pub fn writable(mut self) -> Self {
        self.writable = true;
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }
}

/// The full set of keys the engine understands, built once at startup.
#[derive(Clone, Default)]
pub struct ConfigSchema {
    entries: HashMap<&'static str, SchemaEntry>,
}

impl ConfigSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(mut self, key: &'static str, entry: SchemaEntry) -> Self {
        self.entries.insert(key, entry);
        self
    }

    pub fn get(&self, key: &str) -> Option<&SchemaEntry> {
        self.entries.get(key)
    }

    pub fn persistent_keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().filter(|(_, e)| e.persistent).map(|(k, _)| *k)
    }
}

/// A typed key/value store: single-writer under an `RwLock`, readers
/// never block each other once acquired.
pub struct ConfigStore {
    schema: ConfigSchema,
    values: RwLock<HashMap<String, ConfigValue>>,
    snapshot_path: Option<PathBuf>,
}

impl ConfigStore {
    /// Build a store with schema defaults loaded, optionally persisting
    /// to `snapshot_path` whenever a persistent key changes.
    pub fn new(schema: ConfigSchema, snapshot_path: Option<PathBuf>) -> Self {
        let mut values = HashMap::new();
        for (key, entry) in schema.entries.iter() {
            if let Some(default) = &entry.default {
                values.insert((*key).to_string(), default.clone());
            }
        }
        Self { schema, values: RwLock::new(values), snapshot_path }
    }

    /// Load a previously persisted snapshot, overlaying it on the
    /// schema defaults. Missing or unreadable files are not an error —
    /// the store falls back to defaults.
    pub async fn load_snapshot(&self) -> Result<()> {
        let Some(path) = &self.snapshot_path else { return Ok(()) };
        if !path.exists() {
            return Ok(());
        }
        let data = tokio::fs::read_to_string(path).await?;
        let persisted: HashMap<String, ConfigValue> = serde_json::from_str(&data)
            .map_err(|e| BbrError::Config(format!("malformed snapshot {}: {e}", path.display())))?;
        let mut values = self.values.write().await;
        for (key, value) in persisted {
            if self.schema.get(&key).map(|e| e.persistent).unwrap_or(false) {
                values.insert(key, value);
            }
        }
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Option<ConfigValue> {
        self.values.read().await.get(key).cloned()
    }

    pub async fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).await.and_then(|v| v.as_str().map(str::to_string))
    }

    pub async fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).await.and_then(|v| v.as_int())
    }

    pub async fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).await.and_then(|v| v.as_bool())
    }

    /// Set `key` to `value`, rejecting the mutation (store left
    /// unchanged) if the key is unknown, not writable, or the
    /// schema validator refuses the value.
    pub async fn set(&self, key: &str, value: ConfigValue) -> Result<()> {
        let entry = self
            .schema
            .get(key)
            .ok_or_else(|| BbrError::Config(format!("unknown config key {key}")))?;
        if !entry.writable {
            return Err(BbrError::Config(format!("config key {key} is not writable")));
        }
        if !(entry.validator)(&value) {
            return Err(BbrError::Config(format!("invalid value for config key {key}")));
        }
        let persistent = entry.persistent;
        {
            let mut values = self.values.write().await;
            values.insert(key.to_string(), value);
        }
        if persistent {
            self.snapshot().await?;
        }
        Ok(())
    }

    /// Internal variant for keys the engine itself maintains (e.g.
    /// `bbr_status`, `mlr_cache`) that bypass the `writable` admin gate
    /// but still run through the validator and persistence.
    pub async fn set_internal(&self, key: &'static str, value: ConfigValue) -> Result<()> {
        let persistent = match self.schema.get(key) {
            Some(entry) => {
                if !(entry.validator)(&value) {
                    return Err(BbrError::Config(format!("invalid value for config key {key}")));
                }
                entry.persistent
            }
            None => false,
        };
        {
            let mut values = self.values.write().await;
            values.insert(key.to_string(), value);
        }
        if persistent {
            self.snapshot().await?;
        }
        Ok(())
    }

    pub async fn delete(&self, key: &str) {
        self.values.write().await.remove(key);
    }

    pub async fn has_keys(&self, keys: &[&str]) -> bool {
        let values = self.values.read().await;
        keys.iter().all(|k| values.contains_key(*k))
    }

    /// Atomically snapshot every persistent key to disk: write to a
    /// temp file in the same directory, then rename over the target so
    /// a crash mid-write never leaves a truncated config file.
    pub async fn snapshot(&self) -> Result<()> {
        let Some(path) = &self.snapshot_path else { return Ok(()) };
        let values = self.values.read().await;
        let persisted: HashMap<&str, &ConfigValue> = values
            .iter()
            .filter(|(k, _)| self.schema.get(k).map(|e| e.persistent).unwrap_or(false))
            .map(|(k, v)| (k.as_str(), v))
            .collect();
        let json = serde_json::to_string_pretty(&persisted)
            .map_err(|e| BbrError::Config(format!("serializing snapshot: {e}")))?;
        write_atomic(path, json.as_bytes()).await?;
        tracing::debug!(path = %path.display(), "configuration snapshot written");
        Ok(())
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_schema() -> ConfigSchema {
        ConfigSchema::new()
            .declare("autostart", SchemaEntry::new(Some(ConfigValue::Int(0))).writable())
            .declare(
                "mlr_timeout",
                SchemaEntry::new(Some(ConfigValue::Int(3600)))
                    .with_validator(|v| matches!(v.as_int(), Some(n) if n >= 300))
                    .writable()
                    .persistent(),
            )
            .declare("bbr_status", SchemaEntry::new(Some(ConfigValue::Str("off".into()))))
    }

    #[tokio::test]
    async fn defaults_are_loaded() {
        let store = ConfigStore::new(test_schema(), None);
        assert_eq!(store.get_int("autostart").await, Some(0));
        assert_eq!(store.get_str("bbr_status").await.as_deref(), Some("off"));
    }

    #[tokio::test]
    async fn set_rejects_unknown_key() {
        let store = ConfigStore::new(test_schema(), None);
        let err = store.set("nope", ConfigValue::Int(1)).await.unwrap_err();
        assert!(matches!(err, BbrError::Config(_)));
    }

    #[tokio::test]
    async fn set_rejects_non_writable_key() {
        let store = ConfigStore::new(test_schema(), None);
        let err = store.set("bbr_status", ConfigValue::Str("primary".into())).await.unwrap_err();
        assert!(matches!(err, BbrError::Config(_)));
    }

    #[tokio::test]
    async fn set_rejects_invalid_value_and_leaves_store_unchanged() {
        let store = ConfigStore::new(test_schema(), None);
        let before = store.get_int("mlr_timeout").await;
        let err = store.set("mlr_timeout", ConfigValue::Int(1)).await.unwrap_err();
        assert!(matches!(err, BbrError::Config(_)));
        assert_eq!(store.get_int("mlr_timeout").await, before);
    }

    #[tokio::test]
    async fn persistent_key_round_trips_through_snapshot() {
        let dir = tempdir();
        let path = dir.join("bbr.json");
        let store = ConfigStore::new(test_schema(), Some(path.clone()));
        store.set("mlr_timeout", ConfigValue::Int(900)).await.unwrap();

        let reloaded = ConfigStore::new(test_schema(), Some(path.clone()));
        reloaded.load_snapshot().await.unwrap();
        assert_eq!(reloaded.get_int("mlr_timeout").await, Some(900));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn has_keys_checks_all_present() {
        let store = ConfigStore::new(test_schema(), None);
        assert!(store.has_keys(&["autostart", "bbr_status"]).await);
        assert!(!store.has_keys(&["autostart", "missing_key"]).await);
    }

    fn tempdir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("bbr-core-test-{}", std::process::id()));
        dir
    }
}
