//! Key-value configuration with used-key tracking, for Constellation satellites.
//!
//! A satellite's `initializing` transition consumes a `Configuration` built
//! from a TOML file (plus environment overrides) or handed over the wire by
//! a controller's `initialize` command. Every lookup marks the key as used;
//! whatever is left over after a transition runs is surfaced back to the
//! caller so a typo'd or stale option doesn't fail silently.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/constellation/config.toml` (system)
//! 2. `~/.config/constellation/config.toml` (user)
//! 3. `./constellation.toml` (local override)
//! 4. Environment variables (`CONSTELLATION_*`)
//!
//! # Example Config
//!
//! ```toml
//! [heartbeat]
//! interval_ms = 1000
//! liveness_factor = 3
//!
//! [chirp]
//! group = "constellation"
//! interface = "0.0.0.0"
//! ```
//!
//! Nested tables are flattened into dotted keys (`heartbeat.interval_ms`,
//! `chirp.group`), so downstream code works against a flat map rather than
//! a fixed schema.

pub mod loader;

pub use loader::{ConfigSources, discover_config_files_with_override};

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use thiserror::Error;

/// Configuration loading and lookup errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("key {key} could not be read as the requested type: {message}")]
    TypeMismatch { key: String, message: String },
}

/// How an overlay's values are merged into an existing `Configuration`.
///
/// Mirrors the reconfigure policies a controller can choose between: only
/// fill in keys nobody has consumed yet, or replace everything outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Only overlay keys that the base configuration has not yet looked up.
    OnlyUnused,
    /// Overlay every key present in the overlay, used or not.
    All,
}

/// A flat key-value configuration map with used-key tracking.
///
/// Keys are dotted strings derived by flattening nested TOML tables
/// (`[heartbeat] interval_ms = 1` becomes `heartbeat.interval_ms`). Every
/// successful `get*` call records the key as used; `unused_keys` exposes
/// whatever is left, so a transition can warn about ignored parameters
/// instead of silently dropping them.
#[derive(Debug)]
pub struct Configuration {
    values: BTreeMap<String, toml::Value>,
    used: Mutex<HashSet<String>>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            values: BTreeMap::new(),
            used: Mutex::new(HashSet::new()),
        }
    }
}

impl Clone for Configuration {
    fn clone(&self) -> Self {
        Self {
            values: self.values.clone(),
            used: Mutex::new(self.used.lock().unwrap().clone()),
        }
    }
}

impl Configuration {
    /// Build a `Configuration` from an already-parsed TOML table.
    pub fn from_table(table: toml::Table) -> Self {
        let mut values = BTreeMap::new();
        flatten(&table, "", &mut values);
        Self {
            values,
            used: Mutex::new(HashSet::new()),
        }
    }

    /// Build a `Configuration` directly from a flat key-value map, bypassing
    /// TOML nesting. Useful when a controller hands over parameters on the
    /// wire rather than loading them from a file.
    pub fn from_flat_map(values: BTreeMap<String, toml::Value>) -> Self {
        Self {
            values,
            used: Mutex::new(HashSet::new()),
        }
    }

    /// Load configuration from all standard sources (see module docs).
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration from a specific file path, then apply env overrides.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and return information about which files/env vars
    /// contributed values.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut values = BTreeMap::new();

        for path in loader::discover_config_files_with_override(config_path) {
            let table = loader::load_table_from_file(&path)?;
            flatten(&table, "", &mut values);
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut values, &mut sources);

        Ok((
            Self {
                values,
                used: Mutex::new(HashSet::new()),
            },
            sources,
        ))
    }

    /// Merge `overlay` into `self` per `policy`, returning a new
    /// `Configuration`. Used-key tracking from `self` carries forward so a
    /// key consumed before the merge stays marked used.
    pub fn merge(&self, overlay: &Configuration, policy: MergePolicy) -> Configuration {
        let mut values = self.values.clone();
        let used = self.used.lock().unwrap().clone();

        for (key, value) in &overlay.values {
            match policy {
                MergePolicy::All => {
                    values.insert(key.clone(), value.clone());
                }
                MergePolicy::OnlyUnused => {
                    if !used.contains(key) {
                        values.insert(key.clone(), value.clone());
                    }
                }
            }
        }

        Configuration {
            values,
            used: Mutex::new(used),
        }
    }

    /// Returns `true` if `key` is present, without marking it used.
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Total number of keys in the map, used or not.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Look up `key` and deserialize it as `T`, marking the key used
    /// regardless of whether it was present.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<Result<T, ConfigError>> {
        self.mark_used(key);
        let raw = self.values.get(key)?;
        Some(raw.clone().try_into().map_err(|e: toml::de::Error| ConfigError::TypeMismatch {
            key: key.to_string(),
            message: e.to_string(),
        }))
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.mark_used(key);
        self.values.get(key)?.as_str().map(str::to_string)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.mark_used(key);
        self.values.get(key)?.as_integer()
    }

    pub fn get_u16(&self, key: &str) -> Option<u16> {
        self.get_i64(key).and_then(|v| u16::try_from(v).ok())
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.get_i64(key).and_then(|v| u32::try_from(v).ok())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.mark_used(key);
        self.values.get(key)?.as_float()
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.mark_used(key);
        self.values.get(key)?.as_bool()
    }

    /// Look up `key` without marking it used. For diagnostic code (e.g.
    /// reporting config contents) that should not affect `unused_keys`.
    pub fn peek_str(&self, key: &str) -> Option<String> {
        self.values.get(key)?.as_str().map(str::to_string)
    }

    fn mark_used(&self, key: &str) {
        self.used.lock().unwrap().insert(key.to_string());
    }

    /// Keys present in the map that no `get*` call has touched yet, sorted
    /// for deterministic reply-string formatting.
    pub fn unused_keys(&self) -> Vec<String> {
        let used = self.used.lock().unwrap();
        self.values
            .keys()
            .filter(|k| !used.contains(*k))
            .cloned()
            .collect()
    }

    /// All keys in the map, used or not, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }
}

/// Flatten a nested TOML table into dotted keys, e.g. `[a] b = 1` -> `a.b`.
/// Arrays and scalars are stored as-is; only tables recurse.
fn flatten(table: &toml::Table, prefix: &str, out: &mut BTreeMap<String, toml::Value>) {
    for (key, value) in table {
        let full_key = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            toml::Value::Table(nested) => flatten(nested, &full_key, out),
            other => {
                out.insert(full_key, other.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Configuration {
        let table: toml::Table = r#"
            [heartbeat]
            interval_ms = 1000
            liveness_factor = 3

            [chirp]
            group = "constellation"
        "#
        .parse()
        .unwrap();
        Configuration::from_table(table)
    }

    #[test]
    fn flattens_nested_tables() {
        let config = sample();
        assert_eq!(config.peek_str("chirp.group").as_deref(), Some("constellation"));
        assert!(config.contains_key("heartbeat.interval_ms"));
    }

    #[test]
    fn tracks_used_keys() {
        let config = sample();
        assert_eq!(config.get_i64("heartbeat.interval_ms"), Some(1000));
        let unused = config.unused_keys();
        assert!(!unused.contains(&"heartbeat.interval_ms".to_string()));
        assert!(unused.contains(&"heartbeat.liveness_factor".to_string()));
        assert!(unused.contains(&"chirp.group".to_string()));
    }

    #[test]
    fn unused_key_surfaced_even_if_missing() {
        let config = sample();
        assert_eq!(config.get_str("does.not.exist"), None);
        // A lookup always marks the key used, present or not.
        assert!(!config.unused_keys().contains(&"does.not.exist".to_string()));
    }

    #[test]
    fn merge_only_unused_preserves_consumed_keys() {
        let base = sample();
        assert_eq!(base.get_i64("heartbeat.interval_ms"), Some(1000));

        let overlay_table: toml::Table = r#"
            [heartbeat]
            interval_ms = 500
            liveness_factor = 5
        "#
        .parse()
        .unwrap();
        let overlay = Configuration::from_table(overlay_table);

        let merged = base.merge(&overlay, MergePolicy::OnlyUnused);
        // Already-consumed key is untouched by the overlay.
        assert_eq!(merged.get_i64("heartbeat.interval_ms"), Some(1000));
        // Untouched key picks up the overlay's value.
        assert_eq!(merged.get_i64("heartbeat.liveness_factor"), Some(5));
    }

    #[test]
    fn merge_all_replaces_every_overlap() {
        let base = sample();
        assert_eq!(base.get_i64("heartbeat.interval_ms"), Some(1000));

        let overlay_table: toml::Table = r#"
            [heartbeat]
            interval_ms = 500
        "#
        .parse()
        .unwrap();
        let overlay = Configuration::from_table(overlay_table);

        let merged = base.merge(&overlay, MergePolicy::All);
        assert_eq!(merged.get_i64("heartbeat.interval_ms"), Some(500));
    }
}
