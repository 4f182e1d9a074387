//! Config file discovery, loading, and environment variable overlay.

use crate::ConfigError;
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order).
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values.
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local). Only returns files
/// that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
/// Returns paths in load order (system, user, local/cli).
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/constellation/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("constellation/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    // CLI override takes precedence over local.
    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("constellation.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load and parse a TOML file into a raw table.
pub fn load_table_from_file(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Apply `CONSTELLATION_*` environment variable overrides onto a flat
/// key-value map.
///
/// A double underscore separates table levels (`HEARTBEAT__INTERVAL_MS`
/// becomes `heartbeat.interval_ms`), matching the dotted keys produced by
/// flattening TOML tables. Values that parse as an integer or boolean are
/// stored as such; everything else is stored as a string, and paths
/// beginning with `~/` are expanded.
pub fn apply_env_overrides(values: &mut BTreeMap<String, toml::Value>, sources: &mut ConfigSources) {
    const PREFIX: &str = "CONSTELLATION_";

    for (name, raw) in env::vars() {
        let Some(suffix) = name.strip_prefix(PREFIX) else {
            continue;
        };
        let key = suffix.to_lowercase().replace("__", ".");
        let value = coerce_env_value(&raw);
        values.insert(key, value);
        sources.env_overrides.push(name);
    }
}

fn coerce_env_value(raw: &str) -> toml::Value {
    if let Ok(n) = raw.parse::<i64>() {
        return toml::Value::Integer(n);
    }
    if let Ok(b) = raw.parse::<bool>() {
        return toml::Value::Boolean(b);
    }
    if raw.starts_with("~/") {
        return toml::Value::String(expand_path(raw).to_string_lossy().into_owned());
    }
    toml::Value::String(raw.to_string())
}

/// Expand `~` and `$VAR` in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            return home.join(stripped);
        }
        return PathBuf::from(path);
    }

    if let Some(stripped) = path.strip_prefix('$') {
        if let Some(slash_pos) = stripped.find('/') {
            let var_name = &stripped[..slash_pos];
            if let Ok(var_value) = env::var(var_name) {
                return PathBuf::from(var_value).join(&stripped[slash_pos + 1..]);
            }
        } else if let Ok(var_value) = env::var(stripped) {
            return PathBuf::from(var_value);
        }
        return PathBuf::from(path);
    }

    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_path_tilde() {
        let expanded = expand_path("~/test/path");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert!(expanded.to_string_lossy().contains("test/path"));
    }

    #[test]
    fn expand_path_absolute() {
        let expanded = expand_path("/absolute/path");
        assert_eq!(expanded, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn discover_config_files_does_not_panic() {
        let _files = discover_config_files();
    }

    #[test]
    fn load_table_parses_nested_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("constellation.toml");
        std::fs::write(
            &path,
            r#"
            [heartbeat]
            interval_ms = 1000

            [chirp]
            group = "demo"
            "#,
        )
        .unwrap();

        let table = load_table_from_file(&path).unwrap();
        let heartbeat = table.get("heartbeat").and_then(|v| v.as_table()).unwrap();
        assert_eq!(heartbeat.get("interval_ms").and_then(|v| v.as_integer()), Some(1000));
    }

    #[test]
    fn coerce_env_value_parses_integers_and_booleans() {
        assert_eq!(coerce_env_value("42"), toml::Value::Integer(42));
        assert_eq!(coerce_env_value("true"), toml::Value::Boolean(true));
        assert_eq!(coerce_env_value("hello"), toml::Value::String("hello".to_string()));
    }
}
