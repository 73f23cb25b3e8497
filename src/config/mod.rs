//! Settings store backing provider configuration
//!
//! Providers reference configuration values by dotted path (e.g.
//! `"llm.openai.api_key"`). The store flattens a JSON settings document into
//! those paths at load time and falls back to `UFLEET_*` environment
//! variables for values that are injected rather than written to disk.

use std::collections::HashMap;
use std::path::Path;

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;

/// Errors for settings file I/O (separate from pure flattening)
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read settings file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse settings file: {0}")]
    ParseError(#[from] serde_json::Error),
}

/// Flatten a JSON document into dotted-path keys.
///
/// Scalars become strings; arrays and nulls are skipped (providers only
/// consume scalar settings).
pub fn flatten_settings(value: &Value) -> HashMap<String, String> {
    let mut out = HashMap::new();
    flatten_into("", value, &mut out);
    out
}

fn flatten_into(prefix: &str, value: &Value, out: &mut HashMap<String, String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten_into(&path, child, out);
            }
        }
        Value::String(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
        Value::Number(n) => {
            out.insert(prefix.to_string(), n.to_string());
        }
        Value::Bool(b) => {
            out.insert(prefix.to_string(), b.to_string());
        }
        Value::Null | Value::Array(_) => {}
    }
}

/// Convert a dotted settings path to its environment-variable override name.
/// e.g. `"llm.openai.api_key"` -> `"UFLEET_LLM_OPENAI_API_KEY"`
pub fn path_to_env_var(path: &str) -> String {
    format!("UFLEET_{}", path.replace('.', "_").to_uppercase())
}

/// Read-only view of fleet settings, shared across components
pub struct ConfigStore {
    values: DashMap<String, String>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self {
            values: DashMap::new(),
        }
    }

    /// Build a store from an already-parsed settings document
    pub fn from_document(doc: &Value) -> Self {
        let store = Self::new();
        for (path, value) in flatten_settings(doc) {
            store.values.insert(path, value);
        }
        store
    }

    /// Look up a settings value by dotted path.
    ///
    /// Explicit settings win over environment overrides; empty values are
    /// treated as absent so a blank setting never satisfies a required
    /// provider mapping.
    pub fn get(&self, path: &str) -> Option<String> {
        if let Some(value) = self.values.get(path) {
            if !value.is_empty() {
                return Some(value.clone());
            }
        }
        std::env::var(path_to_env_var(path))
            .ok()
            .filter(|v| !v.is_empty())
    }

    /// Look up a value, falling back to `default` when unset
    pub fn get_sync(&self, path: &str, default: &str) -> String {
        self.get(path).unwrap_or_else(|| default.to_string())
    }

    /// Set a value directly (admin updates, tests)
    pub fn set(&self, path: impl Into<String>, value: impl Into<String>) {
        self.values.insert(path.into(), value.into());
    }

    /// Number of loaded settings
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Load a settings file from disk.
/// This is the I/O boundary - it reads the file and delegates to pure flattening.
pub fn load_settings_file(path: &Path) -> Result<ConfigStore, ConfigError> {
    let expanded = shellexpand::tilde(&path.to_string_lossy().to_string()).to_string();
    let content = std::fs::read_to_string(Path::new(&expanded))?;
    let doc: Value = serde_json::from_str(&content)?;
    Ok(ConfigStore::from_document(&doc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_flatten_nested_document() {
        let doc = serde_json::json!({
            "llm": {
                "openai": { "api_key": "sk-test", "timeout": 30 }
            },
            "enabled": true
        });

        let flat = flatten_settings(&doc);
        assert_eq!(flat.get("llm.openai.api_key"), Some(&"sk-test".to_string()));
        assert_eq!(flat.get("llm.openai.timeout"), Some(&"30".to_string()));
        assert_eq!(flat.get("enabled"), Some(&"true".to_string()));
    }

    #[test]
    fn test_flatten_skips_nulls_and_arrays() {
        let doc = serde_json::json!({
            "missing": null,
            "list": [1, 2, 3]
        });

        let flat = flatten_settings(&doc);
        assert!(flat.is_empty());
    }

    #[test]
    fn test_path_to_env_var() {
        assert_eq!(path_to_env_var("llm.openai.api_key"), "UFLEET_LLM_OPENAI_API_KEY");
        assert_eq!(path_to_env_var("memory.url"), "UFLEET_MEMORY_URL");
    }

    #[test]
    fn test_get_prefers_explicit_value() {
        let store = ConfigStore::new();
        store.set("db.url", "postgres://local");

        assert_eq!(store.get("db.url"), Some("postgres://local".to_string()));
        assert_eq!(store.get("db.missing"), None);
    }

    #[test]
    fn test_empty_value_treated_as_absent() {
        let store = ConfigStore::new();
        store.set("llm.api_key", "");

        assert_eq!(store.get("llm.api_key"), None);
    }

    #[test]
    fn test_get_sync_default() {
        let store = ConfigStore::new();
        store.set("a", "1");

        assert_eq!(store.get_sync("a", "0"), "1");
        assert_eq!(store.get_sync("b", "0"), "0");
    }

    #[test]
    fn test_load_settings_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(br#"{"llm": {"provider": "openai"}}"#).unwrap();

        let store = load_settings_file(file.path()).unwrap();
        assert_eq!(store.get("llm.provider"), Some("openai".to_string()));
    }

    #[test]
    fn test_load_settings_file_invalid_json() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"not json").unwrap();

        assert!(matches!(
            load_settings_file(file.path()),
            Err(ConfigError::ParseError(_))
        ));
    }
}
