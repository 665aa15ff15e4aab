//! Secret resolution from a separate key-value file.
//!
//! Secrets never live in the main configuration; role settings name a key
//! (`api_key_secret = "openai_key"`) and the store supplies the value.

use crate::error::OrchestratorError;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Flat name → value secret source.
#[derive(Debug, Clone, Default)]
pub struct SecretStore {
    values: HashMap<String, String>,
}

impl SecretStore {
    /// A store with no secrets, for endpoints that need no auth.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load secrets from a TOML or JSON file of string pairs, selected by
    /// extension.
    pub fn load(path: &Path) -> Result<Self, OrchestratorError> {
        let raw = fs::read_to_string(path).map_err(|e| {
            OrchestratorError::Configuration(format!(
                "cannot read secret file {}: {e}",
                path.display()
            ))
        })?;

        let values: HashMap<String, String> = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&raw).map_err(|e| {
                OrchestratorError::Configuration(format!(
                    "bad JSON in secret file {}: {e}",
                    path.display()
                ))
            })?,
            _ => toml::from_str(&raw).map_err(|e| {
                OrchestratorError::Configuration(format!(
                    "bad TOML in secret file {}: {e}",
                    path.display()
                ))
            })?,
        };

        Ok(Self { values })
    }

    /// Look up a secret by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Insert a secret, mainly for tests and embedding callers.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }
}
