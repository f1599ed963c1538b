use serde::Deserialize;

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite file; in-memory when unset.
    pub database_path: Option<String>,
    pub busy_timeout_ms: u64,
    /// Extra attempts after a snapshot insert finds its version taken.
    pub max_version_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            busy_timeout_ms: 5_000,
            max_version_retries: 3,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        serde_json::from_str(json).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn with_database_path(mut self, path: impl Into<String>) -> Self {
        self.database_path = Some(path.into());
        self
    }
}
