//! Reactor configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    /// Scopes persisted state; one directory per app for the file backend.
    pub app_id: String,
    /// How many previously cached query results survive a reload.
    pub query_cache_limit: usize,
    /// Single-valued links come back as objects instead of arrays.
    pub cardinality_inference: bool,
    /// Lower bound of the per-mutation send timeout.
    pub mutation_timeout_floor_ms: i64,
    /// Queue size at which age-based cleanup of confirmed mutations starts.
    pub pending_cleanup_threshold: usize,
    /// Age after which a confirmed mutation may be cleaned up.
    pub pending_cleanup_age_ms: i64,
    /// Period of the background timer that expires mutation deadlines.
    pub timer_tick_ms: u64,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            app_id: "default".to_string(),
            query_cache_limit: 10,
            cardinality_inference: true,
            mutation_timeout_floor_ms: 5_000,
            pending_cleanup_threshold: 200,
            pending_cleanup_age_ms: 30_000,
            timer_tick_ms: 1_000,
        }
    }
}

impl ReactorConfig {
    /// Read a JSON config file, then apply environment overrides.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let config: ReactorConfig = serde_json::from_str(&text)
            .with_context(|| format!("invalid config: {}", path.display()))?;
        config.with_env_overrides()
    }

    /// `GRAPHSYNC_APP_ID` and `GRAPHSYNC_QUERY_CACHE_LIMIT` win over file values.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(app_id) = std::env::var("GRAPHSYNC_APP_ID") {
            self.app_id = app_id;
        }
        if let Ok(limit) = std::env::var("GRAPHSYNC_QUERY_CACHE_LIMIT") {
            self.query_cache_limit = limit
                .parse()
                .with_context(|| format!("GRAPHSYNC_QUERY_CACHE_LIMIT is not a number: {limit}"))?;
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ReactorConfig::default();
        assert_eq!(config.query_cache_limit, 10);
        assert_eq!(config.pending_cleanup_threshold, 200);
        assert!(config.cardinality_inference);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"app_id": "todo-app", "mutation_timeout_floor_ms": 100}}"#).unwrap();
        let config = ReactorConfig::from_path(file.path()).unwrap();
        assert_eq!(config.query_cache_limit, 10);
        assert_eq!(config.mutation_timeout_floor_ms, 100);
        assert_eq!(config.pending_cleanup_age_ms, 30_000);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = ReactorConfig::from_path("/definitely/not/here.json").unwrap_err();
        assert!(err.to_string().contains("failed to read config"));
    }
}
