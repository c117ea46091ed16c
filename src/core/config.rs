//! RW-013: Engine options.
//!
//! Loaded from TOML (`relayweave run --config engine.toml`); every field has
//! a default so an empty file is valid.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables shared by the executor, cache, planner and action path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct EngineOptions {
    /// Cache entry lifetime in seconds
    pub cache_ttl_secs: u64,

    /// Upper bound for one fetch
    pub fetch_timeout_ms: u64,

    /// Longest chain of triggered actions
    pub max_chain_depth: usize,

    /// Planner quiet window before a batch executes
    pub batch_debounce_ms: u64,

    /// Profile batcher cache lifetime in seconds
    pub profile_ttl_secs: u64,

    /// Fixed-point passes per run
    pub max_passes: usize,

    /// Keep results live after the initial load
    pub live: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 60,
            fetch_timeout_ms: 3000,
            max_chain_depth: 3,
            batch_debounce_ms: 25,
            profile_ttl_secs: 30,
            max_passes: 8,
            live: true,
        }
    }
}

impl EngineOptions {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn batch_debounce(&self) -> Duration {
        Duration::from_millis(self.batch_debounce_ms)
    }

    pub fn profile_ttl(&self) -> Duration {
        Duration::from_secs(self.profile_ttl_secs)
    }

    /// Parse and validate TOML options.
    pub fn from_toml_str(s: &str) -> Result<Self, String> {
        let options: Self = toml::from_str(s).map_err(|e| format!("TOML parse error: {e}"))?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from a TOML file.
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_passes == 0 {
            return Err("max_passes must be at least 1".to_string());
        }
        if self.fetch_timeout_ms == 0 {
            return Err("fetch_timeout_ms must be positive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rw013_defaults() {
        let o = EngineOptions::default();
        assert_eq!(o.cache_ttl(), Duration::from_secs(60));
        assert_eq!(o.fetch_timeout(), Duration::from_secs(3));
        assert_eq!(o.max_chain_depth, 3);
        assert!(o.live);
    }

    #[test]
    fn test_rw013_empty_toml_is_default() {
        assert_eq!(EngineOptions::from_toml_str("").unwrap(), EngineOptions::default());
    }

    #[test]
    fn test_rw013_partial_toml() {
        let o = EngineOptions::from_toml_str("cache_ttl_secs = 5\nlive = false\n").unwrap();
        assert_eq!(o.cache_ttl_secs, 5);
        assert!(!o.live);
        assert_eq!(o.max_passes, 8);
    }

    #[test]
    fn test_rw013_rejects_unknown_and_invalid() {
        assert!(EngineOptions::from_toml_str("ttl = 5").is_err());
        let err = EngineOptions::from_toml_str("max_passes = 0").unwrap_err();
        assert!(err.contains("max_passes"));
    }

    #[test]
    fn test_rw013_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "fetch_timeout_ms = 250\n").unwrap();
        let o = EngineOptions::load(&path).unwrap();
        assert_eq!(o.fetch_timeout(), Duration::from_millis(250));
        assert!(EngineOptions::load(&dir.path().join("missing.toml")).is_err());
    }
}
