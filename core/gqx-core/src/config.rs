//! Executor configuration
//!
//! Defaults, optional JSON file, then `GQX_*` environment overrides.

use crate::error::{GqxError, GqxResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Default rows per device batch.
pub const DEFAULT_BATCH_CAPACITY: usize = 1 << 20;

/// Per-query executor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Device ordinal the query runs on
    pub device: u32,
    /// Maximum output rows for non-aggregate queries (None = unbounded)
    pub result_limit: Option<usize>,
    /// Maximum rows per batch produced by the context
    pub batch_capacity: usize,
    /// Give every query its own stream instead of the device default
    pub dedicated_streams: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            device: 0,
            result_limit: None,
            batch_capacity: DEFAULT_BATCH_CAPACITY,
            dedicated_streams: true,
        }
    }
}

impl ExecutorConfig {
    pub fn with_device(mut self, device: u32) -> Self {
        self.device = device;
        self
    }

    pub fn with_result_limit(mut self, limit: usize) -> Self {
        self.result_limit = Some(limit);
        self
    }

    pub fn with_batch_capacity(mut self, capacity: usize) -> Self {
        self.batch_capacity = capacity;
        self
    }

    /// JSON 파일에서 로드 (없는 필드는 기본값)
    pub fn from_json_file(path: impl AsRef<Path>) -> GqxResult<Self> {
        let json = fs::read_to_string(path.as_ref())?;
        let config: ExecutorConfig = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Save as pretty JSON.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> GqxResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Apply `GQX_*` overrides from the process environment.
    pub fn apply_env(self) -> GqxResult<Self> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup.
    pub fn apply_env_with<F>(mut self, lookup: F) -> GqxResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("GQX_DEVICE") {
            self.device = parse_env("GQX_DEVICE", &v)?;
        }
        if let Some(v) = lookup("GQX_RESULT_LIMIT") {
            let v = v.trim();
            self.result_limit = if v.is_empty() || v.eq_ignore_ascii_case("none") {
                None
            } else {
                Some(parse_env("GQX_RESULT_LIMIT", v)?)
            };
        }
        if let Some(v) = lookup("GQX_BATCH_CAPACITY") {
            self.batch_capacity = parse_env("GQX_BATCH_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("GQX_DEDICATED_STREAMS") {
            self.dedicated_streams = v.to_lowercase() == "true" || v == "1";
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> GqxResult<()> {
        if self.batch_capacity == 0 {
            return Err(GqxError::Config("batch_capacity must be > 0".to_string()));
        }
        if self.result_limit == Some(0) {
            return Err(GqxError::Config(
                "result_limit must be > 0 (omit it for no limit)".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> GqxResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| GqxError::Config(format!("{key}: cannot parse '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = ExecutorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.result_limit, None);
        assert!(config.dedicated_streams);
    }

    #[test]
    fn env_overrides() {
        let config = ExecutorConfig::default()
            .apply_env_with(lookup(&[
                ("GQX_DEVICE", "2"),
                ("GQX_RESULT_LIMIT", "100"),
                ("GQX_DEDICATED_STREAMS", "0"),
            ]))
            .unwrap();
        assert_eq!(config.device, 2);
        assert_eq!(config.result_limit, Some(100));
        assert!(!config.dedicated_streams);
    }

    #[test]
    fn env_limit_none_clears() {
        let config = ExecutorConfig::default()
            .with_result_limit(5)
            .apply_env_with(lookup(&[("GQX_RESULT_LIMIT", "none")]))
            .unwrap();
        assert_eq!(config.result_limit, None);
    }

    #[test]
    fn env_rejects_garbage() {
        let err = ExecutorConfig::default()
            .apply_env_with(lookup(&[("GQX_BATCH_CAPACITY", "lots")]))
            .unwrap_err();
        assert!(matches!(err, GqxError::Config(_)));
    }

    #[test]
    fn zero_limit_is_invalid() {
        let config = ExecutorConfig::default().with_result_limit(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn json_file_roundtrip_with_partial_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gqx.json");
        std::fs::write(&path, r#"{ "device": 3, "result_limit": 10 }"#).unwrap();

        let config = ExecutorConfig::from_json_file(&path).unwrap();
        assert_eq!(config.device, 3);
        assert_eq!(config.result_limit, Some(10));
        assert_eq!(config.batch_capacity, DEFAULT_BATCH_CAPACITY);

        let out = dir.path().join("nested").join("saved.json");
        config.save_to_file(&out).unwrap();
        assert_eq!(ExecutorConfig::from_json_file(&out).unwrap(), config);
    }
}
