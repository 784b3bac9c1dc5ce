//! Tuning knobs for the batching device.

use std::env;

use log::warn;
use serde::{Deserialize, Serialize};

/// Commands per batch before an implicit commit.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1000;

/// Default working set: 1 GiB.
pub const DEFAULT_MAX_WORKING_SET_BYTES: usize = 1 << 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Encoded commands that trigger an implicit commit.
    pub max_batch_size: usize,
    /// Upper bound on cached bytes; allocation past half of it commits early.
    pub max_working_set_bytes: usize,
    /// Live device bytes after which allocation reclaims and then fails.
    pub memory_limit_bytes: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_working_set_bytes: DEFAULT_MAX_WORKING_SET_BYTES,
            memory_limit_bytes: usize::MAX,
        }
    }
}

impl BatchConfig {
    /// Defaults overlaid with `AD_BATCH_SIZE`, `AD_MAX_WORKING_SET` and
    /// `AD_MEMORY_LIMIT`. Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = BatchConfig::default();
        if let Some(v) = read_var("AD_BATCH_SIZE") {
            config.max_batch_size = v;
        }
        if let Some(v) = read_var("AD_MAX_WORKING_SET") {
            config.max_working_set_bytes = v;
        }
        if let Some(v) = read_var("AD_MEMORY_LIMIT") {
            config.memory_limit_bytes = v;
        }
        config.normalized()
    }

    /// A batch holds at least one command.
    pub fn normalized(mut self) -> Self {
        self.max_batch_size = self.max_batch_size.max(1);
        self
    }
}

fn read_var(name: &str) -> Option<usize> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(err) => {
            warn!("ignoring {}={:?}: {}", name, raw, err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BatchConfig::default();
        assert_eq!(config.max_batch_size, 1000);
        assert_eq!(config.max_working_set_bytes, 1 << 30);
        assert_eq!(config.memory_limit_bytes, usize::MAX);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: BatchConfig = serde_json::from_str(r#"{"max_batch_size": 8}"#).unwrap();
        assert_eq!(config.max_batch_size, 8);
        assert_eq!(config.max_working_set_bytes, DEFAULT_MAX_WORKING_SET_BYTES);
    }

    #[test]
    fn test_normalized_batch_size() {
        let config = BatchConfig {
            max_batch_size: 0,
            ..BatchConfig::default()
        }
        .normalized();
        assert_eq!(config.max_batch_size, 1);
    }
}
