use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use libopque::{Backoff, RetryPolicy};
use serde::Deserialize;

/// Client settings. Every field has a default, so a config file only needs
/// the keys it changes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LioConfig {
    /// Largest attribute value fetched, in bytes.
    pub max_attr_size: usize,
    /// Operations kept in flight by bulk traversals (fsck, rm), and the cap
    /// of the bounded worker pool.
    pub parallel_task_count: usize,
    pub timeout_secs: u64,
    pub fsck_recurse_depth: usize,
    /// Attempts of an attribute write, including the first one.
    pub set_attr_attempts: u32,
    pub set_attr_retry_delay_ms: u64,
}

impl Default for LioConfig {
    fn default() -> Self {
        Self {
            max_attr_size: 1024 * 1024,
            parallel_task_count: 100,
            timeout_secs: 60,
            fsck_recurse_depth: 10000,
            set_attr_attempts: 2,
            set_attr_retry_delay_ms: 1000,
        }
    }
}

impl LioConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read lio config from {}", path.display()))?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> anyhow::Result<Self> {
        let cfg: LioConfig =
            serde_yaml::from_str(content).context("Failed to parse lio YAML config")?;
        Ok(cfg)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn set_attr_retry(&self) -> RetryPolicy {
        let delay = Duration::from_millis(self.set_attr_retry_delay_ms);
        let backoff = if delay.is_zero() {
            Backoff::None
        } else {
            Backoff::Fixed(delay)
        };
        RetryPolicy::new(self.set_attr_attempts, backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let cfg = LioConfig::from_yaml_str("parallel_task_count: 8\nset_attr_retry_delay_ms: 0\n")
            .unwrap();
        assert_eq!(cfg.parallel_task_count, 8);
        assert_eq!(cfg.max_attr_size, 1024 * 1024);
        assert_eq!(cfg.set_attr_retry(), RetryPolicy::new(2, Backoff::None));
    }

    #[test]
    fn test_default_retry_is_one_retry_after_a_second() {
        assert_eq!(
            LioConfig::default().set_attr_retry(),
            RetryPolicy::once_after(Duration::from_secs(1))
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lio.yaml");
        std::fs::write(&path, "timeout_secs: 5\nfsck_recurse_depth: 3\n").unwrap();
        let cfg = LioConfig::load(&path).unwrap();
        assert_eq!(cfg.timeout(), Duration::from_secs(5));
        assert_eq!(cfg.fsck_recurse_depth, 3);

        assert!(LioConfig::load(dir.path().join("missing.yaml")).is_err());
        assert!(LioConfig::from_yaml_str("max_attr_size: [1]").is_err());
    }
}
