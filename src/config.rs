//! Configuration management for Windowkeeper.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, WindowkeeperError};
use crate::ratelimit::{KeyRules, WindowConfig};

/// Prefix of environment variables overriding file settings,
/// e.g. `WINDOWKEEPER__MAX_REQUESTS=20` or `WINDOWKEEPER__IDLE_EVICTION__TTL_SECS=60`.
pub const ENV_PREFIX: &str = "WINDOWKEEPER";

/// Main configuration for a rate limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Default maximum admissions per window
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,

    /// Default window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Idle ledger eviction
    #[serde(default)]
    pub idle_eviction: IdleEvictionConfig,

    /// Per-key-prefix overrides of the default window
    #[serde(default)]
    pub rules: KeyRules,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_ms: default_window_ms(),
            idle_eviction: IdleEvictionConfig::default(),
            rules: KeyRules::default(),
        }
    }
}

fn default_max_requests() -> u64 {
    100
}

fn default_window_ms() -> u64 {
    60_000
}

/// Idle eviction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdleEvictionConfig {
    /// Whether a background sweep removes idle ledgers
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// How long an empty ledger must be unused before it is removed
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Interval between sweeps in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for IdleEvictionConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_ttl_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    30
}

impl IdleEvictionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl LimiterConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: LimiterConfig = serde_yaml::from_str(yaml)
            .map_err(|e| WindowkeeperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional YAML file layered with
    /// `WINDOWKEEPER__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    pub(crate) fn load_with_prefix(path: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Yaml)
                    .required(true),
            );
        }

        let config: LimiterConfig = builder
            .add_source(
                ::config::Environment::with_prefix(env_prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// The default window configuration.
    pub fn window_config(&self) -> Result<WindowConfig> {
        WindowConfig::from_millis(self.max_requests, self.window_ms)
    }

    /// Check the configuration for values that would fail at runtime.
    pub fn validate(&self) -> Result<()> {
        self.window_config()?;

        if self.idle_eviction.enabled && self.idle_eviction.sweep_interval_secs == 0 {
            return Err(WindowkeeperError::Config(
                "idle_eviction.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    fn temp_config(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "windowkeeper-{}-{}.yaml",
            name,
            std::process::id()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_default_config() {
        let config = LimiterConfig::default();
        assert_eq!(config.max_requests, 100);
        assert_eq!(config.window_ms, 60_000);
        assert!(config.idle_eviction.enabled);
        assert!(config.rules.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
max_requests: 5
window_ms: 10000
idle_eviction:
  enabled: false
  ttl_secs: 60
rules:
  - prefix: "tenant:premium:"
    max_requests: 500
    window_ms: 10000
"#;
        let config = LimiterConfig::from_yaml(yaml).unwrap();
        let window = config.window_config().unwrap();

        assert_eq!(window.max_requests(), 5);
        assert_eq!(window.window(), Duration::from_secs(10));
        assert!(!config.idle_eviction.enabled);
        assert_eq!(config.idle_eviction.ttl(), Duration::from_secs(60));
        assert_eq!(config.idle_eviction.sweep_interval(), Duration::from_secs(30));
        assert_eq!(config.rules.config_for("tenant:premium:1", window).max_requests(), 500);
    }

    #[test]
    fn test_zero_max_requests_rejected() {
        let err = LimiterConfig::from_yaml("max_requests: 0").unwrap_err();
        assert!(matches!(err, WindowkeeperError::Config(_)));
    }

    #[test]
    fn test_negative_window_rejected() {
        let err = LimiterConfig::from_yaml("window_ms: -5").unwrap_err();
        assert!(matches!(err, WindowkeeperError::Config(_)));
    }

    #[test]
    fn test_zero_sweep_interval_rejected() {
        let yaml = r#"
idle_eviction:
  sweep_interval_secs: 0
"#;
        assert!(LimiterConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_from_file() {
        let path = temp_config("from-file", "max_requests: 7\n");
        let config = LimiterConfig::from_file(&path).unwrap();
        assert_eq!(config.max_requests, 7);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_from_missing_file() {
        let err = LimiterConfig::from_file("/nonexistent/windowkeeper.yaml").unwrap_err();
        assert!(matches!(err, WindowkeeperError::Io(_)));
    }

    #[test]
    fn test_load_layers_environment_over_file() {
        let path = temp_config("layered", "max_requests: 7\nwindow_ms: 1000\n");
        std::env::set_var("WINDOWKEEPER_TEST_LAYER__MAX_REQUESTS", "42");

        let config = LimiterConfig::load_with_prefix(Some(&path), "WINDOWKEEPER_TEST_LAYER").unwrap();

        assert_eq!(config.max_requests, 42);
        assert_eq!(config.window_ms, 1000);

        std::env::remove_var("WINDOWKEEPER_TEST_LAYER__MAX_REQUESTS");
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = LimiterConfig::load_with_prefix(None, "WINDOWKEEPER_TEST_EMPTY").unwrap();
        assert_eq!(config.max_requests, 100);
    }
}
