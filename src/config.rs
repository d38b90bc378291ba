//! Configuration for rate limiters and keyed registries.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{LimiterError, Result, ValidationError};
use crate::ratelimit::Strategy;

/// Default permits per interval when none is configured.
const DEFAULT_MAX_COUNT: u64 = 1000;
/// Default refill interval when none is configured.
const DEFAULT_DURATION: Duration = Duration::from_secs(1);

/// Settings for a single limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Maximum permits per interval
    #[serde(default = "default_max_count")]
    pub max_count: u64,

    /// Refill interval, in milliseconds when serialized
    #[serde(default = "default_duration", with = "duration_ms")]
    pub duration: Duration,

    /// Ignore `max_count` and `duration` and never throttle
    #[serde(default, alias = "is_unlimited")]
    pub unlimited: bool,

    /// Admission algorithm
    #[serde(default)]
    pub strategy: Strategy,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_count: default_max_count(),
            duration: default_duration(),
            unlimited: false,
            strategy: Strategy::default(),
        }
    }
}

fn default_max_count() -> u64 {
    DEFAULT_MAX_COUNT
}

fn default_duration() -> Duration {
    DEFAULT_DURATION
}

impl LimiterConfig {
    /// A windowed configuration granting `max_count` permits every `duration`.
    pub fn new(max_count: u64, duration: Duration) -> Self {
        Self {
            max_count,
            duration,
            unlimited: false,
            strategy: Strategy::Windowed,
        }
    }

    /// An unlimited configuration.
    pub fn unlimited() -> Self {
        Self {
            unlimited: true,
            ..Self::default()
        }
    }

    /// Use the given admission algorithm.
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Check the numeric fields. Unlimited configurations are always valid.
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        if self.unlimited {
            return Ok(());
        }
        if self.max_count == 0 {
            return Err(ValidationError::ZeroMaxCount);
        }
        if self.duration.is_zero() {
            return Err(ValidationError::ZeroDuration);
        }
        Ok(())
    }

    /// Check the configuration as it would be registered under `key`.
    pub fn validate_for_key(&self, key: &str) -> std::result::Result<(), ValidationError> {
        if !self.unlimited && key.is_empty() {
            return Err(ValidationError::EmptyKey);
        }
        self.validate()
    }
}

/// A limiter configuration bound to a registry key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyOptions {
    /// The registry key
    #[serde(default)]
    pub key: String,

    /// Ignore `max_count` and `duration` and never throttle
    #[serde(default, alias = "unlimited")]
    pub is_unlimited: bool,

    /// Maximum permits per interval
    #[serde(default = "default_max_count")]
    pub max_count: u64,

    /// Refill interval, in milliseconds when serialized
    #[serde(default = "default_duration", with = "duration_ms")]
    pub duration: Duration,

    /// Admission algorithm
    #[serde(default)]
    pub strategy: Strategy,
}

impl Default for KeyOptions {
    fn default() -> Self {
        Self::from_config("default", &LimiterConfig::default())
    }
}

impl KeyOptions {
    /// Bind `config` to `key`.
    pub fn from_config(key: impl Into<String>, config: &LimiterConfig) -> Self {
        Self {
            key: key.into(),
            is_unlimited: config.unlimited,
            max_count: config.max_count,
            duration: config.duration,
            strategy: config.strategy,
        }
    }

    /// The limiter settings without the key.
    pub fn config(&self) -> LimiterConfig {
        LimiterConfig {
            max_count: self.max_count,
            duration: self.duration,
            unlimited: self.is_unlimited,
            strategy: self.strategy,
        }
    }

    /// Check the options, including the key.
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        self.config().validate_for_key(&self.key)
    }
}

/// Configuration for a keyed registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Default options.
    ///
    /// A strict registry registers this key at construction; an
    /// auto-provisioning registry uses these settings for unknown keys.
    #[serde(default)]
    pub default: KeyOptions,

    /// Keys registered with custom settings at construction
    #[serde(default)]
    pub keys: Vec<KeyOptions>,
}

impl RegistryConfig {
    /// Load configuration from a file path.
    ///
    /// Files ending in `.json` are parsed as JSON, everything else as YAML.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading registry configuration");

        let contents = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            Self::from_json(&contents)
        } else {
            Self::from_yaml(&contents)
        }
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::Config(format!("Failed to parse registry config: {}", e)))
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| LimiterError::Config(format!("Failed to parse registry config: {}", e)))
    }
}

/// Serialize a `Duration` as whole milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_validate_order() {
        let config = LimiterConfig::new(0, Duration::ZERO);
        assert_eq!(config.validate_for_key(""), Err(ValidationError::EmptyKey));
        assert_eq!(config.validate_for_key("k"), Err(ValidationError::ZeroMaxCount));

        let config = LimiterConfig::new(1, Duration::ZERO);
        assert_eq!(config.validate_for_key("k"), Err(ValidationError::ZeroDuration));

        let config = LimiterConfig::new(1, Duration::from_secs(1));
        assert_eq!(config.validate_for_key("k"), Ok(()));
    }

    #[test]
    fn test_unlimited_skips_validation() {
        let mut config = LimiterConfig::unlimited();
        config.max_count = 0;
        config.duration = Duration::ZERO;

        assert_eq!(config.validate_for_key(""), Ok(()));
    }

    #[test]
    fn test_validation_messages() {
        assert_eq!(ValidationError::EmptyKey.to_string(), "empty keys not allowed");
        assert_eq!(ValidationError::ZeroMaxCount.to_string(), "maxcount cannot be zero");
        assert_eq!(ValidationError::ZeroDuration.to_string(), "time duration not set");
    }

    #[test]
    fn test_parse_registry_config() {
        let yaml = r#"
default:
  key: default
  max_count: 100
  duration: 3000
keys:
  - key: one
    max_count: 10
    duration: 500
    strategy: continuous
  - key: open
    is_unlimited: true
"#;
        let config = RegistryConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.default.key, "default");
        assert_eq!(config.default.max_count, 100);
        assert_eq!(config.default.duration, Duration::from_secs(3));
        assert_eq!(config.default.strategy, Strategy::Windowed);

        assert_eq!(config.keys.len(), 2);
        assert_eq!(config.keys[0].duration, Duration::from_millis(500));
        assert_eq!(config.keys[0].strategy, Strategy::Continuous);
        assert!(config.keys[1].is_unlimited);
        assert!(config.keys[1].config().unlimited);
    }

    #[test]
    fn test_parse_json_config() {
        let json = r#"{"default": {"key": "api", "max_count": 5, "duration": 1000, "unlimited": false}}"#;
        let config = RegistryConfig::from_json(json).unwrap();
        assert_eq!(config.default.key, "api");
        assert_eq!(config.default.config(), LimiterConfig::new(5, Duration::from_secs(1)));
        assert!(config.keys.is_empty());
    }

    #[test]
    fn test_parse_invalid_config() {
        let result = RegistryConfig::from_yaml("default: [1, 2]");
        assert!(matches!(result, Err(LimiterError::Config(_))));
    }

    #[test]
    fn test_from_file_by_extension() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("ratelimit-config-{}.json", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(br#"{"keys": [{"key": "a", "max_count": 2, "duration": 250}]}"#)
            .unwrap();

        let config = RegistryConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.default, KeyOptions::default());
        assert_eq!(config.keys[0].key, "a");
        assert_eq!(config.keys[0].duration, Duration::from_millis(250));
    }

    #[test]
    fn test_key_options_round_trip_config() {
        let config = LimiterConfig::new(7, Duration::from_millis(1500)).with_strategy(Strategy::Continuous);
        let options = KeyOptions::from_config("k", &config);

        assert_eq!(options.key, "k");
        assert_eq!(options.config(), config);
        assert_eq!(options.validate(), Ok(()));
    }
}
