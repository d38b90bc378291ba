//! Strict keyed registry: unknown keys are an error.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::slots::{appears_available, Slots};
use crate::config::{KeyOptions, LimiterConfig, RegistryConfig};
use crate::error::{LimiterError, Result};
use crate::ratelimit::RateLimiter;

/// Many independently configured limiters addressed by key.
///
/// Every key must be registered with [`add`](Self::add) before use. Stopping a
/// key releases its limiter but remembers the configuration, so the key stays
/// registered until [`remove`](Self::remove) is called; a stopped key can be
/// brought back with [`recreate`](Self::recreate).
#[derive(Debug)]
pub struct MultiLimiter {
    slots: Slots,
}

impl MultiLimiter {
    /// Create a registry and register `options.key` with its settings.
    ///
    /// Every limiter created by the registry is stopped when `scope` is
    /// cancelled.
    pub fn new(scope: &CancellationToken, options: KeyOptions) -> Result<Self> {
        let registry = Self {
            slots: Slots::new(scope),
        };
        registry.add_options(&options)?;
        Ok(registry)
    }

    /// Create a registry with the default key and every listed key registered.
    pub fn from_config(scope: &CancellationToken, config: &RegistryConfig) -> Result<Self> {
        let registry = Self::new(scope, config.default.clone())?;
        for options in &config.keys {
            registry.add_options(options)?;
        }
        Ok(registry)
    }

    /// Register `key` with its own limiter.
    #[instrument(level = "debug", skip(self, config), fields(strategy = %config.strategy))]
    pub fn add(&self, key: &str, config: LimiterConfig) -> Result<()> {
        self.slots.add(key, &config).map(|_| ())
    }

    /// Register a key described by `options`.
    pub fn add_options(&self, options: &KeyOptions) -> Result<()> {
        self.add(&options.key, options.config())
    }

    /// Take one permit for `key`, waiting until one is available.
    pub async fn take(&self, key: &str) -> Result<()> {
        let limiter = self.get(key)?;
        limiter.take().await;
        Ok(())
    }

    /// Check whether `key` appears to have a permit available.
    ///
    /// Unknown and stopped keys report `false`.
    pub fn can_take(&self, key: &str) -> bool {
        self.slots.live(key).map_or(false, |limiter| limiter.can_take())
    }

    /// Alias for [`can_take`](Self::can_take).
    pub fn allow(&self, key: &str) -> bool {
        self.can_take(key)
    }

    /// Check whether `n` permits appear to be available for `key`.
    ///
    /// Nothing is reserved, so concurrent takers may consume the permits
    /// before the caller does.
    pub fn allow_n(&self, key: &str, n: u64) -> bool {
        self.slots
            .live(key)
            .map_or(false, |limiter| appears_available(&limiter, n))
    }

    /// Take a permit, registering `key` with `config` first if it has no live
    /// limiter.
    ///
    /// `config` is ignored for keys that are already live. A concurrent `add`
    /// of the same key is not reported as an error; the permit is then taken
    /// from whichever limiter won.
    pub async fn add_and_take(&self, key: &str, config: LimiterConfig) -> Result<()> {
        if let Some(limiter) = self.slots.live(key) {
            limiter.take().await;
            return Ok(());
        }

        match self.add(key, config) {
            Ok(()) | Err(LimiterError::KeyAlreadyExists(_)) => self.take(key).await,
            Err(e) => Err(e),
        }
    }

    /// Current maximum permits per interval for `key`.
    pub fn limit(&self, key: &str) -> Result<u64> {
        Ok(self.get(key)?.limit())
    }

    /// Change the maximum permits per interval for `key`'s live limiter.
    ///
    /// The remembered configuration is not changed.
    pub fn set_limit(&self, key: &str, max_count: u64) -> Result<()> {
        self.get(key)?.set_limit(max_count)
    }

    /// Change the refill interval for `key`'s live limiter.
    ///
    /// The remembered configuration is not changed.
    pub fn set_duration(&self, key: &str, duration: Duration) -> Result<()> {
        self.get(key)?.set_duration(duration)
    }

    /// Stop the named keys, or every key when `keys` is empty.
    ///
    /// Configurations are remembered. Every named key with a live limiter is
    /// stopped; the first named key without one is reported as `KeyMissing`.
    pub fn stop(&self, keys: &[&str]) -> Result<()> {
        if keys.is_empty() {
            self.slots.stop_all();
            return Ok(());
        }

        let mut missing = None;
        for key in keys {
            if !self.slots.stop(key) && missing.is_none() {
                missing = Some(key.to_string());
            }
        }
        match missing {
            Some(key) => Err(LimiterError::KeyMissing(key)),
            None => Ok(()),
        }
    }

    /// Stop `key` and forget its configuration.
    ///
    /// Returns `false` if the key was not registered.
    pub fn remove(&self, key: &str) -> bool {
        self.slots.remove(key)
    }

    /// Replace `key`'s limiter with a fresh one built from its remembered
    /// configuration.
    pub fn recreate(&self, key: &str) -> Result<()> {
        self.slots.recreate(key, None).map(|_| ())
    }

    /// Whether `key` has a live limiter or a remembered configuration.
    pub fn exists(&self, key: &str) -> bool {
        self.slots.exists(key)
    }

    /// Whether `key` has a live limiter.
    pub fn is_active(&self, key: &str) -> bool {
        self.slots.is_active(key)
    }

    /// Sorted snapshot of the registered keys.
    pub fn keys(&self) -> Vec<String> {
        self.slots.keys()
    }

    /// Stop every limiter and cancel the registry scope.
    ///
    /// Limiters recreated afterwards are stopped from the start.
    pub fn shutdown(&self) {
        self.slots.shutdown();
    }

    /// Whether [`shutdown`](Self::shutdown) was called or the parent scope
    /// was cancelled.
    pub fn is_shutdown(&self) -> bool {
        self.slots.is_shutdown()
    }

    fn get(&self, key: &str) -> Result<Arc<RateLimiter>> {
        self.slots
            .live(key)
            .ok_or_else(|| LimiterError::KeyMissing(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use crate::ratelimit::Strategy;
    use tokio::time::{self, Instant};

    fn options(key: &str, max_count: u64, duration: Duration) -> KeyOptions {
        KeyOptions::from_config(key, &LimiterConfig::new(max_count, duration))
    }

    fn registry() -> MultiLimiter {
        MultiLimiter::new(
            &CancellationToken::new(),
            options("default", 10, Duration::from_secs(1)),
        )
        .unwrap()
    }

    /// Count how many permits are granted before a take would wait.
    async fn admitted(limiter: &MultiLimiter, key: &str) -> usize {
        let mut count = 0;
        while time::timeout(Duration::from_millis(100), limiter.take(key))
            .await
            .is_ok()
        {
            count += 1;
        }
        count
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_limiter() {
        let limiter = MultiLimiter::new(
            &CancellationToken::new(),
            options("default", 100, Duration::from_secs(3)),
        )
        .unwrap();
        limiter
            .add("one", LimiterConfig::new(100, Duration::from_secs(3)))
            .unwrap();

        let run = |key: &'static str| {
            let limiter = &limiter;
            async move {
                let start = Instant::now();
                for _ in 0..201 {
                    limiter.take(key).await.unwrap();
                }
                start.elapsed()
            }
        };

        let (default_took, one_took) = tokio::join!(run("default"), run("one"));
        assert!(default_took >= Duration::from_secs(6));
        assert!(one_took >= Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_new_registers_initial_key() {
        let limiter = registry();
        assert!(limiter.exists("default"));
        assert_eq!(limiter.limit("default").unwrap(), 10);
        assert_eq!(limiter.keys(), vec!["default".to_string()]);
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_options() {
        let result = MultiLimiter::new(
            &CancellationToken::new(),
            options("", 10, Duration::from_secs(1)),
        );
        assert!(matches!(
            result,
            Err(LimiterError::Validation(ValidationError::EmptyKey))
        ));
    }

    #[tokio::test]
    async fn test_add_validation() {
        let limiter = registry();

        let err = limiter
            .add("", LimiterConfig::new(10, Duration::from_secs(1)))
            .unwrap_err();
        assert!(err.to_string().contains("empty keys not allowed"));

        let err = limiter
            .add("key2", LimiterConfig::new(0, Duration::from_secs(1)))
            .unwrap_err();
        assert!(err.to_string().contains("maxcount cannot be zero"));

        let err = limiter
            .add("key3", LimiterConfig::new(10, Duration::ZERO))
            .unwrap_err();
        assert!(err.to_string().contains("time duration not set"));

        limiter.add("unlimited", LimiterConfig::unlimited()).unwrap();
        assert_eq!(
            limiter.keys(),
            vec!["default".to_string(), "unlimited".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_add_leaves_original() {
        let limiter = registry();
        limiter
            .add("key1", LimiterConfig::new(3, Duration::from_secs(1)))
            .unwrap();

        let result = limiter.add("key1", LimiterConfig::new(20, Duration::from_secs(1)));
        assert!(matches!(result, Err(LimiterError::KeyAlreadyExists(_))));

        assert_eq!(limiter.limit("key1").unwrap(), 3);
        assert_eq!(admitted(&limiter, "key1").await, 3);
    }

    #[tokio::test]
    async fn test_take_missing_key() {
        let limiter = registry();

        let result = limiter.take("missing").await;
        assert!(matches!(result, Err(LimiterError::KeyMissing(_))));
        assert!(matches!(limiter.limit("missing"), Err(LimiterError::KeyMissing(_))));
        assert!(!limiter.can_take("missing"));
        assert!(!limiter.allow_n("missing", 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_can_take_and_allow_n() {
        let limiter = registry();
        limiter
            .add("key1", LimiterConfig::new(5, Duration::from_secs(1)))
            .unwrap();

        assert!(limiter.allow_n("key1", 5));
        for _ in 0..3 {
            limiter.take("key1").await.unwrap();
        }
        assert!(limiter.allow("key1"));
        assert!(limiter.allow_n("key1", 2));
        assert!(!limiter.allow_n("key1", 3));

        limiter.take("key1").await.unwrap();
        limiter.take("key1").await.unwrap();
        assert!(!limiter.can_take("key1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_and_take() {
        let limiter = registry();

        limiter
            .add_and_take("key1", LimiterConfig::new(3, Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(limiter.allow_n("key1", 2));

        // existing key keeps its original limit
        limiter
            .add_and_take("key1", LimiterConfig::new(10, Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(limiter.limit("key1").unwrap(), 3);
        assert!(limiter.allow_n("key1", 1));
        assert!(!limiter.allow_n("key1", 2));
    }

    #[tokio::test]
    async fn test_add_and_take_reports_validation_errors() {
        let limiter = registry();
        let result = limiter
            .add_and_take("key1", LimiterConfig::new(0, Duration::from_secs(1)))
            .await;
        assert!(matches!(result, Err(LimiterError::Validation(_))));
        assert!(!limiter.exists("key1"));
    }

    #[tokio::test]
    async fn test_stop_keeps_config() {
        let limiter = registry();
        limiter
            .add("key1", LimiterConfig::new(5, Duration::from_millis(500)))
            .unwrap();
        limiter
            .add("key2", LimiterConfig::new(10, Duration::from_secs(1)))
            .unwrap();

        limiter.stop(&["key1"]).unwrap();
        assert!(!limiter.is_active("key1"));
        assert!(limiter.exists("key1"));
        assert!(limiter.is_active("key2"));
        assert!(matches!(
            limiter.take("key1").await,
            Err(LimiterError::KeyMissing(_))
        ));

        // still registered, so it cannot be added again
        let result = limiter.add("key1", LimiterConfig::new(5, Duration::from_secs(1)));
        assert!(matches!(result, Err(LimiterError::KeyAlreadyExists(_))));

        limiter.stop(&[]).unwrap();
        assert!(!limiter.is_active("key2"));
        assert!(!limiter.is_active("default"));
        assert_eq!(limiter.keys().len(), 3);
    }

    #[tokio::test]
    async fn test_stop_reports_missing_keys() {
        let limiter = registry();
        limiter
            .add("key1", LimiterConfig::new(5, Duration::from_secs(1)))
            .unwrap();

        let result = limiter.stop(&["missing", "key1"]);
        assert!(matches!(result, Err(LimiterError::KeyMissing(key)) if key == "missing"));
        assert!(!limiter.is_active("key1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recreate_after_stop() {
        let limiter = registry();
        limiter
            .add("key1", LimiterConfig::new(4, Duration::from_secs(1)))
            .unwrap();
        limiter.set_limit("key1", 40).unwrap();
        limiter.stop(&["key1"]).unwrap();

        limiter.recreate("key1").unwrap();
        assert!(limiter.is_active("key1"));
        assert_eq!(limiter.limit("key1").unwrap(), 4);
        assert_eq!(admitted(&limiter, "key1").await, 4);

        assert!(matches!(
            limiter.recreate("missing"),
            Err(LimiterError::KeyMissing(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_then_take_fails() {
        let limiter = registry();
        limiter
            .add("key1", LimiterConfig::new(5, Duration::from_secs(1)))
            .unwrap();

        assert!(limiter.remove("key1"));
        assert!(!limiter.exists("key1"));
        assert!(!limiter.remove("key1"));
        assert!(matches!(
            limiter.take("key1").await,
            Err(LimiterError::KeyMissing(_))
        ));

        // forgotten keys can be registered again
        limiter
            .add("key1", LimiterConfig::new(2, Duration::from_secs(1)))
            .unwrap();
        assert_eq!(limiter.limit("key1").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_set_duration() {
        let limiter = registry();
        limiter.set_duration("default", Duration::from_secs(5)).unwrap();
        assert!(limiter.set_duration("default", Duration::ZERO).is_err());
        assert!(matches!(
            limiter.set_duration("missing", Duration::from_secs(1)),
            Err(LimiterError::KeyMissing(_))
        ));
    }

    #[tokio::test]
    async fn test_from_config() {
        let yaml = r#"
default:
  key: default
  max_count: 100
  duration: 3000
keys:
  - key: bursty
    max_count: 10
    duration: 1000
    strategy: continuous
"#;
        let config = RegistryConfig::from_yaml(yaml).unwrap();
        let limiter = MultiLimiter::from_config(&CancellationToken::new(), &config).unwrap();

        assert_eq!(limiter.keys(), vec!["bursty".to_string(), "default".to_string()]);
        assert_eq!(limiter.limit("bursty").unwrap(), 10);
        assert_eq!(
            limiter.slots.live("bursty").unwrap().strategy(),
            Strategy::Continuous
        );
    }

    #[tokio::test]
    async fn test_parent_scope_stops_limiters() {
        let scope = CancellationToken::new();
        let limiter =
            MultiLimiter::new(&scope, options("default", 10, Duration::from_secs(1))).unwrap();
        let live = limiter.slots.live("default").unwrap();

        scope.cancel();
        assert!(limiter.is_shutdown());
        assert!(live.is_stopped());
        assert!(!limiter.can_take("default"));
    }

    #[tokio::test]
    async fn test_shutdown() {
        let scope = CancellationToken::new();
        let limiter =
            MultiLimiter::new(&scope, options("default", 10, Duration::from_secs(1))).unwrap();

        limiter.shutdown();
        assert!(limiter.is_shutdown());
        assert!(!limiter.is_active("default"));
        assert!(!scope.is_cancelled());

        limiter.recreate("default").unwrap();
        assert!(limiter.slots.live("default").unwrap().is_stopped());
    }
}
