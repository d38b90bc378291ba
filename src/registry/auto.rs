//! Auto-provisioning keyed registry.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::slots::{appears_available, Slots};
use crate::config::{LimiterConfig, RegistryConfig};
use crate::error::{LimiterError, Result};
use crate::ratelimit::{RateLimiter, UNLIMITED_MAX_COUNT};

/// Keyed registry that creates limiters on first use.
///
/// Keys registered with [`add`](Self::add) keep their configuration until
/// [`remove`](Self::remove); any other key is throttled with the registry's
/// default configuration. [`stop`](Self::stop) releases a key's limiter (and
/// its refill task) without forgetting the configuration, and the next use of
/// the key rebuilds an identical limiter. This keeps registries with many
/// rarely used keys cheap: stopped keys cost one map entry.
///
/// Reads and writes differ on unknown keys. [`limit`](Self::limit) answers
/// from the remembered or default configuration without creating anything.
/// [`set_limit`](Self::set_limit) and [`set_duration`](Self::set_duration)
/// only act on live limiters, so they provision one first; the change lasts
/// until the key is stopped, after which the key is rebuilt from its
/// remembered or default configuration again.
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use hivemind_ratelimit::{AutoLimiter, LimiterConfig};
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main]
/// # async fn main() -> hivemind_ratelimit::error::Result<()> {
/// let scope = CancellationToken::new();
/// let limiter = AutoLimiter::new(&scope, LimiterConfig::new(10, Duration::from_secs(1)))?;
///
/// limiter.add("premium", LimiterConfig::new(100, Duration::from_secs(1)))?;
///
/// limiter.take("premium").await?;
/// limiter.take("anyone-else").await?;
///
/// // Release idle limiters; their settings come back on next use.
/// limiter.stop(&[]);
/// limiter.take("premium").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct AutoLimiter {
    slots: Slots,
    default: LimiterConfig,
}

impl AutoLimiter {
    /// Create a registry that provisions unknown keys with `default`.
    pub fn new(scope: &CancellationToken, default: LimiterConfig) -> Result<Self> {
        default.validate()?;
        Ok(Self {
            slots: Slots::new(scope),
            default,
        })
    }

    /// Create a registry from configuration.
    ///
    /// The default options become the provisioning default and every listed
    /// key is registered. The default key itself is not registered.
    pub fn from_config(scope: &CancellationToken, config: &RegistryConfig) -> Result<Self> {
        let registry = Self::new(scope, config.default.config())?;
        for options in &config.keys {
            registry.add(&options.key, options.config())?;
        }
        Ok(registry)
    }

    /// Configuration used for keys that were never added.
    pub fn default_config(&self) -> &LimiterConfig {
        &self.default
    }

    /// Register `key` with custom settings.
    #[instrument(level = "debug", skip(self, config), fields(strategy = %config.strategy))]
    pub fn add(&self, key: &str, config: LimiterConfig) -> Result<()> {
        self.slots.add(key, &config).map(|_| ())
    }

    /// Take one permit for `key`, creating its limiter if needed.
    ///
    /// Never fails for an unknown key.
    pub async fn take(&self, key: &str) -> Result<()> {
        let limiter = self.provision(key)?;
        limiter.take().await;
        Ok(())
    }

    /// Check whether `key` appears to have a permit available, creating its
    /// limiter if needed.
    pub fn can_take(&self, key: &str) -> bool {
        self.provision(key)
            .map_or(false, |limiter| limiter.can_take())
    }

    /// Alias for [`can_take`](Self::can_take).
    pub fn allow(&self, key: &str) -> bool {
        self.can_take(key)
    }

    /// Check whether `n` permits appear to be available for `key`, creating
    /// its limiter if needed.
    ///
    /// Nothing is reserved, so concurrent takers may consume the permits
    /// before the caller does.
    pub fn allow_n(&self, key: &str, n: u64) -> bool {
        self.provision(key)
            .map_or(false, |limiter| appears_available(&limiter, n))
    }

    /// Take a permit, registering `key` with `config` first if it has no live
    /// limiter.
    ///
    /// `config` is ignored for keys that are live. A key that is stopped or
    /// was added concurrently is not reported as an error; its existing
    /// configuration is used instead.
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

    /// Maximum permits per interval that apply to `key`.
    ///
    /// Reads the live limiter, else the remembered configuration, else the
    /// default. Does not create a limiter.
    pub fn limit(&self, key: &str) -> u64 {
        if let Some(limiter) = self.slots.live(key) {
            return limiter.limit();
        }
        let config = self.slots.remembered(key).unwrap_or_else(|| self.default.clone());
        if config.unlimited {
            UNLIMITED_MAX_COUNT
        } else {
            config.max_count
        }
    }

    /// Change the maximum permits per interval of `key`'s live limiter,
    /// creating it if needed.
    ///
    /// The remembered configuration is not changed.
    pub fn set_limit(&self, key: &str, max_count: u64) -> Result<()> {
        self.provision(key)?.set_limit(max_count)
    }

    /// Change the refill interval of `key`'s live limiter, creating it if
    /// needed.
    ///
    /// The remembered configuration is not changed.
    pub fn set_duration(&self, key: &str, duration: Duration) -> Result<()> {
        self.provision(key)?.set_duration(duration)
    }

    /// Stop the named keys, or every key when `keys` is empty.
    ///
    /// Configurations are remembered; unknown keys are ignored.
    pub fn stop(&self, keys: &[&str]) {
        if keys.is_empty() {
            self.slots.stop_all();
            return;
        }
        for key in keys {
            self.slots.stop(key);
        }
    }

    /// Stop `key` and forget its configuration.
    ///
    /// Returns `false` if the key was not known.
    pub fn remove(&self, key: &str) -> bool {
        self.slots.remove(key)
    }

    /// Replace `key`'s limiter with one built from its remembered
    /// configuration, or the default.
    pub fn recreate(&self, key: &str) -> Result<()> {
        self.slots.recreate(key, Some(&self.default)).map(|_| ())
    }

    /// Whether `key` has a live limiter or a remembered configuration.
    pub fn exists(&self, key: &str) -> bool {
        self.slots.exists(key)
    }

    /// Whether `key` has a live limiter.
    pub fn is_active(&self, key: &str) -> bool {
        self.slots.is_active(key)
    }

    /// Sorted snapshot of the known keys.
    pub fn keys(&self) -> Vec<String> {
        self.slots.keys()
    }

    /// Stop every limiter and cancel the registry scope.
    ///
    /// Limiters provisioned afterwards are stopped from the start.
    pub fn shutdown(&self) {
        self.slots.shutdown();
    }

    /// Whether [`shutdown`](Self::shutdown) was called or the parent scope
    /// was cancelled.
    pub fn is_shutdown(&self) -> bool {
        self.slots.is_shutdown()
    }

    fn provision(&self, key: &str) -> Result<Arc<RateLimiter>> {
        self.slots.provision(key, &self.default)
    }
}
