//! Live-limiter and remembered-config slots shared by both registries.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::LimiterConfig;
use crate::error::{LimiterError, Result};
use crate::ratelimit::RateLimiter;

/// Two independent maps keyed by the same string.
///
/// `configs` is always locked before `limiters` when both are held, and no
/// guard is held across an `.await`.
#[derive(Debug)]
pub(crate) struct Slots {
    /// Live limiters
    limiters: DashMap<String, Arc<RateLimiter>>,
    /// Configurations of keys registered through `add`
    configs: DashMap<String, LimiterConfig>,
    /// Parent of every limiter created here
    scope: CancellationToken,
}

impl Slots {
    pub(crate) fn new(parent: &CancellationToken) -> Self {
        Self {
            limiters: DashMap::new(),
            configs: DashMap::new(),
            scope: parent.child_token(),
        }
    }

    pub(crate) fn live(&self, key: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.get(key).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn remembered(&self, key: &str) -> Option<LimiterConfig> {
        self.configs.get(key).map(|entry| entry.value().clone())
    }

    /// Validate, then create and store a limiter and its configuration.
    ///
    /// Fails if the key has either slot populated. The existence check and
    /// both inserts happen under the entry locks of the two maps.
    pub(crate) fn add(&self, key: &str, config: &LimiterConfig) -> Result<Arc<RateLimiter>> {
        config.validate_for_key(key)?;

        let remembered = match self.configs.entry(key.to_string()) {
            Entry::Occupied(_) => return Err(LimiterError::KeyAlreadyExists(key.to_string())),
            Entry::Vacant(entry) => entry,
        };
        let live = match self.limiters.entry(key.to_string()) {
            Entry::Occupied(_) => return Err(LimiterError::KeyAlreadyExists(key.to_string())),
            Entry::Vacant(entry) => entry,
        };

        let limiter = Arc::new(RateLimiter::from_config(&self.scope, config)?);
        let limiter = Arc::clone(live.insert(limiter).value());
        remembered.insert(config.clone());

        debug!(
            key = %key,
            max_count = config.max_count,
            duration = ?config.duration,
            unlimited = config.unlimited,
            strategy = %config.strategy,
            "Added rate limiter"
        );
        Ok(limiter)
    }

    /// Return the live limiter for `key`, creating one if there is none.
    ///
    /// A new limiter uses the remembered configuration when there is one and
    /// `default` otherwise. Concurrent callers for the same key all receive
    /// the same instance.
    pub(crate) fn provision(&self, key: &str, default: &LimiterConfig) -> Result<Arc<RateLimiter>> {
        if let Some(limiter) = self.live(key) {
            return Ok(limiter);
        }

        let remembered = self.remembered(key);
        let config = remembered.as_ref().unwrap_or(default);

        match self.limiters.entry(key.to_string()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let limiter = Arc::new(self.rebuild(config)?);
                debug!(
                    key = %key,
                    remembered = remembered.is_some(),
                    "Provisioned rate limiter"
                );
                Ok(Arc::clone(entry.insert(limiter).value()))
            }
        }
    }

    /// Replace the live limiter for `key` with a fresh one.
    ///
    /// Uses the remembered configuration, else `default`; fails with
    /// `KeyMissing` when neither exists.
    pub(crate) fn recreate(
        &self,
        key: &str,
        default: Option<&LimiterConfig>,
    ) -> Result<Arc<RateLimiter>> {
        let remembered = self.remembered(key);
        let config = match (remembered.as_ref(), default) {
            (Some(config), _) | (None, Some(config)) => config,
            (None, None) => return Err(LimiterError::KeyMissing(key.to_string())),
        };

        let limiter = Arc::new(self.rebuild(config)?);
        self.limiters.insert(key.to_string(), Arc::clone(&limiter));

        debug!(key = %key, remembered = remembered.is_some(), "Recreated rate limiter");
        Ok(limiter)
    }

    /// Build a limiter from a configuration that was validated when stored.
    fn rebuild(&self, config: &LimiterConfig) -> Result<RateLimiter> {
        RateLimiter::from_config(&self.scope, config).map_err(|e| match e {
            LimiterError::Validation(e) => {
                LimiterError::Internal(format!("stored configuration rejected: {}", e))
            }
            other => other,
        })
    }

    /// Stop the live limiter for `key` and clear its live slot.
    ///
    /// Returns `false` if there was no live limiter.
    pub(crate) fn stop(&self, key: &str) -> bool {
        match self.limiters.remove(key) {
            Some((_, limiter)) => {
                limiter.stop();
                debug!(key = %key, "Stopped rate limiter");
                true
            }
            None => false,
        }
    }

    /// Stop every live limiter and clear all live slots.
    pub(crate) fn stop_all(&self) {
        self.limiters.retain(|_, limiter| {
            limiter.stop();
            false
        });
        debug!("Stopped all rate limiters");
    }

    /// Stop the live limiter and forget the configuration.
    ///
    /// Returns `true` if either slot was populated.
    pub(crate) fn remove(&self, key: &str) -> bool {
        let stopped = self.stop(key);
        let forgotten = self.configs.remove(key).is_some();
        if forgotten {
            debug!(key = %key, "Removed rate limiter configuration");
        }
        stopped || forgotten
    }

    pub(crate) fn exists(&self, key: &str) -> bool {
        self.limiters.contains_key(key) || self.configs.contains_key(key)
    }

    pub(crate) fn is_active(&self, key: &str) -> bool {
        self.limiters.contains_key(key)
    }

    /// Sorted snapshot of every key with a live or remembered slot.
    pub(crate) fn keys(&self) -> Vec<String> {
        let mut keys: BTreeSet<String> =
            self.limiters.iter().map(|entry| entry.key().clone()).collect();
        keys.extend(self.configs.iter().map(|entry| entry.key().clone()));
        keys.into_iter().collect()
    }

    /// Cancel the registry scope and clear all live slots.
    pub(crate) fn shutdown(&self) {
        self.scope.cancel();
        self.stop_all();
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.scope.is_cancelled()
    }
}

/// Whether `n` permits appear to be available on `limiter`.
///
/// Runs `n` sequential non-consuming checks; concurrent takers can make the
/// answer stale by the time it is returned.
pub(crate) fn appears_available(limiter: &RateLimiter, n: u64) -> bool {
    (0..n).all(|i| limiter.available() > i)
}
