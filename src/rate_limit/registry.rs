use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{builtin_presets, Clock, RateLimitConfig, RateLimitPreset, RateLimitTier, RateLimiter};

/// Process-scoped table of per-feature limiters.
///
/// Constructed once at startup and handed to the web layer; limiters are
/// created lazily the first time a feature is looked up and live as long as
/// the registry.
pub struct LimiterRegistry {
    clock: Arc<dyn Clock>,
    presets: Vec<RateLimitPreset>,
    limiters: Mutex<HashMap<String, Arc<RateLimiter>>>,
}

impl LimiterRegistry {
    pub fn new(clock: Arc<dyn Clock>, presets: Vec<RateLimitPreset>) -> Self {
        Self {
            clock,
            presets,
            limiters: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_builtin_presets(clock: Arc<dyn Clock>) -> Self {
        Self::new(clock, builtin_presets())
    }

    /// The limiter dedicated to `feature`. Same name, same instance.
    pub fn rate_limiter(&self, feature: &str) -> Arc<RateLimiter> {
        let mut guard = self.limiters.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .entry(feature.to_string())
            .or_insert_with(|| {
                tracing::debug!(target: "rate_limit", feature = feature, "Limiter created");
                Arc::new(RateLimiter::new(self.clock.clone()))
            })
            .clone()
    }

    pub fn preset(&self, feature: &str) -> Option<&RateLimitPreset> {
        self.presets.iter().find(|p| p.feature == feature)
    }

    pub fn config(&self, feature: &str, tier: RateLimitTier) -> Option<&RateLimitConfig> {
        self.preset(feature).and_then(|p| p.tier(tier))
    }

    pub fn presets(&self) -> &[RateLimitPreset] {
        &self.presets
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Clears every limiter created so far.
    pub fn reset_all(&self) {
        let guard = self.limiters.lock().unwrap_or_else(|e| e.into_inner());
        for limiter in guard.values() {
            limiter.reset();
        }
    }
}
