//! Sliding-window admission counters.
//!
//! A [`RateLimiter`] keeps, per caller key, the timestamps of the attempts
//! it admitted inside the trailing window. Rejected attempts are never
//! recorded, so the window reflects accepted load only.

mod clock;
mod presets;
mod registry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use presets::{
    builtin_presets, resolve_presets, PresetOverride, RateLimitConfig, RateLimitPreset,
    RateLimitTier, TierOverride, CLAUDE_CHAT, CONVERSATION, MESSAGE,
};
pub use registry::LimiterRegistry;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    state: Mutex<Buckets>,
}

#[derive(Default)]
struct Buckets {
    keys: HashMap<String, VecDeque<u64>>,
    last_sweep_ms: Option<u64>,
    sweeps: u64,
}

impl Buckets {
    /// Drops idle keys once the map is past `threshold`, at most once per
    /// window. Keys still inside their window are never evicted.
    fn maybe_sweep(&mut self, now: u64, window_ms: u64, threshold: usize) {
        if self.keys.len() <= threshold {
            return;
        }
        if let Some(last) = self.last_sweep_ms {
            if now.saturating_sub(last) < window_ms {
                return;
            }
        }
        self.keys.retain(|_, bucket| {
            RateLimiter::prune_bucket(bucket, now, window_ms);
            !bucket.is_empty()
        });
        self.last_sweep_ms = Some(now);
        self.sweeps += 1;
    }
}

impl RateLimiter {
    /// Past this many tracked keys an admission check also sweeps idle keys.
    const SWEEP_THRESHOLD: usize = 4096;

    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(Buckets::default()),
        }
    }

    pub fn with_system_clock() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    fn lock(&self) -> MutexGuard<'_, Buckets> {
        // Counters stay consistent across a panicking holder: every mutation
        // is a single push or pop.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// An attempt stops counting once it is `window_ms` old.
    fn prune_bucket(bucket: &mut VecDeque<u64>, now: u64, window_ms: u64) {
        while let Some(ts) = bucket.front() {
            if now.saturating_sub(*ts) >= window_ms {
                let _ = bucket.pop_front();
            } else {
                break;
            }
        }
    }

    /// Admits and records one attempt for `key` if fewer than `max_requests`
    /// attempts were admitted in the last `window_ms` milliseconds.
    ///
    /// The window is half-open: an attempt made at `t` counts for every
    /// check in `[t, t + window_ms)` and no longer counts at exactly
    /// `t + window_ms`, so a rejected caller is readmitted the moment
    /// [`retry_after_ms`](Self::retry_after_ms) reaches zero.
    ///
    /// Prune, count and append happen under one lock, so two concurrent
    /// callers on the same key can never both take the last slot.
    pub fn is_allowed(&self, key: &str, max_requests: usize, window_ms: u64) -> bool {
        let now = self.clock.now_ms();
        let mut guard = self.lock();
        guard.maybe_sweep(now, window_ms, Self::SWEEP_THRESHOLD);

        let bucket = guard.keys.entry(key.to_string()).or_default();
        Self::prune_bucket(bucket, now, window_ms);
        if bucket.len() >= max_requests {
            return false;
        }
        bucket.push_back(now);
        true
    }

    /// Milliseconds until the oldest counted attempt for `key` leaves the
    /// window. Zero when nothing is counted.
    pub fn retry_after_ms(&self, key: &str, window_ms: u64) -> u64 {
        let now = self.clock.now_ms();
        let mut guard = self.lock();
        let Some(bucket) = guard.keys.get_mut(key) else {
            return 0;
        };
        Self::prune_bucket(bucket, now, window_ms);
        let Some(oldest) = bucket.front().copied() else {
            let _ = guard.keys.remove(key);
            return 0;
        };
        window_ms.saturating_sub(now.saturating_sub(oldest))
    }

    /// Attempts for `key` still counted in the window.
    pub fn counted(&self, key: &str, window_ms: u64) -> usize {
        let now = self.clock.now_ms();
        let mut guard = self.lock();
        match guard.keys.get_mut(key) {
            Some(bucket) => {
                Self::prune_bucket(bucket, now, window_ms);
                bucket.len()
            }
            None => 0,
        }
    }

    pub fn tracked_keys(&self) -> usize {
        self.lock().keys.len()
    }

    pub fn reset(&self) {
        let mut guard = self.lock();
        guard.keys.clear();
        guard.last_sweep_ms = None;
    }
}
