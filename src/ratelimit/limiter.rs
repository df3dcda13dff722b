//! Core rate limiter implementation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, trace};

use super::clock::{Clock, MonotonicClock};
use super::ledger::{WindowConfig, WindowLedger};
use super::registry::KeyRegistry;
use super::rules::KeyRules;
use crate::config::LimiterConfig;
use crate::error::Result;

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the request was admitted
    pub allowed: bool,
    /// Quota of the key's window
    pub limit: u64,
    /// Admissions left in the current window after this decision
    pub remaining: u64,
    /// Advisory backoff for a denied request
    pub retry_after: Option<Duration>,
}

/// Counters describing the limiter's activity since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    /// Keys that currently have a ledger
    pub keys: usize,
    /// Requests admitted
    pub admitted: u64,
    /// Requests denied
    pub denied: u64,
    /// Ledgers removed by idle eviction
    pub idle_evicted: u64,
}

/// Settings new ledgers are created from.
#[derive(Debug, Clone)]
struct Settings {
    default: WindowConfig,
    rules: KeyRules,
}

impl Settings {
    fn config_for(&self, key: &str) -> WindowConfig {
        self.rules.config_for(key, self.default)
    }
}

/// The sliding-window rate limiter.
///
/// Each key is limited independently through its own ledger. The limiter is
/// `Sync` and meant to be shared behind an `Arc` by the service that invokes
/// it.
pub struct RateLimiter<C: Clock = MonotonicClock> {
    /// Per-key ledgers
    registry: KeyRegistry,
    /// Held shared by every admission; taken exclusively only to reconfigure
    settings: RwLock<Settings>,
    clock: C,
    admitted: AtomicU64,
    denied: AtomicU64,
    idle_evicted: AtomicU64,
}

impl RateLimiter<MonotonicClock> {
    /// Create a rate limiter on the monotonic system clock.
    pub fn new(config: WindowConfig) -> Self {
        Self::with_clock(config, MonotonicClock::new())
    }
}

impl<C: Clock> RateLimiter<C> {
    /// Create a rate limiter reading time from `clock`.
    pub fn with_clock(config: WindowConfig, clock: C) -> Self {
        Self::with_rules(config, KeyRules::new(), clock)
    }

    /// Create a rate limiter with per-key rules.
    pub fn with_rules(config: WindowConfig, rules: KeyRules, clock: C) -> Self {
        info!(
            limit = config.max_requests(),
            window = ?config.window(),
            rules = rules.len(),
            "Rate limiter initialized"
        );
        Self {
            registry: KeyRegistry::new(),
            settings: RwLock::new(Settings {
                default: config,
                rules,
            }),
            clock,
            admitted: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            idle_evicted: AtomicU64::new(0),
        }
    }

    /// Build a rate limiter from a loaded configuration.
    pub fn from_config(config: &LimiterConfig, clock: C) -> Result<Self> {
        let window = config.window_config()?;
        Ok(Self::with_rules(window, config.rules.clone(), clock))
    }

    /// Try to admit one request for `key`.
    ///
    /// Returns `true` and records exactly one admission if the key has fewer
    /// than its quota of live admissions, `false` otherwise. Every `true`
    /// consumes a slot, so this is not a read-only query.
    pub fn try_acquire(&self, key: &str) -> bool {
        self.check(key).allowed
    }

    /// Try to admit one request for `key` and report the resulting status.
    pub fn check(&self, key: &str) -> Decision {
        let settings = self.settings.read();

        trace!(key = %key, "Checking rate limit");

        let decision = self.registry.with_ledger(
            key,
            || WindowLedger::new(settings.config_for(key), self.clock.now()),
            |ledger| {
                // Read the clock under the ledger lock so admissions on one key
                // are recorded in the order they were decided.
                let now = self.clock.now();
                let allowed = ledger.acquire(now);
                Decision {
                    allowed,
                    limit: ledger.config().max_requests(),
                    remaining: ledger.remaining(),
                    retry_after: if allowed { None } else { ledger.retry_after(now) },
                }
            },
        );

        if decision.allowed {
            self.admitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.denied.fetch_add(1, Ordering::Relaxed);
            debug!(
                key = %key,
                limit = decision.limit,
                retry_after = ?decision.retry_after,
                "Rate limit exceeded"
            );
        }

        decision
    }

    /// How long a caller should wait before `key` can be admitted again.
    ///
    /// Returns `None` for unknown keys and for keys with spare quota. Never
    /// records an admission.
    pub fn retry_after(&self, key: &str) -> Option<Duration> {
        let ledger = self.registry.get(key)?;
        let mut ledger = ledger.lock();
        ledger.retry_after(self.clock.now())
    }

    /// Live admissions for `key`, or `None` if the key has no ledger.
    pub fn live_count(&self, key: &str) -> Option<usize> {
        let ledger = self.registry.get(key)?;
        let mut ledger = ledger.lock();
        ledger.evict_expired(self.clock.now());
        Some(ledger.len())
    }

    /// Window configuration a new ledger for `key` would be created with.
    pub fn config_for(&self, key: &str) -> WindowConfig {
        self.settings.read().config_for(key)
    }

    /// Replace the default window configuration.
    ///
    /// Live ledgers are never mutated: all of them are dropped and each key
    /// starts a fresh ledger under the new configuration on its next request.
    pub fn reconfigure(&self, config: WindowConfig) {
        let mut settings = self.settings.write();
        settings.default = config;
        self.registry.clear();
        info!(
            limit = config.max_requests(),
            window = ?config.window(),
            "Rate limiter reconfigured"
        );
    }

    /// Replace the per-key rules. Like [`reconfigure`](Self::reconfigure),
    /// this resets every ledger.
    pub fn set_rules(&self, rules: KeyRules) {
        let mut settings = self.settings.write();
        info!(rules = rules.len(), "Rate limit rules replaced");
        settings.rules = rules;
        self.registry.clear();
    }

    /// Remove ledgers that are empty and have been idle for at least `ttl`.
    ///
    /// Returns the number of ledgers removed.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let removed = self.registry.evict_idle(|| self.clock.now(), ttl);
        if removed > 0 {
            self.idle_evicted.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed = removed, remaining = self.registry.len(), "Evicted idle ledgers");
        }
        removed
    }

    /// Clear all ledgers.
    pub fn clear(&self) {
        self.registry.clear();
    }

    /// Get the number of keys with a ledger.
    pub fn key_count(&self) -> usize {
        self.registry.len()
    }

    /// Snapshot of the limiter's counters.
    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            keys: self.registry.len(),
            admitted: self.admitted.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            idle_evicted: self.idle_evicted.load(Ordering::Relaxed),
        }
    }

    /// The clock this limiter reads.
    pub fn clock(&self) -> &C {
        &self.clock
    }
}

impl<C: Clock> std::fmt::Debug for RateLimiter<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let settings = self.settings.read();
        f.debug_struct("RateLimiter")
            .field("default", &settings.default)
            .field("rules", &settings.rules.len())
            .field("keys", &self.registry.len())
            .finish()
    }
}
