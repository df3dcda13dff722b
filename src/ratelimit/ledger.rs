//! Sliding-window ledger of admission timestamps.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::warn;

use super::clock::Timestamp;
use crate::error::{Result, WindowkeeperError};

/// Quota applied to one ledger: at most `max_requests` admissions inside any
/// trailing `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowConfig {
    max_requests: u64,
    window: Duration,
}

impl WindowConfig {
    /// Create a validated window configuration.
    ///
    /// A zero `max_requests` is rejected. A zero `window` is accepted and
    /// means every admission expires immediately, so throughput is unbounded.
    pub fn new(max_requests: u64, window: Duration) -> Result<Self> {
        if max_requests == 0 {
            return Err(WindowkeeperError::Config(
                "max_requests must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            max_requests,
            window,
        })
    }

    pub fn from_millis(max_requests: u64, window_ms: u64) -> Result<Self> {
        Self::new(max_requests, Duration::from_millis(window_ms))
    }

    /// Maximum admissions inside the window.
    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    /// Length of the trailing window.
    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Ordered record of the admissions for a single key.
///
/// Timestamps are appended at the tail in admission order and are therefore
/// non-decreasing, so expiry only ever has to look at the head.
#[derive(Debug)]
pub struct WindowLedger {
    config: WindowConfig,
    entries: VecDeque<Timestamp>,
    /// Latest time this ledger has observed.
    high_water: Timestamp,
    last_access: Timestamp,
    /// Set once the ledger has been dropped from its registry.
    retired: bool,
}

impl WindowLedger {
    /// Create an empty ledger.
    pub fn new(config: WindowConfig, created_at: Timestamp) -> Self {
        Self {
            config,
            entries: VecDeque::new(),
            high_water: created_at,
            last_access: created_at,
            retired: false,
        }
    }

    /// The configuration this ledger was created with.
    pub fn config(&self) -> WindowConfig {
        self.config
    }

    /// Remove every timestamp `t` with `now - t >= window`, scanning from the head.
    ///
    /// If `now` is earlier than a time this ledger already observed, nothing is
    /// evicted: a backwards clock gives no usable information about age.
    /// Returns the number of entries removed.
    pub fn evict_expired(&mut self, now: Timestamp) -> usize {
        if now < self.high_water {
            warn!(
                now = %now,
                last_seen = %self.high_water,
                "Clock moved backwards, skipping eviction"
            );
            return 0;
        }
        self.high_water = now;

        let mut evicted = 0;
        while let Some(&oldest) = self.entries.front() {
            match now.checked_since(oldest) {
                Some(age) if age >= self.config.window => {
                    self.entries.pop_front();
                    evicted += 1;
                }
                _ => break,
            }
        }
        evicted
    }

    /// Number of live timestamps as of the last eviction.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an admission at `now`.
    ///
    /// Must only follow a positive admission decision. If `now` is behind the
    /// latest observed time the entry is recorded at that latest time instead,
    /// keeping the sequence ordered.
    pub fn record(&mut self, now: Timestamp) {
        let at = now.max(self.high_water);
        self.high_water = at;
        self.entries.push_back(at);
    }

    /// Evict, then admit iff fewer than `max_requests` timestamps are live.
    ///
    /// A denied request leaves no entry behind.
    pub fn try_acquire(&mut self, now: Timestamp, max_requests: u64) -> bool {
        self.touch(now);
        self.evict_expired(now);

        if (self.entries.len() as u64) < max_requests {
            self.record(now);
            true
        } else {
            false
        }
    }

    /// [`try_acquire`](Self::try_acquire) against this ledger's own quota.
    pub fn acquire(&mut self, now: Timestamp) -> bool {
        self.try_acquire(now, self.config.max_requests)
    }

    /// Admissions still available before the quota is reached.
    pub fn remaining(&self) -> u64 {
        self.config
            .max_requests
            .saturating_sub(self.entries.len() as u64)
    }

    /// How long until the next admission could succeed.
    ///
    /// Returns `None` when an admission would succeed right now. Otherwise the
    /// hint is `window - (now - oldest)`, the time until the oldest live entry
    /// leaves the window.
    pub fn retry_after(&mut self, now: Timestamp) -> Option<Duration> {
        self.evict_expired(now);

        if self.remaining() > 0 {
            return None;
        }

        let window = self.config.window;
        Some(match self.entries.front() {
            Some(&oldest) => window.saturating_sub(now.saturating_since(oldest)),
            None => window,
        })
    }

    /// Whether the ledger holds no live entries and has not been used for `ttl`.
    pub fn is_idle(&mut self, now: Timestamp, ttl: Duration) -> bool {
        self.evict_expired(now);
        self.entries.is_empty() && now.saturating_since(self.last_access) >= ttl
    }

    pub(crate) fn retire(&mut self) {
        self.retired = true;
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired
    }

    fn touch(&mut self, now: Timestamp) {
        self.last_access = self.last_access.max(now);
    }
}
