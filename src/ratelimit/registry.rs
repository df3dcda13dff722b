//! Concurrent map from limiter keys to their ledgers.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::clock::Timestamp;
use super::key::LimiterKey;
use super::ledger::WindowLedger;

/// A ledger shared between the registry and in-flight admissions.
pub type SharedLedger = Arc<Mutex<WindowLedger>>;

/// Owns the mapping from [`LimiterKey`] to [`WindowLedger`].
///
/// The map is sharded, and every ledger has its own lock. Admission paths
/// release the shard guard before locking a ledger, so different keys never
/// wait on each other and new keys never block checks on existing ones.
/// Only [`evict_idle`](Self::evict_idle) and [`clear`](Self::clear) hold a
/// shard and a ledger lock at once, always in that order.
#[derive(Debug, Default)]
pub struct KeyRegistry {
    ledgers: DashMap<LimiterKey, SharedLedger>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the ledger for `key` without creating one.
    pub fn get(&self, key: &str) -> Option<SharedLedger> {
        self.ledgers.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Return the ledger for `key`, creating it with `make` if absent.
    ///
    /// Threads racing on the same new key all receive the same ledger; `make`
    /// runs at most once per created ledger.
    pub fn get_or_create<F>(&self, key: &str, make: F) -> SharedLedger
    where
        F: FnOnce() -> WindowLedger,
    {
        if let Some(existing) = self.get(key) {
            return existing;
        }

        let entry = self
            .ledgers
            .entry(LimiterKey::from(key))
            .or_insert_with(|| {
                let ledger = make();
                debug!(
                    key = %key,
                    limit = ledger.config().max_requests(),
                    window = ?ledger.config().window(),
                    "Creating new window ledger"
                );
                Arc::new(Mutex::new(ledger))
            });
        Arc::clone(entry.value())
    }

    /// Run `f` on the ledger for `key` while holding that ledger's lock.
    ///
    /// If the ledger was retired by an idle sweep between lookup and locking,
    /// the lookup is retried so nothing is ever recorded into a ledger that
    /// is no longer reachable.
    pub fn with_ledger<M, F, R>(&self, key: &str, make: M, f: F) -> R
    where
        M: Fn() -> WindowLedger,
        F: FnOnce(&mut WindowLedger) -> R,
    {
        loop {
            let ledger = self.get_or_create(key, &make);
            let mut guard = ledger.lock();
            if guard.is_retired() {
                trace!(key = %key, "Ledger retired during lookup, retrying");
                continue;
            }
            return f(&mut guard);
        }
    }

    /// Remove ledgers that are empty and have not been used for `ttl`.
    ///
    /// `now` is read once per ledger while that ledger is locked, so a reading
    /// is never older than an admission the ledger has already recorded.
    /// Returns the number of ledgers removed.
    pub fn evict_idle<N>(&self, now: N, ttl: Duration) -> usize
    where
        N: Fn() -> Timestamp,
    {
        let mut removed = 0;
        self.ledgers.retain(|key, ledger| {
            let mut guard = ledger.lock();
            if guard.is_idle(now(), ttl) {
                guard.retire();
                removed += 1;
                trace!(key = %key, "Evicting idle ledger");
                false
            } else {
                true
            }
        });
        removed
    }

    /// Number of keys with a ledger.
    pub fn len(&self) -> usize {
        self.ledgers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ledgers.is_empty()
    }

    /// Snapshot of the keys currently tracked.
    pub fn keys(&self) -> Vec<LimiterKey> {
        self.ledgers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Drop every ledger.
    pub fn clear(&self) {
        self.ledgers.retain(|_, ledger| {
            ledger.lock().retire();
            false
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ledger::WindowConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn make_ledger() -> WindowLedger {
        WindowLedger::new(
            WindowConfig::new(3, Duration::from_secs(10)).unwrap(),
            Timestamp::ZERO,
        )
    }

    #[test]
    fn test_registry_creation() {
        let registry = KeyRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_get_or_create_returns_same_ledger() {
        let registry = KeyRegistry::new();
        let first = registry.get_or_create("client:a", make_ledger);
        let second = registry.get_or_create("client:a", make_ledger);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_creation_converges() {
        let registry = KeyRegistry::new();
        let created = AtomicUsize::new(0);

        let ledgers: Vec<SharedLedger> = thread::scope(|s| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    s.spawn(|| {
                        registry.get_or_create("tenant:shared", || {
                            created.fetch_add(1, Ordering::SeqCst);
                            make_ledger()
                        })
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(ledgers.iter().all(|l| Arc::ptr_eq(l, &ledgers[0])));
    }

    #[test]
    fn test_evict_idle_removes_only_idle_ledgers() {
        let registry = KeyRegistry::new();
        registry.with_ledger("idle", make_ledger, |l| l.acquire(Timestamp::ZERO));
        registry.with_ledger("busy", make_ledger, |l| l.acquire(Timestamp::from_secs(55)));

        let removed = registry.evict_idle(|| Timestamp::from_secs(60), Duration::from_secs(30));

        assert_eq!(removed, 1);
        assert!(registry.get("idle").is_none());
        assert!(registry.get("busy").is_some());
    }

    #[test]
    fn test_retired_ledger_is_replaced() {
        let registry = KeyRegistry::new();
        let stale = registry.get_or_create("client:b", make_ledger);

        assert_eq!(registry.evict_idle(|| Timestamp::ZERO, Duration::ZERO), 1);
        assert!(stale.lock().is_retired());

        let admitted = registry.with_ledger("client:b", make_ledger, |l| l.acquire(Timestamp::ZERO));
        assert!(admitted);

        let fresh = registry.get("client:b").unwrap();
        assert!(!Arc::ptr_eq(&stale, &fresh));
        assert_eq!(fresh.lock().len(), 1);
        assert!(stale.lock().is_empty());
    }

    #[test]
    fn test_evict_idle_reads_clock_per_ledger() {
        let registry = KeyRegistry::new();
        for key in ["a", "b", "c"] {
            registry.with_ledger(key, make_ledger, |l| l.acquire(Timestamp::ZERO));
        }
        let reads = AtomicUsize::new(0);

        let removed = registry.evict_idle(
            || {
                reads.fetch_add(1, Ordering::SeqCst);
                Timestamp::from_secs(5)
            },
            Duration::ZERO,
        );

        assert_eq!(removed, 0);
        assert_eq!(reads.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_clear_retires_everything() {
        let registry = KeyRegistry::new();
        let ledger = registry.get_or_create("a", make_ledger);
        registry.get_or_create("b", make_ledger);

        registry.clear();

        assert!(registry.is_empty());
        assert!(ledger.lock().is_retired());
    }

    #[test]
    fn test_keys_snapshot() {
        let registry = KeyRegistry::new();
        registry.get_or_create("a", make_ledger);
        registry.get_or_create("b", make_ledger);

        let mut keys: Vec<String> = registry.keys().iter().map(|k| k.to_string()).collect();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);
    }
}
