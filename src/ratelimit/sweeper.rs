//! Background eviction of idle ledgers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::clock::Clock;
use super::limiter::RateLimiter;
use crate::error::{Result, WindowkeeperError};

/// Handle to a task that periodically removes idle ledgers from a limiter.
///
/// Keeps memory bounded for limiters fed by many short-lived keys.
#[derive(Debug)]
pub struct IdleSweeper {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl IdleSweeper {
    /// Spawn the sweep task on the current tokio runtime.
    ///
    /// Every `interval`, ledgers that are empty and idle for at least `ttl`
    /// are evicted. A zero `interval` is a configuration error.
    pub fn spawn<C>(limiter: Arc<RateLimiter<C>>, interval: Duration, ttl: Duration) -> Result<Self>
    where
        C: Clock + 'static,
    {
        if interval.is_zero() {
            return Err(WindowkeeperError::Config(
                "idle sweep interval must be greater than zero".to_string(),
            ));
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);

        info!(interval = ?interval, ttl = ?ttl, "Starting idle ledger sweeper");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let handle = tokio::spawn(async move {
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = limiter.evict_idle(ttl);
                        debug!(removed = removed, keys = limiter.key_count(), "Idle sweep finished");
                    }
                    _ = shutdown_rx.changed() => {
                        break;
                    }
                }
            }
        });

        Ok(Self { shutdown, handle })
    }

    /// Stop the sweep task and wait for it to finish.
    ///
    /// Fails if the task panicked or was cancelled before it could be stopped.
    pub async fn shutdown(self) -> Result<()> {
        info!("Stopping idle ledger sweeper");
        // The receiver is gone if the task already ended; the join below reports why.
        let _ = self.shutdown.send(true);
        self.handle.await.map_err(|e| {
            error!(error = %e, "Idle ledger sweeper failed");
            WindowkeeperError::Task(e)
        })
    }
}
