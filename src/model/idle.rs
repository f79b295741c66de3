//! # Idle Monitor
//!
//! A small background task that periodically asks the lifecycle manager to
//! evict the model when it has sat unused past the configured threshold.
//! The monitor itself holds no model state; the elapsed-time decision is
//! made inside the manager under its lock, so a transcription racing the
//! tick always wins.

use crate::model::lifecycle::ModelLifecycle;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Periodic idle check against the shared lifecycle manager.
pub struct IdleMonitor {
    lifecycle: Arc<ModelLifecycle>,
    check_interval: Duration,
}

impl IdleMonitor {
    pub fn new(lifecycle: Arc<ModelLifecycle>, check_interval: Duration) -> Self {
        Self {
            lifecycle,
            check_interval,
        }
    }

    /// Spawn the monitor loop. It runs for the lifetime of the process; the
    /// returned handle is aborted during shutdown.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.check_interval);
            // A stalled runtime should not cause a burst of catch-up checks
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a freshly loaded
            // model gets a full interval before its first check
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if self.lifecycle.evict_if_idle().await {
                    debug!("Idle monitor evicted the recognizer model");
                }
            }
        })
    }
}
