//! Registry of long-running background operations (index builds, chunk
//! migrations) that hold collection-level state a rollback must not yank out
//! from under them.
//!
//! Each operation registers a guard and polls its pause point. Rollback asks
//! every registered operation to stop, then waits for the guards to drop
//! before truncating the log.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Notify};

struct OpEntry {
    description: String,
    stop_tx: watch::Sender<bool>,
}

#[derive(Default)]
struct Registry {
    ops: HashMap<u64, OpEntry>,
}

/// Shared registry, one per replication node.
pub struct BackgroundOps {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    emptied: Notify,
}

/// Receiver side of the stop signal; long-running operations check this at
/// their pause points.
pub type PausePoint = watch::Receiver<bool>;

impl BackgroundOps {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
            emptied: Notify::new(),
        })
    }

    /// Register a long-running operation. The operation holds the guard for
    /// its lifetime and observes the pause point at interruption-safe points.
    pub fn register(self: &Arc<Self>, description: impl Into<String>) -> (BackgroundOpGuard, PausePoint) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (stop_tx, stop_rx) = watch::channel(false);
        self.registry.lock().unwrap().ops.insert(
            id,
            OpEntry {
                description: description.into(),
                stop_tx,
            },
        );
        (
            BackgroundOpGuard {
                ops: Arc::clone(self),
                id,
            },
            stop_rx,
        )
    }

    pub fn active_count(&self) -> usize {
        self.registry.lock().unwrap().ops.len()
    }

    /// Signal every registered operation to stop and wait until all guards
    /// have dropped, or fail after `timeout`.
    pub async fn drain(&self, timeout: Duration) -> anyhow::Result<()> {
        let descriptions: Vec<String> = {
            let registry = self.registry.lock().unwrap();
            for entry in registry.ops.values() {
                let _ = entry.stop_tx.send(true);
            }
            registry.ops.values().map(|e| e.description.clone()).collect()
        };
        if descriptions.is_empty() {
            return Ok(());
        }
        tracing::info!(
            ops = ?descriptions,
            "waiting for background operations before rollback"
        );

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.active_count() == 0 {
                return Ok(());
            }
            let notified = self.emptied.notified();
            if self.active_count() == 0 {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                anyhow::bail!(
                    "background operations did not drain within {:?}: {:?}",
                    timeout,
                    self.registry
                        .lock()
                        .unwrap()
                        .ops
                        .values()
                        .map(|e| e.description.clone())
                        .collect::<Vec<_>>()
                );
            }
        }
    }
}

/// Dropping the guard unregisters the operation and wakes any drain waiter.
pub struct BackgroundOpGuard {
    ops: Arc<BackgroundOps>,
    id: u64,
}

impl Drop for BackgroundOpGuard {
    fn drop(&mut self) {
        self.ops.registry.lock().unwrap().ops.remove(&self.id);
        self.ops.emptied.notify_waiters();
    }
}
