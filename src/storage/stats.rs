//! Write-stat counters
//!
//! Counts writes queued versus writes executed so a UI can show progress.
//! Observational only; nothing in the engine reads these back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct StatsSnapshot {
    pub queued: u64,
    pub executed: u64,
}

impl StatsSnapshot {
    /// Writes queued but not yet executed.
    pub fn pending(&self) -> u64 {
        self.queued.saturating_sub(self.executed)
    }
}

/// Receives a snapshot after every counter change.
pub trait StatsObserver: Send + Sync {
    fn on_stats(&self, snapshot: StatsSnapshot);
}

impl<F> StatsObserver for F
where
    F: Fn(StatsSnapshot) + Send + Sync,
{
    fn on_stats(&self, snapshot: StatsSnapshot) {
        self(snapshot)
    }
}

#[derive(Default)]
pub struct WriteStats {
    queued: AtomicU64,
    executed: AtomicU64,
    observers: RwLock<Vec<Arc<dyn StatsObserver>>>,
}

impl WriteStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            queued: self.queued.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
        }
    }

    pub fn observe(&self, observer: Arc<dyn StatsObserver>) {
        self.observers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(observer);
    }

    pub(crate) fn record_queued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
        self.notify();
    }

    pub(crate) fn record_executed(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.executed.fetch_add(count, Ordering::Relaxed);
        self.notify();
    }

    fn notify(&self) {
        let snapshot = self.snapshot();
        let observers = self.observers.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        for observer in observers.iter() {
            observer.on_stats(snapshot);
        }
    }
}

impl std::fmt::Debug for WriteStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteStats").field("snapshot", &self.snapshot()).finish()
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Write Statistics:")?;
        writeln!(f, "  Queued: {}", self.queued)?;
        writeln!(f, "  Executed: {}", self.executed)?;
        writeln!(f, "  Pending: {}", self.pending())
    }
}
