//! Health Metrics Sink
//!
//! The connection registry reports updated counts after every admission and
//! release so the dashboard health aggregation always has a current view.
//! The sink is injected, so tests can capture updates and the server can run
//! without a metrics backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Receiver of connection-count updates.
pub trait HealthMetrics: Send + Sync {
    /// Called after every admission or release.
    ///
    /// `total` is the process-wide connection count, `instance_count` the
    /// number of registered connection records, `reserved` a slot count held
    /// back from admission (currently always 0).
    fn update_connection_metrics(&self, total: usize, instance_count: usize, reserved: usize);
}

/// Drops all updates. Default for tests that don't inspect metrics.
pub struct NullMetrics;

impl HealthMetrics for NullMetrics {
    fn update_connection_metrics(&self, _total: usize, _instance_count: usize, _reserved: usize) {}
}

/// Emits updates as tracing events. Used by the server binary.
pub struct LoggingMetrics;

impl HealthMetrics for LoggingMetrics {
    fn update_connection_metrics(&self, total: usize, instance_count: usize, reserved: usize) {
        debug!(total, instance_count, reserved, "connection metrics updated");
    }
}

/// Retains the most recent update for health reporting and assertions.
#[derive(Default)]
pub struct LastReported {
    total: AtomicUsize,
    instance_count: AtomicUsize,
    updates: AtomicUsize,
}

impl LastReported {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn instance_count(&self) -> usize {
        self.instance_count.load(Ordering::SeqCst)
    }

    /// Number of updates received since creation
    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

impl HealthMetrics for LastReported {
    fn update_connection_metrics(&self, total: usize, instance_count: usize, _reserved: usize) {
        self.total.store(total, Ordering::SeqCst);
        self.instance_count.store(instance_count, Ordering::SeqCst);
        self.updates.fetch_add(1, Ordering::SeqCst);
    }
}
