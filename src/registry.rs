//! Connection Admission and Registry
//!
//! The only cross-request shared mutable state in the subsystem. Enforces the
//! global concurrency cap (fail-fast, never queued) and tracks per-session
//! and per-connection records.
//!
//! Invariants, held at all times:
//! - `total == Σ per_session[s]`
//! - `total <= max_concurrent_connections`
//! - every connection record has a matching increment in both counters
//!
//! Concurrency model: mutations for one session are serialized through a
//! keyed async mutex, so two concurrent acquires for the same session observe
//! a linear history while sessions proceed independently. The global total is
//! deliberately NOT guarded by those per-session locks: it lives in its own
//! atomic and the cap check-and-increment is a single `fetch_update`, so
//! acquires on different sessions cannot race it either.

use crate::error::{Result, StreamError};
use crate::metrics::HealthMetrics;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Lifecycle of one SSE connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Closing,
    Closed,
}

/// Per-request subscription record, registered for the request's lifetime
#[derive(Debug, Clone)]
pub struct Connection {
    pub connection_id: Uuid,
    pub session_id: String,
    pub state: ConnectionState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Read-only view of the registry for health reporting. May be stale by the
/// time the caller looks at it; reads require no serialization.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    pub total: usize,
    pub sessions: usize,
    pub limit: usize,
}

pub struct ConnectionRegistry {
    limit: usize,
    /// Global connection count. Owns cap enforcement; see module docs.
    total: AtomicUsize,
    connections: DashMap<Uuid, Connection>,
    per_session: DashMap<String, usize>,
    /// Keyed mutual exclusion for per-session count updates. Entries are
    /// evicted when their session drains, so the map stays bounded by the
    /// number of sessions with live connections.
    session_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    metrics: Arc<dyn HealthMetrics>,
}

impl ConnectionRegistry {
    pub fn new(limit: usize, metrics: Arc<dyn HealthMetrics>) -> Self {
        Self {
            limit,
            total: AtomicUsize::new(0),
            connections: DashMap::new(),
            per_session: DashMap::new(),
            session_locks: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Admit a new connection for `session_id`.
    ///
    /// Fails with `AdmissionDenied` when the global cap is reached, without
    /// mutating any state. On success the connection record is created in
    /// state `Connecting` and both counters are incremented.
    pub async fn acquire(&self, session_id: &str) -> Result<Uuid> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        // Cap check and increment in one atomic step.
        if self
            .total
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.limit).then_some(n + 1)
            })
            .is_err()
        {
            warn!(
                session_id,
                limit = self.limit,
                "connection rejected: global cap reached"
            );
            return Err(StreamError::AdmissionDenied { limit: self.limit });
        }

        let connection_id = Uuid::new_v4();
        let now = Utc::now();
        self.connections.insert(
            connection_id,
            Connection {
                connection_id,
                session_id: session_id.to_string(),
                state: ConnectionState::Connecting,
                created_at: now,
                last_activity: now,
            },
        );
        *self.per_session.entry(session_id.to_string()).or_insert(0) += 1;

        debug!(
            session_id,
            %connection_id,
            total = self.total.load(Ordering::SeqCst),
            "connection admitted"
        );
        self.report();
        Ok(connection_id)
    }

    /// Release a connection. Idempotent: releasing twice, or releasing an id
    /// that was never acquired, is a warned no-op.
    pub async fn release(&self, connection_id: Uuid) {
        // Removing the record first makes double-release inert: only the call
        // that wins the removal touches the counters.
        let Some((_, conn)) = self.connections.remove(&connection_id) else {
            warn!(%connection_id, "release for unknown connection id (already released?)");
            return;
        };

        let lock = self.session_lock(&conn.session_id);
        let guard = lock.lock().await;

        let drained = {
            match self.per_session.get_mut(&conn.session_id) {
                Some(mut count) => {
                    *count = count.saturating_sub(1);
                    *count == 0
                }
                None => {
                    warn!(
                        session_id = %conn.session_id,
                        "per-session count missing during release"
                    );
                    false
                }
            }
        };
        if drained {
            self.per_session
                .remove_if(&conn.session_id, |_, count| *count == 0);
        }
        drop(guard);

        if drained {
            // Evict the keyed lock once the session has no connections left.
            // Holding the map mutex blocks new handles from being cloned, so
            // a strong count of exactly 2 (the map's plus ours) proves no
            // concurrent acquire or release still waits on this lock.
            let mut locks = self.session_locks.lock();
            if locks
                .get(&conn.session_id)
                .is_some_and(|entry| Arc::strong_count(entry) == 2)
            {
                locks.remove(&conn.session_id);
            }
        }

        // Saturating: the counter can never go negative even if the record
        // bookkeeping above ever disagreed.
        let _ = self
            .total
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));

        debug!(
            session_id = %conn.session_id,
            %connection_id,
            total = self.total.load(Ordering::SeqCst),
            "connection released"
        );
        self.report();
    }

    /// Update the lifecycle state of a connection. No-op for unknown ids.
    pub fn set_state(&self, connection_id: Uuid, state: ConnectionState) {
        if let Some(mut conn) = self.connections.get_mut(&connection_id) {
            conn.state = state;
        }
    }

    /// Record activity on a connection (a delivered batch)
    pub fn touch(&self, connection_id: Uuid) {
        if let Some(mut conn) = self.connections.get_mut(&connection_id) {
            conn.last_activity = Utc::now();
        }
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    /// Active connection count for one session (0 when absent)
    pub fn session_count(&self, session_id: &str) -> usize {
        self.per_session.get(session_id).map(|c| *c).unwrap_or(0)
    }

    pub fn connection(&self, connection_id: Uuid) -> Option<Connection> {
        self.connections.get(&connection_id).map(|c| c.clone())
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            total: self.total(),
            sessions: self.per_session.len(),
            limit: self.limit,
        }
    }

    fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.session_locks.lock();
        Arc::clone(
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    #[cfg(test)]
    fn session_lock_count(&self) -> usize {
        self.session_locks.lock().len()
    }

    fn report(&self) {
        self.metrics
            .update_connection_metrics(self.total(), self.connections.len(), 0);
    }
}
