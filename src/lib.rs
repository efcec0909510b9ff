//! Real-Time Log Streaming for Execution Sessions
//!
//! Live-tails append-only execution logs over Server-Sent Events so dashboard
//! clients watch sessions as they run. Logs land in shared per-day JSONL
//! files; each stream replays a session's backlog and then follows new
//! appends with bounded latency until the session ends or the connection is
//! torn down.
//!
//! ## Module Structure
//!
//! - `config`: Tunables (admission cap, pipeline intervals, session timers)
//! - `error`: Subsystem error type
//! - `store`: Append-only JSONL log store with per-session offset reads
//! - `metrics`: Connection-count sink for health aggregation
//! - `registry`: Admission control and connection bookkeeping
//! - `shutdown`: Drain/close signal fan-out for graceful shutdown
//! - `pipeline`: Hybrid watch+poll discovery of newly appended lines
//! - `stream`: Per-connection session lifecycle and wire frames
//! - `api`: HTTP surface (SSE endpoint, health)

/// Tunables for admission, delivery, and session timers
pub mod config;

/// Subsystem error type
pub mod error;

/// Append-only JSONL log store
pub mod store;

/// Connection-count metrics sink
pub mod metrics;

/// Admission control and connection registry
pub mod registry;

/// Graceful shutdown signal fan-out
pub mod shutdown;

/// Watch+poll delivery pipeline
pub mod pipeline;

/// Stream session lifecycle and wire frames
pub mod stream;

/// HTTP endpoints
pub mod api;

pub use config::StreamConfig;
pub use error::{Result, StreamError};
pub use registry::ConnectionRegistry;
pub use shutdown::ShutdownCoordinator;
pub use store::{LogEntry, LogStore};
pub use stream::{StreamFrame, StreamHandle, StreamSession};
