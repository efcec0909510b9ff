//! Error taxonomy for the log streaming subsystem.
//!
//! Only `AdmissionDenied` ever surfaces as an HTTP status (503), and only
//! before a stream is opened. Everything else is scoped to the operation that
//! produced it: snapshot and tail failures are logged and retried or absorbed,
//! never allowed to abort an open stream.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    /// Global connection cap reached. Fail-fast: the request is rejected
    /// outright, never queued.
    #[error("connection limit reached ({limit} active connections)")]
    AdmissionDenied { limit: usize },

    /// No entries persisted for the session yet. Non-fatal: the stream treats
    /// this as an empty backlog and proceeds to tail.
    #[error("no log entries for session {0}")]
    SessionNotFound(String),

    /// Transient I/O failure while reading the log medium. Retried on the
    /// next watch or poll tick; the cursor is not advanced.
    #[error("tail read failed: {0}")]
    TailRead(#[from] std::io::Error),

    /// The filesystem watcher could not be attached. The pipeline degrades to
    /// interval polling only.
    #[error("watcher setup failed: {0}")]
    WatcherSetup(String),
}

pub type Result<T> = std::result::Result<T, StreamError>;
