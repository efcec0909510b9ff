//! Append-Only JSONL Log Store
//!
//! Execution logs land in one JSONL file per calendar day. Entries for many
//! sessions interleave in the same file, so every read filters by session id.
//! Entries are immutable once written and strictly ordered by append time per
//! session, which is what makes offset-based tailing safe: the entry at a
//! given per-session offset never changes.
//!
//! Consumed by the delivery pipeline through two read paths:
//! - `read_session`: full snapshot (metadata + backlog)
//! - `tail_session`: incremental read from a per-session offset

use crate::error::{Result, StreamError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A single immutable log line for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Entry kind: `stdout`, `stderr`, `system`, `end`, ...
    #[serde(rename = "type")]
    pub entry_type: String,
    /// Arbitrary JSON payload. `end` entries carry `{"exitCode": n}`.
    pub data: Value,
    /// Producer timestamp, epoch milliseconds
    pub timestamp: i64,
}

impl LogEntry {
    pub fn new(entry_type: impl Into<String>, data: Value) -> Self {
        Self {
            entry_type: entry_type.into(),
            data,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Terminal entry for a session
    pub fn is_end(&self) -> bool {
        self.entry_type == "end"
    }

    /// Exit code carried by an `end` entry
    pub fn exit_code(&self) -> Option<i64> {
        self.data.get("exitCode").and_then(Value::as_i64)
    }
}

/// On-disk line format: a `LogEntry` tagged with its session id so that
/// entries from many sessions can share one day file.
#[derive(Debug, Serialize, Deserialize)]
struct StoredLine {
    #[serde(rename = "sessionId")]
    session_id: String,
    #[serde(flatten)]
    entry: LogEntry,
}

/// Session status derived from its entries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// `running` until an `end` entry appears, then `completed`
    pub status: String,
    #[serde(rename = "exitCode")]
    pub exit_code: Option<i64>,
    #[serde(rename = "createdAt")]
    pub created_at: Option<i64>,
    #[serde(rename = "endedAt")]
    pub ended_at: Option<i64>,
}

impl SessionMetadata {
    fn from_entries(entries: &[LogEntry]) -> Self {
        let end = entries.iter().rev().find(|e| e.is_end());
        Self {
            status: if end.is_some() {
                "completed".to_string()
            } else {
                "running".to_string()
            },
            exit_code: end.and_then(LogEntry::exit_code),
            created_at: entries.first().map(|e| e.timestamp),
            ended_at: end.map(|e| e.timestamp),
        }
    }
}

/// Full snapshot of a session: metadata plus the entire backlog
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub metadata: SessionMetadata,
    pub logs: Vec<LogEntry>,
}

/// Result of an incremental tail read
#[derive(Debug, Clone)]
pub struct TailBatch {
    /// Entries appended after the requested offset, in append order
    pub logs: Vec<LogEntry>,
    /// Per-session offset after consuming `logs`
    pub next_offset: usize,
}

/// JSONL-backed log store, one file per UTC day under `root`.
pub struct LogStore {
    root: PathBuf,
    // Serializes appends within this process so concurrent producers cannot
    // interleave partial lines.
    write_lock: Mutex<()>,
}

impl LogStore {
    /// Create a store rooted at `root`, creating the directory if needed
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Directory holding the day files
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the log file for the current UTC day. May not exist yet: the
    /// file is created by the first append of the day.
    pub fn current_day_file(&self) -> PathBuf {
        let day = chrono::Utc::now().format("%Y-%m-%d");
        self.root.join(format!("{day}.jsonl"))
    }

    /// Append one entry for a session to the current day file.
    ///
    /// This is the producer side of the store; the streaming subsystem itself
    /// only reads, but tests and self-contained deployments write through it.
    pub fn append_entry(&self, session_id: &str, entry: LogEntry) -> Result<()> {
        let line = serde_json::to_string(&StoredLine {
            session_id: session_id.to_string(),
            entry,
        })
        .map_err(|e| StreamError::TailRead(std::io::Error::other(e)))?;

        let _guard = self.write_lock.lock();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.current_day_file())?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Full snapshot of a session. Fails with `SessionNotFound` when no
    /// entries have been persisted yet; callers treat that as an empty
    /// backlog, not an error.
    pub fn read_session(&self, session_id: &str) -> Result<SessionSnapshot> {
        let logs = self.collect_entries(session_id)?;
        if logs.is_empty() {
            return Err(StreamError::SessionNotFound(session_id.to_string()));
        }
        Ok(SessionSnapshot {
            metadata: SessionMetadata::from_entries(&logs),
            logs,
        })
    }

    /// Incremental read: all entries for the session past `from_offset`, in
    /// append order. An empty result is normal and means no new lines.
    pub fn tail_session(&self, session_id: &str, from_offset: usize) -> Result<TailBatch> {
        let all = self.collect_entries(session_id)?;
        let logs: Vec<LogEntry> = all.into_iter().skip(from_offset).collect();
        let next_offset = from_offset + logs.len();
        Ok(TailBatch { logs, next_offset })
    }

    /// Scan all day files in name (= date) order and collect this session's
    /// entries. Day files are append-only, so repeated scans observe a stable
    /// prefix and offsets stay valid across reads.
    fn collect_entries(&self, session_id: &str) -> Result<Vec<LogEntry>> {
        let mut files: Vec<PathBuf> = match std::fs::read_dir(&self.root) {
            Ok(dir) => dir
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "jsonl"))
                .collect(),
            // Root missing entirely: nothing persisted yet
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        files.sort();

        let mut entries = Vec::new();
        for path in files {
            let content = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                // A day file disappearing mid-scan (external rotation) is not
                // fatal; the next tick sees the remaining files.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<StoredLine>(line) {
                    Ok(stored) if stored.session_id == session_id => {
                        entries.push(stored.entry);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        // Torn or foreign line; skipping keeps per-session
                        // offsets stable because only parsed entries count.
                        debug!(path = %path.display(), %err, "skipping malformed log line");
                    }
                }
            }
        }
        Ok(entries)
    }
}
