//! Delivery Pipeline
//!
//! Discovers newly appended log lines for one session with bounded latency.
//! The log medium may not exist yet, is shared across sessions, and native
//! file events carry no delivery guarantee under rapid writes, so discovery
//! is a hybrid:
//! - a filesystem watcher with write-stabilization (latency optimization)
//! - a fixed-interval poll (correctness backstop)
//!
//! Both paths funnel into the same tail check on a single task that owns the
//! cursor: at-least-once notification, exactly-once consumption. The cursor
//! advances only past lines that were actually handed off, so a watch event
//! and a poll tick firing together can never double-deliver a range, and
//! delivery order equals append order.

use crate::config::DeliveryConfig;
use crate::error::{Result, StreamError};
use crate::store::{LogEntry, LogStore};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A batch of newly discovered lines, in append order.
#[derive(Debug, Clone)]
pub struct LogBatch {
    pub logs: Vec<LogEntry>,
    /// True when the batch contains the session's `end` entry; the pipeline
    /// has already stopped itself when this is set.
    pub ended: bool,
}

/// Handle to a running pipeline. Stopping (or dropping) cancels the tailer
/// task and detaches the watcher.
pub struct DeliveryPipeline {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl DeliveryPipeline {
    /// Start tailing `session_id` from `cursor`. Batches are delivered on
    /// `batches`; the pipeline stops on its own after handing off a batch
    /// containing an `end` entry, when `cancel` fires, or when the receiver
    /// is dropped.
    pub fn spawn(
        store: Arc<LogStore>,
        session_id: String,
        cursor: usize,
        config: DeliveryConfig,
        batches: mpsc::Sender<LogBatch>,
        cancel: CancellationToken,
    ) -> Self {
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            run_tailer(store, session_id, cursor, config, batches, task_cancel).await;
        });
        Self { cancel, handle }
    }

    /// Cancel the watcher and both poll loops. The token is observed before
    /// every tail check, so no new check starts after this returns; a batch
    /// already mid-handoff may still complete the send, landing in a receiver
    /// the caller is abandoning.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for DeliveryPipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum TailOutcome {
    /// Nothing new (or a transient read failure; retried next tick)
    Idle,
    /// Lines handed off, cursor advanced
    Delivered,
    /// An `end` entry was delivered; tailing is over
    Ended,
    /// The batch receiver is gone (stream closed)
    Closed,
}

async fn run_tailer(
    store: Arc<LogStore>,
    session_id: String,
    mut cursor: usize,
    config: DeliveryConfig,
    batches: mpsc::Sender<LogBatch>,
    cancel: CancellationToken,
) {
    // Phase 1: the day file may not exist until the producer writes its first
    // line. Poll it into existence.
    loop {
        if cancel.is_cancelled() {
            return;
        }
        if store.current_day_file().exists() {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(config.existence_poll_interval()) => {}
        }
    }

    // Phase 2: attach the watcher. Failure is not fatal: the interval poll
    // alone still guarantees delivery, just with higher latency.
    let (watch_tx, mut watch_rx) = mpsc::channel::<()>(8);
    let _watcher = match attach_watcher(&store, watch_tx) {
        Ok(watcher) => Some(watcher),
        Err(err) => {
            warn!(
                session_id,
                %err,
                "file watcher unavailable; tailing degrades to interval polling"
            );
            None
        }
    };

    // Immediate check covers lines written before the watcher attached.
    match tail_once(&store, &session_id, &mut cursor, &batches).await {
        TailOutcome::Ended | TailOutcome::Closed => return,
        TailOutcome::Idle | TailOutcome::Delivered => {}
    }

    let mut poll = tokio::time::interval(config.poll_interval());
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    poll.reset(); // the immediate check above already covered "now"

    let mut watch_open = _watcher.is_some();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = poll.tick() => {}
            event = watch_rx.recv(), if watch_open => {
                if event.is_none() {
                    // Watcher thread gone; keep polling.
                    watch_open = false;
                    continue;
                }
                // Write stabilization: coalesce rapid successive events into
                // one tail check.
                let deadline = sleep(config.debounce());
                tokio::pin!(deadline);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = &mut deadline => break,
                        more = watch_rx.recv() => {
                            if more.is_some() {
                                deadline.as_mut().reset(Instant::now() + config.debounce());
                            } else {
                                break;
                            }
                        }
                    }
                }
            }
        }

        match tail_once(&store, &session_id, &mut cursor, &batches).await {
            TailOutcome::Ended | TailOutcome::Closed => return,
            TailOutcome::Idle | TailOutcome::Delivered => {}
        }
    }
}

/// One tail check. Reads past the cursor, hands off anything new, and only
/// then advances the cursor, so no line is ever skipped or repeated.
async fn tail_once(
    store: &LogStore,
    session_id: &str,
    cursor: &mut usize,
    batches: &mpsc::Sender<LogBatch>,
) -> TailOutcome {
    let batch = match store.tail_session(session_id, *cursor) {
        Ok(batch) => batch,
        Err(err) => {
            // Transient read failure. The cursor was not advanced, so the
            // next watch or poll tick retries the same range.
            debug!(session_id, %err, "tail check failed; retrying next tick");
            return TailOutcome::Idle;
        }
    };

    if batch.logs.is_empty() {
        return TailOutcome::Idle;
    }

    let ended = batch.logs.iter().any(LogEntry::is_end);
    let count = batch.logs.len();
    if batches
        .send(LogBatch {
            logs: batch.logs,
            ended,
        })
        .await
        .is_err()
    {
        return TailOutcome::Closed;
    }
    *cursor += count;

    if ended {
        debug!(session_id, cursor, "end entry delivered; pipeline stopping");
        TailOutcome::Ended
    } else {
        TailOutcome::Delivered
    }
}

/// Watch the store directory for writes to any day file. Events are reduced
/// to wake-ups; the tail check itself decides whether anything is new, which
/// makes spurious or coalesced events harmless.
fn attach_watcher(store: &LogStore, watch_tx: mpsc::Sender<()>) -> Result<RecommendedWatcher> {
    let mut watcher =
        notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            let Ok(event) = event else { return };
            let relevant = matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any
            ) && event
                .paths
                .iter()
                .any(|p| p.extension().is_some_and(|ext| ext == "jsonl"));
            if relevant {
                // Full queue means a wake-up is already pending; dropping the
                // event loses nothing.
                let _ = watch_tx.try_send(());
            }
        })
        .map_err(|e| StreamError::WatcherSetup(e.to_string()))?;
    watcher
        .watch(store.root(), RecursiveMode::NonRecursive)
        .map_err(|e| StreamError::WatcherSetup(e.to_string()))?;
    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;
    use tokio::time::timeout;

    fn fast_config() -> DeliveryConfig {
        DeliveryConfig {
            existence_poll_interval_ms: 10,
            poll_interval_ms: 25,
            debounce_ms: 5,
        }
    }

    fn line(text: &str) -> LogEntry {
        LogEntry::new("stdout", json!({ "line": text }))
    }

    async fn recv(batches: &mut mpsc::Receiver<LogBatch>) -> LogBatch {
        timeout(Duration::from_secs(2), batches.recv())
            .await
            .expect("timed out waiting for batch")
            .expect("pipeline closed unexpectedly")
    }

    #[tokio::test]
    async fn test_delivers_appends_in_order() {
        let dir = tempdir().unwrap();
        let store = Arc::new(LogStore::new(dir.path()).unwrap());
        let (tx, mut rx) = mpsc::channel(8);

        let pipeline = DeliveryPipeline::spawn(
            Arc::clone(&store),
            "s1".to_string(),
            0,
            fast_config(),
            tx,
            CancellationToken::new(),
        );

        for i in 0..3 {
            store.append_entry("s1", line(&format!("line {i}"))).unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut seen = Vec::new();
        while seen.len() < 3 {
            let batch = recv(&mut rx).await;
            assert!(!batch.ended);
            seen.extend(batch.logs.into_iter().map(|e| e.data["line"].clone()));
        }
        assert_eq!(seen, vec!["line 0", "line 1", "line 2"]);

        pipeline.stop();
    }

    #[tokio::test]
    async fn test_waits_for_medium_to_exist() {
        let dir = tempdir().unwrap();
        let store = Arc::new(LogStore::new(dir.path()).unwrap());
        let (tx, mut rx) = mpsc::channel(8);

        let _pipeline = DeliveryPipeline::spawn(
            Arc::clone(&store),
            "s1".to_string(),
            0,
            fast_config(),
            tx,
            CancellationToken::new(),
        );

        // Nothing on disk yet; give the existence poll a few cycles
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        store.append_entry("s1", line("first")).unwrap();
        let batch = recv(&mut rx).await;
        assert_eq!(batch.logs.len(), 1);
        assert_eq!(batch.logs[0].data["line"], "first");
    }

    #[tokio::test]
    async fn test_skips_backlog_before_cursor() {
        let dir = tempdir().unwrap();
        let store = Arc::new(LogStore::new(dir.path()).unwrap());

        store.append_entry("s1", line("old 0")).unwrap();
        store.append_entry("s1", line("old 1")).unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let _pipeline = DeliveryPipeline::spawn(
            Arc::clone(&store),
            "s1".to_string(),
            2,
            fast_config(),
            tx,
            CancellationToken::new(),
        );

        store.append_entry("s1", line("new")).unwrap();

        let batch = recv(&mut rx).await;
        assert_eq!(batch.logs.len(), 1);
        assert_eq!(batch.logs[0].data["line"], "new");
    }

    #[tokio::test]
    async fn test_end_entry_stops_pipeline() {
        let dir = tempdir().unwrap();
        let store = Arc::new(LogStore::new(dir.path()).unwrap());
        let (tx, mut rx) = mpsc::channel(8);

        let pipeline = DeliveryPipeline::spawn(
            Arc::clone(&store),
            "s1".to_string(),
            0,
            fast_config(),
            tx,
            CancellationToken::new(),
        );

        store.append_entry("s1", line("work")).unwrap();
        store
            .append_entry("s1", LogEntry::new("end", json!({ "exitCode": 0 })))
            .unwrap();

        let mut ended = false;
        while !ended {
            ended = recv(&mut rx).await.ended;
        }

        // The tailer task exits on its own after delivering the end entry
        timeout(Duration::from_secs(1), async {
            while !pipeline.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pipeline did not stop after end entry");

        // Later appends for the session go undelivered
        store.append_entry("s1", line("after end")).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_duplicates_under_rapid_writes() {
        let dir = tempdir().unwrap();
        let store = Arc::new(LogStore::new(dir.path()).unwrap());
        let (tx, mut rx) = mpsc::channel(64);

        let pipeline = DeliveryPipeline::spawn(
            Arc::clone(&store),
            "s1".to_string(),
            0,
            fast_config(),
            tx,
            CancellationToken::new(),
        );

        // Rapid writes exercise watch/poll overlap and debouncing
        for i in 0..50 {
            store.append_entry("s1", line(&format!("line {i}"))).unwrap();
        }

        let mut seen = Vec::new();
        while seen.len() < 50 {
            let batch = recv(&mut rx).await;
            seen.extend(batch.logs.into_iter().map(|e| e.data["line"].clone()));
        }

        let expected: Vec<serde_json::Value> =
            (0..50).map(|i| json!(format!("line {i}"))).collect();
        assert_eq!(seen, expected);

        pipeline.stop();
    }

    #[tokio::test]
    async fn test_cancellation_stops_delivery() {
        let dir = tempdir().unwrap();
        let store = Arc::new(LogStore::new(dir.path()).unwrap());
        let (tx, mut rx) = mpsc::channel(8);

        let cancel = CancellationToken::new();
        let pipeline = DeliveryPipeline::spawn(
            Arc::clone(&store),
            "s1".to_string(),
            0,
            fast_config(),
            tx,
            cancel.clone(),
        );

        store.append_entry("s1", line("before stop")).unwrap();
        let _ = recv(&mut rx).await;

        pipeline.stop();
        timeout(Duration::from_secs(1), async {
            while !pipeline.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pipeline did not stop after cancellation");

        store.append_entry("s1", line("after stop")).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_other_sessions_are_filtered_out() {
        let dir = tempdir().unwrap();
        let store = Arc::new(LogStore::new(dir.path()).unwrap());
        let (tx, mut rx) = mpsc::channel(8);

        let _pipeline = DeliveryPipeline::spawn(
            Arc::clone(&store),
            "s1".to_string(),
            0,
            fast_config(),
            tx,
            CancellationToken::new(),
        );

        store.append_entry("other", line("noise")).unwrap();
        store.append_entry("s1", line("mine")).unwrap();
        store.append_entry("other", line("more noise")).unwrap();

        let batch = recv(&mut rx).await;
        assert_eq!(batch.logs.len(), 1);
        assert_eq!(batch.logs[0].data["line"], "mine");
    }
}
