//! Stream Session
//!
//! Owns one SSE connection from admission to cleanup. Lifecycle is
//! CONNECTING -> CONNECTED -> CLOSING -> CLOSED, driven by a single task per
//! connection:
//!
//! 1. emit `connected`, read the backlog; when entries exist, emit `metadata`
//!    and the backlog `logs` frame (a session with nothing persisted yet gets
//!    neither, just the live tail)
//! 2. if the backlog already ends the session, emit `completed` and skip the
//!    pipeline entirely
//! 3. otherwise run a delivery pipeline and relay its batches as `logs`
//!    frames, emitting `completed` exactly once when the end entry arrives
//!
//! Termination has many triggers (client abort, session completion followed
//! by idle timeout, inactivity, server drain, targeted close) and they can
//! fire concurrently, so cleanup goes through a single latch: whoever flips
//! it first runs the full sequence, everyone else finds it already done.
//! Completion does NOT close the transport by itself; clients decide when to
//! go away, and the idle timer bounds how long a completed stream lingers.

use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::pipeline::{DeliveryPipeline, LogBatch};
use crate::registry::{ConnectionRegistry, ConnectionState};
use crate::shutdown::{ShutdownCoordinator, ShutdownSignal};
use crate::store::{LogEntry, LogStore};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ============================================================================
// Wire frames
// ============================================================================

/// Frames sent to the client, one JSON object per SSE `data:` line. The
/// `type` tag is part of the wire contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum StreamFrame {
    /// First frame on every stream
    Connected {
        session_id: String,
        connection_id: Uuid,
    },
    /// Session status snapshot, sent once after `connected`
    Metadata {
        status: String,
        exit_code: Option<i64>,
        created_at: Option<i64>,
        ended_at: Option<i64>,
    },
    /// One or more log entries in append order. `incremental` is set on live
    /// batches and absent on the backlog replay.
    Logs {
        logs: Vec<LogEntry>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        incremental: Option<bool>,
    },
    /// The session's end entry was observed. Sent at most once; the stream
    /// stays open afterwards.
    Completed { exit_code: Option<i64> },
    /// Server is draining; clients should reconnect after the given delay
    Shutdown {
        message: String,
        reconnect_delay_ms: u64,
    },
}

// ============================================================================
// Session state
// ============================================================================

/// State shared between the driver task and the response stream's drop guard.
struct SessionInner {
    connection_id: Uuid,
    session_id: String,
    cancel: CancellationToken,
    /// Cleanup latch. First flip wins; all other triggers become no-ops.
    cleaned: AtomicBool,
    registry: Arc<ConnectionRegistry>,
    coordinator: Arc<ShutdownCoordinator>,
}

impl SessionInner {
    /// Run the termination sequence exactly once, no matter how many triggers
    /// fire. Cancellation is synchronous, so by the time this returns no new
    /// batch will be handed to the frame channel; the registry release and
    /// inventory removal follow on a spawned task.
    fn begin_cleanup(self: &Arc<Self>) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.registry
            .set_state(self.connection_id, ConnectionState::Closing);

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.coordinator.untrack_stream(inner.connection_id);
            inner.registry.release(inner.connection_id).await;
            debug!(
                session_id = %inner.session_id,
                connection_id = %inner.connection_id,
                "stream cleanup complete"
            );
        });
    }
}

/// Detects client aborts: axum drops the response body when the peer goes
/// away, which drops this guard, which triggers cleanup.
struct CleanupGuard(Arc<SessionInner>);

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.0.begin_cleanup();
    }
}

/// The response side of a stream session: frames in delivery order, ending
/// when the driver stops. Dropping it (client abort) tears the session down.
pub struct FrameStream {
    frames: ReceiverStream<StreamFrame>,
    _guard: CleanupGuard,
}

impl Stream for FrameStream {
    type Item = StreamFrame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamFrame>> {
        Pin::new(&mut self.frames).poll_next(cx)
    }
}

/// An admitted, running stream session
pub struct StreamHandle {
    pub connection_id: Uuid,
    pub frames: FrameStream,
}

pub struct StreamSession;

impl StreamSession {
    /// Admit and start a stream for `session_id`.
    ///
    /// Fails only with `AdmissionDenied`; everything after admission
    /// (including a missing backlog) is reported in-band through frames.
    pub async fn open(
        store: Arc<LogStore>,
        registry: Arc<ConnectionRegistry>,
        coordinator: Arc<ShutdownCoordinator>,
        config: StreamConfig,
        session_id: &str,
    ) -> Result<StreamHandle> {
        let connection_id = registry.acquire(session_id).await?;

        // Subscribe before the driver starts so a drain broadcast between
        // admission and the first poll cannot be missed.
        let shutdown_rx = coordinator.subscribe();
        coordinator.track_stream(connection_id);

        let inner = Arc::new(SessionInner {
            connection_id,
            session_id: session_id.to_string(),
            cancel: CancellationToken::new(),
            cleaned: AtomicBool::new(false),
            registry,
            coordinator,
        });

        let (frame_tx, frame_rx) = mpsc::channel(32);
        tokio::spawn(run(
            Arc::clone(&inner),
            store,
            config,
            frame_tx,
            shutdown_rx,
        ));

        info!(session_id, %connection_id, "stream session opened");
        Ok(StreamHandle {
            connection_id,
            frames: FrameStream {
                frames: ReceiverStream::new(frame_rx),
                _guard: CleanupGuard(inner),
            },
        })
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Send one frame; false means the client side is gone.
async fn emit(frames: &mpsc::Sender<StreamFrame>, frame: StreamFrame) -> bool {
    frames.send(frame).await.is_ok()
}

async fn recv_batch(rx: &mut Option<mpsc::Receiver<LogBatch>>) -> Option<LogBatch> {
    match rx.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn run(
    inner: Arc<SessionInner>,
    store: Arc<LogStore>,
    config: StreamConfig,
    frames: mpsc::Sender<StreamFrame>,
    mut shutdown_rx: broadcast::Receiver<ShutdownSignal>,
) {
    let session_id = inner.session_id.clone();
    let connection_id = inner.connection_id;
    let cancel = inner.cancel.clone();

    if !emit(
        &frames,
        StreamFrame::Connected {
            session_id: session_id.clone(),
            connection_id,
        },
    )
    .await
    {
        inner.begin_cleanup();
        return;
    }

    // Backlog phase. A session with no persisted entries yet is a normal
    // live-tail start, not an error — it gets no metadata frame, just the
    // tail from offset zero.
    let (backlog, metadata) = match store.read_session(&session_id) {
        Ok(snap) => (snap.logs, Some(snap.metadata)),
        Err(StreamError::SessionNotFound(_)) => {
            debug!(session_id, "no persisted entries; tailing from empty backlog");
            (Vec::new(), None)
        }
        Err(err) => {
            warn!(session_id, %err, "backlog read failed; starting from empty");
            (Vec::new(), None)
        }
    };

    let already_completed = metadata
        .as_ref()
        .is_some_and(|m| m.status == "completed");
    let backlog_exit = metadata.as_ref().and_then(|m| m.exit_code);
    let cursor = backlog.len();

    if let Some(metadata) = metadata {
        if !emit(
            &frames,
            StreamFrame::Metadata {
                status: metadata.status,
                exit_code: metadata.exit_code,
                created_at: metadata.created_at,
                ended_at: metadata.ended_at,
            },
        )
        .await
        {
            inner.begin_cleanup();
            return;
        }
    }
    if !backlog.is_empty()
        && !emit(
            &frames,
            StreamFrame::Logs {
                logs: backlog,
                incremental: None,
            },
        )
        .await
    {
        inner.begin_cleanup();
        return;
    }

    inner
        .registry
        .set_state(connection_id, ConnectionState::Connected);

    // A session that ended before we connected gets its completed frame from
    // the backlog; there is nothing left to tail.
    let mut batch_rx: Option<mpsc::Receiver<LogBatch>> = None;
    let mut _pipeline: Option<DeliveryPipeline> = None;
    if already_completed {
        debug!(session_id, "session already ended; skipping delivery pipeline");
        if !emit(
            &frames,
            StreamFrame::Completed {
                exit_code: backlog_exit,
            },
        )
        .await
        {
            inner.begin_cleanup();
            return;
        }
    } else {
        let (batch_tx, rx) = mpsc::channel(32);
        _pipeline = Some(DeliveryPipeline::spawn(
            Arc::clone(&store),
            session_id.clone(),
            cursor,
            config.delivery.clone(),
            batch_tx,
            cancel.child_token(),
        ));
        batch_rx = Some(rx);
    }

    let inactivity = sleep(config.session.inactivity_timeout());
    tokio::pin!(inactivity);
    let mut shutdown_open = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            batch = recv_batch(&mut batch_rx) => {
                let Some(batch) = batch else {
                    // Pipeline task gone; the stream stays open for the
                    // client until another trigger fires.
                    batch_rx = None;
                    continue;
                };
                inner.registry.touch(connection_id);
                inactivity
                    .as_mut()
                    .reset(Instant::now() + config.session.inactivity_timeout());

                let ended = batch.ended;
                let exit_code = batch
                    .logs
                    .iter()
                    .rev()
                    .find(|e| e.is_end())
                    .and_then(LogEntry::exit_code);
                if !emit(
                    &frames,
                    StreamFrame::Logs {
                        logs: batch.logs,
                        incremental: Some(true),
                    },
                )
                .await
                {
                    break;
                }
                if ended {
                    batch_rx = None;
                    info!(session_id, %connection_id, ?exit_code, "session completed");
                    // Re-fetch so the final metadata frame reflects the end
                    // entry the client just received
                    if let Ok(snap) = store.read_session(&session_id) {
                        if !emit(
                            &frames,
                            StreamFrame::Metadata {
                                status: snap.metadata.status,
                                exit_code: snap.metadata.exit_code,
                                created_at: snap.metadata.created_at,
                                ended_at: snap.metadata.ended_at,
                            },
                        )
                        .await
                        {
                            break;
                        }
                    }
                    if !emit(&frames, StreamFrame::Completed { exit_code }).await {
                        break;
                    }
                }
            }

            signal = shutdown_rx.recv(), if shutdown_open => {
                match signal {
                    Ok(ShutdownSignal::DrainAll { message, reconnect_delay_ms }) => {
                        info!(session_id, %connection_id, "drain received; advising client");
                        let _ = emit(
                            &frames,
                            StreamFrame::Shutdown { message, reconnect_delay_ms },
                        )
                        .await;
                        // Grace period lets the advisory flush before close
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            _ = sleep(config.session.shutdown_grace()) => {}
                        }
                        break;
                    }
                    Ok(ShutdownSignal::CloseStream(id)) if id == connection_id => {
                        info!(session_id, %connection_id, "targeted close received");
                        break;
                    }
                    Ok(ShutdownSignal::CloseStream(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(session_id, skipped, "shutdown signals lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        shutdown_open = false;
                    }
                }
            }

            _ = &mut inactivity => {
                info!(session_id, %connection_id, "closing idle stream");
                break;
            }
        }
    }

    inner.begin_cleanup();
}
