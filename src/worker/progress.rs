//! Progress events streamed to whoever is watching a run.
//!
//! The engine pushes immutable [`ProgressEvent`] values into a bounded
//! channel with `try_send`. A full or closed channel drops the event; the
//! engine never waits on the consumer.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Prefetch,
    StatusCheck,
    Download,
    Request,
    Fallback,
    RequestQueue,
    RetryQueue,
    Enrichment,
}

/// Per-item lifecycle state inside a queue run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Requesting,
    Waiting,
    Checking,
    Done,
    Failed,
    Stopped,
    Skipped,
}

impl TaskState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Requesting | Self::Waiting | Self::Checking)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Stopped | Self::Skipped)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressEvent {
    PhaseStart {
        phase: Phase,
        scope: String,
        total: usize,
        message: String,
    },
    PhaseProgress {
        phase: Phase,
        scope: String,
        completed: usize,
        total: usize,
    },
    PhaseComplete {
        phase: Phase,
        scope: String,
        succeeded: usize,
        failed: usize,
        message: String,
    },
    ItemStatus {
        id: i64,
        title: String,
        state: TaskState,
        detail: Option<String>,
    },
}

/// Non-blocking sender half of the progress stream.
pub struct ProgressSink {
    tx: Option<mpsc::Sender<ProgressEvent>>,
    disconnected: AtomicBool,
    dropped: AtomicU64,
}

impl ProgressSink {
    /// Create a sink and the receiver a display/forwarder drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx: Some(tx),
                disconnected: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            disconnected: AtomicBool::new(true),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn emit(&self, event: ProgressEvent) {
        if self.disconnected.load(Ordering::Relaxed) {
            return;
        }
        let Some(tx) = &self.tx else { return };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::debug!("Progress consumer went away, dropping further events");
                self.disconnected.store(true, Ordering::Relaxed);
            }
        }
    }

    /// Events discarded because the consumer was not keeping up.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn phase_start(&self, phase: Phase, scope: &str, total: usize, message: impl Into<String>) {
        self.emit(ProgressEvent::PhaseStart {
            phase,
            scope: scope.to_string(),
            total,
            message: message.into(),
        });
    }

    pub fn phase_progress(&self, phase: Phase, scope: &str, completed: usize, total: usize) {
        self.emit(ProgressEvent::PhaseProgress {
            phase,
            scope: scope.to_string(),
            completed,
            total,
        });
    }

    pub fn phase_complete(
        &self,
        phase: Phase,
        scope: &str,
        succeeded: usize,
        failed: usize,
        message: impl Into<String>,
    ) {
        self.emit(ProgressEvent::PhaseComplete {
            phase,
            scope: scope.to_string(),
            succeeded,
            failed,
            message: message.into(),
        });
    }

    pub fn item(&self, id: i64, title: &str, state: TaskState, detail: Option<String>) {
        self.emit(ProgressEvent::ItemStatus {
            id,
            title: title.to_string(),
            state,
            detail,
        });
    }
}
