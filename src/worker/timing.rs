//! Cancellable sleeps and latency statistics shared by the queues.

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How a cancellable sleep ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    Elapsed,
    Cancelled,
}

/// Sleep for `duration` unless `cancel` fires first. An already-cancelled
/// token resolves immediately as `Cancelled`.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> SleepOutcome {
    if cancel.is_cancelled() {
        return SleepOutcome::Cancelled;
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => SleepOutcome::Cancelled,
        _ = tokio::time::sleep(duration) => SleepOutcome::Elapsed,
    }
}

/// Summary of per-task elapsed times, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimingStats {
    pub count: usize,
    pub min_ms: u64,
    pub max_ms: u64,
    pub mean_ms: u64,
    pub median_ms: u64,
}

impl TimingStats {
    pub fn from_durations(durations: &[Duration]) -> Option<Self> {
        if durations.is_empty() {
            return None;
        }
        let mut ms: Vec<u64> = durations.iter().map(|d| d.as_millis() as u64).collect();
        ms.sort_unstable();
        let count = ms.len();
        let sum: u64 = ms.iter().sum();
        let median_ms = if count % 2 == 1 {
            ms[count / 2]
        } else {
            (ms[count / 2 - 1] + ms[count / 2]) / 2
        };
        Some(Self {
            count,
            min_ms: ms[0],
            max_ms: ms[count - 1],
            mean_ms: sum / count as u64,
            median_ms,
        })
    }
}

/// Elapsed-time tracker started at the first active state of a task.
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    started: Instant,
}

impl Stopwatch {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", d.as_secs_f64())
    }
}
