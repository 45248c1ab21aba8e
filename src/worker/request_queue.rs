//! Per-episode request and poll state machine.
//!
//! ```text
//! queued -> requesting -> waiting -> checking -> done | failed | stopped
//!                            ^          |
//!                            +----------+   (retry mode enters at checking)
//! ```
//!
//! Only the first step of a task (status lookup plus request or reset, or
//! the first check in retry mode) holds one of the `concurrency` slots.
//! After that each task sleeps and polls on its own schedule, so any number
//! of tasks can be waiting at once.

use super::progress::{Phase, ProgressSink, TaskState};
use super::timing::{format_duration, sleep_or_cancel, SleepOutcome, Stopwatch, TimingStats};
use crate::config::EngineConfig;
use crate::database::{Database, Episode, SourceStatus, StatusUpdate, TranscriptOrigin};
use crate::source::{Credential, SourceError, StatusInfo, TranscriptPayload, TranscriptSource};
use futures_util::FutureExt;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    /// Ask the service to transcribe episodes it has not started.
    Request,
    /// Resume polling episodes already triggered upstream.
    Retry,
}

impl QueueMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Retry => "retry",
        }
    }

    fn phase(&self) -> Phase {
        match self {
            Self::Request => Phase::RequestQueue,
            Self::Retry => Phase::RetryQueue,
        }
    }

    fn entry_state(&self) -> TaskState {
        match self {
            Self::Request => TaskState::Requesting,
            Self::Retry => TaskState::Checking,
        }
    }
}

impl std::fmt::Display for QueueMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub concurrency: usize,
    pub stagger: Duration,
    pub check_delay: Duration,
    pub retry_delay: Duration,
    pub max_check_retries: u32,
}

impl QueueOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            stagger: config.stagger(),
            check_delay: config.check_delay(),
            retry_delay: config.retry_delay(),
            max_check_retries: config.max_check_retries,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueResult {
    pub total: usize,
    pub requested: usize,
    pub reset: usize,
    pub downloaded: usize,
    pub failed: usize,
    /// Pending or mid-poll when the run stopped. Not failures.
    pub still_processing: usize,
    pub errors: Vec<String>,
    /// Latency over tasks that finished with a transcript.
    pub timing: Option<TimingStats>,
    /// The service rejected the credential and the run was cut short.
    pub aborted: bool,
}

impl QueueResult {
    pub fn summary(&self) -> String {
        format!(
            "{} total, {} requested, {} reset, {} downloaded, {} failed, {} still processing",
            self.total, self.requested, self.reset, self.downloaded, self.failed, self.still_processing
        )
    }
}

struct QueueTask {
    episode: Episode,
    item_id: i64,
    checks: u32,
    waits: u32,
    stopwatch: Stopwatch,
}

enum Step {
    Finish(Finish),
    Poll,
}

enum Finish {
    Done,
    /// `None` when the error was already recorded (fatal auth).
    Failed(Option<String>),
    Stopped,
}

enum Check {
    Ready(TranscriptPayload),
    /// `done` upstream but nothing to download.
    Bogus,
    NotReady(String),
}

#[derive(Default)]
struct Tracker {
    pending: VecDeque<QueueTask>,
    active: HashMap<i64, TaskState>,
    requesting: usize,
    waiting: usize,
    checking: usize,
    result: QueueResult,
    durations: Vec<Duration>,
}

impl Tracker {
    fn is_drained(&self) -> bool {
        self.pending.is_empty() && self.requesting == 0 && self.waiting == 0 && self.checking == 0
    }

    fn counter(&mut self, state: TaskState) -> Option<&mut usize> {
        match state {
            TaskState::Requesting => Some(&mut self.requesting),
            TaskState::Waiting => Some(&mut self.waiting),
            TaskState::Checking => Some(&mut self.checking),
            _ => None,
        }
    }

    /// Move task `id` to `to` and report whether the queue is now drained.
    fn transition(&mut self, id: i64, to: TaskState) -> bool {
        let from = if to.is_terminal() {
            self.active.remove(&id)
        } else {
            self.active.insert(id, to)
        };
        if let Some(c) = from.and_then(|s| self.counter(s)) {
            *c = c.saturating_sub(1);
        }
        if let Some(c) = self.counter(to) {
            *c += 1;
        }
        self.is_drained()
    }
}

struct Shared {
    db: Arc<Database>,
    source: Arc<dyn TranscriptSource>,
    credential: Option<Credential>,
    options: QueueOptions,
    mode: QueueMode,
    progress: Arc<ProgressSink>,
    cancel: CancellationToken,
    tracker: Mutex<Tracker>,
    drained: Notify,
}

pub struct TranscriptRequestQueue {
    db: Arc<Database>,
    source: Arc<dyn TranscriptSource>,
    credential: Option<Credential>,
    options: QueueOptions,
    progress: Arc<ProgressSink>,
    cancel: CancellationToken,
}

impl TranscriptRequestQueue {
    pub fn new(
        db: Arc<Database>,
        source: Arc<dyn TranscriptSource>,
        credential: Option<Credential>,
        options: QueueOptions,
    ) -> Self {
        Self {
            db,
            source,
            credential,
            options,
            progress: Arc::new(ProgressSink::disabled()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: Arc<ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Stop signal for the run. The queue derives a child token, so a fatal
    /// auth abort does not cancel the caller's token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn run(&self, episodes: Vec<Episode>, mode: QueueMode) -> QueueResult {
        let (pending, result) = self.prepare(episodes);
        let enqueued = pending.len();

        let shared = Arc::new(Shared {
            db: self.db.clone(),
            source: self.source.clone(),
            credential: self.credential.clone(),
            options: self.options.clone(),
            mode,
            progress: self.progress.clone(),
            cancel: self.cancel.child_token(),
            tracker: Mutex::new(Tracker {
                pending,
                result,
                ..Default::default()
            }),
            drained: Notify::new(),
        });

        log::info!(
            "Starting {} queue: {} episodes (concurrency {})",
            mode,
            enqueued,
            self.options.concurrency
        );
        self.progress
            .phase_start(mode.phase(), mode.as_str(), enqueued, format!("{} episodes queued", enqueued));
        let queued: Vec<(i64, String)> = shared
            .tracker()
            .pending
            .iter()
            .map(|task| (task.episode.id, task.episode.title.clone()))
            .collect();
        for (id, title) in &queued {
            self.progress.item(*id, title, TaskState::Queued, None);
        }

        let concurrency = self.options.concurrency.max(1);
        let slots = Arc::new(Semaphore::new(concurrency));
        let mut tasks = JoinSet::new();
        let mut dispatched = 0usize;

        loop {
            let permit: OwnedSemaphorePermit = tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            let nothing_left = shared.tracker().pending.is_empty();
            if nothing_left {
                break;
            }
            if dispatched >= concurrency
                && !self.options.stagger.is_zero()
                && sleep_or_cancel(self.options.stagger, &shared.cancel).await == SleepOutcome::Cancelled
            {
                break;
            }
            let Some(task) = shared.dequeue() else { break };
            dispatched += 1;

            let id = task.episode.id;
            let title = task.episode.title.clone();
            let stopwatch = task.stopwatch;
            let worker = shared.clone();
            tasks.spawn(async move {
                let outcome = AssertUnwindSafe(worker.clone().drive(task, permit))
                    .catch_unwind()
                    .await;
                if outcome.is_err() {
                    log::error!("Queue task for \"{}\" panicked", title);
                    worker.finish(
                        id,
                        &title,
                        stopwatch.elapsed(),
                        Finish::Failed(Some(format!("\"{}\": task panicked", title))),
                    );
                }
            });
        }

        let abandoned = shared.abandon_pending();
        if abandoned > 0 {
            log::info!("{} queue stopped with {} episodes never started", mode, abandoned);
        }

        shared.wait_drained().await;
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                log::error!("Queue task join error: {}", e);
            }
        }

        let result = {
            let mut guard = shared.tracker();
            let tracker = &mut *guard;
            tracker.result.timing = TimingStats::from_durations(&tracker.durations);
            std::mem::take(&mut tracker.result)
        };

        debug_assert_eq!(
            result.downloaded + result.failed + result.still_processing,
            result.total
        );
        log::info!("{} queue finished: {}", mode, result.summary());
        if let Some(timing) = &result.timing {
            log::info!(
                "{} queue timing: min {}ms, median {}ms, mean {}ms, max {}ms over {} transcripts",
                mode,
                timing.min_ms,
                timing.median_ms,
                timing.mean_ms,
                timing.max_ms,
                timing.count
            );
        }
        self.progress.phase_complete(
            mode.phase(),
            mode.as_str(),
            result.downloaded,
            result.failed,
            result.summary(),
        );
        result
    }

    /// Drop duplicates and episodes that must never be queued. Episodes
    /// without a catalog item id fail up front.
    fn prepare(&self, episodes: Vec<Episode>) -> (VecDeque<QueueTask>, QueueResult) {
        let mut seen = HashSet::new();
        let mut pending = VecDeque::new();
        let mut result = QueueResult::default();

        for episode in episodes {
            if !seen.insert(episode.id) {
                log::debug!("Skipping duplicate queue entry for {}", episode.label());
                continue;
            }
            if episode.has_transcript() || episode.exclusion_tag.is_some() {
                log::debug!("Not queueing {}: already transcribed or excluded", episode.label());
                continue;
            }
            result.total += 1;
            let Some(item_id) = episode.source_item_id else {
                result.failed += 1;
                result
                    .errors
                    .push(format!("{}: no catalog item id, cannot request transcript", episode.label()));
                continue;
            };
            pending.push_back(QueueTask {
                episode,
                item_id,
                checks: 0,
                waits: 0,
                stopwatch: Stopwatch::start(),
            });
        }

        (pending, result)
    }
}

impl Shared {
    fn tracker(&self) -> MutexGuard<'_, Tracker> {
        self.tracker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn dequeue(&self) -> Option<QueueTask> {
        let state = self.mode.entry_state();
        let mut task = {
            let mut tracker = self.tracker();
            let task = tracker.pending.pop_front()?;
            tracker.transition(task.episode.id, state);
            task
        };
        task.stopwatch = Stopwatch::start();
        self.progress.item(task.episode.id, &task.episode.title, state, None);
        Some(task)
    }

    fn set_state(&self, task: &QueueTask, state: TaskState, detail: Option<String>) {
        self.tracker().transition(task.episode.id, state);
        self.progress.item(task.episode.id, &task.episode.title, state, detail);
    }

    fn finish(&self, id: i64, title: &str, elapsed: Duration, finish: Finish) {
        let (state, detail) = match &finish {
            Finish::Done => (TaskState::Done, None),
            Finish::Failed(err) => (TaskState::Failed, err.clone()),
            Finish::Stopped => (TaskState::Stopped, None),
        };
        let (drained, completed, total) = {
            let mut tracker = self.tracker();
            match finish {
                Finish::Done => {
                    tracker.result.downloaded += 1;
                    tracker.durations.push(elapsed);
                }
                Finish::Failed(err) => {
                    tracker.result.failed += 1;
                    if let Some(err) = err {
                        log::warn!("{}", err);
                        tracker.result.errors.push(err);
                    }
                }
                Finish::Stopped => tracker.result.still_processing += 1,
            }
            let drained = tracker.transition(id, state);
            let r = &tracker.result;
            (drained, r.downloaded + r.failed + r.still_processing, r.total)
        };

        self.progress.item(id, title, state, detail);
        self.progress
            .phase_progress(self.mode.phase(), self.mode.as_str(), completed, total);
        if drained {
            self.drained.notify_waiters();
        }
    }

    /// Reclassify never-started tasks as still processing.
    fn abandon_pending(&self) -> usize {
        let (abandoned, drained) = {
            let mut tracker = self.tracker();
            let abandoned: Vec<QueueTask> = tracker.pending.drain(..).collect();
            tracker.result.still_processing += abandoned.len();
            (abandoned, tracker.is_drained())
        };
        for task in &abandoned {
            self.progress
                .item(task.episode.id, &task.episode.title, TaskState::Stopped, None);
        }
        if drained {
            self.drained.notify_waiters();
        }
        abandoned.len()
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            let drained = self.tracker().is_drained();
            if drained {
                return;
            }
            notified.await;
        }
    }

    async fn drive(self: Arc<Self>, mut task: QueueTask, permit: OwnedSemaphorePermit) {
        let first = match self.mode {
            QueueMode::Request => self.initiate(&task).await,
            QueueMode::Retry => self.first_check(&mut task).await,
        };
        drop(permit);

        let finish = match first {
            Step::Finish(finish) => finish,
            Step::Poll => self.poll(&mut task).await,
        };
        self.finish(task.episode.id, &task.episode.title, task.stopwatch.elapsed(), finish);
    }

    /// Request mode entry: look at the live status, then act on it.
    async fn initiate(&self, task: &QueueTask) -> Step {
        let status = match self.source.fetch_status(task.item_id).await {
            Ok(status) => {
                self.cache_status(task, &status);
                status
            }
            Err(e) => {
                log::warn!(
                    "Status lookup failed for {}, using cached status: {}",
                    task.episode.label(),
                    e
                );
                StatusInfo {
                    status: task.episode.source_status.unwrap_or(SourceStatus::NotStarted),
                    transcription_id: task.episode.transcription_id.clone(),
                }
            }
        };

        match status.status {
            SourceStatus::Done => match self.classify(task, status).await {
                Check::Ready(payload) => Step::Finish(self.persist(task, payload)),
                Check::Bogus => self.reset(task).await,
                Check::NotReady(_) => Step::Poll,
            },
            s if s.is_in_flight() => Step::Poll,
            _ => self.request(task).await,
        }
    }

    /// Retry mode entry: one immediate check. Anything unresolved goes
    /// back to polling, never to a new request.
    async fn first_check(&self, task: &mut QueueTask) -> Step {
        task.checks += 1;
        match self.check_once(task).await {
            Check::Ready(payload) => Step::Finish(self.persist(task, payload)),
            Check::Bogus => self.reset(task).await,
            Check::NotReady(_) => Step::Poll,
        }
    }

    async fn poll(&self, task: &mut QueueTask) -> Finish {
        let max_checks = self.options.max_check_retries + 1;
        let mut last = String::from("not ready");

        loop {
            if task.checks >= max_checks {
                return Finish::Failed(Some(format!(
                    "{}: timed out after {} status checks (last: {})",
                    task.episode.label(),
                    task.checks,
                    last
                )));
            }

            let delay = if task.waits == 0 {
                self.options.check_delay
            } else {
                self.options.retry_delay
            };
            self.set_state(
                task,
                TaskState::Waiting,
                Some(format!(
                    "check {}/{} in {}",
                    task.checks + 1,
                    max_checks,
                    format_duration(delay)
                )),
            );
            if sleep_or_cancel(delay, &self.cancel).await == SleepOutcome::Cancelled {
                return Finish::Stopped;
            }
            task.waits += 1;

            self.set_state(task, TaskState::Checking, None);
            task.checks += 1;
            match self.check_once(task).await {
                Check::Ready(payload) => return self.persist(task, payload),
                Check::Bogus => last = "done without transcript".to_string(),
                Check::NotReady(detail) => last = detail,
            }

            // A stop that landed mid-check leaves the task unresolved
            if self.cancel.is_cancelled() {
                return Finish::Stopped;
            }
        }
    }

    /// One status poll. Transport errors count as "not ready yet".
    async fn check_once(&self, task: &QueueTask) -> Check {
        match self.source.fetch_status(task.item_id).await {
            Ok(status) => {
                self.cache_status(task, &status);
                self.classify(task, status).await
            }
            Err(e) => {
                log::debug!("Status check failed for {}: {}", task.episode.label(), e);
                Check::NotReady(format!("status check failed: {}", e))
            }
        }
    }

    async fn classify(&self, task: &QueueTask, status: StatusInfo) -> Check {
        if status.status != SourceStatus::Done {
            return Check::NotReady(status.status.to_string());
        }
        let Some(transcription_id) = status.transcription_id.as_deref() else {
            return Check::Bogus;
        };
        match self.source.fetch_text(task.item_id, transcription_id).await {
            Ok(Some(payload)) if !payload.is_empty() => Check::Ready(payload),
            Ok(_) => {
                log::info!("Service reports {} done but has no transcript", task.episode.label());
                Check::Bogus
            }
            Err(e) => Check::NotReady(format!("transcript download failed: {}", e)),
        }
    }

    async fn request(&self, task: &QueueTask) -> Step {
        let label = task.episode.label();
        let Some(credential) = &self.credential else {
            return Step::Finish(Finish::Failed(Some(format!(
                "{}: no service credential configured, cannot request",
                label
            ))));
        };

        // A sibling's auth failure may have landed while this task looked up its status
        if self.cancel.is_cancelled() {
            return Step::Finish(Finish::Stopped);
        }

        match self.source.request_transcription(task.item_id, credential).await {
            Ok(outcome) => {
                self.cache_requested(task);
                if outcome.success {
                    self.tracker().result.requested += 1;
                    log::info!("Requested transcript for {}", label);
                    Step::Poll
                } else {
                    Step::Finish(Finish::Failed(Some(format!(
                        "{}: request refused: {}",
                        label,
                        outcome.error.unwrap_or_default()
                    ))))
                }
            }
            Err(e) if e.is_unauthorized() => self.abort_for_auth(&e),
            Err(e) => Step::Finish(Finish::Failed(Some(format!("{}: request failed: {}", label, e)))),
        }
    }

    async fn reset(&self, task: &QueueTask) -> Step {
        let label = task.episode.label();
        let Some(credential) = &self.credential else {
            return Step::Finish(Finish::Failed(Some(format!(
                "{}: reset needed but no service credential configured",
                label
            ))));
        };
        let Some(user_id) = credential.user_id.as_deref() else {
            return Step::Finish(Finish::Failed(Some(format!(
                "{}: reset needed but no user identifier is available",
                label
            ))));
        };

        if self.cancel.is_cancelled() {
            return Step::Finish(Finish::Stopped);
        }

        self.set_state(task, TaskState::Requesting, Some("reset".to_string()));
        match self
            .source
            .reset_transcription(task.item_id, credential, user_id)
            .await
        {
            Ok(outcome) => {
                self.cache_requested(task);
                if outcome.success {
                    self.tracker().result.reset += 1;
                    log::info!("Reset transcript for {}", label);
                    Step::Poll
                } else {
                    Step::Finish(Finish::Failed(Some(format!(
                        "{}: reset refused: {}",
                        label,
                        outcome.error.unwrap_or_default()
                    ))))
                }
            }
            Err(e) if e.is_unauthorized() => self.abort_for_auth(&e),
            Err(e) => Step::Finish(Finish::Failed(Some(format!("{}: reset failed: {}", label, e)))),
        }
    }

    /// A rejected credential is invalid for every item, so the whole run
    /// stops. The error is recorded once.
    fn abort_for_auth(&self, err: &SourceError) -> Step {
        let first = {
            let mut tracker = self.tracker();
            let first = !tracker.result.aborted;
            if first {
                tracker.result.aborted = true;
                tracker.result.errors.push(format!(
                    "Transcription service rejected the credential, queue aborted: {}",
                    err
                ));
            }
            first
        };
        if first {
            log::error!("Authentication failed, aborting {} queue: {}", self.mode, err);
            self.cancel.cancel();
        }
        Step::Finish(Finish::Failed(None))
    }

    fn persist(&self, task: &QueueTask, payload: TranscriptPayload) -> Finish {
        let ep = &task.episode;
        let words = (!payload.words.is_empty()).then_some(payload.words.as_slice());
        match self
            .db
            .set_transcript(&ep.source_id, &ep.guid, &payload.text, TranscriptOrigin::Service, words)
        {
            Ok(_) => {
                log::info!(
                    "Saved transcript for {} ({} chars, {} words)",
                    ep.label(),
                    payload.text.len(),
                    payload.words.len()
                );
                Finish::Done
            }
            Err(e) => Finish::Failed(Some(format!("{}: failed to save transcript: {}", ep.label(), e))),
        }
    }

    fn cache_status(&self, task: &QueueTask, status: &StatusInfo) {
        let update = StatusUpdate::for_episode(&task.episode, status.status, status.transcription_id.clone());
        if let Err(e) = self.db.set_statuses(&[update]) {
            log::warn!("Failed to cache status for {}: {}", task.episode.label(), e);
        }
    }

    fn cache_requested(&self, task: &QueueTask) {
        self.cache_status(task, &StatusInfo::new(SourceStatus::Requested, None));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::mock::{MockAction, MockSource};
    use crate::worker::progress::ProgressEvent;
    use crate::worker::test_support::{seed, temp_db};
    use tokio::time::Instant;

    fn options(concurrency: usize) -> QueueOptions {
        QueueOptions {
            concurrency,
            stagger: Duration::ZERO,
            check_delay: Duration::from_secs(240),
            retry_delay: Duration::from_secs(120),
            max_check_retries: 15,
        }
    }

    fn credential() -> Option<Credential> {
        Some(Credential::new("token", Some("user-1".into())))
    }

    fn assert_accounted(result: &QueueResult) {
        assert_eq!(
            result.downloaded + result.failed + result.still_processing,
            result.total,
            "{:?}",
            result
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_retries_exact_check_count() {
        let (_dir, db) = temp_db();
        let episodes = seed(&db, &[("slow", "Slow Episode", Some(7))]);
        let source = Arc::new(MockSource::new().with_status(7, SourceStatus::Running, None));

        let queue = TranscriptRequestQueue::new(db, source.clone(), credential(), options(5));
        let result = queue.run(episodes, QueueMode::Retry).await;

        assert_eq!(source.status_calls(7), 16);
        assert_eq!(result.failed, 1);
        assert_eq!(result.downloaded, 0);
        assert!(result.errors[0].contains("timed out after 16 status checks"));
        assert!(result.timing.is_none());
        assert_accounted(&result);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_then_poll_until_done() {
        let (_dir, db) = temp_db();
        let episodes = seed(&db, &[("new", "New Episode", Some(1))]);
        let source = Arc::new(
            MockSource::new()
                .with_statuses(
                    1,
                    vec![
                        StatusInfo::new(SourceStatus::NotStarted, None),
                        StatusInfo::new(SourceStatus::Running, None),
                        StatusInfo::new(SourceStatus::Done, Some("t1")),
                    ],
                )
                .with_text(1, "t1", "hello from the service"),
        );

        let queue = TranscriptRequestQueue::new(db.clone(), source.clone(), credential(), options(5));
        let start = Instant::now();
        let result = queue.run(episodes, QueueMode::Request).await;

        assert_eq!(result.requested, 1);
        assert_eq!(result.downloaded, 1);
        assert!(result.errors.is_empty(), "{:?}", result.errors);
        assert_eq!(source.request_calls(), vec![1]);
        assert_eq!(result.timing.as_ref().map(|t| t.count), Some(1));
        // one check delay then one retry delay
        assert!(start.elapsed() >= Duration::from_secs(360));

        let stored = db.get_episode("main", "new").unwrap().unwrap();
        assert_eq!(stored.transcript_text.as_deref(), Some("hello from the service"));
        assert!(stored.has_transcript_data);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bogus_done_is_reset_not_failed() {
        let (_dir, db) = temp_db();
        let episodes = seed(&db, &[("bogus", "Bogus Episode", Some(3))]);
        let source = Arc::new(
            MockSource::new()
                .with_statuses(
                    3,
                    vec![
                        StatusInfo::new(SourceStatus::Done, Some("stale")),
                        StatusInfo::new(SourceStatus::Running, None),
                        StatusInfo::new(SourceStatus::Done, Some("fresh")),
                    ],
                )
                .with_text(3, "fresh", "second time lucky"),
        );

        let queue = TranscriptRequestQueue::new(db.clone(), source.clone(), credential(), options(5));
        let result = queue.run(episodes, QueueMode::Retry).await;

        assert_eq!(source.reset_calls(), vec![(3, "user-1".to_string())]);
        assert_eq!(result.reset, 1);
        assert_eq!(result.downloaded, 1);
        assert_eq!(result.failed, 0);
        assert!(source.request_calls().is_empty());
        assert_accounted(&result);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_without_user_id_fails_item() {
        let (_dir, db) = temp_db();
        let episodes = seed(&db, &[("bogus", "Bogus Episode", Some(3))]);
        let source = Arc::new(MockSource::new().with_status(3, SourceStatus::Done, Some("stale")));

        let queue = TranscriptRequestQueue::new(
            db,
            source.clone(),
            Some(Credential::new("opaque-key", None)),
            options(5),
        );
        let result = queue.run(episodes, QueueMode::Retry).await;

        assert_eq!(result.failed, 1);
        assert!(result.errors[0].contains("no user identifier"));
        assert!(source.reset_calls().is_empty());
        assert_eq!(source.status_calls(3), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_request_aborts_whole_run() {
        let (_dir, db) = temp_db();
        let episodes = seed(
            &db,
            &[("a", "A", Some(1)), ("b", "B", Some(2)), ("c", "C", Some(3))],
        );
        let source = Arc::new(
            MockSource::new()
                .with_status(1, SourceStatus::NotStarted, None)
                .with_status(2, SourceStatus::NotStarted, None)
                .with_status(3, SourceStatus::NotStarted, None)
                .with_request(2, MockAction::Unauthorized),
        );

        let queue = TranscriptRequestQueue::new(db.clone(), source.clone(), credential(), options(1));
        let result = queue.run(episodes, QueueMode::Request).await;

        assert!(result.aborted);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("rejected the credential"));
        assert_eq!(source.request_calls(), vec![1, 2]);
        assert_eq!(result.requested, 1);
        assert_eq!(result.failed, 1);
        // "a" was waiting, "c" never started
        assert_eq!(result.still_processing, 2);
        assert_accounted(&result);

        let a = db.get_episode("main", "a").unwrap().unwrap();
        assert_eq!(a.source_status, Some(SourceStatus::Requested));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_counts_pending_and_waiting_as_still_processing() {
        let (_dir, db) = temp_db();
        let episodes = seed(
            &db,
            &[
                ("a", "A", Some(1)),
                ("b", "B", Some(2)),
                ("c", "C", Some(3)),
                ("d", "D", Some(4)),
                ("e", "E", Some(5)),
            ],
        );
        let mut source = MockSource::new();
        for id in 1..=5 {
            source = source.with_status(id, SourceStatus::Running, None);
        }
        let source = Arc::new(source);

        let mut opts = options(2);
        opts.stagger = Duration::from_secs(100);
        let cancel = CancellationToken::new();
        let queue = TranscriptRequestQueue::new(db, source.clone(), None, opts).with_cancel(cancel.clone());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            trigger.cancel();
        });
        let result = queue.run(episodes, QueueMode::Request).await;

        // 2 waiting + 3 never dequeued
        assert_eq!(result.total, 5);
        assert_eq!(result.still_processing, 5);
        assert_eq!(result.failed, 0);
        assert!(result.errors.is_empty());
        assert_eq!(source.status_calls(3), 0);
        assert_accounted(&result);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_does_not_hold_slots() {
        let (_dir, db) = temp_db();
        let rows: Vec<(String, String)> = (1..=6).map(|i| (format!("g{}", i), format!("Ep {}", i))).collect();
        let row_refs: Vec<(&str, &str, Option<i64>)> = rows
            .iter()
            .enumerate()
            .map(|(i, (g, t))| (g.as_str(), t.as_str(), Some(i as i64 + 1)))
            .collect();
        let episodes = seed(&db, &row_refs);

        let mut source = MockSource::new();
        for id in 1..=6 {
            source = source
                .with_statuses(
                    id,
                    vec![
                        StatusInfo::new(SourceStatus::Running, None),
                        StatusInfo::new(SourceStatus::Done, Some("t")),
                    ],
                )
                .with_text(id, "t", "text");
        }

        let queue = TranscriptRequestQueue::new(db, Arc::new(source), None, options(2));
        let start = Instant::now();
        let result = queue.run(episodes, QueueMode::Retry).await;

        assert_eq!(result.downloaded, 6);
        // All six wait out the same check delay together
        assert!(start.elapsed() < Duration::from_secs(300), "{:?}", start.elapsed());
        assert_eq!(result.timing.as_ref().map(|t| t.count), Some(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_one_task_per_episode() {
        let (_dir, db) = temp_db();
        let episodes = seed(&db, &[("a", "A", Some(1)), ("b", "B", Some(2))]);
        let doubled = vec![episodes[0].clone(), episodes[1].clone(), episodes[0].clone()];
        let source = Arc::new(
            MockSource::new()
                .with_status(1, SourceStatus::Done, Some("t1"))
                .with_text(1, "t1", "one")
                .with_status(2, SourceStatus::Done, Some("t2"))
                .with_text(2, "t2", "two"),
        );

        let queue = TranscriptRequestQueue::new(db, source.clone(), None, options(4));
        let result = queue.run(doubled, QueueMode::Retry).await;

        assert_eq!(result.total, 2);
        assert_eq!(result.downloaded, 2);
        assert_eq!(source.status_calls(1), 1);
        assert_eq!(source.peak_calls_per_item(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_filters_transcribed_excluded_and_missing_item_id() {
        let (_dir, db) = temp_db();
        seed(
            &db,
            &[
                ("done", "Done", Some(1)),
                ("promo", "Promo", Some(2)),
                ("orphan", "Orphan", None),
            ],
        );
        db.set_transcript("main", "done", "existing", TranscriptOrigin::Service, None)
            .unwrap();
        db.set_exclusion_tag("main", "promo", Some("promo")).unwrap();
        let episodes = db.get_episodes_for_source("main").unwrap();
        let source = Arc::new(MockSource::new());

        let queue = TranscriptRequestQueue::new(db, source.clone(), credential(), options(2));
        let result = queue.run(episodes, QueueMode::Request).await;

        assert_eq!(result.total, 1);
        assert_eq!(result.failed, 1);
        assert!(result.errors[0].contains("no catalog item id"));
        assert_eq!(source.status_calls(1) + source.status_calls(2), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_request_after_sibling_auth_failure() {
        let (_dir, db) = temp_db();
        let episodes = seed(&db, &[("a", "A", Some(1)), ("b", "B", Some(2))]);
        let source = Arc::new(
            MockSource::new()
                .with_latency(Duration::from_millis(10))
                .with_status(1, SourceStatus::NotStarted, None)
                .with_status(2, SourceStatus::NotStarted, None)
                .with_status_delay(2, Duration::from_millis(50))
                .with_request(1, MockAction::Unauthorized),
        );

        let queue = TranscriptRequestQueue::new(db, source.clone(), credential(), options(2));
        let result = queue.run(episodes, QueueMode::Request).await;

        assert!(result.aborted);
        assert_eq!(source.request_calls(), vec![1]);
        assert_eq!(source.status_calls(2), 1);
        assert_eq!(result.requested, 0);
        assert_eq!(result.failed, 1);
        assert_eq!(result.still_processing, 1);
        assert_accounted(&result);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_reset_after_sibling_auth_failure() {
        let (_dir, db) = temp_db();
        let episodes = seed(&db, &[("a", "A", Some(1)), ("b", "B", Some(2))]);
        let source = Arc::new(
            MockSource::new()
                .with_status(1, SourceStatus::NotStarted, None)
                .with_status(2, SourceStatus::Done, Some("stale"))
                .with_status_delay(2, Duration::from_millis(50))
                .with_request(1, MockAction::Unauthorized),
        );

        let queue = TranscriptRequestQueue::new(db, source.clone(), credential(), options(2));
        let result = queue.run(episodes, QueueMode::Request).await;

        assert!(result.aborted);
        assert!(source.reset_calls().is_empty());
        assert_eq!(result.reset, 0);
        assert_eq!(result.still_processing, 1);
        assert_accounted(&result);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_check_errors_count_as_not_ready() {
        let (_dir, db) = temp_db();
        let episodes = seed(&db, &[("flaky", "Flaky Episode", Some(4))]);
        let source = Arc::new(
            MockSource::new()
                .with_status_script(
                    4,
                    vec![None, None, None, Some(StatusInfo::new(SourceStatus::Done, Some("t4")))],
                )
                .with_text(4, "t4", "made it through"),
        );

        let queue = TranscriptRequestQueue::new(db.clone(), source.clone(), None, options(2));
        let result = queue.run(episodes, QueueMode::Retry).await;

        assert_eq!(result.downloaded, 1);
        assert_eq!(result.failed, 0);
        assert!(result.errors.is_empty(), "{:?}", result.errors);
        assert_eq!(source.status_calls(4), 4);
        assert_eq!(source.text_calls(), 1);

        let stored = db.get_episode("main", "flaky").unwrap().unwrap();
        assert_eq!(stored.transcript_text.as_deref(), Some("made it through"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_errors_exhaust_retry_budget() {
        let (_dir, db) = temp_db();
        let episodes = seed(&db, &[("down", "Down Episode", Some(5))]);
        let source = Arc::new(MockSource::new().with_status_error(5));

        let mut opts = options(2);
        opts.max_check_retries = 3;
        let queue = TranscriptRequestQueue::new(db, source.clone(), None, opts);
        let result = queue.run(episodes, QueueMode::Retry).await;

        assert_eq!(source.status_calls(5), 4);
        assert_eq!(source.text_calls(), 0);
        assert_eq!(result.failed, 1);
        assert!(result.errors[0].contains("timed out after 4 status checks"));
        assert!(result.errors[0].contains("status check failed"));
        assert_accounted(&result);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_request_fails_item() {
        let (_dir, db) = temp_db();
        let episodes = seed(&db, &[("a", "A", Some(1)), ("b", "B", Some(2))]);
        let source = Arc::new(
            MockSource::new()
                .with_status(1, SourceStatus::NotStarted, None)
                .with_status(2, SourceStatus::NotStarted, None)
                .with_request(1, MockAction::Refused("quota exceeded".into())),
        );

        let mut opts = options(2);
        opts.max_check_retries = 0;
        let queue = TranscriptRequestQueue::new(db.clone(), source.clone(), credential(), opts);
        let result = queue.run(episodes, QueueMode::Request).await;

        assert!(!result.aborted);
        assert_eq!(source.request_calls().len(), 2);
        assert_eq!(result.requested, 1);
        assert_eq!(result.failed, 2);
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("request refused: quota exceeded")));
        assert_accounted(&result);

        let a = db.get_episode("main", "a").unwrap().unwrap();
        assert_eq!(a.source_status, Some(SourceStatus::Requested));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_reset_fails_item() {
        let (_dir, db) = temp_db();
        let episodes = seed(&db, &[("bogus", "Bogus Episode", Some(3))]);
        let source = Arc::new(
            MockSource::new()
                .with_status(3, SourceStatus::Done, Some("stale"))
                .with_reset(3, MockAction::Refused("locked".into())),
        );

        let queue = TranscriptRequestQueue::new(db, source.clone(), credential(), options(2));
        let result = queue.run(episodes, QueueMode::Retry).await;

        assert_eq!(source.reset_calls(), vec![(3, "user-1".to_string())]);
        assert_eq!(result.reset, 0);
        assert_eq!(result.failed, 1);
        assert!(result.errors[0].contains("reset refused: locked"));
        assert_eq!(source.status_calls(3), 1);
        assert_accounted(&result);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_task_reported_queued_first() {
        let (_dir, db) = temp_db();
        let episodes = seed(&db, &[("a", "A", Some(1)), ("b", "B", Some(2))]);
        let source = Arc::new(
            MockSource::new()
                .with_status(1, SourceStatus::Done, Some("t1"))
                .with_text(1, "t1", "one")
                .with_status(2, SourceStatus::Done, Some("t2"))
                .with_text(2, "t2", "two"),
        );
        let (sink, mut rx) = ProgressSink::channel(64);

        let queue = TranscriptRequestQueue::new(db, source, None, options(1)).with_progress(Arc::new(sink));
        let result = queue.run(episodes.clone(), QueueMode::Retry).await;
        assert_eq!(result.downloaded, 2);

        let mut states: HashMap<i64, Vec<TaskState>> = HashMap::new();
        while let Ok(event) = rx.try_recv() {
            if let ProgressEvent::ItemStatus { id, state, .. } = event {
                states.entry(id).or_default().push(state);
            }
        }
        for episode in &episodes {
            let seen = &states[&episode.id];
            assert_eq!(seen.first(), Some(&TaskState::Queued), "{:?}", seen);
            assert_eq!(seen.last(), Some(&TaskState::Done), "{:?}", seen);
        }
    }

    #[tokio::test]
    async fn test_empty_run() {
        let (_dir, db) = temp_db();
        let queue = TranscriptRequestQueue::new(db, Arc::new(MockSource::new()), None, options(2));
        let result = queue.run(Vec::new(), QueueMode::Request).await;
        assert_eq!(result.total, 0);
        assert!(!result.aborted);
    }
}
