//! Per-source sync pipeline.
//!
//! 1. Prefetch: feed -> upsert, then catalog matching and backfill.
//! 2. Status check: pooled status lookups for untranscribed episodes.
//! 3. Download: pooled transcript fetches for `done` items.
//! 4. Request/reset for items the service has not started or reports as
//!    done without text, then the fallback chain for items with no
//!    catalog id.
//!
//! Per-item failures land in `SyncResult::errors`. A failed feed fetch
//! ends only that source's sync.

use super::pool::{run_pool, PoolOptions};
use super::progress::{Phase, ProgressSink, TaskState};
use super::timing::{sleep_or_cancel, SleepOutcome};
use crate::config::{EngineConfig, SourceConfig};
use crate::database::{Database, Episode, NewEpisode, SourceStatus, StatusUpdate, TranscriptOrigin};
use crate::error::AppResult;
use crate::fallback::{FallbackChain, FallbackOutcome};
use crate::feed::{normalize_title, parse_feed, ExclusionMatcher, FeedFetcher};
use crate::source::{CatalogItem, Credential, SourceError, StatusInfo, TranscriptPayload, TranscriptSource};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub pool: PoolOptions,
    pub status_cooldown: Duration,
    pub max_episodes_per_feed: usize,
    pub max_items_per_run: Option<usize>,
}

impl SyncOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            pool: PoolOptions::new(config.concurrency, config.stagger()),
            status_cooldown: config.status_cooldown(),
            max_episodes_per_feed: config.max_episodes_per_feed,
            max_items_per_run: config.max_items_per_run,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncResult {
    pub new_episodes: usize,
    pub updated_episodes: usize,
    /// Catalog items with no feed match, inserted as episodes.
    pub backfilled: usize,
    pub checked: usize,
    pub new_transcripts: usize,
    pub requested: usize,
    pub reset: usize,
    /// Request/reset calls not made (no credential, or credential rejected).
    pub skipped: usize,
    pub failed: usize,
    /// Upstream is still working on these.
    pub in_progress: usize,
    pub fallback_found: usize,
    pub stopped: bool,
    pub errors: Vec<String>,
}

impl SyncResult {
    pub fn merge(&mut self, other: SyncResult) {
        self.new_episodes += other.new_episodes;
        self.updated_episodes += other.updated_episodes;
        self.backfilled += other.backfilled;
        self.checked += other.checked;
        self.new_transcripts += other.new_transcripts;
        self.requested += other.requested;
        self.reset += other.reset;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.in_progress += other.in_progress;
        self.fallback_found += other.fallback_found;
        self.stopped |= other.stopped;
        self.errors.extend(other.errors);
    }

    pub fn summary(&self) -> String {
        format!(
            "{} new / {} updated episodes, {} checked, {} new transcripts, {} via fallback, {} requested, {} reset, {} skipped, {} failed, {} in progress",
            self.new_episodes,
            self.updated_episodes,
            self.checked,
            self.new_transcripts,
            self.fallback_found,
            self.requested,
            self.reset,
            self.skipped,
            self.failed,
            self.in_progress
        )
    }
}

/// Pair episodes lacking a catalog id with catalog items, by guid first and
/// then by normalized title. Catalog ids already assigned to an episode are
/// never reused. Returns `(guid, item_id)` pairs and the catalog items left
/// over.
pub fn match_catalog<'a>(
    episodes: &[Episode],
    catalog: &'a [CatalogItem],
) -> (Vec<(String, i64)>, Vec<&'a CatalogItem>) {
    let assigned: HashSet<i64> = episodes.iter().filter_map(|e| e.source_item_id).collect();
    let mut used: Vec<bool> = catalog.iter().map(|c| assigned.contains(&c.item_id)).collect();

    let mut by_guid: HashMap<&str, usize> = HashMap::new();
    let mut by_title: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, item) in catalog.iter().enumerate() {
        if let Some(guid) = item.guid.as_deref().filter(|g| !g.is_empty()) {
            by_guid.entry(guid).or_insert(i);
        }
        by_title.entry(normalize_title(&item.title)).or_default().push(i);
    }

    let unassigned: Vec<&Episode> = episodes.iter().filter(|e| e.source_item_id.is_none()).collect();
    let mut matched_guids: HashSet<&str> = HashSet::new();
    let mut matches = Vec::new();

    for ep in &unassigned {
        if let Some(&i) = by_guid.get(ep.guid.as_str()) {
            if !used[i] {
                used[i] = true;
                matched_guids.insert(ep.guid.as_str());
                matches.push((ep.guid.clone(), catalog[i].item_id));
            }
        }
    }

    for ep in &unassigned {
        if matched_guids.contains(ep.guid.as_str()) {
            continue;
        }
        let Some(candidates) = by_title.get(&normalize_title(&ep.title)) else {
            continue;
        };
        if let Some(&i) = candidates.iter().find(|&&i| !used[i]) {
            used[i] = true;
            matches.push((ep.guid.clone(), catalog[i].item_id));
        }
    }

    let leftover = catalog
        .iter()
        .zip(used)
        .filter(|(_, used)| !used)
        .map(|(item, _)| item)
        .collect();
    (matches, leftover)
}

/// Guid for a backfilled catalog item.
pub fn backfill_guid(item: &CatalogItem) -> String {
    item.guid
        .as_deref()
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("catalog:{}", item.item_id))
}

enum Attempt<T> {
    Ok(T),
    Err(SourceError),
    Cancelled,
}

#[derive(Clone, Copy)]
enum Action {
    Request,
    Reset,
}

enum ActionResult {
    Requested,
    Reset,
    Failed(String),
    AuthRejected(String),
    Skipped,
}

pub struct SyncOrchestrator {
    db: Arc<Database>,
    source: Arc<dyn TranscriptSource>,
    fetcher: Arc<dyn FeedFetcher>,
    fallback: Arc<FallbackChain>,
    exclusions: Arc<ExclusionMatcher>,
    credential: Option<Credential>,
    options: SyncOptions,
}

impl SyncOrchestrator {
    pub fn new(
        db: Arc<Database>,
        source: Arc<dyn TranscriptSource>,
        fetcher: Arc<dyn FeedFetcher>,
        options: SyncOptions,
    ) -> Self {
        Self {
            db,
            source,
            fetcher,
            fallback: Arc::new(FallbackChain::empty()),
            exclusions: Arc::new(ExclusionMatcher::empty()),
            credential: None,
            options,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<FallbackChain>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_exclusions(mut self, exclusions: Arc<ExclusionMatcher>) -> Self {
        self.exclusions = exclusions;
        self
    }

    pub fn with_credential(mut self, credential: Option<Credential>) -> Self {
        self.credential = credential;
        self
    }

    /// Sync every source in order, folding results together.
    pub async fn sync_all(
        &self,
        sources: &[&SourceConfig],
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> SyncResult {
        let mut total = SyncResult::default();
        for source in sources {
            if cancel.is_cancelled() {
                total.stopped = true;
                break;
            }
            let result = self.sync_source(source, progress, cancel).await;
            total.merge(result);
        }
        log::info!("Sync of {} sources finished: {}", sources.len(), total.summary());
        total
    }

    pub async fn sync_source(
        &self,
        source: &SourceConfig,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> SyncResult {
        let span = tracing::info_span!("sync_source", source = %source.id);
        self.run_phases(source, progress, cancel).instrument(span).await
    }

    async fn run_phases(
        &self,
        source: &SourceConfig,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> SyncResult {
        let mut result = SyncResult::default();
        let name = source.display_name();
        log::info!("Syncing {}", name);

        if let Err(e) = self.prefetch(source, progress, &mut result).await {
            log::error!("Sync of {} aborted during prefetch: {}", name, e);
            result.errors.push(format!("{}: feed sync failed: {}", name, e));
            return result;
        }
        if self.stop_requested(cancel, &mut result) {
            return result;
        }

        let candidates = match self.db.get_episodes_missing_transcript(
            &source.id,
            self.options.max_items_per_run.map(|n| n as i64),
            self.options.status_cooldown,
        ) {
            Ok(c) => c,
            Err(e) => {
                result.errors.push(format!("{}: could not list episodes: {}", name, e));
                return result;
            }
        };
        let (with_id, without_id): (Vec<Episode>, Vec<Episode>) =
            candidates.into_iter().partition(|ep| ep.source_item_id.is_some());

        let checked = self.check_statuses(&source.id, with_id, progress, cancel, &mut result).await;
        if self.stop_requested(cancel, &mut result) {
            return result;
        }

        let mut not_started = Vec::new();
        let mut done = Vec::new();
        for (ep, status) in checked {
            match status.status {
                SourceStatus::Done => done.push((ep, status)),
                SourceStatus::NotStarted => not_started.push(ep),
                s if s.is_in_flight() => result.in_progress += 1,
                _ => log::debug!("{} has status {}, leaving it", ep.label(), status.status),
            }
        }

        let bogus = self.download(&source.id, done, progress, cancel, &mut result).await;
        if self.stop_requested(cancel, &mut result) {
            return result;
        }

        self.request_or_reset(&source.id, not_started, bogus, progress, cancel, &mut result)
            .await;
        if self.stop_requested(cancel, &mut result) {
            return result;
        }

        self.run_fallback(&source.id, without_id, progress, cancel, &mut result)
            .await;

        log::info!("Sync of {} finished: {}", name, result.summary());
        result
    }

    fn stop_requested(&self, cancel: &CancellationToken, result: &mut SyncResult) -> bool {
        if cancel.is_cancelled() {
            log::info!("Sync stopped between phases");
            result.stopped = true;
        }
        result.stopped
    }

    // ── Phase 1 ────────────────────────────────────────────────────────────

    async fn prefetch(
        &self,
        source: &SourceConfig,
        progress: &ProgressSink,
        result: &mut SyncResult,
    ) -> AppResult<()> {
        progress.phase_start(Phase::Prefetch, &source.id, 0, format!("Fetching {}", source.display_name()));

        let body = self.fetcher.fetch(&source.feed_url).await?;
        let items = parse_feed(
            &body,
            &source.id,
            self.options.max_episodes_per_feed,
            &self.exclusions,
        )?;
        let (added, updated) = self.db.upsert_episodes(&items)?;
        result.new_episodes += added;
        result.updated_episodes += updated;
        log::info!("{}: {} new, {} updated from feed", source.display_name(), added, updated);

        if let Some(catalog_id) = source.catalog_id {
            match self.source.fetch_catalog(catalog_id).await {
                Ok(catalog) => self.apply_catalog(source, &catalog, result)?,
                Err(e) => {
                    log::warn!("{}: catalog fetch failed: {}", source.display_name(), e);
                    result
                        .errors
                        .push(format!("{}: catalog fetch failed: {}", source.display_name(), e));
                }
            }
        }

        progress.phase_complete(
            Phase::Prefetch,
            &source.id,
            items.len(),
            0,
            format!("{} new, {} updated", added, updated),
        );
        Ok(())
    }

    fn apply_catalog(
        &self,
        source: &SourceConfig,
        catalog: &[CatalogItem],
        result: &mut SyncResult,
    ) -> AppResult<()> {
        let known = self.db.get_episodes_for_source(&source.id)?;
        let (matches, leftover) = match_catalog(&known, catalog);

        let ids: Vec<(String, String, i64)> = matches
            .into_iter()
            .map(|(guid, item_id)| (source.id.clone(), guid, item_id))
            .collect();
        let linked = self.db.set_source_item_ids(&ids)?;

        let backfill: Vec<NewEpisode> = leftover
            .into_iter()
            .map(|item| NewEpisode {
                source_id: source.id.clone(),
                guid: backfill_guid(item),
                title: item.title.trim().to_string(),
                audio_url: item.audio_url.clone(),
                published_date: item.published_date.clone(),
                source_item_id: Some(item.item_id),
                exclusion_tag: self.exclusions.tag_for(&item.title),
                ..Default::default()
            })
            .collect();
        let (added, updated) = self.db.upsert_episodes(&backfill)?;
        result.new_episodes += added;
        result.updated_episodes += updated;
        result.backfilled += added;

        log::info!(
            "{}: {} catalog items, {} linked, {} backfilled",
            source.display_name(),
            catalog.len(),
            linked,
            added
        );
        Ok(())
    }

    // ── Phase 2 ────────────────────────────────────────────────────────────

    async fn check_statuses(
        &self,
        scope: &str,
        episodes: Vec<Episode>,
        progress: &ProgressSink,
        cancel: &CancellationToken,
        result: &mut SyncResult,
    ) -> Vec<(Episode, StatusInfo)> {
        if episodes.is_empty() {
            return Vec::new();
        }
        progress.phase_start(Phase::StatusCheck, scope, episodes.len(), "Checking transcript status");

        let on_progress = |done: usize, total: usize| progress.phase_progress(Phase::StatusCheck, scope, done, total);
        let attempts = run_pool(episodes.clone(), self.options.pool, Some(&on_progress), |ep, _| async move {
            if cancel.is_cancelled() {
                return Attempt::Cancelled;
            }
            let Some(item_id) = ep.source_item_id else {
                return Attempt::Cancelled;
            };
            match self.source.fetch_status(item_id).await {
                Ok(status) => Attempt::Ok(status),
                Err(e) => Attempt::Err(e),
            }
        })
        .await;

        let mut checked = Vec::new();
        let mut failed = 0usize;
        for (ep, attempt) in episodes.into_iter().zip(attempts) {
            match attempt {
                Some(Attempt::Ok(status)) => checked.push((ep, status)),
                Some(Attempt::Err(e)) => {
                    failed += 1;
                    result.errors.push(format!("{}: status check failed: {}", ep.label(), e));
                }
                Some(Attempt::Cancelled) => {}
                None => {
                    failed += 1;
                    result.errors.push(format!("{}: status check panicked", ep.label()));
                }
            }
        }
        result.checked += checked.len();

        let updates: Vec<StatusUpdate> = checked
            .iter()
            .map(|(ep, s)| StatusUpdate::for_episode(ep, s.status, s.transcription_id.clone()))
            .collect();
        if let Err(e) = self.db.set_statuses(&updates) {
            result.errors.push(format!("{}: failed to cache statuses: {}", scope, e));
        }

        progress.phase_complete(
            Phase::StatusCheck,
            scope,
            checked.len(),
            failed,
            format!("{} checked, {} failed", checked.len(), failed),
        );
        checked
    }

    // ── Phase 3 ────────────────────────────────────────────────────────────

    /// Download finished transcripts. Returns the bogus-done episodes.
    async fn download(
        &self,
        scope: &str,
        done: Vec<(Episode, StatusInfo)>,
        progress: &ProgressSink,
        cancel: &CancellationToken,
        result: &mut SyncResult,
    ) -> Vec<Episode> {
        let mut bogus = Vec::new();
        let mut fetchable = Vec::new();
        for (ep, status) in done {
            match (ep.source_item_id, status.transcription_id) {
                (Some(item_id), Some(tid)) => fetchable.push((ep, item_id, tid)),
                _ => {
                    log::info!("{} is done upstream with no transcription id", ep.label());
                    bogus.push(ep);
                }
            }
        }
        if fetchable.is_empty() {
            return bogus;
        }
        progress.phase_start(Phase::Download, scope, fetchable.len(), "Downloading transcripts");

        let on_progress = |done: usize, total: usize| progress.phase_progress(Phase::Download, scope, done, total);
        let jobs: Vec<(i64, String)> = fetchable.iter().map(|(_, id, tid)| (*id, tid.clone())).collect();
        let attempts = run_pool(jobs, self.options.pool, Some(&on_progress), |(item_id, tid), _| async move {
            if cancel.is_cancelled() {
                return Attempt::Cancelled;
            }
            match self.source.fetch_text(item_id, &tid).await {
                Ok(payload) => Attempt::Ok(payload),
                Err(e) => Attempt::Err(e),
            }
        })
        .await;

        let mut saved = 0usize;
        let mut failed = 0usize;
        for ((ep, _, _), attempt) in fetchable.into_iter().zip(attempts) {
            match attempt {
                Some(Attempt::Ok(Some(payload))) if !payload.is_empty() => match self.save(&ep, &payload) {
                    Ok(()) => {
                        saved += 1;
                        result.new_transcripts += 1;
                    }
                    Err(e) => {
                        failed += 1;
                        result.errors.push(format!("{}: failed to save transcript: {}", ep.label(), e));
                    }
                },
                Some(Attempt::Ok(_)) => {
                    log::info!("{} is done upstream but has no transcript text", ep.label());
                    bogus.push(ep);
                }
                Some(Attempt::Err(e)) => {
                    failed += 1;
                    result.errors.push(format!("{}: transcript download failed: {}", ep.label(), e));
                }
                Some(Attempt::Cancelled) => {}
                None => {
                    failed += 1;
                    result.errors.push(format!("{}: transcript download panicked", ep.label()));
                }
            }
        }

        progress.phase_complete(
            Phase::Download,
            scope,
            saved,
            failed,
            format!("{} downloaded, {} done without text", saved, bogus.len()),
        );
        bogus
    }

    fn save(&self, ep: &Episode, payload: &TranscriptPayload) -> AppResult<()> {
        let words = (!payload.words.is_empty()).then_some(payload.words.as_slice());
        self.db
            .set_transcript(&ep.source_id, &ep.guid, &payload.text, TranscriptOrigin::Service, words)?;
        log::info!("Downloaded transcript for {}", ep.label());
        Ok(())
    }

    // ── Phase 4 ────────────────────────────────────────────────────────────

    async fn request_or_reset(
        &self,
        scope: &str,
        not_started: Vec<Episode>,
        bogus: Vec<Episode>,
        progress: &ProgressSink,
        cancel: &CancellationToken,
        result: &mut SyncResult,
    ) {
        let total = not_started.len() + bogus.len();
        if total == 0 {
            return;
        }
        let Some(credential) = &self.credential else {
            log::warn!(
                "No transcription service credential; skipping {} requests and {} resets for {}",
                not_started.len(),
                bogus.len(),
                scope
            );
            result.skipped += total;
            return;
        };

        progress.phase_start(Phase::Request, scope, total, "Requesting transcripts");
        let jobs: Vec<(Episode, Action)> = not_started
            .into_iter()
            .map(|ep| (ep, Action::Request))
            .chain(bogus.into_iter().map(|ep| (ep, Action::Reset)))
            .collect();

        let auth_rejected = AtomicBool::new(false);
        let auth_rejected = &auth_rejected;
        let on_progress = |done: usize, total: usize| progress.phase_progress(Phase::Request, scope, done, total);
        let outcomes = run_pool(jobs, self.options.pool, Some(&on_progress), |(ep, action), _| async move {
            if cancel.is_cancelled() || auth_rejected.load(Ordering::SeqCst) {
                return (ep, ActionResult::Skipped);
            }
            let outcome = self.act(&ep, action, credential).await;
            if matches!(outcome, ActionResult::AuthRejected(_)) {
                auth_rejected.store(true, Ordering::SeqCst);
            }
            (ep, outcome)
        })
        .await;

        let mut auth_error_recorded = false;
        for outcome in outcomes {
            match outcome {
                Some((_, ActionResult::Requested)) => result.requested += 1,
                Some((_, ActionResult::Reset)) => result.reset += 1,
                Some((_, ActionResult::Skipped)) => result.skipped += 1,
                Some((_, ActionResult::Failed(err))) => {
                    result.failed += 1;
                    result.errors.push(err);
                }
                Some((ep, ActionResult::AuthRejected(err))) => {
                    result.failed += 1;
                    if !auth_error_recorded {
                        auth_error_recorded = true;
                        log::error!("Credential rejected while handling {}: {}", ep.label(), err);
                        result.errors.push(format!(
                            "{}: transcription service rejected the credential: {}",
                            scope, err
                        ));
                    }
                }
                None => {
                    result.failed += 1;
                    result.errors.push(format!("{}: request task panicked", scope));
                }
            }
        }

        progress.phase_complete(
            Phase::Request,
            scope,
            result.requested + result.reset,
            result.failed,
            format!("{} requested, {} reset", result.requested, result.reset),
        );
    }

    async fn act(&self, ep: &Episode, action: Action, credential: &Credential) -> ActionResult {
        let Some(item_id) = ep.source_item_id else {
            return ActionResult::Failed(format!("{}: no catalog item id", ep.label()));
        };
        let response = match action {
            Action::Request => self.source.request_transcription(item_id, credential).await,
            Action::Reset => {
                let Some(user_id) = credential.user_id.as_deref() else {
                    return ActionResult::Failed(format!(
                        "{}: reset needed but no user identifier is available",
                        ep.label()
                    ));
                };
                self.source.reset_transcription(item_id, credential, user_id).await
            }
        };

        match response {
            Ok(outcome) => {
                let update = StatusUpdate::for_episode(ep, SourceStatus::Requested, None);
                if let Err(e) = self.db.set_statuses(&[update]) {
                    log::warn!("Failed to cache requested status for {}: {}", ep.label(), e);
                }
                match (outcome.success, action) {
                    (true, Action::Request) => {
                        log::info!("Requested transcript for {}", ep.label());
                        ActionResult::Requested
                    }
                    (true, Action::Reset) => {
                        log::info!("Reset transcript for {}", ep.label());
                        ActionResult::Reset
                    }
                    (false, _) => ActionResult::Failed(format!(
                        "{}: service refused: {}",
                        ep.label(),
                        outcome.error.unwrap_or_default()
                    )),
                }
            }
            Err(e) if e.is_unauthorized() => ActionResult::AuthRejected(e.to_string()),
            Err(e) => ActionResult::Failed(format!("{}: request failed: {}", ep.label(), e)),
        }
    }

    /// Sequential adapter chain for episodes the service has no id for.
    async fn run_fallback(
        &self,
        scope: &str,
        episodes: Vec<Episode>,
        progress: &ProgressSink,
        cancel: &CancellationToken,
        result: &mut SyncResult,
    ) {
        if episodes.is_empty() || self.fallback.is_empty() {
            return;
        }
        progress.phase_start(Phase::Fallback, scope, episodes.len(), "Trying other transcript sources");

        let total = episodes.len();
        let mut found = 0usize;
        let mut failed = 0usize;
        for (i, ep) in episodes.iter().enumerate() {
            if i > 0 && sleep_or_cancel(self.fallback.delay(), cancel).await == SleepOutcome::Cancelled {
                break;
            }
            progress.item(ep.id, &ep.title, TaskState::Checking, None);

            match self.fallback.find(ep, cancel).await {
                FallbackOutcome::Found { text, adapter, origin } => {
                    match self.db.set_transcript(&ep.source_id, &ep.guid, &text, origin, None) {
                        Ok(_) => {
                            found += 1;
                            result.fallback_found += 1;
                            progress.item(ep.id, &ep.title, TaskState::Done, Some(adapter.to_string()));
                        }
                        Err(e) => {
                            failed += 1;
                            result.errors.push(format!("{}: failed to save transcript: {}", ep.label(), e));
                        }
                    }
                }
                FallbackOutcome::NotFound { errors } => {
                    // Stamp the attempt so the cooldown applies next sync
                    let update = StatusUpdate::for_episode(ep, SourceStatus::Unknown, None);
                    if let Err(e) = self.db.set_statuses(&[update]) {
                        log::warn!("Failed to record fallback attempt for {}: {}", ep.label(), e);
                    }
                    if !errors.is_empty() {
                        failed += 1;
                    }
                    for err in errors {
                        result.errors.push(format!("{}: {}", ep.label(), err));
                    }
                    progress.item(ep.id, &ep.title, TaskState::Skipped, None);
                }
                FallbackOutcome::Cancelled => break,
            }
            progress.phase_progress(Phase::Fallback, scope, i + 1, total);
        }

        progress.phase_complete(
            Phase::Fallback,
            scope,
            found,
            failed,
            format!("{} of {} found elsewhere", found, total),
        );
    }
}
