//! Attaches word-level timing to episodes that already have plain text.
//!
//! Single step per episode through the pool: look up status, and when the
//! service has a finished transcription, store its word array. Plain text
//! is never rewritten here.

use super::pool::{run_pool, PoolOptions};
use super::progress::{Phase, ProgressSink, TaskState};
use crate::database::{Database, Episode};
use crate::source::TranscriptSource;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrichmentResult {
    pub total: usize,
    pub enriched: usize,
    /// Not ready upstream yet, or nothing to attach.
    pub skipped: usize,
    pub failed: usize,
    pub still_processing: usize,
    pub errors: Vec<String>,
}

impl EnrichmentResult {
    pub fn summary(&self) -> String {
        format!(
            "{} total, {} enriched, {} skipped, {} failed, {} still processing",
            self.total, self.enriched, self.skipped, self.failed, self.still_processing
        )
    }
}

enum Outcome {
    Enriched(usize),
    Skipped(String),
    Failed(String),
    Stopped,
}

pub struct EnrichmentQueue {
    db: Arc<Database>,
    source: Arc<dyn TranscriptSource>,
    options: PoolOptions,
    progress: Arc<ProgressSink>,
    cancel: CancellationToken,
}

impl EnrichmentQueue {
    pub fn new(db: Arc<Database>, source: Arc<dyn TranscriptSource>, options: PoolOptions) -> Self {
        Self {
            db,
            source,
            options,
            progress: Arc::new(ProgressSink::disabled()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: Arc<ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn run(&self, episodes: Vec<Episode>) -> EnrichmentResult {
        let episodes: Vec<Episode> = episodes
            .into_iter()
            .filter(|ep| ep.has_transcript() && !ep.has_transcript_data && ep.exclusion_tag.is_none())
            .collect();
        let total = episodes.len();
        let mut result = EnrichmentResult {
            total,
            ..Default::default()
        };

        log::info!("Starting enrichment: {} episodes", total);
        self.progress
            .phase_start(Phase::Enrichment, "enrichment", total, format!("{} episodes to enrich", total));

        let progress = self.progress.clone();
        let on_progress = move |done: usize, total: usize| {
            progress.phase_progress(Phase::Enrichment, "enrichment", done, total);
        };

        let outcomes = run_pool(episodes.clone(), self.options, Some(&on_progress), |ep, _| {
            self.enrich_one(ep)
        })
        .await;

        for (ep, outcome) in episodes.iter().zip(outcomes) {
            match outcome {
                Some(Outcome::Enriched(words)) => {
                    log::info!("Enriched {} with {} words", ep.label(), words);
                    result.enriched += 1;
                }
                Some(Outcome::Skipped(reason)) => {
                    log::debug!("Skipped enrichment for {}: {}", ep.label(), reason);
                    result.skipped += 1;
                }
                Some(Outcome::Failed(err)) => {
                    log::warn!("{}", err);
                    result.failed += 1;
                    result.errors.push(err);
                }
                Some(Outcome::Stopped) => result.still_processing += 1,
                None => {
                    result.failed += 1;
                    result.errors.push(format!("{}: enrichment task panicked", ep.label()));
                }
            }
        }

        log::info!("Enrichment finished: {}", result.summary());
        self.progress.phase_complete(
            Phase::Enrichment,
            "enrichment",
            result.enriched,
            result.failed,
            result.summary(),
        );
        result
    }

    async fn enrich_one(&self, ep: Episode) -> Outcome {
        if self.cancel.is_cancelled() {
            self.progress.item(ep.id, &ep.title, TaskState::Stopped, None);
            return Outcome::Stopped;
        }
        let Some(item_id) = ep.source_item_id else {
            self.progress.item(ep.id, &ep.title, TaskState::Skipped, None);
            return Outcome::Skipped("no catalog item id".to_string());
        };

        self.progress.item(ep.id, &ep.title, TaskState::Checking, None);
        let outcome = self.fetch_words(&ep, item_id).await;
        let state = match &outcome {
            Outcome::Enriched(_) => TaskState::Done,
            Outcome::Skipped(_) => TaskState::Skipped,
            Outcome::Failed(_) => TaskState::Failed,
            Outcome::Stopped => TaskState::Stopped,
        };
        self.progress.item(ep.id, &ep.title, state, None);
        outcome
    }

    async fn fetch_words(&self, ep: &Episode, item_id: i64) -> Outcome {
        let status = match self.source.fetch_status(item_id).await {
            Ok(status) => status,
            Err(e) => return Outcome::Failed(format!("{}: status lookup failed: {}", ep.label(), e)),
        };
        let Some(transcription_id) = status.downloadable_id() else {
            return Outcome::Skipped(format!("service status is {}", status.status));
        };

        let payload = match self.source.fetch_text(item_id, transcription_id).await {
            Ok(Some(payload)) => payload,
            Ok(None) => return Outcome::Skipped("no transcript on the service".to_string()),
            Err(e) => return Outcome::Failed(format!("{}: transcript download failed: {}", ep.label(), e)),
        };
        if payload.words.is_empty() {
            return Outcome::Skipped("transcript has no word timings".to_string());
        }

        match self.db.set_transcript_data(ep.id, &payload.words) {
            Ok(true) => Outcome::Enriched(payload.words.len()),
            Ok(false) => Outcome::Failed(format!("{}: episode disappeared before save", ep.label())),
            Err(e) => Outcome::Failed(format!("{}: failed to save word data: {}", ep.label(), e)),
        }
    }
}
