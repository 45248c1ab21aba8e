//! Transcript acquisition engine.
//!
//! [`Engine`] owns the store, the service client, the feed fetcher and the
//! fallback chain, and runs one mutating operation at a time under the
//! [`OperationLock`]. Every run gets a fresh cancellation token so
//! [`Engine::stop`] only affects the run in flight.

pub mod enrichment;
pub mod lock;
pub mod pool;
pub mod progress;
pub mod request_queue;
pub mod sync;
pub mod timing;

#[cfg(test)]
pub(crate) mod test_support;

use crate::config::{EngineConfig, SourceConfig, TOKEN_ENV_VAR, USER_ID_ENV_VAR};
use crate::database::{Database, Episode};
use crate::error::{AppError, AppResult};
use crate::fallback::{
    CatalogLookupAdapter, FallbackChain, FeedLinkAdapter, HtmlScrapeAdapter, TranscriptAdapter,
};
use crate::feed::{ExclusionMatcher, FeedFetcher, HttpFeedFetcher};
use crate::source::client::HttpTranscriptSource;
use crate::source::{Credential, TranscriptSource};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use enrichment::{EnrichmentQueue, EnrichmentResult};
use lock::{OperationLock, RunGuard};
use pool::PoolOptions;
use progress::ProgressSink;
use request_queue::{QueueMode, QueueOptions, QueueResult, TranscriptRequestQueue};
use sync::{SyncOptions, SyncOrchestrator, SyncResult};

/// `app_settings` key holding a stored service token.
pub const CREDENTIAL_SETTING: &str = "service_credential";

/// Token lookup order: environment, `.env` beside the config, settings row.
/// The user id comes from the environment or `.env` when set, otherwise
/// from the token's own claims.
pub fn resolve_credential(
    env_token: Option<String>,
    env_user_id: Option<String>,
    env_dir: Option<&Path>,
    db: &Database,
) -> Option<Credential> {
    let from_dotenv = |key: &str| env_dir.and_then(|dir| crate::load_env_value(dir, key));

    let token = env_token
        .filter(|t| !t.trim().is_empty())
        .or_else(|| from_dotenv(TOKEN_ENV_VAR))
        .or_else(|| match db.get_setting(CREDENTIAL_SETTING) {
            Ok(value) => value.filter(|t| !t.trim().is_empty()),
            Err(e) => {
                log::warn!("Failed to read stored credential: {}", e);
                None
            }
        })?;
    let user_id = env_user_id
        .filter(|u| !u.trim().is_empty())
        .or_else(|| from_dotenv(USER_ID_ENV_VAR));

    Some(Credential::new(token.trim(), user_id))
}

/// Stop handle plus lock for one run. Dropping it, whether the run
/// completed or its future was dropped, clears both.
struct ActiveRun<'a> {
    current: &'a Mutex<Option<(Uuid, CancellationToken)>>,
    guard: RunGuard,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        let run_id = self.guard.run_id();
        if let Ok(mut current) = self.current.lock() {
            if current.as_ref().map(|(id, _)| *id) == Some(run_id) {
                *current = None;
            }
        }
        log::info!("{} run {} finished", self.guard.kind(), run_id);
    }
}

pub struct Engine {
    db: Arc<Database>,
    source: Arc<dyn TranscriptSource>,
    fetcher: Arc<dyn FeedFetcher>,
    fallback: Arc<FallbackChain>,
    exclusions: Arc<ExclusionMatcher>,
    config: EngineConfig,
    env_dir: Option<PathBuf>,
    lock: OperationLock,
    progress: Arc<ProgressSink>,
    current: Mutex<Option<(Uuid, CancellationToken)>>,
}

impl Engine {
    /// Wire the HTTP client, feed fetcher and default fallback chain.
    pub fn new(db: Arc<Database>, config: EngineConfig) -> AppResult<Self> {
        let source: Arc<dyn TranscriptSource> = Arc::new(HttpTranscriptSource::new(&config.service));
        let adapters: Vec<Box<dyn TranscriptAdapter>> = vec![
            Box::new(FeedLinkAdapter::new()),
            Box::new(CatalogLookupAdapter::new(source.clone())),
            Box::new(HtmlScrapeAdapter::new()),
        ];
        let fallback = FallbackChain::new(adapters, config.fallback_delay());
        Self::from_parts(db, config, source, Arc::new(HttpFeedFetcher::new()), Arc::new(fallback))
    }

    pub fn from_parts(
        db: Arc<Database>,
        config: EngineConfig,
        source: Arc<dyn TranscriptSource>,
        fetcher: Arc<dyn FeedFetcher>,
        fallback: Arc<FallbackChain>,
    ) -> AppResult<Self> {
        let exclusions = Arc::new(ExclusionMatcher::new(&config.exclusion_rules)?);
        Ok(Self {
            db,
            source,
            fetcher,
            fallback,
            exclusions,
            lock: OperationLock::new(config.lock_timeout()),
            config,
            env_dir: None,
            progress: Arc::new(ProgressSink::disabled()),
            current: Mutex::new(None),
        })
    }

    /// Directory searched for a `.env` file during credential lookup.
    pub fn with_env_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.env_dir = Some(dir.into());
        self
    }

    pub fn with_progress(mut self, progress: Arc<ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn credential(&self) -> Option<Credential> {
        resolve_credential(
            std::env::var(TOKEN_ENV_VAR).ok(),
            std::env::var(USER_ID_ENV_VAR).ok(),
            self.env_dir.as_deref(),
            &self.db,
        )
    }

    // ── Lifecycle ──────────────────────────────────────────────────────────

    pub fn is_busy(&self) -> bool {
        self.lock.current().is_some()
    }

    /// Kind of the run holding the lock, if any.
    pub fn current_run(&self) -> Option<String> {
        self.lock.current()
    }

    /// Cancel the run in flight. Returns false when nothing was running.
    pub fn stop(&self) -> bool {
        let Ok(current) = self.current.lock() else {
            return false;
        };
        match current.as_ref() {
            Some((run_id, token)) => {
                log::info!("Stop requested for run {}", run_id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn begin(&self, kind: &str) -> AppResult<(ActiveRun<'_>, CancellationToken)> {
        let guard = self.lock.try_acquire(kind).map_err(AppError::Busy)?;
        let token = CancellationToken::new();
        if let Ok(mut current) = self.current.lock() {
            *current = Some((guard.run_id(), token.clone()));
        }
        Ok((
            ActiveRun {
                current: &self.current,
                guard,
            },
            token,
        ))
    }

    fn source_ids(&self, requested: Option<&[String]>) -> Option<Vec<String>> {
        requested
            .map(|ids| ids.to_vec())
            .or_else(|| self.config.source_filter.clone())
    }

    fn run_limit(&self) -> Option<i64> {
        self.config.max_items_per_run.map(|n| n as i64)
    }

    // ── Operations ─────────────────────────────────────────────────────────

    fn orchestrator(&self) -> SyncOrchestrator {
        SyncOrchestrator::new(
            self.db.clone(),
            self.source.clone(),
            self.fetcher.clone(),
            SyncOptions::from_config(&self.config),
        )
        .with_fallback(self.fallback.clone())
        .with_exclusions(self.exclusions.clone())
        .with_credential(self.credential())
    }

    /// Sync every enabled source that passes the configured filter.
    pub async fn sync_all(&self) -> AppResult<SyncResult> {
        let (run, cancel) = self.begin("sync")?;
        let sources = self.config.active_sources();
        let result = self.orchestrator().sync_all(&sources, &self.progress, &cancel).await;
        drop(run);
        Ok(result)
    }

    pub async fn sync_source(&self, source_id: &str) -> AppResult<SyncResult> {
        let source: &SourceConfig = self
            .config
            .sources
            .iter()
            .find(|s| s.id == source_id)
            .ok_or_else(|| AppError::NotFound(format!("source '{}'", source_id)))?;
        let (run, cancel) = self.begin("sync")?;
        let result = self.orchestrator().sync_source(source, &self.progress, &cancel).await;
        drop(run);
        Ok(result)
    }

    /// Ask the service for every eligible episode not yet requested, then
    /// follow each through to a downloaded transcript.
    pub async fn request_transcripts(&self, source_ids: Option<&[String]>) -> AppResult<QueueResult> {
        let (run, cancel) = self.begin("request")?;
        let ids = self.source_ids(source_ids);
        let result = match self.db.get_episodes_needing_request(ids.as_deref(), self.run_limit()) {
            Ok(episodes) => self.run_queue(episodes, QueueMode::Request, cancel).await,
            Err(e) => QueueResult {
                errors: vec![format!("could not list episodes needing a request: {}", e)],
                ..Default::default()
            },
        };
        drop(run);
        Ok(result)
    }

    /// Re-poll episodes the service is already working on.
    pub async fn retry_processing(&self, source_ids: Option<&[String]>) -> AppResult<QueueResult> {
        let (run, cancel) = self.begin("retry")?;
        let ids = self.source_ids(source_ids);
        let result = match self.db.get_episodes_in_processing(ids.as_deref()) {
            Ok(mut episodes) => {
                if let Some(limit) = self.config.max_items_per_run {
                    episodes.truncate(limit);
                }
                self.run_queue(episodes, QueueMode::Retry, cancel).await
            }
            Err(e) => QueueResult {
                errors: vec![format!("could not list episodes in processing: {}", e)],
                ..Default::default()
            },
        };
        drop(run);
        Ok(result)
    }

    async fn run_queue(&self, episodes: Vec<Episode>, mode: QueueMode, cancel: CancellationToken) -> QueueResult {
        TranscriptRequestQueue::new(
            self.db.clone(),
            self.source.clone(),
            self.credential(),
            QueueOptions::from_config(&self.config),
        )
        .with_progress(self.progress.clone())
        .with_cancel(cancel)
        .run(episodes, mode)
        .await
    }

    /// Attach word timings to transcribed episodes that lack them.
    pub async fn enrich(&self, source_ids: Option<&[String]>) -> AppResult<EnrichmentResult> {
        let (run, cancel) = self.begin("enrichment")?;
        let ids = self.source_ids(source_ids);
        let result = match self.db.get_episodes_needing_enrichment(ids.as_deref(), self.run_limit()) {
            Ok(episodes) => {
                EnrichmentQueue::new(
                    self.db.clone(),
                    self.source.clone(),
                    PoolOptions::new(self.config.concurrency, self.config.stagger()),
                )
                .with_progress(self.progress.clone())
                .with_cancel(cancel)
                .run(episodes)
                .await
            }
            Err(e) => EnrichmentResult {
                errors: vec![format!("could not list episodes needing enrichment: {}", e)],
                ..Default::default()
            },
        };
        drop(run);
        Ok(result)
    }
}
