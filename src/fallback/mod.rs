//! Ordered transcript adapters for episodes the service cannot process.
//!
//! The chain tries each applicable adapter in order, pausing between calls,
//! and stops at the first one that returns text.

pub mod adapters;

use crate::database::{Episode, TranscriptOrigin};
use crate::error::AppResult;
use crate::worker::timing::{sleep_or_cancel, SleepOutcome};
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use adapters::{CatalogLookupAdapter, FeedLinkAdapter, HtmlScrapeAdapter};

#[async_trait]
pub trait TranscriptAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn origin(&self) -> TranscriptOrigin;

    /// Whether this adapter has anything to work with for `episode`.
    fn applies_to(&self, episode: &Episode) -> bool;

    /// `Ok(None)` means "nothing found", not an error.
    async fn fetch(&self, episode: &Episode) -> AppResult<Option<String>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum FallbackOutcome {
    Found {
        text: String,
        adapter: &'static str,
        origin: TranscriptOrigin,
    },
    NotFound {
        /// Adapter failures along the way, as "adapter: reason".
        errors: Vec<String>,
    },
    Cancelled,
}

pub struct FallbackChain {
    adapters: Vec<Box<dyn TranscriptAdapter>>,
    delay: Duration,
}

impl FallbackChain {
    pub fn new(adapters: Vec<Box<dyn TranscriptAdapter>>, delay: Duration) -> Self {
        Self { adapters, delay }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), Duration::ZERO)
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub async fn find(&self, episode: &Episode, cancel: &CancellationToken) -> FallbackOutcome {
        let mut errors = Vec::new();
        let mut attempted = 0usize;

        for adapter in self.adapters.iter().filter(|a| a.applies_to(episode)) {
            if attempted > 0 && sleep_or_cancel(self.delay, cancel).await == SleepOutcome::Cancelled {
                return FallbackOutcome::Cancelled;
            }
            if cancel.is_cancelled() {
                return FallbackOutcome::Cancelled;
            }
            attempted += 1;

            match adapter.fetch(episode).await {
                Ok(Some(text)) if !text.trim().is_empty() => {
                    log::info!(
                        "Fallback adapter '{}' found transcript for {}",
                        adapter.name(),
                        episode.label()
                    );
                    return FallbackOutcome::Found {
                        text,
                        adapter: adapter.name(),
                        origin: adapter.origin(),
                    };
                }
                Ok(_) => {
                    log::debug!("Fallback adapter '{}' found nothing for {}", adapter.name(), episode.label());
                }
                Err(e) => {
                    log::warn!("Fallback adapter '{}' failed for {}: {}", adapter.name(), episode.label(), e);
                    errors.push(format!("{}: {}", adapter.name(), e));
                }
            }
        }

        FallbackOutcome::NotFound { errors }
    }
}
