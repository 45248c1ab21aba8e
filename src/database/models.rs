use serde::{Deserialize, Serialize};

/// Last status reported by the external transcription service for an episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    NotStarted,
    Requested,
    Running,
    Processing,
    Done,
    Unknown,
}

impl Default for SourceStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Requested => "requested",
            Self::Running => "running",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Unknown => "unknown",
        }
    }

    /// Upstream is already working on it.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Requested | Self::Running | Self::Processing)
    }
}

impl std::fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for SourceStatus {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<&str> for SourceStatus {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "not_started" | "notstarted" | "none" | "new" => Self::NotStarted,
            "requested" | "queued" | "pending" => Self::Requested,
            "running" | "in_progress" => Self::Running,
            "processing" => Self::Processing,
            "done" | "completed" | "complete" => Self::Done,
            _ => Self::Unknown,
        }
    }
}

/// Where a stored transcript came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptOrigin {
    /// Downloaded from the transcription service.
    Service,
    /// `<podcast:transcript>` link in the feed.
    FeedLink,
    /// Found through a catalog search by title.
    CatalogLookup,
    /// Scraped from the episode's web page.
    HtmlScrape,
}

impl TranscriptOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Service => "service",
            Self::FeedLink => "feed_link",
            Self::CatalogLookup => "catalog_lookup",
            Self::HtmlScrape => "html_scrape",
        }
    }
}

impl std::fmt::Display for TranscriptOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One word with timing from the service's structured transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptWord {
    pub word: String,
    pub start: f64,
    pub end: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: i64,
    pub source_id: String,
    pub guid: String,
    pub title: String,
    pub description: Option<String>,
    pub audio_url: Option<String>,
    pub link: Option<String>,
    pub published_date: Option<String>,
    pub added_date: String,
    pub transcript_text: Option<String>,
    pub transcript_origin: Option<String>,
    pub has_transcript_data: bool,
    pub transcript_url: Option<String>,
    pub source_item_id: Option<i64>,
    pub source_status: Option<SourceStatus>,
    pub transcription_id: Option<String>,
    pub status_checked_at: Option<String>,
    pub exclusion_tag: Option<String>,
}

impl Episode {
    pub fn has_transcript(&self) -> bool {
        self.transcript_text
            .as_deref()
            .map(|t| !t.trim().is_empty())
            .unwrap_or(false)
    }

    /// Short label for logs and error lists.
    pub fn label(&self) -> String {
        format!("\"{}\" ({}/{})", self.title, self.source_id, self.guid)
    }
}

/// Feed or catalog item as handed to `upsert_episodes`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewEpisode {
    pub source_id: String,
    pub guid: String,
    pub title: String,
    pub description: Option<String>,
    pub audio_url: Option<String>,
    pub link: Option<String>,
    pub published_date: Option<String>,
    pub transcript_url: Option<String>,
    pub source_item_id: Option<i64>,
    pub exclusion_tag: Option<String>,
}

/// Cached status write for one episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub source_id: String,
    pub guid: String,
    pub status: SourceStatus,
    pub transcription_id: Option<String>,
}

impl StatusUpdate {
    pub fn for_episode(episode: &Episode, status: SourceStatus, transcription_id: Option<String>) -> Self {
        Self {
            source_id: episode.source_id.clone(),
            guid: episode.guid.clone(),
            status,
            transcription_id,
        }
    }
}

/// Counts per cached status for one source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceSummary {
    pub source_id: String,
    pub total: i64,
    pub with_transcript: i64,
    pub excluded: i64,
    pub without_item_id: i64,
    pub in_processing: i64,
    pub needing_request: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptData {
    pub episode_id: i64,
    pub full_text: String,
    pub origin: Option<String>,
    pub words: Option<Vec<TranscriptWord>>,
    pub transcribed_date: Option<String>,
}
