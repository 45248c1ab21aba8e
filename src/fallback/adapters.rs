//! The three built-in fallback adapters and their text clean-up helpers.

use super::TranscriptAdapter;
use crate::database::{Episode, TranscriptOrigin};
use crate::error::{AppError, AppResult};
use crate::feed::{cached_regex, normalize_title};
use crate::source::TranscriptSource;
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Scraped sections shorter than this are navigation labels, not transcripts.
const MIN_SCRAPED_CHARS: usize = 500;

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(60))
        .user_agent(concat!("podcast-kb/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_default()
}

async fn get_text(client: &reqwest::Client, url: &str) -> AppResult<(Option<String>, String)> {
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(AppError::Http(format!("{} returned {}", url, response.status())));
    }
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase());
    let body = response.text().await?;
    Ok((content_type, body))
}

// ── Feed link ──────────────────────────────────────────────────────────────

/// Downloads the `<podcast:transcript>` URL captured at prefetch.
pub struct FeedLinkAdapter {
    client: reqwest::Client,
}

impl FeedLinkAdapter {
    pub fn new() -> Self {
        Self { client: http_client() }
    }
}

impl Default for FeedLinkAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TranscriptAdapter for FeedLinkAdapter {
    fn name(&self) -> &'static str {
        "feed_link"
    }

    fn origin(&self) -> TranscriptOrigin {
        TranscriptOrigin::FeedLink
    }

    fn applies_to(&self, episode: &Episode) -> bool {
        episode.transcript_url.is_some()
    }

    async fn fetch(&self, episode: &Episode) -> AppResult<Option<String>> {
        let Some(url) = episode.transcript_url.as_deref() else {
            return Ok(None);
        };
        let (content_type, body) = get_text(&self.client, url).await?;
        let text = transcript_body_to_text(url, content_type.as_deref(), &body);
        Ok(Some(text).filter(|t| !t.is_empty()))
    }
}

#[derive(Debug, Deserialize)]
struct JsonTranscript {
    #[serde(default)]
    segments: Vec<JsonSegment>,
}

#[derive(Debug, Deserialize)]
struct JsonSegment {
    #[serde(default)]
    body: String,
}

/// Turn a podcast transcript file into plain text based on its declared
/// or sniffed format.
pub fn transcript_body_to_text(url: &str, content_type: Option<&str>, body: &str) -> String {
    let ct = content_type.unwrap_or("");
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    let trimmed = body.trim_start();

    if ct.contains("vtt") || path.ends_with(".vtt") || trimmed.starts_with("WEBVTT") {
        return flatten_captions(body);
    }
    if ct.contains("srt") || path.ends_with(".srt") || looks_like_srt(trimmed) {
        return flatten_captions(body);
    }
    if ct.contains("json") || path.ends_with(".json") || trimmed.starts_with('{') {
        if let Ok(json) = serde_json::from_str::<JsonTranscript>(body) {
            return json
                .segments
                .iter()
                .map(|s| s.body.trim())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(" ");
        }
    }
    if ct.contains("html") || trimmed.starts_with('<') {
        return strip_html(body);
    }
    body.trim().to_string()
}

fn looks_like_srt(body: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached_regex(&RE, r"^\d+\s*\r?\n\d{2}:\d{2}:\d{2},\d{3}\s*-->").is_some_and(|re| re.is_match(body))
}

/// Flatten WebVTT or SRT cues into running text.
pub fn flatten_captions(body: &str) -> String {
    static TAG: OnceLock<Option<Regex>> = OnceLock::new();
    let tag = cached_regex(&TAG, r"<[^>]+>");

    let mut lines: Vec<String> = Vec::new();
    let mut in_block = false;

    for raw in body.lines() {
        let line = raw.trim();
        if line.is_empty() {
            in_block = false;
            continue;
        }
        if in_block {
            continue;
        }
        if line.starts_with("WEBVTT")
            || line.starts_with("NOTE")
            || line.starts_with("STYLE")
            || line.starts_with("REGION")
        {
            in_block = true;
            continue;
        }
        if line.contains("-->") || line.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let cleaned = match tag {
            Some(re) => re.replace_all(line, "").trim().to_string(),
            None => line.to_string(),
        };
        if cleaned.is_empty() || lines.last() == Some(&cleaned) {
            continue;
        }
        lines.push(cleaned);
    }

    lines.join(" ")
}

/// Crude HTML to text: drops scripts and tags, keeps paragraph breaks.
pub fn strip_html(html: &str) -> String {
    static BLOCKS: OnceLock<Option<Regex>> = OnceLock::new();
    static BREAKS: OnceLock<Option<Regex>> = OnceLock::new();
    static TAGS: OnceLock<Option<Regex>> = OnceLock::new();
    let passes = [
        (&BLOCKS, r"(?is)<(script|style|noscript)[^>]*>.*?</(script|style|noscript)>", ""),
        (&BREAKS, r"(?i)<br\s*/?>|</p>|</div>|</li>|</h[1-6]>", "\n"),
        (&TAGS, r"<[^>]+>", ""),
    ];

    let mut text = html.to_string();
    for (cell, pattern, with) in passes {
        if let Some(re) = cached_regex(cell, pattern) {
            text = re.replace_all(&text, with).into_owned();
        }
    }
    let text = text
        .replace("&nbsp;", " ")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&");

    text.lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Catalog lookup ─────────────────────────────────────────────────────────

/// Searches the service catalog by title for episodes prefetch could not match.
pub struct CatalogLookupAdapter {
    source: Arc<dyn TranscriptSource>,
}

impl CatalogLookupAdapter {
    pub fn new(source: Arc<dyn TranscriptSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl TranscriptAdapter for CatalogLookupAdapter {
    fn name(&self) -> &'static str {
        "catalog_lookup"
    }

    fn origin(&self) -> TranscriptOrigin {
        TranscriptOrigin::CatalogLookup
    }

    fn applies_to(&self, episode: &Episode) -> bool {
        !episode.title.trim().is_empty()
    }

    async fn fetch(&self, episode: &Episode) -> AppResult<Option<String>> {
        let wanted = normalize_title(&episode.title);
        let hits = self
            .source
            .search_catalog(episode.title.trim())
            .await
            .map_err(|e| AppError::Http(e.to_string()))?;

        let Some(hit) = hits.iter().find(|item| normalize_title(&item.title) == wanted) else {
            return Ok(None);
        };
        log::debug!("Catalog search matched {} to item {}", episode.label(), hit.item_id);

        let status = self
            .source
            .fetch_status(hit.item_id)
            .await
            .map_err(|e| AppError::Http(e.to_string()))?;
        let Some(transcription_id) = status.downloadable_id() else {
            return Ok(None);
        };

        let payload = self
            .source
            .fetch_text(hit.item_id, transcription_id)
            .await
            .map_err(|e| AppError::Http(e.to_string()))?;
        Ok(payload.filter(|p| !p.is_empty()).map(|p| p.text))
    }
}

// ── HTML heuristic ─────────────────────────────────────────────────────────

/// Looks for a transcript section on the episode's web page.
pub struct HtmlScrapeAdapter {
    client: reqwest::Client,
}

impl HtmlScrapeAdapter {
    pub fn new() -> Self {
        Self { client: http_client() }
    }
}

impl Default for HtmlScrapeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TranscriptAdapter for HtmlScrapeAdapter {
    fn name(&self) -> &'static str {
        "html_scrape"
    }

    fn origin(&self) -> TranscriptOrigin {
        TranscriptOrigin::HtmlScrape
    }

    fn applies_to(&self, episode: &Episode) -> bool {
        episode
            .link
            .as_deref()
            .map(|l| l.starts_with("http://") || l.starts_with("https://"))
            .unwrap_or(false)
    }

    async fn fetch(&self, episode: &Episode) -> AppResult<Option<String>> {
        let Some(link) = episode.link.as_deref() else {
            return Ok(None);
        };
        let (_, page) = get_text(&self.client, link).await?;
        Ok(scrape_transcript(&page))
    }
}

/// Find a container whose class or id mentions "transcript", or a
/// "Transcript" heading, and return the text after it.
pub fn scrape_transcript(page: &str) -> Option<String> {
    static CONTAINER: OnceLock<Option<Regex>> = OnceLock::new();
    static HEADING: OnceLock<Option<Regex>> = OnceLock::new();
    static SECTION_END: OnceLock<Option<Regex>> = OnceLock::new();
    let container = cached_regex(
        &CONTAINER,
        r#"(?is)<(?:div|section|article)[^>]*\b(?:class|id)\s*=\s*["'][^"']*transcript[^"']*["'][^>]*>"#,
    );
    let heading = cached_regex(
        &HEADING,
        r"(?is)<h[1-4][^>]*>\s*(?:full\s+|episode\s+)?transcript\s*:?\s*</h[1-4]>",
    );
    let section_end = cached_regex(&SECTION_END, r"(?i)</(?:section|article|main)>|<footer");

    let start = container
        .and_then(|re| re.find(page))
        .or_else(|| heading.and_then(|re| re.find(page)))
        .map(|m| m.end())?;
    let rest = &page[start..];
    let end = section_end
        .and_then(|re| re.find(rest))
        .map(|m| m.start())
        .unwrap_or(rest.len());

    let text = strip_html(&rest[..end]);
    (text.chars().count() >= MIN_SCRAPED_CHARS).then_some(text)
}
