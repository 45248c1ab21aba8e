//! Podcast feed fetching and decoding.

use crate::config::ExclusionRule;
use crate::database::NewEpisode;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

/// Fetches raw feed bytes. Split out so the orchestrator can be driven
/// from fixtures.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> AppResult<Vec<u8>>;
}

pub struct HttpFeedFetcher {
    client: reqwest::Client,
}

impl HttpFeedFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(30))
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for HttpFeedFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FeedFetcher for HttpFeedFetcher {
    async fn fetch(&self, url: &str) -> AppResult<Vec<u8>> {
        log::info!("Fetching RSS from: {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AppError::Feed(format!("Failed to fetch RSS: {}", e)))?;
        if !response.status().is_success() {
            return Err(AppError::Feed(format!(
                "RSS fetch failed with status: {}",
                response.status()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| AppError::Feed(format!("Failed to read RSS body: {}", e)))?;
        Ok(body.to_vec())
    }
}

/// Compiled exclusion rules; first match wins.
pub struct ExclusionMatcher {
    rules: Vec<(Regex, String)>,
}

impl ExclusionMatcher {
    pub fn new(rules: &[ExclusionRule]) -> AppResult<Self> {
        let rules = rules
            .iter()
            .map(|r| {
                Regex::new(&r.pattern)
                    .map(|re| (re, r.tag.clone()))
                    .map_err(|e| AppError::Config(format!("Invalid exclusion pattern '{}': {}", r.pattern, e)))
            })
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn tag_for(&self, title: &str) -> Option<String> {
        self.rules
            .iter()
            .find(|(re, _)| re.is_match(title))
            .map(|(_, tag)| tag.clone())
    }
}

/// Decode a feed into episodes for `source_id`, newest first, capped at
/// `max_items`.
pub fn parse_feed(
    body: &[u8],
    source_id: &str,
    max_items: usize,
    exclusions: &ExclusionMatcher,
) -> AppResult<Vec<NewEpisode>> {
    let feed = feed_rs::parser::parse(body)
        .map_err(|e| AppError::Feed(format!("Failed to parse RSS: {}", e)))?;

    log::info!("Parsed {} entries from RSS feed", feed.entries.len());

    let transcript_links = extract_transcript_links(&String::from_utf8_lossy(body));

    let mut entries = feed.entries;
    // Newest first; undated items sort last
    entries.sort_by(|a, b| b.published.cmp(&a.published));
    entries.truncate(max_items);

    let episodes = entries
        .into_iter()
        .map(|entry| {
            let guid = entry.id.trim().to_string();
            let title = entry
                .title
                .map(|t| t.content.trim().to_string())
                .unwrap_or_default();

            let audio_url = entry
                .media
                .first()
                .and_then(|m| m.content.first())
                .and_then(|c| c.url.as_ref())
                .map(|u| u.to_string())
                .or_else(|| {
                    entry
                        .links
                        .iter()
                        .find(|l| {
                            l.media_type
                                .as_deref()
                                .map(|t| t.starts_with("audio/"))
                                .unwrap_or(false)
                        })
                        .map(|l| l.href.clone())
                });

            let link = entry
                .links
                .iter()
                .find(|l| {
                    !l.media_type
                        .as_deref()
                        .map(|t| t.starts_with("audio/"))
                        .unwrap_or(false)
                })
                .map(|l| l.href.clone());

            NewEpisode {
                source_id: source_id.to_string(),
                transcript_url: transcript_links.get(&guid).cloned(),
                exclusion_tag: exclusions.tag_for(&title),
                guid,
                description: entry.summary.map(|s| s.content),
                audio_url,
                link,
                published_date: entry.published.map(crate::database::format_timestamp),
                source_item_id: None,
                title,
            }
        })
        .collect();

    Ok(episodes)
}

/// Title key for matching feed items to catalog items: trimmed, case-folded.
pub fn normalize_title(title: &str) -> String {
    title.trim().to_lowercase()
}

/// Compile `pattern` once into `cell`. `None` if it does not compile.
pub(crate) fn cached_regex(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

/// Map item guid to its `<podcast:transcript>` URL. Text formats are
/// preferred over JSON/HTML when an item lists several.
pub fn extract_transcript_links(xml: &str) -> HashMap<String, String> {
    static ITEM: OnceLock<Option<Regex>> = OnceLock::new();
    static GUID: OnceLock<Option<Regex>> = OnceLock::new();
    static TAG: OnceLock<Option<Regex>> = OnceLock::new();
    static ATTR: OnceLock<Option<Regex>> = OnceLock::new();

    let mut links = HashMap::new();
    let (Some(item_re), Some(guid_re), Some(tag_re), Some(attr_re)) = (
        cached_regex(&ITEM, r"(?s)<item\b.*?</item>"),
        cached_regex(&GUID, r"(?s)<guid\b[^>]*>(.*?)</guid>"),
        cached_regex(&TAG, r"<podcast:transcript\b[^>]*>"),
        cached_regex(&ATTR, r#"(\w+)\s*=\s*"([^"]*)""#),
    ) else {
        return links;
    };

    for item in item_re.find_iter(xml) {
        let item = item.as_str();
        let Some(guid) = guid_re
            .captures(item)
            .map(|c| unescape_xml(strip_cdata(&c[1])).trim().to_string())
        else {
            continue;
        };

        let mut best: Option<(u8, String)> = None;
        for tag in tag_re.find_iter(item) {
            let mut url = None;
            let mut mime = String::new();
            for attr in attr_re.captures_iter(tag.as_str()) {
                match &attr[1] {
                    "url" => url = Some(unescape_xml(&attr[2])),
                    "type" => mime = attr[2].to_ascii_lowercase(),
                    _ => {}
                }
            }
            let Some(url) = url else { continue };
            let rank = match mime.as_str() {
                "text/plain" => 0,
                "text/vtt" => 1,
                "application/x-subrip" | "application/srt" => 2,
                "text/html" => 3,
                _ => 4,
            };
            if best.as_ref().map(|(r, _)| rank < *r).unwrap_or(true) {
                best = Some((rank, url));
            }
        }
        if let Some((_, url)) = best {
            links.insert(guid, url);
        }
    }
    links
}

fn strip_cdata(s: &str) -> &str {
    let t = s.trim();
    t.strip_prefix("<![CDATA[")
        .and_then(|r| r.strip_suffix("]]>"))
        .unwrap_or(t)
}

fn unescape_xml(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
