//! reqwest-backed client for the transcription service REST API.

use super::{
    ActionOutcome, CatalogItem, Credential, SourceError, SourceResult, StatusInfo,
    TranscriptPayload, TranscriptSource,
};
use crate::config::ServiceConfig;
use crate::database::{SourceStatus, TranscriptWord};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on catalog pages so a misbehaving cursor cannot loop forever.
const MAX_CATALOG_PAGES: u32 = 200;

pub struct HttpTranscriptSource {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    transcription_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TranscriptResponse {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    words: Vec<TranscriptWord>,
}

#[derive(Debug, Deserialize)]
struct CatalogPage {
    #[serde(default)]
    items: Vec<CatalogItem>,
    #[serde(default)]
    next_page: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ResetRequest<'a> {
    user_id: &'a str,
}

impl HttpTranscriptSource {
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()
                .unwrap_or_default(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> SourceResult<T> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?;
        let response = check_status(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))
    }

    /// POST an authenticated action. Non-auth 4xx refusals come back as an
    /// unsuccessful outcome rather than an error.
    async fn post_action<B: Serialize + ?Sized>(
        &self,
        url: &str,
        credential: &Credential,
        body: Option<&B>,
    ) -> SourceResult<ActionOutcome> {
        let mut request = self.client.post(url).bearer_auth(&credential.token);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        action_outcome(status, body)
    }
}

async fn check_status(response: reqwest::Response) -> SourceResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(error_for_status(status, body))
}

fn error_for_status(status: StatusCode, body: String) -> SourceError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SourceError::Unauthorized(body),
        StatusCode::NOT_FOUND => SourceError::NotFound(body),
        _ => SourceError::Http {
            status: status.as_u16(),
            body,
        },
    }
}

fn action_outcome(status: StatusCode, body: String) -> SourceResult<ActionOutcome> {
    if status.is_success() {
        return Ok(serde_json::from_str::<ActionOutcome>(&body).unwrap_or_else(|_| ActionOutcome::ok()));
    }
    match status {
        // Already requested upstream; nothing left to do
        StatusCode::CONFLICT => Ok(ActionOutcome::ok()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(SourceError::Unauthorized(body)),
        s if s.is_client_error() => Ok(ActionOutcome::failed(format!("{}: {}", s, body))),
        s => Err(error_for_status(s, body)),
    }
}

#[async_trait]
impl TranscriptSource for HttpTranscriptSource {
    async fn fetch_status(&self, item_id: i64) -> SourceResult<StatusInfo> {
        let url = self.url(&format!("/items/{}/status", item_id));
        let response: StatusResponse = self.get_json(&url).await?;
        Ok(StatusInfo {
            status: SourceStatus::from(response.status),
            transcription_id: response.transcription_id.filter(|t| !t.is_empty()),
        })
    }

    async fn fetch_text(
        &self,
        item_id: i64,
        transcription_id: &str,
    ) -> SourceResult<Option<TranscriptPayload>> {
        let url = self.url(&format!("/items/{}/transcriptions/{}", item_id, transcription_id));
        let response: TranscriptResponse = match self.get_json(&url).await {
            Ok(r) => r,
            Err(SourceError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(payload_from_response(response))
    }

    async fn request_transcription(
        &self,
        item_id: i64,
        credential: &Credential,
    ) -> SourceResult<ActionOutcome> {
        let url = self.url(&format!("/items/{}/transcriptions", item_id));
        log::info!("Requesting transcription for item {}", item_id);
        self.post_action::<()>(&url, credential, None).await
    }

    async fn reset_transcription(
        &self,
        item_id: i64,
        credential: &Credential,
        user_id: &str,
    ) -> SourceResult<ActionOutcome> {
        let url = self.url(&format!("/items/{}/transcriptions/reset", item_id));
        log::info!("Resetting transcription for item {}", item_id);
        self.post_action(&url, credential, Some(&ResetRequest { user_id }))
            .await
    }

    async fn fetch_catalog(&self, catalog_id: i64) -> SourceResult<Vec<CatalogItem>> {
        let mut items = Vec::new();
        let mut page = 1u32;
        loop {
            let url = self.url(&format!("/catalogs/{}/items?page={}", catalog_id, page));
            let response: CatalogPage = self.get_json(&url).await?;
            items.extend(response.items);
            match response.next_page {
                Some(next) if next > page && next <= MAX_CATALOG_PAGES => page = next,
                _ => break,
            }
        }
        log::info!("Fetched {} catalog items for catalog {}", items.len(), catalog_id);
        Ok(items)
    }

    async fn search_catalog(&self, title: &str) -> SourceResult<Vec<CatalogItem>> {
        let url = reqwest::Url::parse_with_params(&self.url("/search"), &[("q", title)])
            .map_err(|e| SourceError::Decode(e.to_string()))?;
        let response: CatalogPage = self.get_json(url.as_str()).await?;
        Ok(response.items)
    }
}

/// Empty text is the "bogus done" shape and maps to `None`.
fn payload_from_response(response: TranscriptResponse) -> Option<TranscriptPayload> {
    let text = response.text.unwrap_or_default();
    if text.trim().is_empty() {
        let joined = response
            .words
            .iter()
            .map(|w| w.word.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        if joined.trim().is_empty() {
            return None;
        }
        return Some(TranscriptPayload {
            text: joined,
            words: response.words,
        });
    }
    Some(TranscriptPayload {
        text,
        words: response.words,
    })
}
