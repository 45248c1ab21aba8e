//! Transcript service contract.
//!
//! The engine only talks to the service through [`TranscriptSource`], so
//! tests and alternative backends can stand in for the HTTP client.

pub mod client;
#[cfg(test)]
pub(crate) mod mock;

use crate::database::{SourceStatus, TranscriptWord};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use client::HttpTranscriptSource;

#[derive(Debug, Error)]
pub enum SourceError {
    /// 401/403-class rejection. Fatal to a request queue run.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Service returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid response: {0}")]
    Decode(String),
}

impl SourceError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

pub type SourceResult<T> = Result<T, SourceError>;

/// Status lookup result for one catalog item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusInfo {
    pub status: SourceStatus,
    pub transcription_id: Option<String>,
}

impl StatusInfo {
    pub fn new(status: SourceStatus, transcription_id: Option<&str>) -> Self {
        Self {
            status,
            transcription_id: transcription_id.map(str::to_string),
        }
    }

    /// `Done` with something to download.
    pub fn downloadable_id(&self) -> Option<&str> {
        match self.status {
            SourceStatus::Done => self.transcription_id.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptPayload {
    pub text: String,
    #[serde(default)]
    pub words: Vec<TranscriptWord>,
}

impl TranscriptPayload {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Outcome of a request/reset call that reached the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl ActionOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// One episode in the service's catalog for a show.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub item_id: i64,
    #[serde(default)]
    pub guid: Option<String>,
    pub title: String,
    #[serde(default)]
    pub published_date: Option<String>,
    #[serde(default)]
    pub audio_url: Option<String>,
}

/// Service API token plus the account id that reset calls need.
#[derive(Clone)]
pub struct Credential {
    pub token: String,
    pub user_id: Option<String>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("user_id", &self.user_id)
            .finish()
    }
}

impl Credential {
    /// Build a credential, deriving the user id from the token's claims
    /// when none is given explicitly.
    pub fn new(token: impl Into<String>, user_id: Option<String>) -> Self {
        let token = token.into();
        let user_id = user_id
            .filter(|u| !u.trim().is_empty())
            .or_else(|| user_id_from_token(&token));
        Self { token, user_id }
    }
}

/// Pull `sub` (or `user_id`) out of a JWT-shaped token's payload.
pub fn user_id_from_token(token: &str) -> Option<String> {
    let mut parts = token.split('.');
    let (_header, payload, _sig) = (parts.next()?, parts.next()?, parts.next()?);
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    ["sub", "user_id", "uid"].iter().find_map(|key| match claims.get(*key)? {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

#[async_trait]
pub trait TranscriptSource: Send + Sync {
    async fn fetch_status(&self, item_id: i64) -> SourceResult<StatusInfo>;

    /// `Ok(None)` when the service has no text for this transcription.
    async fn fetch_text(
        &self,
        item_id: i64,
        transcription_id: &str,
    ) -> SourceResult<Option<TranscriptPayload>>;

    async fn request_transcription(
        &self,
        item_id: i64,
        credential: &Credential,
    ) -> SourceResult<ActionOutcome>;

    async fn reset_transcription(
        &self,
        item_id: i64,
        credential: &Credential,
        user_id: &str,
    ) -> SourceResult<ActionOutcome>;

    /// Every episode the service knows for a show.
    async fn fetch_catalog(&self, catalog_id: i64) -> SourceResult<Vec<CatalogItem>>;

    /// Title search across the whole catalog.
    async fn search_catalog(&self, title: &str) -> SourceResult<Vec<CatalogItem>>;
}
