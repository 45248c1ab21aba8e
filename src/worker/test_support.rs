//! Fixtures shared by the worker tests.

use crate::database::{Database, Episode, NewEpisode};
use crate::error::{AppError, AppResult};
use crate::feed::FeedFetcher;
use async_trait::async_trait;
use std::sync::Arc;
use tempfile::TempDir;

/// Serves one fixed body for every URL, or fails every fetch when `None`.
pub(crate) struct StaticFeed(pub Option<&'static str>);

#[async_trait]
impl FeedFetcher for StaticFeed {
    async fn fetch(&self, _url: &str) -> AppResult<Vec<u8>> {
        match self.0 {
            Some(body) => Ok(body.as_bytes().to_vec()),
            None => Err(AppError::Feed("connection refused".into())),
        }
    }
}

pub(crate) fn temp_db() -> (TempDir, Arc<Database>) {
    let dir = TempDir::new().unwrap();
    let db = Database::new(&dir.path().join("test.db")).unwrap();
    (dir, Arc::new(db))
}

/// Insert `(guid, title, item_id)` rows for source "main" and return them
/// in insertion order.
pub(crate) fn seed(db: &Database, rows: &[(&str, &str, Option<i64>)]) -> Vec<Episode> {
    let new: Vec<NewEpisode> = rows
        .iter()
        .map(|(guid, title, item_id)| NewEpisode {
            source_id: "main".into(),
            guid: guid.to_string(),
            title: title.to_string(),
            source_item_id: *item_id,
            ..Default::default()
        })
        .collect();
    db.upsert_episodes(&new).unwrap();
    rows.iter()
        .map(|(guid, _, _)| db.get_episode("main", guid).unwrap().unwrap())
        .collect()
}
