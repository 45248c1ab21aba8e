//! Scripted in-memory [`TranscriptSource`] for engine tests.

use super::{
    ActionOutcome, CatalogItem, Credential, SourceError, SourceResult, StatusInfo,
    TranscriptPayload, TranscriptSource,
};
use crate::database::{SourceStatus, TranscriptWord};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum MockAction {
    Ok,
    Refused(String),
    Unauthorized,
}

#[derive(Default)]
struct State {
    /// Status sequence per item; the last entry repeats forever. `None`
    /// answers that lookup with a transport error.
    statuses: HashMap<i64, VecDeque<Option<StatusInfo>>>,
    status_errors: HashSet<i64>,
    status_delays: HashMap<i64, Duration>,
    texts: HashMap<(i64, String), TranscriptPayload>,
    requests: HashMap<i64, MockAction>,
    resets: HashMap<i64, MockAction>,
    catalogs: HashMap<i64, Vec<CatalogItem>>,
    search: Vec<CatalogItem>,

    status_calls: Vec<i64>,
    text_calls: Vec<i64>,
    request_calls: Vec<i64>,
    reset_calls: Vec<(i64, String)>,
    active: HashMap<i64, usize>,
    peak_per_item: usize,
}

pub(crate) struct MockSource {
    state: Mutex<State>,
    latency: Duration,
}

impl MockSource {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            latency: Duration::from_millis(5),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_statuses(self, item_id: i64, statuses: Vec<StatusInfo>) -> Self {
        self.with_status_script(item_id, statuses.into_iter().map(Some).collect())
    }

    pub fn with_status_script(self, item_id: i64, script: Vec<Option<StatusInfo>>) -> Self {
        self.state.lock().unwrap().statuses.insert(item_id, script.into());
        self
    }

    /// Status lookups for `item_id` take `delay` instead of the base latency.
    pub fn with_status_delay(self, item_id: i64, delay: Duration) -> Self {
        self.state.lock().unwrap().status_delays.insert(item_id, delay);
        self
    }

    pub fn with_status(self, item_id: i64, status: SourceStatus, transcription_id: Option<&str>) -> Self {
        self.with_statuses(item_id, vec![StatusInfo::new(status, transcription_id)])
    }

    pub fn with_status_error(self, item_id: i64) -> Self {
        self.state.lock().unwrap().status_errors.insert(item_id);
        self
    }

    pub fn with_text(self, item_id: i64, transcription_id: &str, text: &str) -> Self {
        let words = text
            .split_whitespace()
            .enumerate()
            .map(|(i, w)| TranscriptWord {
                word: w.to_string(),
                start: i as f64,
                end: i as f64 + 0.5,
                speaker: None,
                confidence: Some(0.9),
            })
            .collect();
        self.state.lock().unwrap().texts.insert(
            (item_id, transcription_id.to_string()),
            TranscriptPayload {
                text: text.to_string(),
                words,
            },
        );
        self
    }

    pub fn with_request(self, item_id: i64, action: MockAction) -> Self {
        self.state.lock().unwrap().requests.insert(item_id, action);
        self
    }

    pub fn with_reset(self, item_id: i64, action: MockAction) -> Self {
        self.state.lock().unwrap().resets.insert(item_id, action);
        self
    }

    pub fn with_catalog(self, catalog_id: i64, items: Vec<CatalogItem>) -> Self {
        self.state.lock().unwrap().catalogs.insert(catalog_id, items);
        self
    }

    pub fn with_search(self, items: Vec<CatalogItem>) -> Self {
        self.state.lock().unwrap().search = items;
        self
    }

    pub fn status_calls(&self, item_id: i64) -> usize {
        self.state.lock().unwrap().status_calls.iter().filter(|i| **i == item_id).count()
    }

    pub fn text_calls(&self) -> usize {
        self.state.lock().unwrap().text_calls.len()
    }

    pub fn request_calls(&self) -> Vec<i64> {
        self.state.lock().unwrap().request_calls.clone()
    }

    pub fn reset_calls(&self) -> Vec<(i64, String)> {
        self.state.lock().unwrap().reset_calls.clone()
    }

    /// Highest number of overlapping calls seen for any single item.
    pub fn peak_calls_per_item(&self) -> usize {
        self.state.lock().unwrap().peak_per_item
    }

    fn enter(&self, item_id: i64) {
        let mut state = self.state.lock().unwrap();
        let active = state.active.entry(item_id).or_insert(0);
        *active += 1;
        let now = *active;
        state.peak_per_item = state.peak_per_item.max(now);
    }

    fn leave(&self, item_id: i64) {
        if let Some(active) = self.state.lock().unwrap().active.get_mut(&item_id) {
            *active -= 1;
        }
    }

    async fn call<T>(&self, item_id: i64, f: impl FnOnce(&mut State) -> T) -> T {
        self.call_after(item_id, self.latency, f).await
    }

    async fn call_after<T>(&self, item_id: i64, latency: Duration, f: impl FnOnce(&mut State) -> T) -> T {
        self.enter(item_id);
        tokio::time::sleep(latency).await;
        let result = f(&mut self.state.lock().unwrap());
        self.leave(item_id);
        result
    }
}

fn action_result(action: Option<&MockAction>) -> SourceResult<ActionOutcome> {
    match action.cloned().unwrap_or(MockAction::Ok) {
        MockAction::Ok => Ok(ActionOutcome::ok()),
        MockAction::Refused(reason) => Ok(ActionOutcome::failed(reason)),
        MockAction::Unauthorized => Err(SourceError::Unauthorized("token rejected".into())),
    }
}

#[async_trait]
impl TranscriptSource for MockSource {
    async fn fetch_status(&self, item_id: i64) -> SourceResult<StatusInfo> {
        let latency = self
            .state
            .lock()
            .unwrap()
            .status_delays
            .get(&item_id)
            .copied()
            .unwrap_or(self.latency);
        self.call_after(item_id, latency, |state| {
            state.status_calls.push(item_id);
            if state.status_errors.contains(&item_id) {
                return Err(SourceError::Transport("connection reset".into()));
            }
            let Some(queue) = state.statuses.get_mut(&item_id) else {
                return Err(SourceError::NotFound(format!("item {}", item_id)));
            };
            let current = queue
                .front()
                .cloned()
                .unwrap_or_else(|| Some(StatusInfo::new(SourceStatus::Unknown, None)));
            if queue.len() > 1 {
                queue.pop_front();
            }
            current.ok_or_else(|| SourceError::Transport("connection timed out".into()))
        })
        .await
    }

    async fn fetch_text(
        &self,
        item_id: i64,
        transcription_id: &str,
    ) -> SourceResult<Option<TranscriptPayload>> {
        self.call(item_id, |state| {
            state.text_calls.push(item_id);
            Ok(state.texts.get(&(item_id, transcription_id.to_string())).cloned())
        })
        .await
    }

    async fn request_transcription(
        &self,
        item_id: i64,
        _credential: &Credential,
    ) -> SourceResult<ActionOutcome> {
        self.call(item_id, |state| {
            state.request_calls.push(item_id);
            action_result(state.requests.get(&item_id))
        })
        .await
    }

    async fn reset_transcription(
        &self,
        item_id: i64,
        _credential: &Credential,
        user_id: &str,
    ) -> SourceResult<ActionOutcome> {
        self.call(item_id, |state| {
            state.reset_calls.push((item_id, user_id.to_string()));
            action_result(state.resets.get(&item_id))
        })
        .await
    }

    async fn fetch_catalog(&self, catalog_id: i64) -> SourceResult<Vec<CatalogItem>> {
        tokio::time::sleep(self.latency).await;
        let state = self.state.lock().unwrap();
        state
            .catalogs
            .get(&catalog_id)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("catalog {}", catalog_id)))
    }

    async fn search_catalog(&self, _title: &str) -> SourceResult<Vec<CatalogItem>> {
        tokio::time::sleep(self.latency).await;
        Ok(self.state.lock().unwrap().search.clone())
    }
}

pub(crate) fn catalog_item(item_id: i64, guid: Option<&str>, title: &str) -> CatalogItem {
    CatalogItem {
        item_id,
        guid: guid.map(str::to_string),
        title: title.to_string(),
        published_date: None,
        audio_url: None,
    }
}
