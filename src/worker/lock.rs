//! In-process mutation lock over the episode set.
//!
//! Sync, request and enrichment runs all rewrite episode rows, so only one
//! may run at a time. A holder older than the timeout is treated as
//! abandoned and replaced.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Holder {
    run_id: Uuid,
    kind: String,
    acquired_at: Instant,
}

#[derive(Debug, Clone)]
pub struct OperationLock {
    holder: Arc<Mutex<Option<Holder>>>,
    timeout: Duration,
}

/// Releases the lock on drop, but only if it still owns it.
#[derive(Debug)]
pub struct RunGuard {
    holder: Arc<Mutex<Option<Holder>>>,
    run_id: Uuid,
    kind: String,
}

impl RunGuard {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.holder.lock() {
            if slot.as_ref().map(|h| h.run_id) == Some(self.run_id) {
                *slot = None;
            }
        }
    }
}

impl OperationLock {
    pub fn new(timeout: Duration) -> Self {
        Self {
            holder: Arc::new(Mutex::new(None)),
            timeout,
        }
    }

    /// Take the lock for a `kind` run ("sync", "request", ...).
    /// `Err` carries the kind of the run currently holding it.
    pub fn try_acquire(&self, kind: &str) -> Result<RunGuard, String> {
        let mut slot = self
            .holder
            .lock()
            .map_err(|_| "operation lock poisoned".to_string())?;

        if let Some(current) = slot.as_ref() {
            let held_for = current.acquired_at.elapsed();
            if held_for < self.timeout {
                return Err(current.kind.clone());
            }
            log::warn!(
                "Treating stuck {} run {} as abandoned after {:?}",
                current.kind,
                current.run_id,
                held_for
            );
        }

        let run_id = Uuid::new_v4();
        *slot = Some(Holder {
            run_id,
            kind: kind.to_string(),
            acquired_at: Instant::now(),
        });
        log::info!("Acquired operation lock for {} run {}", kind, run_id);

        Ok(RunGuard {
            holder: self.holder.clone(),
            run_id,
            kind: kind.to_string(),
        })
    }

    /// Kind of the live (non-stale) holder, if any.
    pub fn current(&self) -> Option<String> {
        let slot = self.holder.lock().ok()?;
        slot.as_ref()
            .filter(|h| h.acquired_at.elapsed() < self.timeout)
            .map(|h| h.kind.clone())
    }
}
