//! Bounded concurrency pool.
//!
//! `concurrency` workers share one claim counter; each takes the next
//! unclaimed index until the input is exhausted. Workers run as futures
//! on the calling task, so "concurrent" means interleaved at await points.
//! Results land in input order regardless of completion order.

use futures_util::future::join_all;
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    pub concurrency: usize,
    /// Delay before starting each item past the first `concurrency`.
    pub stagger: Duration,
}

impl PoolOptions {
    pub fn new(concurrency: usize, stagger: Duration) -> Self {
        Self {
            concurrency: concurrency.max(1),
            stagger,
        }
    }
}

/// Run `op` over `items` with at most `options.concurrency` in flight.
///
/// `on_progress(completed, total)` fires after each item. An operation
/// that panics leaves `None` in its slot; siblings keep going. Operations
/// that can fail should encode the failure in `R`.
pub async fn run_pool<T, R, F, Fut>(
    items: Vec<T>,
    options: PoolOptions,
    on_progress: Option<&(dyn Fn(usize, usize) + Sync)>,
    op: F,
) -> Vec<Option<R>>
where
    F: Fn(T, usize) -> Fut,
    Fut: Future<Output = R>,
{
    let total = items.len();
    if total == 0 {
        return Vec::new();
    }

    let concurrency = options.concurrency.max(1).min(total);
    let pending: Mutex<Vec<Option<T>>> = Mutex::new(items.into_iter().map(Some).collect());
    let results: Mutex<Vec<Option<R>>> = Mutex::new((0..total).map(|_| None).collect());
    let next = AtomicUsize::new(0);
    let completed = AtomicUsize::new(0);

    let worker = |worker_id: usize| {
        let pending = &pending;
        let results = &results;
        let next = &next;
        let completed = &completed;
        let op = &op;
        async move {
            loop {
                let index = next.fetch_add(1, Ordering::SeqCst);
                if index >= total {
                    break;
                }
                let item = match pending.lock() {
                    Ok(mut guard) => guard[index].take(),
                    Err(_) => None,
                };
                let Some(item) = item else { continue };

                if index >= concurrency && !options.stagger.is_zero() {
                    tokio::time::sleep(options.stagger).await;
                }

                match AssertUnwindSafe(op(item, index)).catch_unwind().await {
                    Ok(result) => {
                        if let Ok(mut guard) = results.lock() {
                            guard[index] = Some(result);
                        }
                    }
                    Err(_) => {
                        log::error!("Pool worker {}: task {} panicked", worker_id, index);
                    }
                }

                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(cb) = on_progress {
                    cb(done, total);
                }
            }
        }
    };

    join_all((0..concurrency).map(worker)).await;

    results
        .into_inner()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
