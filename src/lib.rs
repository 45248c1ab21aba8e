pub mod config;
pub mod database;
pub mod error;
pub mod fallback;
pub mod feed;
pub mod source;
pub mod worker;

pub use worker::Engine;

use chrono::{Local, NaiveDateTime};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use worker::timing::{sleep_or_cancel, SleepOutcome};

/// Install the fmt subscriber. `RUST_LOG` overrides the default `info`
/// filter; `log` records are bridged through the subscriber.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if let Err(e) = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init() {
        eprintln!("Logging already initialized: {}", e);
    }
}

/// Load a value from the .env file by key name
pub fn load_env_value(project_dir: &std::path::Path, key: &str) -> Option<String> {
    let env_path = project_dir.join(".env");
    let prefix = format!("{}=", key);
    let content = std::fs::read_to_string(&env_path).ok()?;
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.strip_prefix(&prefix))
        .map(|value| value.trim().trim_matches('"').trim_matches('\''))
        .find(|value| !value.is_empty())
        .map(str::to_string)
}

/// Next local time at `hour`:00, today if still ahead, otherwise tomorrow.
pub fn next_daily_run(now: NaiveDateTime, hour: u32) -> NaiveDateTime {
    let Some(today_target) = now.date().and_hms_opt(hour.min(23), 0, 0) else {
        return now + chrono::Duration::hours(24);
    };
    if now < today_target {
        today_target
    } else {
        today_target + chrono::Duration::days(1)
    }
}

/// Daily sync scheduler: sync every source, then re-poll in-flight
/// transcripts, once a day at `daily_sync_hour` local time.
pub async fn daily_sync_scheduler(engine: Arc<Engine>, shutdown: CancellationToken) {
    let hour = engine.config().daily_sync_hour;
    log::info!("Daily sync scheduler started (daily at {:02}:00)", hour);

    loop {
        let now = Local::now().naive_local();
        let next_run = next_daily_run(now, hour);
        let wait_duration = (next_run - now).to_std().unwrap_or(Duration::from_secs(3600));

        log::info!(
            "Next sync scheduled for {} (in {:.1} hours)",
            next_run.format("%Y-%m-%d %H:%M"),
            wait_duration.as_secs_f64() / 3600.0
        );

        if sleep_or_cancel(wait_duration, &shutdown).await == SleepOutcome::Cancelled {
            log::info!("Daily sync scheduler shutting down");
            return;
        }

        log::info!("Running scheduled sync...");
        match engine.sync_all().await {
            Ok(result) => {
                log::info!("Scheduled sync: {}", result.summary());
                for err in &result.errors {
                    log::warn!("Scheduled sync: {}", err);
                }
            }
            Err(e) => log::error!("Scheduled sync skipped: {}", e),
        }

        match engine.retry_processing(None).await {
            Ok(result) => log::info!("Scheduled retry: {}", result.summary()),
            Err(e) => log::error!("Scheduled retry skipped: {}", e),
        }
    }
}
