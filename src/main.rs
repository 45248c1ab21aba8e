use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use podcast_kb_lib::config::{EngineConfig, CONFIG_ENV_VAR};
use podcast_kb_lib::database::Database;
use podcast_kb_lib::worker::progress::{ProgressEvent, ProgressSink};
use podcast_kb_lib::{daily_sync_scheduler, init_logging, Engine};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "podcast-kb")]
#[command(about = "Keeps podcast transcripts in sync with a transcription service")]
#[command(version)]
struct Args {
    /// Path to config.yaml
    #[arg(short, long, env = CONFIG_ENV_VAR)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch feeds and pull whatever transcripts are ready (default)
    Sync {
        /// Only this source id
        #[arg(long)]
        source: Option<String>,
    },
    /// Request transcripts for episodes never sent to the service
    Request {
        #[arg(long = "source")]
        sources: Vec<String>,
    },
    /// Re-poll episodes the service is still working on
    Retry {
        #[arg(long = "source")]
        sources: Vec<String>,
    },
    /// Attach word timings to plain-text transcripts
    Enrich {
        #[arg(long = "source")]
        sources: Vec<String>,
    },
    /// Per-source episode counts
    Status,
    /// Run the daily sync schedule until interrupted
    Daemon,
}

#[derive(Serialize)]
struct SourceStatusReport {
    summary: podcast_kb_lib::database::SourceSummary,
    by_status: Vec<(String, i64)>,
}

fn load_config(path: Option<PathBuf>) -> Result<(EngineConfig, Option<PathBuf>)> {
    let Some(path) = path.or_else(EngineConfig::default_path) else {
        log::warn!("No config path available, using defaults");
        return Ok((EngineConfig::default(), None));
    };
    if !path.exists() {
        log::warn!("Config {:?} not found, using defaults", path);
        return Ok((EngineConfig::default(), path.parent().map(PathBuf::from)));
    }
    let config = EngineConfig::load(&path).with_context(|| format!("Failed to load {:?}", path))?;
    log::info!("Loaded config from {:?} ({} sources)", path, config.sources.len());
    Ok((config, path.parent().map(PathBuf::from)))
}

/// Forward progress events to the log at debug level.
fn spawn_progress_logger(mut rx: mpsc::Receiver<ProgressEvent>) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => log::debug!("progress {}", json),
                Err(e) => log::debug!("progress event not serializable: {}", e),
            }
        }
    });
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    let (config, config_dir) = load_config(args.config)?;
    let db_path = config
        .resolved_database_path()
        .context("Could not determine a database path")?;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {:?}", parent))?;
    }
    let db = Arc::new(Database::new(&db_path).context("Failed to initialize database")?);
    log::info!("Database: {:?}", db_path);

    let (sink, rx) = ProgressSink::channel(256);
    spawn_progress_logger(rx);

    let mut engine = Engine::new(db.clone(), config)?.with_progress(Arc::new(sink));
    if let Some(dir) = config_dir {
        engine = engine.with_env_dir(dir);
    }
    let engine = Arc::new(engine);

    let shutdown = CancellationToken::new();
    {
        let engine = engine.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("Interrupt received, stopping");
                shutdown.cancel();
                engine.stop();
            }
        });
    }

    let filter = |sources: Vec<String>| (!sources.is_empty()).then_some(sources);

    match args.command.unwrap_or(Command::Sync { source: None }) {
        Command::Sync { source: Some(id) } => print_json(&engine.sync_source(&id).await?)?,
        Command::Sync { source: None } => print_json(&engine.sync_all().await?)?,
        Command::Request { sources } => {
            let ids = filter(sources);
            print_json(&engine.request_transcripts(ids.as_deref()).await?)?
        }
        Command::Retry { sources } => {
            let ids = filter(sources);
            print_json(&engine.retry_processing(ids.as_deref()).await?)?
        }
        Command::Enrich { sources } => {
            let ids = filter(sources);
            print_json(&engine.enrich(ids.as_deref()).await?)?
        }
        Command::Status => {
            let mut reports = Vec::new();
            for source in &engine.config().sources {
                reports.push(SourceStatusReport {
                    summary: db.get_source_summary(&source.id)?,
                    by_status: db.count_by_status(&source.id)?,
                });
            }
            print_json(&reports)?
        }
        Command::Daemon => daily_sync_scheduler(engine.clone(), shutdown).await,
    }

    Ok(())
}
