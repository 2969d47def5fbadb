//! rfs-watch - report changes under a directory through the polling watch service

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use clap::Parser;
use rfs_fs::{Config, EventKind, FileSystemRegistry, FsPath, LocalBackend, StorageBackend, WatchEvent};
use rfs_log::LogSettings;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Watch a directory for created, modified and deleted entries
#[derive(Parser, Debug)]
#[command(name = "rfs-watch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Host directory served as the filesystem root
    root: PathBuf,

    /// Directory to watch, inside ROOT
    #[arg(default_value = "/")]
    dir: String,

    /// Event kinds to report
    #[arg(long, value_delimiter = ',', default_value = "created,modified,deleted")]
    kinds: Vec<EventKind>,

    /// Poll period in milliseconds (overrides the config file)
    #[arg(long, env = "RFS_POLL_INTERVAL_MS")]
    interval_ms: Option<u64>,

    /// Exit after this many seconds without a change
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Poll from a background thread instead of the waiting caller
    #[arg(long)]
    background: bool,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,

    /// Configuration file (default: platform config directory)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Serialize)]
struct EventRecord<'a> {
    kind: EventKind,
    path: &'a FsPath,
    count: u32,
    timestamp: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, config_error) = match &cli.config {
        Some(path) => (
            Config::load_from(path)
                .with_context(|| format!("failed to load configuration from {}", path.display()))?,
            None,
        ),
        None => load_or_default(&Config::config_path()),
    };

    // Logging and panic hook before anything touches the filesystem
    let _log_guard = rfs_log::init(&LogSettings {
        level: config.logging.level.clone(),
        dir: rfs_log::log_dir(),
        json_file: config.logging.json_file,
        retain_days: config.logging.retain_days,
    })?;

    tracing::info!("rfs-watch starting...");
    if let Some(e) = config_error {
        tracing::warn!("Using default configuration: {:#}", e);
    }

    let mut watch = config.watch.clone();
    if let Some(ms) = cli.interval_ms {
        watch.poll_interval_ms = ms;
    }
    if cli.background {
        watch.background_polling = true;
    }

    let backend: Arc<dyn StorageBackend> = Arc::new(
        LocalBackend::new(&cli.root)
            .with_context(|| format!("cannot serve {}", cli.root.display()))?,
    );

    let registry = FileSystemRegistry::new();
    let fs = registry.open(&format!("local:{}", cli.root.display()), backend)?;
    let dir = fs.path(&cli.dir)?.to_absolute();

    let service = fs.new_watch_service(&watch)?;
    let key = service.register(&dir, &cli.kinds)?;
    tracing::info!("Watching {} under {}", key.watchable(), cli.root.display());

    loop {
        let signalled = match cli.timeout_secs {
            Some(secs) => match service.poll_timeout(Duration::from_secs(secs))? {
                Some(key) => key,
                None => {
                    tracing::info!("No changes for {}s, exiting", secs);
                    break;
                }
            },
            None => service.take()?,
        };

        for event in signalled.poll_events() {
            print_event(&event, cli.json)?;
        }

        if !signalled.is_valid() {
            tracing::warn!("Watch on {} was cancelled", signalled.watchable());
            break;
        }
        signalled.reset();
    }

    registry.close_all();
    Ok(())
}

/// Load the configuration, falling back to defaults on error
///
/// The error is handed back so it can be logged once logging is up.
fn load_or_default(path: &Path) -> (Config, Option<anyhow::Error>) {
    match Config::load_from(path) {
        Ok(config) => (config, None),
        Err(e) => (
            Config::default(),
            Some(e.context(format!("failed to load configuration from {}", path.display()))),
        ),
    }
}

fn print_event(event: &WatchEvent, json: bool) -> Result<()> {
    let timestamp = DateTime::<Local>::from(event.timestamp()).to_rfc3339();

    if json {
        let record = EventRecord {
            kind: event.kind(),
            path: event.path(),
            count: event.count(),
            timestamp,
        };
        println!("{}", serde_json::to_string(&record)?);
    } else {
        println!(
            "{:<8} {} (#{}) {}",
            event.kind(),
            event.path(),
            event.count(),
            timestamp
        );
    }
    Ok(())
}
