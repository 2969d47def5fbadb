//! Structured logging setup with tracing

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// File name prefix of the rolling log
const LOG_FILE: &str = "rfs.log";

/// Logging options
#[derive(Debug, Clone)]
pub struct LogSettings {
    /// Default filter directive when RUST_LOG is unset
    pub level: String,
    /// Directory for rolling log files and crash dumps
    pub dir: PathBuf,
    /// Write JSON logs to `dir`
    pub json_file: bool,
    /// Remove log files older than this many days at startup (0 keeps everything)
    pub retain_days: u32,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: super::log_dir(),
            json_file: true,
            retain_days: 7,
        }
    }
}

/// Keeps the non-blocking file writer alive; buffered lines are flushed on drop
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Initialize the logging system
pub fn init_logging(settings: &LogSettings) -> anyhow::Result<LogGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = if settings.json_file {
        std::fs::create_dir_all(&settings.dir)?;
        let file_appender = RollingFileAppender::new(Rotation::DAILY, &settings.dir, LOG_FILE);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        (
            Some(fmt::layer().json().with_writer(non_blocking)),
            Some(guard),
        )
    } else {
        (None, None)
    };

    #[cfg(debug_assertions)]
    {
        // Development: pretty console output
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty().with_writer(std::io::stderr))
            .with(file_layer)
            .try_init()?;
    }

    #[cfg(not(debug_assertions))]
    {
        // Release: compact console output
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .with(file_layer)
            .try_init()?;
    }

    tracing::info!("Logging initialized");
    Ok(LogGuard { _file: guard })
}

/// Remove log files in `dir` older than `days`
///
/// Matches the rolling files (`rfs.log.YYYY-MM-DD`) and anything else with `.log` in its
/// name. Returns the number of files deleted.
pub fn cleanup_old_logs(dir: &Path, days: u32) -> anyhow::Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let age = Duration::from_secs(u64::from(days) * 24 * 60 * 60);
    let Some(threshold) = SystemTime::now().checked_sub(age) else {
        return Ok(0);
    };
    let mut deleted = 0;

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        let is_log = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.contains(".log"));
        if !is_log {
            continue;
        }

        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        if modified < threshold && std::fs::remove_file(&path).is_ok() {
            deleted += 1;
            tracing::debug!("Deleted old log: {:?}", path);
        }
    }

    tracing::info!("Cleaned up {} old log files", deleted);
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use tempfile::TempDir;

    fn age_file(path: &Path, days: u64) {
        let when = SystemTime::now() - Duration::from_secs(days * 24 * 60 * 60);
        filetime::set_file_mtime(path, FileTime::from_system_time(when)).unwrap();
    }

    #[test]
    fn test_cleanup_removes_only_old_logs() {
        let temp = TempDir::new().unwrap();
        let old_log = temp.path().join("rfs.log.2026-01-01");
        let new_log = temp.path().join("rfs.log.2026-10-19");
        let old_other = temp.path().join("notes.txt");

        for path in [&old_log, &new_log, &old_other] {
            std::fs::write(path, b"line\n").unwrap();
        }
        age_file(&old_log, 30);
        age_file(&old_other, 30);

        let deleted = cleanup_old_logs(temp.path(), 7).unwrap();
        assert_eq!(deleted, 1);
        assert!(!old_log.exists());
        assert!(new_log.exists());
        assert!(old_other.exists());
    }

    #[test]
    fn test_cleanup_missing_dir() {
        let temp = TempDir::new().unwrap();
        assert_eq!(cleanup_old_logs(&temp.path().join("absent"), 7).unwrap(), 0);
    }
}
