//! Logging & crash reporting for the rfs tools
//!
//! Provides structured logging, log retention, panic handling with crash dumps, and
//! deadlock detection in debug builds.

mod panic_hook;
mod logging;

pub use panic_hook::init_panic_hook;
pub use logging::{cleanup_old_logs, init_logging, LogGuard, LogSettings};

use directories::ProjectDirs;
use std::path::PathBuf;

/// Get the default log directory
pub fn log_dir() -> PathBuf {
    ProjectDirs::from("com", "rfs", "rfs")
        .map(|dirs| dirs.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("./logs"))
}

/// Initialize all observability features
///
/// The returned guard flushes the file writer on drop; keep it alive until exit.
pub fn init(settings: &LogSettings) -> anyhow::Result<LogGuard> {
    let guard = init_logging(settings)?;
    init_panic_hook(settings.dir.clone());

    if settings.retain_days > 0 {
        if let Err(e) = cleanup_old_logs(&settings.dir, settings.retain_days) {
            tracing::warn!("Log cleanup failed: {}", e);
        }
    }

    #[cfg(debug_assertions)]
    init_deadlock_detector();

    Ok(guard)
}

#[cfg(debug_assertions)]
fn init_deadlock_detector() {
    use std::thread;
    use std::time::Duration;

    let spawned = thread::Builder::new()
        .name("rfs-deadlock-detector".into())
        .spawn(|| loop {
            thread::sleep(Duration::from_secs(10));
            let deadlocks = parking_lot::deadlock::check_deadlock();
            if !deadlocks.is_empty() {
                tracing::error!("Deadlock detected!");
                for (i, threads) in deadlocks.iter().enumerate() {
                    tracing::error!("Deadlock #{}", i);
                    for t in threads {
                        tracing::error!("Thread Id {:#?}", t.thread_id());
                        tracing::error!("{:#?}", t.backtrace());
                    }
                }
            }
        });

    if let Err(e) = spawned {
        tracing::warn!("Deadlock detector not started: {}", e);
    }
}
