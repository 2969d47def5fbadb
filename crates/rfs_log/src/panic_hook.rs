//! Panic hook for crash reporting

use backtrace::Backtrace;
use chrono::{DateTime, Local};
use std::panic::PanicHookInfo;
use std::path::{Path, PathBuf};

/// Initialize the panic hook; crash dumps are written to `dump_dir`
pub fn init_panic_hook(dump_dir: PathBuf) {
    std::panic::set_hook(Box::new(move |info: &PanicHookInfo<'_>| {
        panic_handler(info, &dump_dir)
    }));
    tracing::debug!("Panic hook initialized");
}

fn panic_handler(info: &PanicHookInfo, dump_dir: &Path) {
    let backtrace = Backtrace::new();
    let thread = std::thread::current();
    let thread_name = thread.name().unwrap_or("<unnamed>");
    let now = Local::now();

    let payload = info
        .payload()
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| info.payload().downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<unknown>");

    let report = format!(
        "=== CRITICAL PANIC ===\n\
         Timestamp: {}\n\
         Thread: {}\n\
         Location: {:?}\n\
         Payload: {}\n\n\
         Stack Trace:\n{:?}",
        now.to_rfc3339(),
        thread_name,
        info.location(),
        payload,
        backtrace
    );

    // stderr first, it is always available
    eprintln!("{}", report);
    tracing::error!("{}", report);

    let dump_path = dump_dir.join(dump_file_name(&now));
    let written = std::fs::create_dir_all(dump_dir).and_then(|_| std::fs::write(&dump_path, &report));
    match written {
        Ok(()) => eprintln!("Crash report written to {}", dump_path.display()),
        Err(e) => eprintln!("Failed to write crash dump: {}", e),
    }
}

fn dump_file_name(now: &DateTime<Local>) -> String {
    format!("rfs_crash_{}.txt", now.format("%Y%m%d_%H%M%S"))
}
