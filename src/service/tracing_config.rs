use std::path::Path;

use dotenv::dotenv;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use super::{AppError, AppResult};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Console-only subscriber, used by tests and local runs.
///
/// Safe to call more than once; only the first call installs the subscriber.
pub fn setup_local_tracing() -> AppResult<()> {
    // load .env file
    dotenv().ok();
    let timer = ChronoLocal::new(TIME_FORMAT.to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_line_number(true);
    // a second initialisation in the same process is not an error for us
    let _ = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter("info"))
        .try_init();
    Ok(())
}

/// Console plus an hourly rolling file under `log_dir`.
///
/// The returned guard flushes the non-blocking file writer on drop, keep it
/// alive for the lifetime of the process.
pub fn setup_tracing<P: AsRef<Path>>(log_dir: P, default_level: &str) -> AppResult<WorkerGuard> {
    dotenv().ok();
    let file_appender = tracing_appender::rolling::hourly(log_dir, "stonenet.log");
    let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);

    // write to both the console and the log file
    let writer = non_blocking.and(std::io::stdout);

    let timer = ChronoLocal::new(TIME_FORMAT.to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(writer);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter(default_level))
        .try_init()
        .map_err(|e| AppError::IllegalStateError(format!("tracing already initialised: {e}")))?;

    Ok(worker_guard)
}
