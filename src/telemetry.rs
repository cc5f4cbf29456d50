//! JSON trace log for debugging turn taking after the fact.

use crate::config::AppConfig;
use std::env;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::Level;
use tracing_subscriber::fmt::time::UtcTime;

static TRACE_FILE: OnceLock<Option<PathBuf>> = OnceLock::new();

pub fn tracing_log_path() -> PathBuf {
    env::var("VOXDUPLEX_TRACE_LOG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| env::temp_dir().join("voxduplex_trace.jsonl"))
}

/// Install the JSON file subscriber once and return the file it writes to.
///
/// Returns `None` when file logging is off (`--logs` unset or `--no-logs`) or
/// the file cannot be opened. Stage, capture and playback threads are named, so
/// thread names are kept on every record.
pub fn init_tracing(config: &AppConfig) -> Option<PathBuf> {
    if !config.logs || config.no_logs {
        return None;
    }

    TRACE_FILE
        .get_or_init(|| {
            let path = tracing_log_path();
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .ok()?;
            let subscriber = tracing_subscriber::fmt()
                .json()
                .with_timer(UtcTime::rfc_3339())
                .with_max_level(Level::DEBUG)
                .with_thread_names(true)
                .with_writer(file)
                .with_current_span(false)
                .with_span_list(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber).ok()?;
            Some(path)
        })
        .clone()
}
