use crate::errors::CuesyncError;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 4096;

#[derive(Debug, Clone)]
pub struct JsonlLogger {
    pub path: PathBuf,
    pub max_payload_bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent<'a> {
    pub level: &'a str,
    pub event_type: &'a str,
    pub payload: Value,
    pub ts_unix_ms: u64,
}

impl JsonlLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    pub fn append(&self, event: &LogEvent<'_>) -> Result<(), CuesyncError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| CuesyncError::Io(e.to_string()))?;
        }
        let line = serde_json::to_string(&LogEvent {
            level: event.level,
            event_type: event.event_type,
            payload: truncate_json(event.payload.clone(), self.max_payload_bytes),
            ts_unix_ms: event.ts_unix_ms,
        })
        .map_err(|e| CuesyncError::Io(e.to_string()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| CuesyncError::Io(e.to_string()))?;
        writeln!(file, "{line}").map_err(|e| CuesyncError::Io(e.to_string()))
    }
}

static RUN_LOGGER: OnceLock<Mutex<Option<JsonlLogger>>> = OnceLock::new();

fn logger_slot() -> &'static Mutex<Option<JsonlLogger>> {
    RUN_LOGGER.get_or_init(|| Mutex::new(None))
}

/// Install the process-wide run logger. Later calls replace the target file.
pub fn init_run_logger(path: impl AsRef<Path>) -> Result<(), CuesyncError> {
    let logger = JsonlLogger::new(path);
    if let Some(parent) = logger.path.parent() {
        fs::create_dir_all(parent).map_err(|e| CuesyncError::Io(e.to_string()))?;
    }
    if let Ok(mut slot) = logger_slot().lock() {
        *slot = Some(logger);
    }
    Ok(())
}

pub fn clear_run_logger() {
    if let Ok(mut slot) = logger_slot().lock() {
        *slot = None;
    }
}

pub fn run_log_path() -> Option<PathBuf> {
    logger_slot()
        .lock()
        .ok()
        .and_then(|slot| slot.as_ref().map(|logger| logger.path.clone()))
}

/// Append one structured event to the run log. No-op when no logger is installed;
/// write failures are swallowed so logging never interrupts a session.
pub fn append_run_log(level: &str, event_type: &str, payload: Value) {
    let logger = match logger_slot().lock() {
        Ok(slot) => slot.clone(),
        Err(_) => None,
    };
    let Some(logger) = logger else {
        return;
    };
    let _ = logger.append(&LogEvent {
        level,
        event_type,
        payload,
        ts_unix_ms: unix_ms(),
    });
}

/// Print an operator-facing diagnostic naming the failing component, and log it.
pub fn report_failure(error: &CuesyncError) {
    eprintln!("[{}] {error}", error.component());
    append_run_log(
        "error",
        "session.failure",
        serde_json::json!({
            "component": error.component(),
            "error": error.to_string(),
        }),
    );
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn truncate_json(value: Value, max_bytes: usize) -> Value {
    let rendered = serde_json::to_string(&value).unwrap_or_default();
    if rendered.len() <= max_bytes {
        return value;
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    Value::String(format!("{}...", &rendered[..cut]))
}

#[cfg(test)]
mod tests {
    use super::{truncate_json, JsonlLogger, LogEvent};
    use serde_json::json;

    #[test]
    fn logger_truncates_large_payloads_and_writes_jsonl() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("logs/run.jsonl");
        let mut logger = JsonlLogger::new(&path);
        logger.max_payload_bytes = 20;

        logger
            .append(&LogEvent {
                level: "info",
                event_type: "supervisor.start.spawned",
                payload: json!({"command": "abcdefghijklmnopqrstuvwxyz"}),
                ts_unix_ms: 7,
            })
            .expect("append");

        let text = std::fs::read_to_string(&path).expect("read");
        assert!(text.contains("\"event_type\":\"supervisor.start.spawned\""));
        assert!(text.contains("..."));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let value = json!({"label": "ééééééééééééééé"});
        let truncated = truncate_json(value, 12);
        let text = truncated.as_str().expect("string");
        assert!(text.ends_with("..."));
    }
}
