//! Message tracing for debugging
//!
//! Appends one JSON line per chat request, completion and failure.
//! Image payloads are never written, only their count.

use crate::cli::TracingConfig;
use crate::models::{ChatRequest, ProviderId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

/// Message tracer that writes to JSONL file
pub struct MessageTracer {
    file: Option<Mutex<File>>,
}

/// A trace entry for a request
#[derive(Serialize)]
struct RequestTrace<'a> {
    ts: DateTime<Utc>,
    dir: &'static str,
    id: &'a str,
    provider: ProviderId,
    model: &'a str,
    history: usize,
    images: usize,
    message: &'a str,
}

/// A trace entry for a finished stream
#[derive(Serialize)]
struct ResponseTrace<'a> {
    ts: DateTime<Utc>,
    dir: &'static str,
    id: &'a str,
    latency_ms: u64,
    chars: usize,
    cancelled: bool,
}

/// A trace entry for an error
#[derive(Serialize)]
struct ErrorTrace<'a> {
    ts: DateTime<Utc>,
    dir: &'static str,
    id: &'a str,
    latency_ms: u64,
    error: &'a str,
}

impl MessageTracer {
    /// Create a new tracer from config
    pub fn new(config: &TracingConfig) -> Self {
        if !config.enabled {
            return Self::disabled();
        }

        let path = expand_tilde(&config.path);

        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::error!("Failed to create tracing directory: {}", e);
                return Self::disabled();
            }
        }

        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                tracing::info!("📝 Message tracing enabled: {}", path.display());
                Self {
                    file: Some(Mutex::new(file)),
                }
            }
            Err(e) => {
                tracing::error!("Failed to open trace file: {}", e);
                Self::disabled()
            }
        }
    }

    pub fn disabled() -> Self {
        Self { file: None }
    }

    /// Generate a new trace ID
    pub fn new_trace_id(&self) -> String {
        if self.file.is_some() {
            Uuid::new_v4().to_string()[..8].to_string()
        } else {
            String::new()
        }
    }

    /// Check if tracing is enabled
    pub fn is_enabled(&self) -> bool {
        self.file.is_some()
    }

    pub fn trace_request(&self, id: &str, provider: ProviderId, request: &ChatRequest) {
        let Some(ref file_mutex) = self.file else {
            return;
        };

        let trace = RequestTrace {
            ts: Utc::now(),
            dir: "req",
            id,
            provider,
            model: &request.model_version,
            history: request.history.len(),
            images: request.images.len(),
            message: &request.message,
        };

        self.write_trace(&trace, file_mutex);
    }

    /// Trace a stream that ended normally or by cancellation
    pub fn trace_response(&self, id: &str, text: &str, latency_ms: u64, cancelled: bool) {
        let Some(ref file_mutex) = self.file else {
            return;
        };

        let trace = ResponseTrace {
            ts: Utc::now(),
            dir: "res",
            id,
            latency_ms,
            chars: text.chars().count(),
            cancelled,
        };

        self.write_trace(&trace, file_mutex);
    }

    /// Trace an error
    pub fn trace_error(&self, id: &str, error: &str, latency_ms: u64) {
        let Some(ref file_mutex) = self.file else {
            return;
        };

        let trace = ErrorTrace {
            ts: Utc::now(),
            dir: "err",
            id,
            latency_ms,
            error,
        };

        self.write_trace(&trace, file_mutex);
    }

    fn write_trace<T: Serialize>(&self, trace: &T, file_mutex: &Mutex<File>) {
        let Ok(json) = serde_json::to_string(trace) else {
            return;
        };

        if let Ok(mut file) = file_mutex.lock() {
            let _ = writeln!(file, "{}", json);
        }
    }
}

/// Expand ~ to home directory
pub fn expand_tilde(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_disabled_tracer_writes_nothing() {
        let tracer = MessageTracer::new(&TracingConfig::default());
        assert!(!tracer.is_enabled());
        assert!(tracer.new_trace_id().is_empty());
        tracer.trace_error("x", "boom", 0);
    }

    #[test]
    fn test_records_are_jsonl_without_image_data() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("traces").join("trace.jsonl");
        let tracer = MessageTracer::new(&TracingConfig {
            enabled: true,
            path: path.to_string_lossy().into_owned(),
        });
        assert!(tracer.is_enabled());

        let id = tracer.new_trace_id();
        assert_eq!(id.len(), 8);

        let request = ChatRequest {
            message: "Hello".to_string(),
            images: vec!["SECRETBASE64".to_string()],
            model_version: "gpt-4o-mini".to_string(),
            ..Default::default()
        };
        tracer.trace_request(&id, ProviderId::ChatGpt, &request);
        tracer.trace_response(&id, "Hi there", 42, false);
        tracer.trace_error(&id, "Unexpected status 500", 7);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["dir"], "req");
        assert_eq!(lines[0]["provider"], "chatGpt");
        assert_eq!(lines[0]["images"], 1);
        assert_eq!(lines[1]["chars"], 8);
        assert_eq!(lines[2]["dir"], "err");
        assert!(!content.contains("SECRETBASE64"));
    }

    #[test]
    fn test_expand_tilde() {
        assert_eq!(expand_tilde("/tmp/x"), PathBuf::from("/tmp/x"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde("~/a/b"), home.join("a/b"));
        }
    }
}
