//! Durable append-only output.
//!
//! The pipeline writes line-delimited JSON records into one logical stream
//! per record kind. [`JsonlSink`] is the production implementation: one
//! file per stream per day (`kpt_positions_YYYYMMDD.jsonl`,
//! `kpt_routes_YYYYMMDD.jsonl`), rotated when the local date changes.
//!
//! The trait is object-safe and injectable so tests can capture writes with
//! an in-memory sink. Appends are safe to issue from both periodic tasks
//! concurrently; within a stream, ordering is call order.

// ============================================================================
// Imports
// ============================================================================

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Local;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Error, Result};

// ============================================================================
// StreamName
// ============================================================================

/// Logical output stream selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamName {
    /// Vehicle position batches.
    Positions,
    /// Route poll records.
    Routes,
}

impl StreamName {
    /// File prefix for this stream.
    #[inline]
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Positions => "kpt_positions",
            Self::Routes => "kpt_routes",
        }
    }
}

// ============================================================================
// Sink Trait
// ============================================================================

/// Durable append-only writer, one logical stream per record kind.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Appends one record to the named stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Sink`] or [`Error::Io`] on write failure.
    async fn append(&self, stream: StreamName, record: &Value) -> Result<()>;
}

// ============================================================================
// RotatingFile
// ============================================================================

/// One stream's file handle, reopened when the date stamp changes.
struct RotatingFile {
    prefix: &'static str,
    date: String,
    file: Option<File>,
}

impl RotatingFile {
    const fn new(prefix: &'static str) -> Self {
        Self {
            prefix,
            date: String::new(),
            file: None,
        }
    }

    fn write_line(&mut self, dir: &Path, line: &str) -> Result<()> {
        let today = Local::now().format("%Y%m%d").to_string();
        if self.file.is_none() || self.date != today {
            let path = dir.join(format!("{}_{today}.jsonl", self.prefix));
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            info!(path = %path.display(), "sink file opened");
            self.date = today;
            self.file = Some(file);
        }

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::sink("sink file handle missing after rotation"))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        Ok(())
    }
}

// ============================================================================
// JsonlSink
// ============================================================================

/// Daily-rotated line-delimited JSON sink.
pub struct JsonlSink {
    output_dir: PathBuf,
    positions: Mutex<RotatingFile>,
    routes: Mutex<RotatingFile>,
}

impl JsonlSink {
    /// Creates the sink, ensuring the output directory exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the directory cannot be created.
    pub fn new(output_dir: impl Into<PathBuf>) -> Result<Self> {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir)?;
        debug!(dir = %output_dir.display(), "sink initialized");

        Ok(Self {
            output_dir,
            positions: Mutex::new(RotatingFile::new(StreamName::Positions.prefix())),
            routes: Mutex::new(RotatingFile::new(StreamName::Routes.prefix())),
        })
    }

    fn handle(&self, stream: StreamName) -> &Mutex<RotatingFile> {
        match stream {
            StreamName::Positions => &self.positions,
            StreamName::Routes => &self.routes,
        }
    }
}

#[async_trait]
impl Sink for JsonlSink {
    async fn append(&self, stream: StreamName, record: &Value) -> Result<()> {
        let line = serde_json::to_string(record)?;
        // Per-stream lock: both periodic tasks may append concurrently.
        self.handle(stream).lock().write_line(&self.output_dir, &line)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_stream_prefixes() {
        assert_eq!(StreamName::Positions.prefix(), "kpt_positions");
        assert_eq!(StreamName::Routes.prefix(), "kpt_routes");
    }

    #[tokio::test]
    async fn test_append_writes_one_line_per_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = JsonlSink::new(dir.path()).expect("sink");

        sink.append(StreamName::Positions, &json!({ "n": 1 }))
            .await
            .expect("append");
        sink.append(StreamName::Positions, &json!({ "n": 2 }))
            .await
            .expect("append");

        let date = Local::now().format("%Y%m%d").to_string();
        let path = dir.path().join(format!("kpt_positions_{date}.jsonl"));
        let content = std::fs::read_to_string(path).expect("read");

        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"{"n":1}"#);
        assert_eq!(lines[1], r#"{"n":2}"#);
    }

    #[tokio::test]
    async fn test_streams_write_separate_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = JsonlSink::new(dir.path()).expect("sink");

        sink.append(StreamName::Positions, &json!({ "kind": "p" }))
            .await
            .expect("append");
        sink.append(StreamName::Routes, &json!({ "kind": "r" }))
            .await
            .expect("append");

        let date = Local::now().format("%Y%m%d").to_string();
        assert!(dir.path().join(format!("kpt_positions_{date}.jsonl")).exists());
        assert!(dir.path().join(format!("kpt_routes_{date}.jsonl")).exists());
    }

    #[test]
    fn test_rotation_reopens_on_date_change() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut file = RotatingFile::new("kpt_test");

        file.write_line(dir.path(), "{}").expect("write");
        // Simulate a date change; the next write must reopen.
        file.date = "19700101".to_string();
        file.write_line(dir.path(), "{}").expect("write");

        let date = Local::now().format("%Y%m%d").to_string();
        let content = std::fs::read_to_string(dir.path().join(format!("kpt_test_{date}.jsonl")))
            .expect("read");
        assert_eq!(content.lines().count(), 2);
    }
}
