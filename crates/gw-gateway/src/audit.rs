//! Publish audit trail
//!
//! One JSON line per publish attempt, written to its own append-only file and
//! kept apart from operational logs. Rotation is left to the environment.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// One audited publish attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub ts: DateTime<Utc>,
    pub request_id: Uuid,
    /// `ok` or the error code
    pub outcome: String,
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub size: usize,
    pub tagged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    pub elapsed_us: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub trait AuditSink: Send + Sync {
    fn write(&self, entry: &AuditEntry);

    fn flush(&self) {}
}

/// Append-only JSON-lines audit file
pub struct FileAuditSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl FileAuditSink {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(path = %path.display(), "Opened publish audit log");
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for FileAuditSink {
    fn write(&self, entry: &AuditEntry) {
        let mut writer = self.writer.lock();
        let result = serde_json::to_writer(&mut *writer, entry)
            .map_err(io::Error::from)
            .and_then(|()| writer.write_all(b"\n"));
        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "Failed to write audit entry");
        }
    }

    fn flush(&self) {
        if let Err(e) = self.writer.lock().flush() {
            warn!(path = %self.path.display(), error = %e, "Failed to flush audit log");
        }
    }
}

impl Drop for FileAuditSink {
    fn drop(&mut self) {
        let _ = self.writer.get_mut().flush();
    }
}

/// Keeps the most recent entries in memory
pub struct MemoryAuditSink {
    capacity: usize,
    entries: Mutex<VecDeque<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl AuditSink for MemoryAuditSink {
    fn write(&self, entry: &AuditEntry) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(outcome: &str) -> AuditEntry {
        AuditEntry {
            ts: Utc::now(),
            request_id: Uuid::new_v4(),
            outcome: outcome.to_string(),
            topic: "orders".to_string(),
            key: None,
            size: 11,
            tagged: false,
            client: Some("127.0.0.1:5000".to_string()),
            partition: Some(0),
            offset: Some(7),
            elapsed_us: 120,
            error: None,
        }
    }

    #[test]
    fn test_file_sink_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pub_audit.log");

        {
            let sink = FileAuditSink::open(&path).unwrap();
            sink.write(&entry("ok"));
            sink.write(&entry("throttled"));
            sink.flush();
        }
        {
            let sink = FileAuditSink::open(&path).unwrap();
            sink.write(&entry("ok"));
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);

        let parsed: AuditEntry = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed.outcome, "throttled");
        assert_eq!(parsed.size, 11);
        assert!(!lines[0].contains("\"key\""));
    }

    #[test]
    fn test_memory_sink_keeps_latest() {
        let sink = MemoryAuditSink::new(2);
        sink.write(&entry("a"));
        sink.write(&entry("b"));
        sink.write(&entry("c"));

        let outcomes: Vec<String> = sink.entries().into_iter().map(|e| e.outcome).collect();
        assert_eq!(outcomes, vec!["b", "c"]);
    }
}
