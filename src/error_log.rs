use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Local};
use serde::Serialize;

use crate::error::ChatError;

/// A failed chat request, as recorded in the failure log.
#[derive(Clone, Debug)]
pub struct ErrorLogEntry {
    pub timestamp: DateTime<Local>,
    pub kind: &'static str,
    pub status: Option<u16>,
    pub message: String,
}

impl ErrorLogEntry {
    pub fn from_error(err: &ChatError) -> Self {
        ErrorLogEntry {
            timestamp: Local::now(),
            kind: err.kind_label(),
            status: err.status(),
            message: err.to_string(),
        }
    }

    fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

#[derive(Clone, Debug)]
pub struct ErrorLogStore {
    path: PathBuf,
}

impl ErrorLogStore {
    pub fn new(path: PathBuf) -> Self {
        ErrorLogStore { path }
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from("ai_errors.jsonl")
    }

    pub fn append_error(&self, err: &ChatError) -> Result<()> {
        self.append(&ErrorLogEntry::from_error(err))
    }

    fn append(&self, entry: &ErrorLogEntry) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        serde_json::to_writer(&mut file, &StoredErrorLogEntry::from(entry))?;
        file.write_all(b"\n")?;
        Ok(())
    }
}

#[derive(Serialize)]
struct StoredErrorLogEntry<'a> {
    timestamp_ms: i64,
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<u16>,
    message: &'a str,
}

impl<'a> From<&'a ErrorLogEntry> for StoredErrorLogEntry<'a> {
    fn from(entry: &'a ErrorLogEntry) -> Self {
        StoredErrorLogEntry {
            timestamp_ms: entry.timestamp_ms(),
            kind: entry.kind,
            status: entry.status,
            message: &entry.message,
        }
    }
}
