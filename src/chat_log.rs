use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Local, LocalResult, TimeZone};
use serde::{Deserialize, Serialize};

const SUMMARY_CHARS: usize = 80;

/// One completed question/answer exchange.
#[derive(Clone, Debug, PartialEq)]
pub struct ChatLogRecord {
    pub timestamp: DateTime<Local>,
    pub context: String,
    pub question: String,
    pub answer: String,
    pub has_chart: bool,
}

impl ChatLogRecord {
    pub fn new(
        context: impl Into<String>,
        question: impl Into<String>,
        answer: impl Into<String>,
        has_chart: bool,
    ) -> Self {
        ChatLogRecord {
            timestamp: Local::now(),
            context: context.into(),
            question: question.into(),
            answer: answer.into(),
            has_chart,
        }
    }

    pub fn summary(&self) -> String {
        let mut in_fence = false;
        let answer = self
            .answer
            .lines()
            .map(str::trim)
            .filter(|line| {
                if line.starts_with("```") {
                    in_fence = !in_fence;
                    return false;
                }
                !in_fence && !line.is_empty() && !line.starts_with("<think")
            })
            .take(2)
            .collect::<Vec<_>>()
            .join(" | ");
        let answer = if answer.is_empty() {
            "无内容".to_string()
        } else {
            clip(&answer, SUMMARY_CHARS)
        };
        let chart = if self.has_chart { " 📊" } else { "" };
        format!(
            "[{}] {} · {} → {}{}",
            self.timestamp.format("%m-%d %H:%M"),
            self.context,
            clip(self.question.trim(), SUMMARY_CHARS),
            answer,
            chart
        )
    }

    fn from_parts(
        timestamp_ms: i64,
        context: String,
        question: String,
        answer: String,
        has_chart: bool,
    ) -> Self {
        let timestamp = match Local.timestamp_millis_opt(timestamp_ms) {
            LocalResult::Single(dt) => dt,
            _ => Local::now(),
        };
        ChatLogRecord {
            timestamp,
            context,
            question,
            answer,
            has_chart,
        }
    }

    fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}

#[derive(Clone, Debug)]
pub struct ChatLogStore {
    path: PathBuf,
    max_entries: usize,
}

impl ChatLogStore {
    const TAIL_CHUNK_SIZE: usize = 8 * 1024;

    pub fn new(path: PathBuf) -> Self {
        ChatLogStore {
            path,
            max_entries: 512,
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from("ai_chat_log.jsonl")
    }

    /// Reads at most `max_entries` records from the end of the file, oldest first.
    pub fn load(&self) -> Result<Vec<ChatLogRecord>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let lines = Self::read_tail_lines(&mut file, self.max_entries)?;
        let mut entries = Vec::with_capacity(lines.len());
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(stored) = serde_json::from_str::<StoredChatLog>(&line) {
                entries.push(stored.into_record());
            }
        }
        Ok(entries)
    }

    pub fn append(&self, entry: &ChatLogRecord) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        serde_json::to_writer(&mut file, &StoredChatLog::from(entry))?;
        file.write_all(b"\n")?;
        Ok(())
    }

    fn read_tail_lines(file: &mut File, max_lines: usize) -> Result<Vec<String>> {
        if max_lines == 0 {
            return Ok(Vec::new());
        }

        let mut pos = file.seek(SeekFrom::End(0))?;
        let mut chunk = vec![0_u8; Self::TAIL_CHUNK_SIZE];
        let mut pending = Vec::new();
        let mut lines = Vec::new();

        'outer: while pos > 0 && lines.len() < max_lines {
            let read_size = std::cmp::min(pos, chunk.len() as u64) as usize;
            pos -= read_size as u64;
            file.seek(SeekFrom::Start(pos))?;
            file.read_exact(&mut chunk[..read_size])?;

            for &byte in chunk[..read_size].iter().rev() {
                if byte == b'\n' {
                    if Self::push_pending_line(&mut pending, &mut lines) && lines.len() == max_lines
                    {
                        break 'outer;
                    }
                } else {
                    pending.push(byte);
                }
            }
        }

        if lines.len() < max_lines {
            Self::push_pending_line(&mut pending, &mut lines);
        }

        lines.reverse();
        Ok(lines)
    }

    fn push_pending_line(pending: &mut Vec<u8>, lines: &mut Vec<String>) -> bool {
        if pending.is_empty() {
            return false;
        }
        pending.reverse();
        let line = String::from_utf8_lossy(pending).to_string();
        pending.clear();
        lines.push(line);
        true
    }
}

#[derive(Serialize, Deserialize)]
struct StoredChatLog {
    timestamp_ms: i64,
    context: String,
    question: String,
    answer: String,
    #[serde(default)]
    has_chart: bool,
}

impl StoredChatLog {
    fn into_record(self) -> ChatLogRecord {
        ChatLogRecord::from_parts(
            self.timestamp_ms,
            self.context,
            self.question,
            self.answer,
            self.has_chart,
        )
    }
}

impl From<&ChatLogRecord> for StoredChatLog {
    fn from(value: &ChatLogRecord) -> Self {
        StoredChatLog {
            timestamp_ms: value.timestamp_ms(),
            context: value.context.clone(),
            question: value.question.clone(),
            answer: value.answer.clone(),
            has_chart: value.has_chart,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_returns_only_the_tail() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChatLogStore::new(dir.path().join("logs/chat.jsonl")).with_max_entries(3);
        for idx in 0..5 {
            store
                .append(&ChatLogRecord::new("上证指数", format!("q{idx}"), format!("a{idx}"), idx == 4))
                .unwrap();
        }
        let entries = store.load().unwrap();
        let questions: Vec<&str> = entries.iter().map(|entry| entry.question.as_str()).collect();
        assert_eq!(questions, vec!["q2", "q3", "q4"]);
        assert!(entries[2].has_chart);
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChatLogStore::new(dir.path().join("absent.jsonl"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.jsonl");
        let store = ChatLogStore::new(path.clone());
        store.append(&ChatLogRecord::new("ETF", "q", "a", false)).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{broken\n").unwrap();
        assert_eq!(store.load().unwrap().len(), 1);
    }

    #[test]
    fn summary_skips_reasoning_and_code() {
        let record = ChatLogRecord::new(
            "上证指数",
            "走势如何？",
            "<think>内部推理</think>\n```json\n{}\n```\n短期震荡\n支撑 3000",
            true,
        );
        let summary = record.summary();
        assert!(summary.contains("上证指数 · 走势如何？ → "));
        assert!(summary.contains("短期震荡 | 支撑 3000"));
        assert!(summary.ends_with("📊"));
        assert!(!summary.contains("内部推理"));
    }
}
