//! Log Router - one append-only log file per bot key
//!
//! A sink is created the first time a key is started and remembered for the
//! rest of the daemon's lifetime. Files are never truncated or deleted here:
//! lifecycle markers and the child's own output are all appended.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Append-only log file for one bot key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSink {
    pub key: String,
    pub path: PathBuf,
}

impl LogSink {
    /// Open the file in append mode, creating it (and parent dirs) if needed.
    pub fn open_append(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open log file {}", self.path.display()))
    }

    /// Append one `[timestamp] message` line with a single write.
    pub fn append_marker(&self, message: &str) -> Result<()> {
        let mut file = self.open_append()?;
        file.write_all(marker_line(message).as_bytes())
            .with_context(|| format!("Failed to write log file {}", self.path.display()))?;
        Ok(())
    }

    /// Read the whole file and keep at most the last `max_chars` characters.
    /// Returns `None` when the file is gone.
    pub fn tail(&self, max_chars: usize) -> Result<Option<String>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.path.display()))
            }
        };
        Ok(Some(tail_chars(&String::from_utf8_lossy(&bytes), max_chars)))
    }
}

/// Format a lifecycle marker with a local wall-clock timestamp.
pub fn marker_line(message: &str) -> String {
    format!(
        "[{}] {}\n",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.6f"),
        message
    )
}

/// Trailing window of at most `max_chars` characters.
fn tail_chars(content: &str, max_chars: usize) -> String {
    let total = content.chars().count();
    if total <= max_chars {
        return content.to_string();
    }
    content.chars().skip(total - max_chars).collect()
}

/// Maps bot keys to their log sinks.
pub struct LogRouter {
    logs_dir: PathBuf,
    sinks: HashMap<String, LogSink>,
}

impl LogRouter {
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
            sinks: HashMap::new(),
        }
    }

    /// Return the sink for `key`, recording `<logs_dir>/<key>.log` on first use.
    pub fn sink_for(&mut self, key: &str) -> LogSink {
        let logs_dir = &self.logs_dir;
        self.sinks
            .entry(key.to_string())
            .or_insert_with(|| LogSink {
                key: key.to_string(),
                path: logs_dir.join(format!("{}.log", key)),
            })
            .clone()
    }

    /// Sink remembered for `key`, if it was ever started.
    pub fn get(&self, key: &str) -> Option<&LogSink> {
        self.sinks.get(key)
    }
}
