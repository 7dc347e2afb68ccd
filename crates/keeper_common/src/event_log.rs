//! Append-only lifecycle event log.
//!
//! One JSON object per line. Appends write whole lines in a single
//! `write_all` followed by `sync_data`, so a crash can at worst leave one
//! partial record at the very end of the file. [`EventLog::recover`] drops
//! such a trailing fragment; every earlier record is untouched.

use crate::error::{KeeperError, ParseError, Result};
use crate::store::write_atomic;
use crate::types::Event;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Lines, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

pub const EVENT_LOG_FILE: &str = "events.jsonl";

#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

/// Everything read from a full pass over the log.
#[derive(Debug, Clone, Default)]
pub struct LogScan {
    pub events: Vec<Event>,
    pub errors: Vec<ParseError>,
}

impl EventLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Log at `<data_dir>/events.jsonl`.
    pub fn in_dir(data_dir: impl AsRef<Path>) -> Self {
        Self::new(data_dir.as_ref().join(EVENT_LOG_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn append(&self, event: &Event) -> Result<()> {
        self.append_batch(std::slice::from_ref(event))
    }

    /// Append several events with one write.
    pub fn append_batch(&self, events: &[Event]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let mut buf = String::new();
        for event in events {
            buf.push_str(&event.to_line()?);
            buf.push('\n');
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| KeeperError::persistence(parent, e))?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| KeeperError::persistence(&self.path, e))?;
        file.write_all(buf.as_bytes())
            .and_then(|_| file.sync_data())
            .map_err(|e| KeeperError::persistence(&self.path, e))?;

        Ok(())
    }

    /// Stream the log from the beginning. A missing file reads as empty.
    /// Each call opens the file afresh.
    pub fn iter(&self) -> Result<EventIter> {
        if !self.path.exists() {
            return Ok(EventIter { lines: None, line_no: 0 });
        }
        let file = File::open(&self.path).map_err(|e| KeeperError::persistence(&self.path, e))?;
        Ok(EventIter {
            lines: Some(BufReader::new(file).lines()),
            line_no: 0,
        })
    }

    /// Read the whole log, separating events from malformed records.
    pub fn scan(&self) -> Result<LogScan> {
        let mut scan = LogScan::default();
        for item in self.iter()? {
            match item {
                Ok(event) => scan.events.push(event),
                Err(e) => scan.errors.push(e),
            }
        }
        Ok(scan)
    }

    /// Drop a trailing partial record left by an interrupted append.
    ///
    /// Returns the number of bytes removed, if any. The previous file is kept
    /// as a backup generation before being replaced.
    pub fn recover(&self, backups: usize) -> Result<Option<usize>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path).map_err(|e| KeeperError::persistence(&self.path, e))?;
        if bytes.is_empty() || bytes.ends_with(b"\n") {
            return Ok(None);
        }

        let keep = bytes
            .iter()
            .rposition(|b| *b == b'\n')
            .map(|idx| idx + 1)
            .unwrap_or(0);
        let dropped = bytes.len() - keep;
        write_atomic(&self.path, &bytes[..keep], backups.max(1))?;

        warn!(
            "Truncated {} byte partial record from end of {}",
            dropped,
            self.path.display()
        );
        Ok(Some(dropped))
    }

    /// Last `n` raw lines of the log (all lines when `n == 0`).
    pub fn tail(&self, n: usize) -> Result<Vec<String>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path).map_err(|e| KeeperError::persistence(&self.path, e))?;
        let mut lines: VecDeque<String> = VecDeque::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| KeeperError::persistence(&self.path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            if n > 0 && lines.len() == n {
                lines.pop_front();
            }
            lines.push_back(line);
        }
        Ok(lines.into())
    }
}

/// Lazy iterator over log records; malformed lines come out as [`ParseError`].
pub struct EventIter {
    lines: Option<Lines<BufReader<File>>>,
    line_no: usize,
}

impl Iterator for EventIter {
    type Item = std::result::Result<Event, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        let lines = self.lines.as_mut()?;
        loop {
            let line = lines.next()?;
            self.line_no += 1;
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    return Some(Err(ParseError {
                        line: self.line_no,
                        reason: e.to_string(),
                    }))
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            return Some(Event::from_line(&line).map_err(|e| ParseError {
                line: self.line_no,
                reason: e.to_string(),
            }));
        }
    }
}
