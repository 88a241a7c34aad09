// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Incremental log tailing with rotation/truncation detection.
//!
//! The watcher stats the log on every poll. An inode change means the file
//! was rotated; a size below the read offset means it was truncated. Either
//! way the reader reseeds from the start of the new content and the reset
//! reason is reported exactly once.

use crate::record::BurstRecord;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Why the watcher reseeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    Rotated,
    Truncated,
}

impl ResetReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ResetReason::Rotated => "rotated",
            ResetReason::Truncated => "truncated",
        }
    }
}

/// Outcome of one poll.
#[derive(Debug, Default)]
pub struct LogDelta {
    /// False while the log does not exist yet.
    pub exists: bool,
    /// Set on the poll that detected a reset, then cleared.
    pub reset: Option<ResetReason>,
    /// Records parsed from newly appended complete lines.
    pub records: Vec<BurstRecord>,
}

/// Tail reader for a JSONL probe log.
#[derive(Debug)]
pub struct LogWatcher {
    path: PathBuf,
    inode: Option<u64>,
    offset: u64,
    carry: String,
}

impl LogWatcher {
    #[must_use]
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            inode: None,
            offset: 0,
            carry: String::new(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stat the log, detect resets, and drain newly completed lines.
    pub fn poll(&mut self) -> std::io::Result<LogDelta> {
        let meta = match std::fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LogDelta::default());
            }
            Err(e) => return Err(e),
        };

        let inode = file_inode(&meta);
        let size = meta.len();
        let mut reset = None;
        match self.inode {
            None => self.inode = inode,
            Some(prev) => {
                if inode.is_some() && inode != Some(prev) {
                    reset = Some(ResetReason::Rotated);
                    self.inode = inode;
                } else if size < self.offset {
                    reset = Some(ResetReason::Truncated);
                }
            }
        }
        if reset.is_some() {
            self.offset = 0;
            self.carry.clear();
        }

        let records = self.read_new_lines()?;
        Ok(LogDelta {
            exists: true,
            reset,
            records,
        })
    }

    fn read_new_lines(&mut self) -> std::io::Result<Vec<BurstRecord>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.offset))?;
        let mut fresh = String::new();
        let read = file.read_to_string(&mut fresh)?;
        self.offset += read as u64;

        // A partially written last line is carried until its newline arrives.
        let mut buffer = std::mem::take(&mut self.carry);
        buffer.push_str(&fresh);

        let mut records = Vec::new();
        let mut rest = buffer.as_str();
        while let Some(pos) = rest.find('\n') {
            let line = &rest[..pos];
            rest = &rest[pos + 1..];
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(rec) = serde_json::from_str::<BurstRecord>(line) {
                records.push(rec);
            }
        }
        self.carry = rest.to_string();
        Ok(records)
    }
}

#[cfg(unix)]
fn file_inode(meta: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.ino())
}

#[cfg(not(unix))]
fn file_inode(_meta: &std::fs::Metadata) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::test_record;
    use std::io::Write;
    use tempfile::tempdir;

    fn append_record(path: &Path, id: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .expect("open log");
        let line = serde_json::to_string(&test_record(id, vec![1.0])).expect("serialize");
        writeln!(file, "{}", line).expect("append");
    }

    #[test]
    fn test_missing_log_reports_absent() {
        let dir = tempdir().expect("tempdir");
        let mut watcher = LogWatcher::new(dir.path().join("absent.jsonl"));
        let delta = watcher.poll().expect("poll");
        assert!(!delta.exists);
        assert!(delta.records.is_empty());
    }

    #[test]
    fn test_incremental_reads_return_only_new_records() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("log.jsonl");
        let mut watcher = LogWatcher::new(&path);

        append_record(&path, "a");
        let first = watcher.poll().expect("poll");
        assert_eq!(first.records.len(), 1);

        append_record(&path, "b");
        append_record(&path, "c");
        let second = watcher.poll().expect("poll");
        assert_eq!(second.records.len(), 2);
        assert_eq!(second.records[0].endpoint_id, "b");

        let idle = watcher.poll().expect("poll");
        assert!(idle.records.is_empty());
        assert!(idle.reset.is_none());
    }

    #[test]
    fn test_partial_line_is_held_until_complete() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("log.jsonl");
        let mut watcher = LogWatcher::new(&path);

        let line = serde_json::to_string(&test_record("a", vec![1.0])).expect("serialize");
        let (head, tail) = line.split_at(line.len() / 2);
        std::fs::write(&path, head).expect("write head");
        assert!(watcher.poll().expect("poll").records.is_empty());

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .expect("open");
        file.write_all(tail.as_bytes()).expect("tail");
        file.write_all(b"\n").expect("newline");
        let delta = watcher.poll().expect("poll");
        assert_eq!(delta.records.len(), 1);
    }

    #[test]
    fn test_truncation_reported_once_then_reseeds() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("log.jsonl");
        let mut watcher = LogWatcher::new(&path);

        append_record(&path, "a");
        append_record(&path, "b");
        assert_eq!(watcher.poll().expect("poll").records.len(), 2);

        // Truncate and write fresh content.
        std::fs::write(&path, b"").expect("truncate");
        append_record(&path, "fresh");

        let delta = watcher.poll().expect("poll");
        assert_eq!(delta.reset, Some(ResetReason::Truncated));
        assert_eq!(delta.records.len(), 1);
        assert_eq!(delta.records[0].endpoint_id, "fresh");

        // The reason does not repeat.
        append_record(&path, "more");
        let next = watcher.poll().expect("poll");
        assert!(next.reset.is_none());
        assert_eq!(next.records.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_rotation_detected_by_inode_change() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("log.jsonl");
        let mut watcher = LogWatcher::new(&path);

        append_record(&path, "old");
        assert_eq!(watcher.poll().expect("poll").records.len(), 1);

        // Rotate: build the replacement first so it gets its own inode, then
        // move it over the original.
        let staged = dir.path().join("staged.jsonl");
        append_record(&staged, "new");
        std::fs::rename(&staged, &path).expect("rename");

        let delta = watcher.poll().expect("poll");
        assert_eq!(delta.reset, Some(ResetReason::Rotated));
        assert_eq!(delta.records.len(), 1);
        assert_eq!(delta.records[0].endpoint_id, "new");
    }
}
