//! Bounded in-memory log storage for supervised processes
//!
//! Each producer tag (usually an app name) gets a fixed-capacity circular
//! buffer. The merged view interleaves all tags chronologically, breaking
//! timestamp ties by append order. An optional shared sink appends one JSON
//! record per line to a file that other guvnor processes can read;
//! shared-file writes are best-effort and never fail the appender.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Default per-tag ring capacity
pub const DEFAULT_CAPACITY: usize = 1000;

/// One log record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub tag: String,
    pub message: String,
    /// Global append order; tie-breaker for the merged view
    #[serde(skip)]
    pub seq: u64,
}

/// Fixed-capacity ring of log records for one tag
struct Ring {
    entries: Vec<LogRecord>,
    capacity: usize,
    head: usize,
    len: usize,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, record: LogRecord) {
        if self.entries.len() < self.capacity {
            self.entries.push(record);
            self.len += 1;
        } else {
            // Overwrite the oldest entry
            self.entries[self.head] = record;
            self.head = (self.head + 1) % self.capacity;
        }
    }

    /// Last n entries in chronological order
    fn tail(&self, n: usize) -> Vec<LogRecord> {
        let count = n.min(self.len);
        let mut out = Vec::with_capacity(count);
        for i in (self.len - count)..self.len {
            let pos = (self.head + i) % self.entries.len().max(1);
            out.push(self.entries[pos].clone());
        }
        out
    }

    fn all(&self) -> Vec<LogRecord> {
        self.tail(self.len)
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.head = 0;
        self.len = 0;
    }
}

/// Thread-safe log store with one ring per tag
#[derive(Clone)]
pub struct LogRing {
    inner: Arc<LogRingInner>,
}

struct LogRingInner {
    rings: RwLock<HashMap<String, Mutex<Ring>>>,
    capacity: usize,
    seq: AtomicU64,
    shared_file: Option<PathBuf>,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(LogRingInner {
                rings: RwLock::new(HashMap::new()),
                capacity,
                seq: AtomicU64::new(0),
                shared_file: None,
            }),
        }
    }

    /// Ring that also appends each record to a shared JSON-lines file
    pub fn with_shared_file(capacity: usize, path: PathBuf) -> Self {
        Self {
            inner: Arc::new(LogRingInner {
                rings: RwLock::new(HashMap::new()),
                capacity,
                seq: AtomicU64::new(0),
                shared_file: Some(path),
            }),
        }
    }

    /// Append a record under the given tag. Timestamp is assigned here.
    pub fn append(&self, tag: &str, level: &str, message: impl Into<String>) {
        let record = LogRecord {
            timestamp: Utc::now(),
            level: level.to_string(),
            tag: tag.to_string(),
            message: message.into(),
            seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
        };

        {
            let rings = self.inner.rings.read();
            if let Some(ring) = rings.get(tag) {
                ring.lock().push(record.clone());
            } else {
                drop(rings);
                let mut rings = self.inner.rings.write();
                rings
                    .entry(tag.to_string())
                    .or_insert_with(|| Mutex::new(Ring::new(self.inner.capacity)))
                    .lock()
                    .push(record.clone());
            }
        }

        if let Some(path) = &self.inner.shared_file {
            write_shared_record(path, &record);
        }
    }

    /// Last n records for a tag, chronological
    pub fn tail_by_tag(&self, tag: &str, n: usize) -> Vec<LogRecord> {
        let rings = self.inner.rings.read();
        rings
            .get(tag)
            .map(|ring| ring.lock().tail(n))
            .unwrap_or_default()
    }

    /// Last n records across all tags, stable-sorted by timestamp with
    /// append order as the tie-breaker
    pub fn merged(&self, n: usize) -> Vec<LogRecord> {
        let rings = self.inner.rings.read();
        let mut all: Vec<LogRecord> = Vec::new();
        for ring in rings.values() {
            all.extend(ring.lock().all());
        }
        all.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.seq.cmp(&b.seq)));
        if n > 0 && all.len() > n {
            all.split_off(all.len() - n)
        } else {
            all
        }
    }

    /// Records at or after the given cursor, merged and ordered.
    /// Use with [`cursor`](Self::cursor) to poll for fresh records.
    pub fn since(&self, cursor: u64) -> Vec<LogRecord> {
        let rings = self.inner.rings.read();
        let mut fresh: Vec<LogRecord> = Vec::new();
        for ring in rings.values() {
            fresh.extend(ring.lock().all().into_iter().filter(|r| r.seq >= cursor));
        }
        fresh.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.seq.cmp(&b.seq)));
        fresh
    }

    /// Sequence number the next appended record will receive
    pub fn cursor(&self) -> u64 {
        self.inner.seq.load(Ordering::Relaxed)
    }

    pub fn tags(&self) -> Vec<String> {
        self.inner.rings.read().keys().cloned().collect()
    }

    /// Clear one tag's ring, or all rings when tag is empty
    pub fn clear(&self, tag: &str) {
        let rings = self.inner.rings.read();
        if tag.is_empty() {
            for ring in rings.values() {
                ring.lock().clear();
            }
        } else if let Some(ring) = rings.get(tag) {
            ring.lock().clear();
        }
    }

    pub fn shared_file(&self) -> Option<&Path> {
        self.inner.shared_file.as_deref()
    }
}

/// Shared-file record shape: the in-memory record plus the writer's pid
#[derive(Debug, Serialize)]
struct SharedRecord<'a> {
    timestamp: DateTime<Utc>,
    level: &'a str,
    tag: &'a str,
    message: &'a str,
    pid: u32,
}

/// Default shared log file location under the OS temp directory
pub fn shared_log_path() -> PathBuf {
    std::env::temp_dir().join("guvnor").join("guvnor-shared.log")
}

fn write_shared_record(path: &Path, record: &LogRecord) {
    let shared = SharedRecord {
        timestamp: record.timestamp,
        level: &record.level,
        tag: &record.tag,
        message: &record.message,
        pid: std::process::id(),
    };

    let Ok(line) = serde_json::to_string(&shared) else {
        return;
    };
    if let Some(dir) = path.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
    // Open-append per record; the file is never held open between writes
    if let Ok(mut file) = std::fs::OpenOptions::new().append(true).create(true).open(path) {
        let _ = writeln!(file, "{line}");
    }
}

/// Read the last max_lines records from a shared log file, skipping
/// lines that fail to decode.
pub fn read_shared_records(path: &Path, max_lines: usize) -> std::io::Result<Vec<LogRecord>> {
    let data = std::fs::read_to_string(path)?;
    let mut records: Vec<LogRecord> = data
        .lines()
        .filter(|l| !l.is_empty())
        .filter_map(|l| serde_json::from_str::<LogRecord>(l).ok())
        .collect();
    if max_lines > 0 && records.len() > max_lines {
        records = records.split_off(records.len() - max_lines);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_tail() {
        let ring = LogRing::new(10);
        ring.append("web", "info", "first");
        ring.append("web", "info", "second");
        ring.append("api", "error", "other tag");

        let tail = ring.tail_by_tag("web", 10);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].message, "first");
        assert_eq!(tail[1].message, "second");

        assert!(ring.tail_by_tag("missing", 10).is_empty());
    }

    #[test]
    fn test_capacity_eviction() {
        let ring = LogRing::new(5);
        for i in 0..8 {
            ring.append("web", "info", format!("msg-{i}"));
        }

        let tail = ring.tail_by_tag("web", 100);
        assert_eq!(tail.len(), 5);
        assert_eq!(tail[0].message, "msg-3");
        assert_eq!(tail[4].message, "msg-7");
    }

    #[test]
    fn test_tail_smaller_than_len() {
        let ring = LogRing::new(10);
        for i in 0..6 {
            ring.append("web", "info", format!("msg-{i}"));
        }

        let tail = ring.tail_by_tag("web", 2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].message, "msg-4");
        assert_eq!(tail[1].message, "msg-5");
    }

    #[test]
    fn test_merged_interleaves_by_order() {
        let ring = LogRing::new(10);
        ring.append("a", "info", "1");
        ring.append("b", "info", "2");
        ring.append("a", "info", "3");
        ring.append("b", "info", "4");

        let merged = ring.merged(10);
        let messages: Vec<&str> = merged.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["1", "2", "3", "4"]);
    }

    #[test]
    fn test_merged_limit() {
        let ring = LogRing::new(10);
        for i in 0..6 {
            ring.append("a", "info", format!("{i}"));
        }
        let merged = ring.merged(3);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].message, "3");
    }

    #[test]
    fn test_since() {
        let ring = LogRing::new(10);
        ring.append("a", "info", "old");
        let mark = ring.cursor();
        ring.append("a", "info", "new");
        ring.append("b", "warn", "newer");

        let fresh = ring.since(mark);
        assert_eq!(fresh.len(), 2);
        assert_eq!(fresh[0].message, "new");
        assert_eq!(fresh[1].message, "newer");
    }

    #[test]
    fn test_tags_and_clear() {
        let ring = LogRing::new(10);
        ring.append("a", "info", "x");
        ring.append("b", "info", "y");

        let mut tags = ring.tags();
        tags.sort();
        assert_eq!(tags, vec!["a", "b"]);

        ring.clear("a");
        assert!(ring.tail_by_tag("a", 10).is_empty());
        assert_eq!(ring.tail_by_tag("b", 10).len(), 1);

        ring.clear("");
        assert!(ring.tail_by_tag("b", 10).is_empty());
    }

    #[test]
    fn test_shared_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.log");
        let ring = LogRing::with_shared_file(10, path.clone());

        ring.append("web", "info", "hello");
        ring.append("web", "error", "boom");

        let records = read_shared_records(&path, 10).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].message, "hello");
        assert_eq!(records[1].level, "error");
    }

    #[test]
    fn test_shared_file_skips_invalid_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.log");
        std::fs::write(&path, "not-json\n").unwrap();

        let ring = LogRing::with_shared_file(10, path.clone());
        ring.append("web", "info", "valid");

        let records = read_shared_records(&path, 0).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "valid");
    }

    #[test]
    fn test_concurrent_appenders() {
        let ring = LogRing::new(100);
        let mut handles = Vec::new();
        for t in 0..4 {
            let ring = ring.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    ring.append(&format!("tag-{t}"), "info", format!("{i}"));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        for t in 0..4 {
            assert_eq!(ring.tail_by_tag(&format!("tag-{t}"), 100).len(), 50);
        }
        assert_eq!(ring.merged(0).len(), 200);
    }
}
