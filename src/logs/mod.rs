use crate::{
    constants,
    models::{LogEntry, StreamTag},
    Result,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// One slice of a task's log history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPage {
    pub entries: Vec<LogEntry>,
    pub next_offset: u64,
    /// Total sequence numbers ever assigned for the task.
    pub total: u64,
    pub has_more: bool,
}

struct TaskLog {
    entries: VecDeque<LogEntry>,
    next_seq: u64,
    /// Lines dropped so far, reported through the head marker.
    truncated_total: u64,
    /// Synthetic system entry standing in for everything dropped. Its
    /// sequence is the last dropped entry's, so ordering stays monotonic
    /// across the marker boundary.
    marker: Option<LogEntry>,
    last_append: chrono::DateTime<chrono::Utc>,
}

impl TaskLog {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            next_seq: 0,
            truncated_total: 0,
            marker: None,
            last_append: chrono::Utc::now(),
        }
    }

    fn push(&mut self, stream: StreamTag, message: String, cap: usize) {
        let entry = LogEntry {
            sequence: self.next_seq,
            timestamp: chrono::Utc::now(),
            stream,
            message,
        };
        self.next_seq += 1;
        self.last_append = entry.timestamp;
        self.entries.push_back(entry);
        self.enforce_cap(cap);
    }

    fn enforce_cap(&mut self, cap: usize) {
        let mut last_dropped_seq = None;
        while self.entries.len() > cap {
            if let Some(dropped) = self.entries.pop_front() {
                self.truncated_total += 1;
                last_dropped_seq = Some(dropped.sequence);
            }
        }
        if let Some(seq) = last_dropped_seq {
            self.marker = Some(LogEntry {
                sequence: seq,
                timestamp: chrono::Utc::now(),
                stream: StreamTag::System,
                message: format!("[truncated {} lines]", self.truncated_total),
            });
        }
    }

    fn visible(&self) -> impl Iterator<Item = &LogEntry> {
        self.marker.iter().chain(self.entries.iter())
    }
}

/// Per-task append-only log channel.
///
/// Appends are O(1) amortized and never block readers beyond the lock
/// hold of a single push; readers page by sequence offset and never
/// block writers. Entries expire after the retention window, and the
/// per-task cap evicts from the head, leaving a `[truncated N lines]`
/// system marker.
pub struct LogChannel {
    inner: Arc<RwLock<HashMap<String, TaskLog>>>,
    max_lines_per_task: usize,
    retention: chrono::Duration,
}

impl LogChannel {
    pub fn new(max_lines_per_task: usize, retention_seconds: u64) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            max_lines_per_task,
            retention: chrono::Duration::seconds(retention_seconds as i64),
        }
    }

    /// Append one line. Lines longer than 64 KiB are split at the
    /// boundary; every part gets its own sequence number.
    pub async fn append(&self, task_id: &str, stream: StreamTag, line: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let log = inner
            .entry(task_id.to_string())
            .or_insert_with(TaskLog::new);

        for part in split_line(line, constants::MAX_LOG_LINE_BYTES) {
            log.push(stream, part.to_string(), self.max_lines_per_task);
        }
        Ok(())
    }

    /// Read entries with `sequence >= offset`, up to `max`.
    pub async fn read(&self, task_id: &str, offset: u64, max: usize) -> Result<LogPage> {
        let inner = self.inner.read().await;
        let Some(log) = inner.get(task_id) else {
            return Ok(LogPage {
                entries: Vec::new(),
                next_offset: offset,
                total: 0,
                has_more: false,
            });
        };

        let entries: Vec<LogEntry> = log
            .visible()
            .filter(|e| e.sequence >= offset)
            .take(max)
            .cloned()
            .collect();

        let next_offset = entries
            .last()
            .map(|e| e.sequence + 1)
            .unwrap_or(offset);
        let has_more = log.visible().any(|e| e.sequence >= next_offset);

        Ok(LogPage {
            entries,
            next_offset,
            total: log.next_seq,
            has_more,
        })
    }

    /// Evict entries past the retention window; empty task logs are
    /// removed outright.
    pub async fn sweep(&self, now: chrono::DateTime<chrono::Utc>) -> usize {
        let cutoff = now - self.retention;
        let mut inner = self.inner.write().await;
        let mut evicted = 0;

        inner.retain(|_task_id, log| {
            let before = log.entries.len();
            let mut last_dropped_seq = None;
            while log
                .entries
                .front()
                .is_some_and(|e| e.timestamp < cutoff)
            {
                if let Some(dropped) = log.entries.pop_front() {
                    log.truncated_total += 1;
                    last_dropped_seq = Some(dropped.sequence);
                }
            }
            if let Some(seq) = last_dropped_seq {
                log.marker = Some(LogEntry {
                    sequence: seq,
                    timestamp: now,
                    stream: StreamTag::System,
                    message: format!("[truncated {} lines]", log.truncated_total),
                });
            }
            evicted += before - log.entries.len();

            // Drop the whole log once nothing but the marker is left and
            // the task has been quiet past the retention window.
            !(log.entries.is_empty() && log.last_append < cutoff)
        });

        if evicted > 0 {
            debug!("Log sweep evicted {} entries", evicted);
        }
        evicted
    }
}

/// Split at a byte budget without breaking UTF-8 sequences.
fn split_line(line: &str, max_bytes: usize) -> Vec<&str> {
    if line.len() <= max_bytes {
        return vec![line];
    }
    let mut parts = Vec::new();
    let mut rest = line;
    while rest.len() > max_bytes {
        let mut cut = max_bytes;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let (head, tail) = rest.split_at(cut);
        parts.push(head);
        rest = tail;
    }
    if !rest.is_empty() {
        parts.push(rest);
    }
    parts
}
