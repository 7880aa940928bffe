// 📜 Run Log - ordered, live step log for interactive runs
// The UI polls `since(seq)`; every line is mirrored to tracing

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;

/// Lines kept before the oldest are dropped
pub const DEFAULT_CAPACITY: usize = 2000;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LogLine {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub text: String,
}

#[derive(Debug, Default)]
struct Buffer {
    lines: VecDeque<LogLine>,
    next_seq: u64,
}

/// Cheap-to-clone handle to a shared, bounded log buffer.
#[derive(Debug, Clone)]
pub struct RunLog {
    inner: Arc<Mutex<Buffer>>,
    capacity: usize,
}

impl RunLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        RunLog {
            inner: Arc::new(Mutex::new(Buffer::default())),
            capacity: capacity.max(1),
        }
    }

    /// Append a line and return its sequence number
    pub fn push(&self, text: impl Into<String>) -> u64 {
        let text = text.into();
        tracing::info!(target: "bank_sync::run", "{}", text);

        let mut buf = self.inner.lock();
        let seq = buf.next_seq;
        buf.next_seq += 1;
        buf.lines.push_back(LogLine {
            seq,
            at: Utc::now(),
            text,
        });
        while buf.lines.len() > self.capacity {
            buf.lines.pop_front();
        }
        seq
    }

    /// Lines with `seq >= from`, oldest first
    pub fn since(&self, from: u64) -> Vec<LogLine> {
        let buf = self.inner.lock();
        buf.lines.iter().filter(|l| l.seq >= from).cloned().collect()
    }

    /// Sequence number the next line will get
    pub fn next_seq(&self) -> u64 {
        self.inner.lock().next_seq
    }
}

impl Default for RunLog {
    fn default() -> Self {
        Self::new()
    }
}
