//! Fixed-capacity console log ring buffer (spec §4.C). Newest wins: once
//! full, the oldest entry is dropped to make room.

use serde::Serialize;
use std::collections::VecDeque;

#[derive(Clone, Debug, Serialize)]
pub struct ConsoleLogEntry {
    pub level: String,
    pub args: Vec<serde_json::Value>,
    pub timestamp_ms: i64,
}

pub struct ConsoleRing {
    capacity: usize,
    entries: VecDeque<ConsoleLogEntry>,
}

impl ConsoleRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, entry: ConsoleLogEntry) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn tail(&self, limit: usize) -> Vec<ConsoleLogEntry> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }
}
