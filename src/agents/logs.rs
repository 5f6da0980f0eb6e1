//! # Bounded per-agent log buffer.
//!
//! Keeps the last `capacity` lines; older lines are dropped first.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// Ring buffer of log lines, shared between an agent handle and the supervisor.
#[derive(Debug)]
pub struct LogStore {
    capacity: usize,
    lines: Mutex<VecDeque<String>>,
}

impl LogStore {
    /// Creates an empty store holding at most `capacity` lines (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
        }
    }

    /// Appends a line, evicting the oldest one when full.
    pub fn push(&self, line: impl Into<String>) {
        let mut lines = self.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    /// Returns a copy of the stored lines (oldest first) and the capacity.
    pub fn lines(&self) -> (Vec<String>, usize) {
        let lines = self.lock();
        (lines.iter().cloned().collect(), self.capacity)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.lines.lock().unwrap_or_else(|p| p.into_inner())
    }
}
