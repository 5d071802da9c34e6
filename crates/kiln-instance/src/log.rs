//! Bounded per-instance console history.

use std::collections::VecDeque;
use std::time::SystemTime;

/// Lines kept per instance before the oldest are dropped.
pub const MAX_LOG_ENTRIES: usize = 2000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub time: SystemTime,
    pub text: String,
}

/// A ring of the most recent console lines.
#[derive(Debug)]
pub struct InstanceLog {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl Default for InstanceLog {
    fn default() -> Self {
        Self::with_capacity(MAX_LOG_ENTRIES)
    }
}

impl InstanceLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(256)),
            capacity,
        }
    }

    pub fn push(&mut self, time: SystemTime, text: impl Into<String>) {
        self.entries.push_back(LogEntry {
            time,
            text: text.into(),
        });
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    /// Up to `max` most recent entries, oldest first.
    pub fn last(&self, max: usize) -> Vec<LogEntry> {
        let skip = self.entries.len().saturating_sub(max);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_drops_oldest() {
        let mut log = InstanceLog::with_capacity(3);
        for i in 0..5 {
            log.push(SystemTime::UNIX_EPOCH, format!("line {i}"));
        }
        assert_eq!(log.len(), 3);
        let texts: Vec<_> = log.last(10).into_iter().map(|e| e.text).collect();
        assert_eq!(texts, ["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn test_last_returns_tail_in_order() {
        let mut log = InstanceLog::default();
        for i in 0..10 {
            log.push(SystemTime::UNIX_EPOCH, i.to_string());
        }
        let texts: Vec<_> = log.last(2).into_iter().map(|e| e.text).collect();
        assert_eq!(texts, ["8", "9"]);
        assert!(InstanceLog::default().last(5).is_empty());
    }
}
