// src/history.rs
//
// Bounded log of successful conversions. Oldest entries are evicted first.

use crate::engine::search::ConversionResult;
use crate::ops::OutputFormat;
use std::collections::VecDeque;
use chrono::Utc;

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub filename: String,
    pub original_size: u64,
    pub converted_size: u64,
    pub output_format: OutputFormat,
    pub savings_percent: f64,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,
}

impl HistoryEntry {
    pub fn from_result(filename: impl Into<String>, result: &ConversionResult) -> Self {
        Self {
            filename: filename.into(),
            original_size: result.original_size,
            converted_size: result.byte_size,
            output_format: result.format,
            savings_percent: result.savings_percent(),
            timestamp_ms: now_ms(),
        }
    }
}

fn now_ms() -> u64 {
    // clocks before 1970 clamp to zero
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct HistoryLog {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl HistoryLog {
    /// A capacity of 0 keeps nothing.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn record(&mut self, entry: HistoryEntry) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Oldest first.
    pub fn entries(&self) -> impl DoubleEndedIterator<Item = &HistoryEntry> + '_ {
        self.entries.iter()
    }

    pub fn latest(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str) -> HistoryEntry {
        HistoryEntry {
            filename: name.to_string(),
            original_size: 1000,
            converted_size: 400,
            output_format: OutputFormat::Webp,
            savings_percent: 60.0,
            timestamp_ms: 0,
        }
    }

    #[test]
    fn test_evicts_oldest_first() {
        let mut log = HistoryLog::new(3);
        for name in ["a", "b", "c", "d", "e"] {
            log.record(entry(name));
        }
        let names: Vec<_> = log.entries().map(|e| e.filename.as_str()).collect();
        assert_eq!(names, vec!["c", "d", "e"]);
        assert_eq!(log.latest().map(|e| e.filename.as_str()), Some("e"));
    }

    #[test]
    fn test_zero_capacity_keeps_nothing() {
        let mut log = HistoryLog::new(0);
        log.record(entry("a"));
        assert!(log.is_empty());
    }

    #[test]
    fn test_timestamp_is_wall_clock_millis() {
        let before = Utc::now().timestamp_millis();
        let stamped = now_ms() as i64;
        let after = Utc::now().timestamp_millis();
        assert!(before <= stamped && stamped <= after);
    }

    #[test]
    fn test_clear() {
        let mut log = HistoryLog::new(2);
        log.record(entry("a"));
        log.clear();
        assert_eq!(log.len(), 0);
        assert_eq!(log.capacity(), 2);
    }
}
