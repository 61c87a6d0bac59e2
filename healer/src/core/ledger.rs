//! Bounded lesson ledger.
//!
//! Lessons accumulate one per failed iteration. When an append would push the
//! ledger past its capacity, the oldest surplus entries are folded into a
//! single replacement entry by a [`Compressor`], so nothing is dropped without
//! passing through a compression pass.

use std::collections::VecDeque;

use crate::core::types::{one_line, truncate_chars};

/// Default number of lessons kept.
pub const LEDGER_CAPACITY: usize = 5;

/// Folds several lessons into exactly one. Must be bounded (one call, no loops
/// over the model) and infallible; implementations fall back internally.
pub trait Compressor {
    fn compress(&self, entries: &[String]) -> String;
}

/// Deterministic compression: joins entries with `"; "` and truncates.
#[derive(Debug, Clone)]
pub struct JoinCompressor {
    pub max_chars: usize,
}

impl Default for JoinCompressor {
    fn default() -> Self {
        Self { max_chars: 400 }
    }
}

impl Compressor for JoinCompressor {
    fn compress(&self, entries: &[String]) -> String {
        let joined = entries
            .iter()
            .map(|e| one_line(e))
            .filter(|e| !e.is_empty())
            .collect::<Vec<_>>()
            .join("; ");
        truncate_chars(&joined, self.max_chars)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LessonLedger {
    entries: VecDeque<String>,
    capacity: usize,
}

impl Default for LessonLedger {
    fn default() -> Self {
        Self::new(LEDGER_CAPACITY)
    }
}

impl LessonLedger {
    /// Capacity is clamped to `2..=LEDGER_CAPACITY`; below 2 there is no room
    /// for a compressed entry plus a new one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(2, LEDGER_CAPACITY);
        Self {
            entries: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Read-only copy handed to the generation and diagnosis steps.
    pub fn snapshot(&self) -> Vec<String> {
        self.entries.iter().cloned().collect()
    }

    /// Append a lesson, compressing the oldest surplus entries on overflow.
    /// Returns the ledger contents after the append.
    pub fn append<C: Compressor + ?Sized>(&mut self, entry: String, compressor: &C) -> Vec<String> {
        self.entries.push_back(entry);
        if self.entries.len() > self.capacity {
            // Merge enough of the oldest entries that one replacement brings us back to capacity.
            let surplus = self.entries.len() - self.capacity + 1;
            let oldest: Vec<String> = self.entries.drain(..surplus).collect();
            let merged = compressor.compress(&oldest);
            self.entries.push_front(merged);
        }
        debug_assert!(self.entries.len() <= self.capacity);
        self.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct CountingCompressor {
        calls: RefCell<Vec<Vec<String>>>,
    }

    impl Compressor for CountingCompressor {
        fn compress(&self, entries: &[String]) -> String {
            self.calls.borrow_mut().push(entries.to_vec());
            format!("merged({})", entries.len())
        }
    }

    #[test]
    fn append_below_capacity_keeps_order() {
        let mut ledger = LessonLedger::default();
        let compressor = JoinCompressor::default();
        ledger.append("a".to_string(), &compressor);
        let snapshot = ledger.append("b".to_string(), &compressor);
        assert_eq!(snapshot, vec!["a", "b"]);
    }

    #[test]
    fn overflow_merges_two_oldest_into_one() {
        let mut ledger = LessonLedger::new(5);
        let compressor = CountingCompressor {
            calls: RefCell::new(Vec::new()),
        };
        for i in 0..5 {
            ledger.append(format!("l{i}"), &compressor);
        }
        let snapshot = ledger.append("l5".to_string(), &compressor);

        assert_eq!(snapshot, vec!["merged(2)", "l2", "l3", "l4", "l5"]);
        assert_eq!(compressor.calls.borrow().as_slice(), &[vec!["l0", "l1"]]);
    }

    #[test]
    fn length_never_exceeds_capacity() {
        let mut ledger = LessonLedger::new(5);
        let compressor = JoinCompressor::default();
        for i in 0..20 {
            let snapshot = ledger.append(format!("lesson {i}"), &compressor);
            assert!(snapshot.len() <= 5);
        }
        assert_eq!(ledger.len(), 5);
        // Earliest lessons survive inside the compressed head entry.
        assert!(ledger.snapshot()[0].contains("lesson 0"));
    }

    #[test]
    fn join_compressor_truncates() {
        let compressor = JoinCompressor { max_chars: 10 };
        let merged = compressor.compress(&["abcdef".to_string(), "ghijkl".to_string()]);
        assert_eq!(merged, "abcdef;...");
    }

    #[test]
    fn tiny_capacity_is_clamped() {
        let mut ledger = LessonLedger::new(0);
        let compressor = JoinCompressor::default();
        ledger.append("a".to_string(), &compressor);
        ledger.append("b".to_string(), &compressor);
        let snapshot = ledger.append("c".to_string(), &compressor);
        assert_eq!(snapshot, vec!["a; b", "c"]);
    }

    #[test]
    fn oversized_capacity_is_clamped_to_bound() {
        let mut ledger = LessonLedger::new(9);
        assert_eq!(ledger.capacity(), LEDGER_CAPACITY);
        let compressor = JoinCompressor::default();
        for i in 0..9 {
            let snapshot = ledger.append(format!("lesson {i}"), &compressor);
            assert!(snapshot.len() <= LEDGER_CAPACITY);
        }
    }
}
