//! Stale-tolerant reconciliation of monotonic counters.
//!
//! A record carries the counters its producer observed; the consumer holds its
//! own (possibly lagging, possibly ahead) view of the same counters. Because
//! every counter only grows, the pointwise maximum of the two observations is
//! never older than either of them.

use std::cmp::Ordering;

use crate::records::TermFrequencyRecord;

/// A value of a counter that never decreases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Watermark(u64);

impl Watermark {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Whichever observation is further along.
    pub fn merge(self, other: Self) -> Self {
        match self.cmp(&other) {
            Ordering::Less => other,
            Ordering::Equal | Ordering::Greater => self,
        }
    }
}

impl Ord for Watermark {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for Watermark {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The two global counters the IDF computation depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub document_frequency: Watermark,
    pub document_count: Watermark,
}

impl CounterSnapshot {
    pub fn new(document_frequency: u64, document_count: u64) -> Self {
        Self { document_frequency: Watermark::new(document_frequency), document_count: Watermark::new(document_count) }
    }

    /// The counters embedded in a term-frequency record.
    pub fn of_record(record: &TermFrequencyRecord) -> Self {
        Self::new(record.document_frequency, record.document_count)
    }

    pub fn merge(self, other: Self) -> Self {
        Self {
            document_frequency: self.document_frequency.merge(other.document_frequency),
            document_count: self.document_count.merge(other.document_count),
        }
    }

    /// `ln(document_count / document_frequency)`.
    ///
    /// Records always carry `document_frequency >= 1`, so after merging with one
    /// the ratio is finite.
    pub fn idf(&self) -> f64 {
        let df = self.document_frequency.get().max(1) as f64;
        (self.document_count.get() as f64 / df).ln()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_takes_the_further_watermark() {
        let a = Watermark::new(3);
        let b = Watermark::new(7);
        assert_eq!(a.merge(b), b);
        assert_eq!(b.merge(a), b);
        assert_eq!(a.merge(a), a);
    }

    #[test]
    fn snapshot_merge_is_pointwise() {
        let live = CounterSnapshot::new(10, 15);
        let embedded = CounterSnapshot::new(5, 20);
        assert_eq!(live.merge(embedded), CounterSnapshot::new(10, 20));
    }

    #[test]
    fn merging_equal_snapshots_keeps_idf() {
        let current = CounterSnapshot::new(5, 20);
        let merged = current.merge(current);
        assert_eq!(merged, current);
        assert!((merged.idf() - (20f64 / 5.0).ln()).abs() < 1e-12);
    }

    #[test]
    fn idf_is_zero_when_term_is_everywhere() {
        assert_eq!(CounterSnapshot::new(4, 4).idf(), 0.0);
    }
}
