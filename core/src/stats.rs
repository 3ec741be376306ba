use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Per-stage counters. Cheap to bump from any worker.
#[derive(Debug, Default)]
pub struct StageStats {
    received: AtomicU64,
    emitted: AtomicU64,
    /// Maximum-tracking only: scores that did not beat the incumbent.
    suppressed: AtomicU64,
    /// Documents without any matched entity.
    skipped: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    malformed: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub emitted: u64,
    pub suppressed: u64,
    pub skipped: u64,
    pub retried: u64,
    pub failed: u64,
    pub malformed: u64,
}

impl StageStats {
    pub fn record_received(&self) { self.received.fetch_add(1, Ordering::Relaxed); }
    pub fn record_emitted(&self, n: u64) { self.emitted.fetch_add(n, Ordering::Relaxed); }
    pub fn record_suppressed(&self) { self.suppressed.fetch_add(1, Ordering::Relaxed); }
    pub fn record_skipped(&self) { self.skipped.fetch_add(1, Ordering::Relaxed); }
    pub fn record_retried(&self) { self.retried.fetch_add(1, Ordering::Relaxed); }
    pub fn record_failed(&self) { self.failed.fetch_add(1, Ordering::Relaxed); }
    pub fn record_malformed(&self) { self.malformed.fetch_add(1, Ordering::Relaxed); }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct PipelineStats {
    pub term_frequency: Arc<StageStats>,
    pub inverse_document_frequency: Arc<StageStats>,
    pub maximum_tracking: Arc<StageStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineStatsSnapshot {
    pub term_frequency: StatsSnapshot,
    pub inverse_document_frequency: StatsSnapshot,
    pub maximum_tracking: StatsSnapshot,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            term_frequency: self.term_frequency.snapshot(),
            inverse_document_frequency: self.inverse_document_frequency.snapshot(),
            maximum_tracking: self.maximum_tracking.snapshot(),
        }
    }
}
