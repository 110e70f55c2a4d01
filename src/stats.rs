use crate::checkpoint::CheckpointStats;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared between the record producer and the flushing driver
#[derive(Default, Debug)]
pub struct IngestStats {
    pub records_seen: AtomicU64,
    pub records_skipped: AtomicU64,
    pub entities_committed: AtomicU64,
    pub relationships_committed: AtomicU64,
    pub flushes: AtomicU64,
    pub flush_retries: AtomicU64,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_records(&self) {
        self.records_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_skipped(&self) {
        self.records_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Only called once the sink has confirmed the whole batch.
    pub fn add_committed(&self, entities: u64, relationships: u64) {
        self.entities_committed.fetch_add(entities, Ordering::Relaxed);
        self.relationships_committed
            .fetch_add(relationships, Ordering::Relaxed);
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_retries(&self) {
        self.flush_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn records(&self) -> u64 {
        self.records_seen.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.records_skipped.load(Ordering::Relaxed)
    }

    pub fn entities(&self) -> u64 {
        self.entities_committed.load(Ordering::Relaxed)
    }

    pub fn relationships(&self) -> u64 {
        self.relationships_committed.load(Ordering::Relaxed)
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.flush_retries.load(Ordering::Relaxed)
    }

    /// Overwrite every counter, e.g. from a checkpoint or back to zero.
    pub fn restore(&self, cp: &CheckpointStats) {
        self.records_seen.store(cp.records_seen, Ordering::Relaxed);
        self.records_skipped.store(cp.records_skipped, Ordering::Relaxed);
        self.entities_committed
            .store(cp.entities_committed, Ordering::Relaxed);
        self.relationships_committed
            .store(cp.relationships_committed, Ordering::Relaxed);
        self.flushes.store(cp.flushes, Ordering::Relaxed);
        self.flush_retries.store(cp.flush_retries, Ordering::Relaxed);
    }

    /// Convert to checkpoint stats for persistence
    pub fn to_checkpoint(&self) -> CheckpointStats {
        CheckpointStats {
            records_seen: self.records(),
            records_skipped: self.skipped(),
            entities_committed: self.entities(),
            relationships_committed: self.relationships(),
            flushes: self.flushes(),
            flush_retries: self.retries(),
        }
    }
}
