//! In this module, we keep the runtime stats for the acquisition pipeline.
//! Every fault we recover from locally (timeouts, DMA sentinel violations,
//! peak disagreements, dropped uploads) bumps a counter here so operators can
//! see how often it happens without the pipeline ever stopping for it.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

#[derive(Debug, Default)]
pub struct Counters {
    pub cycles: AtomicU64,
    pub ready_timeouts: AtomicU64,
    pub register_read_errors: AtomicU64,
    pub sentinel_errors: AtomicU64,
    pub peak_value_mismatches: AtomicU64,
    pub peak_index_mismatches: AtomicU64,
    pub records_logged: AtomicU64,
    pub log_write_errors: AtomicU64,
    pub uploads_queued: AtomicU64,
    pub uploads_dropped: AtomicU64,
    pub uploads_sent: AtomicU64,
    pub uploads_failed: AtomicU64,
    pub events_triggered: AtomicU64,
    pub snapshots_saved: AtomicU64,
    pub snapshots_dropped: AtomicU64,
}

/// Increment a counter, returning the new value
pub fn bump(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::Relaxed) + 1
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub cycles: u64,
    pub ready_timeouts: u64,
    pub register_read_errors: u64,
    pub sentinel_errors: u64,
    pub peak_value_mismatches: u64,
    pub peak_index_mismatches: u64,
    pub records_logged: u64,
    pub log_write_errors: u64,
    pub uploads_queued: u64,
    pub uploads_dropped: u64,
    pub uploads_sent: u64,
    pub uploads_failed: u64,
    pub events_triggered: u64,
    pub snapshots_saved: u64,
    pub snapshots_dropped: u64,
}

impl Counters {
    pub fn snapshot(&self) -> CounterSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            cycles: get(&self.cycles),
            ready_timeouts: get(&self.ready_timeouts),
            register_read_errors: get(&self.register_read_errors),
            sentinel_errors: get(&self.sentinel_errors),
            peak_value_mismatches: get(&self.peak_value_mismatches),
            peak_index_mismatches: get(&self.peak_index_mismatches),
            records_logged: get(&self.records_logged),
            log_write_errors: get(&self.log_write_errors),
            uploads_queued: get(&self.uploads_queued),
            uploads_dropped: get(&self.uploads_dropped),
            uploads_sent: get(&self.uploads_sent),
            uploads_failed: get(&self.uploads_failed),
            events_triggered: get(&self.events_triggered),
            snapshots_saved: get(&self.snapshots_saved),
            snapshots_dropped: get(&self.snapshots_dropped),
        }
    }

    /// Dump everything at info level, used at shutdown
    pub fn report(&self) {
        let s = self.snapshot();
        info!(
            cycles = s.cycles,
            ready_timeouts = s.ready_timeouts,
            register_read_errors = s.register_read_errors,
            sentinel_errors = s.sentinel_errors,
            peak_value_mismatches = s.peak_value_mismatches,
            peak_index_mismatches = s.peak_index_mismatches,
            records_logged = s.records_logged,
            log_write_errors = s.log_write_errors,
            uploads_queued = s.uploads_queued,
            uploads_dropped = s.uploads_dropped,
            uploads_sent = s.uploads_sent,
            uploads_failed = s.uploads_failed,
            events_triggered = s.events_triggered,
            snapshots_saved = s.snapshots_saved,
            snapshots_dropped = s.snapshots_dropped,
            "Runtime counters"
        );
    }
}
