//! Scheduling counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Per-bus scheduling counters.
///
/// Updated with relaxed atomics from submit, service and completion paths; read through
/// [`BusStats::snapshot`].
#[derive(Debug, Default)]
pub struct BusStats {
    submitted: AtomicU64,
    dispatched_direct: AtomicU64,
    dispatched_queued: AtomicU64,
    completed: AtomicU64,
    queue_full: AtomicU64,
    requeued: AtomicU64,
    resubmitted: AtomicU64,
    aborted: AtomicU64,
    autosense_issued: AtomicU64,
    dma_buffered: AtomicU64,
    dma_reclaimed: AtomicU64,
    dpcs_run: AtomicU64,
}

macro_rules! counters {
    ($($inc:ident => $field:ident),* $(,)?) => {
        impl BusStats {
            $(
                pub(crate) fn $inc(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*

            pub fn snapshot(&self) -> BusStatsSnapshot {
                BusStatsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    inc_submitted => submitted,
    inc_dispatched_direct => dispatched_direct,
    inc_dispatched_queued => dispatched_queued,
    inc_completed => completed,
    inc_queue_full => queue_full,
    inc_requeued => requeued,
    inc_resubmitted => resubmitted,
    inc_aborted => aborted,
    inc_autosense_issued => autosense_issued,
    inc_dma_buffered => dma_buffered,
    inc_dma_reclaimed => dma_reclaimed,
    inc_dpcs_run => dpcs_run,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStatsSnapshot {
    pub submitted: u64,
    /// Sent straight from the submitting thread.
    pub dispatched_direct: u64,
    /// Sent by the service thread after waiting in a device queue.
    pub dispatched_queued: u64,
    pub completed: u64,
    pub queue_full: u64,
    pub requeued: u64,
    pub resubmitted: u64,
    pub aborted: u64,
    pub autosense_issued: u64,
    pub dma_buffered: u64,
    pub dma_reclaimed: u64,
    pub dpcs_run: u64,
}

impl BusStatsSnapshot {
    pub fn dispatched(&self) -> u64 {
        self.dispatched_direct + self.dispatched_queued
    }
}
