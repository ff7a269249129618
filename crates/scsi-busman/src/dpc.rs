//! Deferred procedure calls.
//!
//! Controller drivers use DPCs to move work out of their completion path and onto the bus
//! service thread. Both locks here are spinlocks: scheduling must work from contexts that may
//! not sleep.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type DpcCallback = Box<dyn FnOnce() + Send + 'static>;

static NEXT_DPC_ID: AtomicU64 = AtomicU64::new(1);

/// A reusable DPC slot obtained from [`crate::Bus::alloc_dpc`].
///
/// At most one invocation is pending per slot: scheduling a slot that is already pending only
/// replaces the callback.
pub struct Dpc {
    id: u64,
    bus_id: u64,
    pending: spin::Mutex<Option<DpcCallback>>,
}

impl fmt::Debug for Dpc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dpc")
            .field("id", &self.id)
            .field("bus_id", &self.bus_id)
            .field("pending", &self.is_pending())
            .finish()
    }
}

impl Dpc {
    pub(crate) fn new(bus_id: u64) -> Self {
        Self {
            id: NEXT_DPC_ID.fetch_add(1, Ordering::Relaxed),
            bus_id,
            pending: spin::Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn bus_id(&self) -> u64 {
        self.bus_id
    }

    pub fn is_pending(&self) -> bool {
        self.pending.lock().is_some()
    }
}

/// FIFO of pending DPC slots. Lock order: list, then slot.
#[derive(Default)]
pub(crate) struct DpcQueue {
    list: spin::Mutex<VecDeque<Arc<Dpc>>>,
}

impl DpcQueue {
    /// Registers `callback` on `dpc`. Returns `true` if the slot was newly queued, `false` if it
    /// was already pending and only its callback changed.
    pub fn schedule(&self, dpc: &Arc<Dpc>, callback: DpcCallback) -> bool {
        let mut list = self.list.lock();
        let mut slot = dpc.pending.lock();
        let newly = slot.is_none();
        *slot = Some(callback);
        drop(slot);
        if newly {
            list.push_back(dpc.clone());
        }
        newly
    }

    /// Detaches the oldest pending callback, if any. The caller runs it without any lock held.
    pub fn pop(&self) -> Option<DpcCallback> {
        let mut list = self.list.lock();
        while let Some(dpc) = list.pop_front() {
            if let Some(callback) = dpc.pending.lock().take() {
                return Some(callback);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.list.lock().len()
    }

    /// Drops every pending callback without running it.
    pub fn clear(&self) -> usize {
        let mut list = self.list.lock();
        let n = list.len();
        for dpc in list.drain(..) {
            dpc.pending.lock().take();
        }
        n
    }
}
