//! Admission bookkeeping for one bus and its devices.
//!
//! Everything in here lives under the bus mutex. The main invariant: a device is on the waiting
//! list exactly when it has queued requests and nothing blocks it. Every method that changes a
//! device's queue or blocks re-establishes that with [`AdmissionState::refresh_waiting`].

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::device::DeviceId;
use crate::queue::{DeviceQueue, QueueEntry, WaitingDevices};
use crate::request::Request;

/// Why a bus or device is not dispatching.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct BlockState {
    /// Explicit block/unblock pairs from the controller driver.
    pub by_driver: u32,
    /// Slot exhaustion and ordered barriers.
    pub by_self: u32,
    /// The controller refused a command; cleared by the next completion or a continue call.
    pub overflow: bool,
}

impl BlockState {
    pub fn lock_count(&self) -> u32 {
        self.by_driver + self.by_self + u32::from(self.overflow)
    }

    pub fn is_blocked(&self) -> bool {
        self.lock_count() > 0
    }
}

/// Slot accounting shared by bus and devices: `left + in_flight == total` at all times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Slots {
    pub total: i32,
    pub left: i32,
}

impl Slots {
    fn new(total: u32) -> Self {
        let total = i32::try_from(total.max(1)).unwrap_or(i32::MAX);
        Self { total, left: total }
    }

    pub fn in_flight(&self) -> i32 {
        self.total - self.left
    }

    /// Takes one slot. Returns whether this exhausted the slots.
    fn take(&mut self) -> bool {
        self.left -= 1;
        self.left == 0
    }

    /// Gives one slot back. Returns whether slots became available again.
    fn give(&mut self) -> bool {
        self.left += 1;
        self.left == 1
    }
}

#[derive(Debug)]
pub(crate) struct DeviceState {
    pub block: BlockState,
    pub slots: Slots,
    pub queue: DeviceQueue,
    /// Sort key of the last dispatched sortable request (the head position).
    pub last_sort: i64,
    /// Request whose sense data the autosense command is currently fetching.
    pub autosense_for: Option<Arc<Request>>,
    pub autosense_waiters: VecDeque<Arc<Request>>,
}

impl DeviceState {
    pub fn new(queue_depth: u32) -> Self {
        Self {
            block: BlockState::default(),
            slots: Slots::new(queue_depth),
            queue: DeviceQueue::default(),
            last_sort: 0,
            autosense_for: None,
            autosense_waiters: VecDeque::new(),
        }
    }

    fn is_eligible(&self) -> bool {
        !self.block.is_blocked() && !self.queue.is_empty()
    }

    /// Nothing queued, nothing in flight, no sense fetch pending.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
            && self.slots.in_flight() == 0
            && self.autosense_for.is_none()
            && self.autosense_waiters.is_empty()
    }
}

/// Which side a requeue attributes a refused command to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Overflow {
    Device,
    Bus,
}

#[derive(Debug)]
pub(crate) struct AdmissionState {
    pub block: BlockState,
    pub slots: Slots,
    pub waiting: WaitingDevices,
    pub devices: HashMap<DeviceId, DeviceState>,
}

impl AdmissionState {
    pub fn new(hba_queue_size: u32) -> Self {
        Self {
            block: BlockState::default(),
            slots: Slots::new(hba_queue_size),
            waiting: WaitingDevices::default(),
            devices: HashMap::new(),
        }
    }

    /// Whether the service thread has something it may dispatch right now.
    pub fn can_service(&self) -> bool {
        !self.block.is_blocked() && !self.waiting.is_empty()
    }

    /// Fast path: a new request for `id` may go straight to the controller, skipping the queue.
    pub fn can_dispatch_directly(&self, id: DeviceId) -> bool {
        let Some(dev) = self.devices.get(&id) else {
            return false;
        };
        dev.queue.is_empty()
            && !dev.block.is_blocked()
            && self.waiting.is_empty()
            && !self.block.is_blocked()
    }

    pub fn device(&self, id: DeviceId) -> &DeviceState {
        match self.devices.get(&id) {
            Some(dev) => dev,
            None => panic!("device {id} has no admission state"),
        }
    }

    pub fn device_mut(&mut self, id: DeviceId) -> &mut DeviceState {
        match self.devices.get_mut(&id) {
            Some(dev) => dev,
            None => panic!("device {id} has no admission state"),
        }
    }

    /// Puts `id` on or takes it off the waiting list to match its queue and blocks.
    pub fn refresh_waiting(&mut self, id: DeviceId) {
        let eligible = self.devices.get(&id).is_some_and(DeviceState::is_eligible);
        if eligible {
            self.waiting.push_back(id);
        } else {
            self.waiting.remove(id);
        }
    }

    /// Makes `id` the next device serviced, if it may dispatch at all.
    pub fn promote(&mut self, id: DeviceId) {
        if self.device(id).is_eligible() {
            self.waiting.push_front(id);
        } else {
            self.waiting.remove(id);
        }
    }

    /// Sends `id` to the back of the round-robin, if it may dispatch at all.
    pub fn demote(&mut self, id: DeviceId) {
        self.waiting.remove(id);
        self.refresh_waiting(id);
    }

    /// Bookkeeping for one request leaving for the controller.
    pub fn take_slots(&mut self, id: DeviceId, ordered: bool) {
        if self.slots.take() {
            self.block.by_self += 1;
        }
        let dev = self.device_mut(id);
        if dev.slots.take() {
            dev.block.by_self += 1;
        }
        if ordered {
            dev.block.by_self += 1;
        }
        self.refresh_waiting(id);
    }

    /// Inverse of [`AdmissionState::take_slots`], for a request coming back from the controller.
    pub fn return_slots(&mut self, id: DeviceId, ordered: bool) {
        if self.slots.give() {
            self.block.by_self -= 1;
        }
        let dev = self.device_mut(id);
        if dev.slots.give() {
            dev.block.by_self -= 1;
        }
        if ordered {
            dev.block.by_self -= 1;
        }
        self.refresh_waiting(id);
    }

    /// Shrinks the device's concurrency to `max(observed - 1, 1)` if that is below the current
    /// total. Returns the new total when it changed.
    pub fn shrink_device_slots(&mut self, id: DeviceId, observed: usize) -> Option<i32> {
        let new_total = i32::try_from(observed.saturating_sub(1).max(1)).unwrap_or(i32::MAX);
        let dev = self.device_mut(id);
        if new_total >= dev.slots.total {
            return None;
        }
        let diff = dev.slots.total - new_total;
        let was_available = dev.slots.left > 0;
        dev.slots.total = new_total;
        dev.slots.left -= diff;
        if was_available && dev.slots.left <= 0 {
            dev.block.by_self += 1;
        }
        warn!(device = %id, total = new_total, left = dev.slots.left, "device queue depth reduced");
        self.refresh_waiting(id);
        Some(new_total)
    }

    /// Puts a refused request back in front of its device and raises the overflow flag on the
    /// side that refused it.
    ///
    /// An overflow flag is only kept while its side still has commands in flight, since only a
    /// completion clears it.
    pub fn requeue_front(&mut self, request: Arc<Request>, sort: i64, ordered: bool, side: Overflow) {
        let id = request.device().id();
        self.device_mut(id)
            .queue
            .push_front(QueueEntry::new(request, sort, ordered));
        match side {
            Overflow::Device => {
                let dev = self.device_mut(id);
                if !dev.block.overflow {
                    dev.block.overflow = true;
                    debug!(device = %id, "device overflow");
                }
                self.block.overflow = false;
            }
            Overflow::Bus => {
                if !self.block.overflow {
                    self.block.overflow = true;
                    debug!("bus overflow");
                }
            }
        }
        if self.slots.in_flight() == 0 {
            self.block.overflow = false;
        }
        let dev = self.device_mut(id);
        if dev.slots.in_flight() == 0 {
            dev.block.overflow = false;
        }
        self.demote(id);
    }

    /// A completion proves the controller has room again.
    pub fn clear_overflow(&mut self, id: DeviceId) {
        self.block.overflow = false;
        if let Some(dev) = self.devices.get_mut(&id) {
            dev.block.overflow = false;
        }
        self.refresh_waiting(id);
    }

    pub fn block_device(&mut self, id: DeviceId) {
        self.device_mut(id).block.by_driver += 1;
        self.refresh_waiting(id);
    }

    pub fn unblock_device(&mut self, id: DeviceId) {
        let dev = self.device_mut(id);
        if dev.block.by_driver == 0 {
            panic!("unblocking device {id} which is not blocked");
        }
        dev.block.by_driver -= 1;
        self.refresh_waiting(id);
    }

    pub fn continue_device(&mut self, id: DeviceId) {
        self.device_mut(id).block.overflow = false;
        self.refresh_waiting(id);
    }

    pub fn block_bus(&mut self) {
        self.block.by_driver += 1;
    }

    pub fn unblock_bus(&mut self) {
        if self.block.by_driver == 0 {
            panic!("unblocking bus which is not blocked");
        }
        self.block.by_driver -= 1;
    }

    pub fn continue_bus(&mut self) {
        self.block.overflow = false;
    }
}
