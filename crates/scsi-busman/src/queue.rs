//! Per-device request queue (elevator) and the bus's list of devices waiting for service.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::device::DeviceId;
use crate::request::Request;

/// A queued request with its scheduling attributes captured at enqueue time.
#[derive(Debug, Clone)]
pub(crate) struct QueueEntry<R = Arc<Request>> {
    pub request: R,
    pub sort: i64,
    pub ordered: bool,
}

impl<R> QueueEntry<R> {
    pub fn new(request: R, sort: i64, ordered: bool) -> Self {
        Self {
            request,
            sort,
            ordered,
        }
    }

    fn is_barrier(&self) -> bool {
        self.ordered
    }
}

/// Position of `key` in a one-directional sweep that starts at `last_sort`: keys at or past
/// the head position come first, keys behind it wrap to the next sweep.
fn sweep_rank(key: i64, last_sort: i64) -> (bool, i64) {
    (key < last_sort, key)
}

#[derive(Debug)]
pub(crate) struct DeviceQueue<R = Arc<Request>> {
    entries: VecDeque<QueueEntry<R>>,
}

impl<R> Default for DeviceQueue<R> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }
}

impl<R> DeviceQueue<R> {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry<R>> {
        self.entries.iter()
    }

    pub fn pop_front(&mut self) -> Option<QueueEntry<R>> {
        self.entries.pop_front()
    }

    /// Puts `entry` in front of everything, regardless of ordering constraints.
    pub fn push_front(&mut self, entry: QueueEntry<R>) {
        self.entries.push_front(entry);
    }

    pub fn remove_where(&mut self, pred: impl Fn(&R) -> bool) -> Option<QueueEntry<R>> {
        let pos = self.entries.iter().position(|e| pred(&e.request))?;
        self.entries.remove(pos)
    }

    pub fn drain(&mut self) -> impl Iterator<Item = QueueEntry<R>> + '_ {
        self.entries.drain(..)
    }

    /// Elevator insertion relative to the last dispatched key `last_sort`.
    ///
    /// Ordered and position-less requests go to the tail. A sortable request never passes an
    /// ordered one and lands after every entry with an equal or lower sweep rank, so equal keys
    /// stay FIFO.
    pub fn insert_sorted(&mut self, entry: QueueEntry<R>, last_sort: i64) {
        let Some(head) = self.entries.front() else {
            self.entries.push_back(entry);
            return;
        };
        if entry.ordered || entry.sort < 0 {
            self.entries.push_back(entry);
            return;
        }

        let new_rank = sweep_rank(entry.sort, last_sort);
        let barrier = self.entries.iter().any(QueueEntry::is_barrier);

        // Head exceptions: new sits between the head position and the head key, or both new
        // and head are behind the head position and new comes first.
        let before_head = (last_sort <= entry.sort && entry.sort < head.sort)
            // Strict so a key equal to the head's queues behind it.
            || (head.sort < last_sort && entry.sort < head.sort);
        if before_head {
            if barrier {
                self.entries.push_back(entry);
            } else {
                self.entries.push_front(entry);
            }
            return;
        }

        for i in (1..=self.entries.len()).rev() {
            let prev = &self.entries[i - 1];
            if prev.is_barrier() {
                self.entries.push_back(entry);
                return;
            }
            if sweep_rank(prev.sort, last_sort) <= new_rank {
                self.entries.insert(i, entry);
                return;
            }
        }
        self.entries.push_front(entry);
    }
}

/// Devices with queued work that are currently allowed to dispatch, serviced round-robin from
/// the front.
#[derive(Debug, Default)]
pub(crate) struct WaitingDevices {
    list: VecDeque<DeviceId>,
}

impl WaitingDevices {
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn front(&self) -> Option<DeviceId> {
        self.list.front().copied()
    }

    pub fn contains(&self, id: DeviceId) -> bool {
        self.list.contains(&id)
    }

    pub fn push_back(&mut self, id: DeviceId) {
        if !self.contains(id) {
            self.list.push_back(id);
        }
    }

    /// Moves (or inserts) `id` to the front so it is serviced next.
    pub fn push_front(&mut self, id: DeviceId) {
        self.remove(id);
        self.list.push_front(id);
    }

    pub fn remove(&mut self, id: DeviceId) -> bool {
        match self.list.iter().position(|d| *d == id) {
            Some(pos) => {
                self.list.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.list.clear();
    }

    pub fn to_vec(&self) -> Vec<DeviceId> {
        self.list.iter().copied().collect()
    }
}
