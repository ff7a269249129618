//! Wake-up credits for the bus service thread.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::thread::{self, Thread};

/// Counting wake-up signal for the bus service thread.
///
/// Posting is a single atomic increment plus an unpark and never takes a lock, so it is safe
/// from completion paths that run in interrupt-like context.
#[derive(Debug, Default)]
pub(crate) struct ServiceSignal {
    credits: AtomicUsize,
    waiter: OnceLock<Thread>,
}

impl ServiceSignal {
    /// Binds the signal to the calling thread. Only that thread may call [`ServiceSignal::wait`].
    pub fn register_current(&self) {
        let _ = self.waiter.set(thread::current());
    }

    /// Adds one credit and wakes the service thread.
    pub fn post(&self) {
        self.credits.fetch_add(1, Ordering::AcqRel);
        if let Some(waiter) = self.waiter.get() {
            waiter.unpark();
        }
    }

    /// Adds one credit and wakes the service thread unless the caller is the service thread
    /// itself, which picks the credit up on its next pass.
    pub fn post_no_reschedule(&self) {
        self.credits.fetch_add(1, Ordering::AcqRel);
        if let Some(waiter) = self.waiter.get() {
            if waiter.id() != thread::current().id() {
                waiter.unpark();
            }
        }
    }

    /// Consumes every credit posted so far.
    pub fn drain(&self) -> usize {
        self.credits.swap(0, Ordering::AcqRel)
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.credits.load(Ordering::Acquire)
    }

    /// Parks until at least one credit is available, then consumes it.
    pub fn wait(&self) {
        loop {
            let credits = self.credits.load(Ordering::Acquire);
            if credits == 0 {
                thread::park();
                continue;
            }
            if self
                .credits
                .compare_exchange(credits, credits - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }
}
