use std::sync::{Mutex, MutexGuard};

/// Locks `m`, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Rounds `value` up to a multiple of `mask + 1` (`mask` is a 2^n-1 mask).
pub(crate) fn round_up_mask(value: u64, mask: u64) -> u64 {
    (value + mask) & !mask
}
