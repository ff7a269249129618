//! Request allocation.

use std::sync::{Arc, Condvar, Mutex};

use tracing::trace;

use crate::config::PoolConfig;
use crate::device::Device;
use crate::request::{Request, RequestData, RequestState};
use crate::util::lock;
use crate::{BusError, Result};

/// Source of [`Request`]s for peripheral drivers.
///
/// `allocate` hands out a request in the `Finished` state with cleared fields. `release` takes it
/// back; releasing a request that is not `Finished` is a contract violation and panics.
pub trait RequestPool: Send + Sync {
    fn allocate(&self, device: &Arc<Device>) -> Result<Arc<Request>>;

    fn release(&self, request: Arc<Request>);
}

#[derive(Debug, Default)]
struct PoolState {
    spare: Vec<RequestData>,
    outstanding: usize,
}

/// Mutex-protected pool that recycles request storage.
#[derive(Debug)]
pub struct LockedRequestPool {
    config: PoolConfig,
    state: Mutex<PoolState>,
    freed: Condvar,
}

impl LockedRequestPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PoolState::default()),
            freed: Condvar::new(),
        }
    }

    pub fn outstanding(&self) -> usize {
        lock(&self.state).outstanding
    }

    /// Recycled request bodies ready for reuse.
    pub fn spare(&self) -> usize {
        lock(&self.state).spare.len()
    }
}

impl Default for LockedRequestPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl RequestPool for LockedRequestPool {
    fn allocate(&self, device: &Arc<Device>) -> Result<Arc<Request>> {
        let mut state = lock(&self.state);
        while self.config.capacity != 0 && state.outstanding >= self.config.capacity {
            if !self.config.wait_when_exhausted {
                return Err(BusError::PoolExhausted);
            }
            state = match self.freed.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        state.outstanding += 1;
        let data = state.spare.pop().unwrap_or_default();
        drop(state);

        let request = Arc::new(Request::new(device.clone(), data));
        trace!(request = request.id(), device = %device.id(), "request allocated");
        Ok(request)
    }

    fn release(&self, request: Arc<Request>) {
        let state = request.state();
        if state != RequestState::Finished {
            panic!("request {} released while {:?}", request.id(), state);
        }
        request.set_state(RequestState::Free);
        trace!(request = request.id(), "request released");

        let mut pool = lock(&self.state);
        pool.outstanding -= 1;
        if let Ok(request) = Arc::try_unwrap(request) {
            pool.spare.push(request.into_data());
        }
        drop(pool);
        self.freed.notify_one();
    }
}
