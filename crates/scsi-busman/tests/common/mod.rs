#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use scsi_busman::scsi_memory::{PagedMemory, PhysicalMemory, PAGE_SIZE};
use scsi_busman::{
    device_status, Bus, BusConfig, ControllerDriver, Device, DeviceConfig, LockedRequestPool,
    PathInquiry, Request, RequestPool, SubsysStatus,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

/// What the mock controller does with a request the moment it is submitted.
pub type Responder = Box<dyn Fn(&Request) -> Option<Reply> + Send + Sync>;

/// Outcome applied to a request before it is handed back to the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub subsys: SubsysStatus,
    pub device_status: u8,
    pub data_resid: usize,
}

impl Reply {
    pub const GOOD: Reply = Reply {
        subsys: SubsysStatus::Completed,
        device_status: device_status::GOOD,
        data_resid: 0,
    };

    pub fn status(device_status: u8) -> Reply {
        Reply {
            subsys: SubsysStatus::CompletedWithError,
            device_status,
            data_resid: 0,
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Default)]
struct MockState {
    held: VecDeque<Arc<Request>>,
    /// Sort keys in the order requests reached the controller.
    log: Vec<(u64, i64)>,
    resets: Vec<(u8, u8)>,
}

/// Controller driver that records submissions and either answers them on the spot (through a
/// [`Responder`]) or holds them until the test completes them.
#[derive(Default)]
pub struct MockController {
    state: Mutex<MockState>,
    cv: Condvar,
    responder: Mutex<Option<Arc<Responder>>>,
}

impl MockController {
    pub fn set_responder(&self, responder: impl Fn(&Request) -> Option<Reply> + Send + Sync + 'static) {
        *lock(&self.responder) = Some(Arc::new(Box::new(responder)));
    }

    pub fn held(&self) -> usize {
        lock(&self.state).held.len()
    }

    pub fn held_for(&self, device: &Device) -> usize {
        lock(&self.state)
            .held
            .iter()
            .filter(|r| r.device().id() == device.id())
            .count()
    }

    /// Sort keys of every request submitted so far, in submission order.
    pub fn sort_log(&self) -> Vec<i64> {
        lock(&self.state).log.iter().map(|(_, sort)| *sort).collect()
    }

    pub fn id_log(&self) -> Vec<u64> {
        lock(&self.state).log.iter().map(|(id, _)| *id).collect()
    }

    pub fn resets(&self) -> Vec<(u8, u8)> {
        lock(&self.state).resets.clone()
    }

    /// Waits until at least `n` requests are held.
    pub fn wait_held(&self, n: usize) -> bool {
        let state = lock(&self.state);
        let (state, _) = match self.cv.wait_timeout_while(state, TIMEOUT, |s| s.held.len() < n) {
            Ok(res) => res,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.held.len() >= n
    }

    pub fn take(&self, pos: usize) -> Option<Arc<Request>> {
        lock(&self.state).held.remove(pos)
    }

    pub fn take_oldest(&self) -> Option<Arc<Request>> {
        lock(&self.state).held.pop_front()
    }

    pub fn take_request(&self, request: &Arc<Request>) -> Option<Arc<Request>> {
        let mut state = lock(&self.state);
        let pos = state.held.iter().position(|r| Arc::ptr_eq(r, request))?;
        state.held.remove(pos)
    }

    /// Applies `reply` and reports the completion, with the held count for the device (this
    /// request included) as the observed concurrency.
    pub fn complete(&self, request: Arc<Request>, reply: Reply) {
        let observed = 1 + self.held_for(request.device());
        apply(&request, reply);
        let bus = request.device().bus().clone();
        bus.on_completion(request, observed);
    }

    pub fn complete_oldest(&self, reply: Reply) -> Option<u64> {
        let request = self.take_oldest()?;
        let id = request.id();
        self.complete(request, reply);
        Some(id)
    }
}

fn apply(request: &Request, reply: Reply) {
    let mut data = request.lock();
    data.subsys_status = reply.subsys;
    data.device_status = reply.device_status;
    data.data_resid = reply.data_resid;
}

impl ControllerDriver for MockController {
    fn submit(&self, request: Arc<Request>) {
        let sort = request.lock().sort;
        lock(&self.state).log.push((request.id(), sort));

        let responder = lock(&self.responder).clone();
        if let Some(responder) = responder {
            if let Some(reply) = responder(&request) {
                let observed = 1 + self.held_for(request.device());
                apply(&request, reply);
                let bus = request.device().bus().clone();
                bus.on_completion(request, observed);
                return;
            }
        }
        lock(&self.state).held.push_back(request);
        self.cv.notify_all();
    }

    fn path_inquiry(&self) -> PathInquiry {
        PathInquiry {
            initiator_id: 7,
            max_target: 15,
            max_lun: 7,
            hba_queue_size: 32,
            sim_vendor: "mock".to_string(),
            hba_vendor: "mock".to_string(),
            controller_family: "test".to_string(),
        }
    }

    fn reset_bus(&self) -> SubsysStatus {
        lock(&self.state).resets.push((u8::MAX, u8::MAX));
        SubsysStatus::Completed
    }

    fn reset_device(&self, target: u8, lun: u8) -> SubsysStatus {
        lock(&self.state).resets.push((target, lun));
        SubsysStatus::Completed
    }

    fn terminate(&self, request: &Arc<Request>) -> SubsysStatus {
        match self.take_request(request) {
            Some(request) => {
                self.complete(
                    request,
                    Reply {
                        subsys: SubsysStatus::Aborted,
                        device_status: device_status::GOOD,
                        data_resid: 0,
                    },
                );
                SubsysStatus::Completed
            }
            None => SubsysStatus::InvalidRequest,
        }
    }

    fn ioctl(&self, op: u32, buf: &mut [u8]) -> Result<(), SubsysStatus> {
        match op {
            1 => {
                buf.fill(0xa5);
                Ok(())
            }
            _ => Err(SubsysStatus::InvalidRequest),
        }
    }
}

/// A bus wired to a [`MockController`] and page-backed memory. Shuts the bus down on drop.
pub struct Harness {
    pub bus: Arc<Bus>,
    pub sim: Arc<MockController>,
    pub memory: Arc<PagedMemory>,
    pub pool: LockedRequestPool,
}

impl Harness {
    pub fn new(config: BusConfig) -> Self {
        Self::with_memory(config, PagedMemory::new(256 * PAGE_SIZE as u64).unwrap())
    }

    pub fn with_memory(config: BusConfig, memory: PagedMemory) -> Self {
        init_tracing();
        let sim = Arc::new(MockController::default());
        let memory = Arc::new(memory);
        let bus = Bus::attach(
            config,
            sim.clone(),
            memory.clone() as Arc<dyn PhysicalMemory>,
        )
        .unwrap();
        Self {
            bus,
            sim,
            memory,
            pool: LockedRequestPool::default(),
        }
    }

    pub fn device(&self, target: u8, config: DeviceConfig) -> Arc<Device> {
        self.bus.register_device(target, 0, config).unwrap()
    }

    /// A TEST UNIT READY-like command without data, carrying `sort` as its elevator key.
    pub fn request(&self, device: &Arc<Device>, sort: i64) -> Arc<Request> {
        let request = self.pool.allocate(device).unwrap();
        {
            let mut data = request.lock();
            data.set_cdb(&[0x00, 0, 0, 0, 0, 0]);
            data.sort = sort;
        }
        request
    }

    pub fn submit(&self, device: &Arc<Device>, sort: i64) -> Arc<Request> {
        let request = self.request(device, sort);
        self.bus.submit_async(&request).unwrap();
        request
    }

    /// Waits until the service thread has nothing it may dispatch and every dispatched request
    /// has reached the controller.
    pub fn settle(&self) {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            let snap = self.bus.snapshot();
            let in_flight = (snap.total_slots - snap.left_slots) as usize;
            let quiet = snap.waiting.is_empty() || snap.lock_count > 0;
            if quiet && in_flight == self.sim.held() {
                return;
            }
            assert!(Instant::now() < deadline, "bus did not settle: {snap:?}");
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.bus.shutdown();
    }
}

/// Polls `cond` until it holds or [`TIMEOUT`] passes.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while !cond() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
    true
}

pub fn small_queue(hba_queue_size: u32) -> BusConfig {
    BusConfig {
        hba_queue_size,
        ..BusConfig::default()
    }
}

pub fn depth(queue_depth: u32) -> DeviceConfig {
    DeviceConfig {
        queue_depth,
        ..DeviceConfig::default()
    }
}
