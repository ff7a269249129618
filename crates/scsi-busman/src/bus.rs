//! One SCSI bus: admission control, the service thread and the public submission API.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use scsi_memory::{PhysicalEntry, PhysicalMemory, Placement};
use tracing::{debug, info, trace, warn};

use crate::config::{BusConfig, DeviceConfig};
use crate::device::{Device, DeviceId};
use crate::dpc::{Dpc, DpcQueue};
use crate::flow::{AdmissionState, DeviceState, Overflow};
use crate::queue::QueueEntry;
use crate::request::{
    device_status, Request, RequestFlags, RequestState, SubsysStatus, MAX_SENSE_SIZE,
};
use crate::sg::build_sg_list;
use crate::signal::ServiceSignal;
use crate::sim::{ControllerDriver, PathInquiry};
use crate::stats::{BusStats, BusStatsSnapshot};
use crate::util::lock;
use crate::{BusError, Result};

static NEXT_BUS_ID: AtomicU64 = AtomicU64::new(1);

/// Result of [`Bus::abort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOutcome {
    /// Removed from its device queue and completed with [`SubsysStatus::Aborted`].
    Aborted,
    /// Already handed to the controller; only the controller can stop it now.
    InFlight,
    /// Not queued on this bus (never submitted, or already finished).
    NotQueued,
}

/// Point-in-time view of a device's admission state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub total_slots: i32,
    pub left_slots: i32,
    pub queued: usize,
    pub lock_count: u32,
    pub overflow: bool,
    pub waiting: bool,
    pub last_sort: i64,
}

/// Point-in-time view of the bus's admission state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusSnapshot {
    pub total_slots: i32,
    pub left_slots: i32,
    pub lock_count: u32,
    pub overflow: bool,
    pub waiting: Vec<DeviceId>,
    pub pending_dpcs: usize,
}

/// Per-controller command scheduler.
///
/// A bus owns one service thread that dispatches queued requests and runs DPCs, plus a
/// background thread that frees idle DMA bounce buffers. Both hold a reference to the bus until
/// [`Bus::shutdown`] stops them.
pub struct Bus {
    pub(crate) id: u64,
    pub(crate) config: BusConfig,
    pub(crate) sim: Arc<dyn ControllerDriver>,
    pub(crate) memory: Arc<dyn PhysicalMemory>,
    pub(crate) admission: Mutex<AdmissionState>,
    dpc: DpcQueue,
    signal: ServiceSignal,
    shutting_down: AtomicBool,
    devices: Mutex<Vec<Weak<Device>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    reclaim_stop: Mutex<bool>,
    reclaim_cv: Condvar,
    pub(crate) stats: BusStats,
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

impl Bus {
    /// Creates a bus for `sim` and starts its service and DMA reclaim threads.
    pub fn attach(
        config: BusConfig,
        sim: Arc<dyn ControllerDriver>,
        memory: Arc<dyn PhysicalMemory>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let bus = Arc::new(Self {
            id: NEXT_BUS_ID.fetch_add(1, Ordering::Relaxed),
            admission: Mutex::new(AdmissionState::new(config.hba_queue_size)),
            config,
            sim,
            memory,
            dpc: DpcQueue::default(),
            signal: ServiceSignal::default(),
            shutting_down: AtomicBool::new(false),
            devices: Mutex::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
            reclaim_stop: Mutex::new(false),
            reclaim_cv: Condvar::new(),
            stats: BusStats::default(),
        });

        let name = bus.config.service_thread_name.clone();
        bus.spawn_worker(name.clone(), Self::service_loop)?;
        if let Err(err) = bus.spawn_worker(format!("{name}-dma-reclaim"), Self::reclaim_loop) {
            bus.shutdown();
            return Err(err);
        }

        info!(
            bus = bus.id,
            hba_queue_size = bus.config.hba_queue_size,
            "bus attached"
        );
        Ok(bus)
    }

    fn spawn_worker(self: &Arc<Self>, name: String, body: fn(Arc<Self>)) -> Result<()> {
        let bus = self.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || body(bus))
            .map_err(|err| BusError::ThreadSpawn {
                name,
                reason: err.to_string(),
            })?;
        lock(&self.workers).push(handle);
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn memory(&self) -> &Arc<dyn PhysicalMemory> {
        &self.memory
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> BusStatsSnapshot {
        self.stats.snapshot()
    }

    /// Runs `f` on the admission state and wakes the service thread if it turned serviceable.
    pub(crate) fn with_admission<T>(&self, f: impl FnOnce(&mut AdmissionState) -> T) -> T {
        let mut st = lock(&self.admission);
        let was = st.can_service();
        let out = f(&mut st);
        let now = st.can_service();
        drop(st);
        if !was && now {
            self.signal.post();
        }
        out
    }

    // ---------------------------------------------------------------------
    // Service thread
    // ---------------------------------------------------------------------

    fn service_loop(self: Arc<Self>) {
        self.signal.register_current();
        debug!(bus = self.id, "service thread running");
        loop {
            // Posts that land after the drain make the next wait return at once.
            self.signal.drain();
            if self.is_shutting_down() {
                break;
            }
            if self.run_one_dpc() || self.dispatch_one() {
                continue;
            }
            self.signal.wait();
        }
        debug!(bus = self.id, "service thread exiting");
    }

    fn run_one_dpc(&self) -> bool {
        let Some(callback) = self.dpc.pop() else {
            return false;
        };
        callback();
        self.stats.inc_dpcs_run();
        true
    }

    /// Sends the head request of the next waiting device to the controller.
    fn dispatch_one(&self) -> bool {
        let mut st = lock(&self.admission);
        if !st.can_service() {
            return false;
        }
        let Some(id) = st.waiting.front() else {
            return false;
        };
        let Some(entry) = st.device_mut(id).queue.pop_front() else {
            warn!(device = %id, "waiting device has an empty queue");
            st.refresh_waiting(id);
            return true;
        };
        if entry.sort >= 0 {
            st.device_mut(id).last_sort = entry.sort;
        }
        // Off the front; take_slots re-adds at the tail if the device may go on.
        st.waiting.remove(id);
        st.take_slots(id, entry.ordered);
        entry.request.transition(RequestState::Queued, RequestState::Sent);
        drop(st);

        self.stats.inc_dispatched_queued();
        trace!(request = entry.request.id(), device = %id, sort = entry.sort, "dispatching");
        self.sim.submit(entry.request);
        true
    }

    // ---------------------------------------------------------------------
    // Submission
    // ---------------------------------------------------------------------

    /// Submits `request` without waiting for it.
    ///
    /// On `Ok` the request will complete exactly once. On `Err` it was not accepted, its state
    /// is back to `Finished` and nothing is left claimed on its behalf.
    pub fn submit_async(&self, request: &Arc<Request>) -> Result<()> {
        let device = request.device().clone();
        if device.bus().id() != self.id {
            return Err(BusError::InvalidRequest("request belongs to another bus"));
        }
        if self.is_shutting_down() {
            return Err(BusError::ShuttingDown);
        }
        if !device.is_valid() {
            return Err(BusError::DeviceGone);
        }
        let (sort, ordered) = {
            let data = request.lock();
            if data.cdb_len == 0 {
                return Err(BusError::InvalidRequest("empty command block"));
            }
            if data.data_length > 0 && data.sg_list.is_none() {
                return Err(BusError::InvalidRequest("data without scatter-gather list"));
            }
            (data.sort, data.flags.contains(RequestFlags::ORDERED))
        };

        request.begin_submission();
        request.set_ordered(ordered);
        match device.dma.prepare(request, &self.config.dma, &*self.memory) {
            Ok(true) => self.stats.inc_dma_buffered(),
            Ok(false) => {}
            Err(err) => {
                request.abandon_submission();
                debug!(request = request.id(), %err, "submission rejected");
                return Err(err);
            }
        }
        self.stats.inc_submitted();

        let direct = self.with_admission(|st| {
            if self.is_shutting_down() {
                return Err(BusError::ShuttingDown);
            }
            if !st.devices.contains_key(&device.id()) {
                return Err(BusError::DeviceGone);
            }
            let id = device.id();
            if st.can_dispatch_directly(id) {
                if sort >= 0 {
                    st.device_mut(id).last_sort = sort;
                }
                st.take_slots(id, ordered);
                request.transition(RequestState::InWork, RequestState::Sent);
                return Ok(true);
            }
            request.transition(RequestState::InWork, RequestState::Queued);
            let dev = st.device_mut(id);
            let last_sort = dev.last_sort;
            dev.queue
                .insert_sorted(QueueEntry::new(request.clone(), sort, ordered), last_sort);
            st.refresh_waiting(id);
            Ok(false)
        });

        match direct {
            Ok(true) => {
                self.stats.inc_dispatched_direct();
                trace!(request = request.id(), device = %device.id(), "dispatching directly");
                self.sim.submit(request.clone());
                Ok(())
            }
            Ok(false) => {
                trace!(request = request.id(), device = %device.id(), sort, "queued");
                Ok(())
            }
            Err(err) => {
                device.dma.release(request, &*self.memory);
                request.abandon_submission();
                Err(err)
            }
        }
    }

    /// Submits `request` and blocks until it completes.
    ///
    /// A request with a flat data buffer (`data`) but no fragment list gets a temporary one for
    /// the duration of the call.
    pub fn submit_sync(&self, request: &Arc<Request>) -> Result<()> {
        let temp_sg = {
            let mut data = request.lock();
            if data.data_length > 0 && data.sg_list.is_none() {
                let vaddr = data
                    .data
                    .ok_or(BusError::InvalidRequest("data length without a buffer"))?;
                let sg = build_sg_list(&*self.memory, vaddr, data.data_length, &self.config.dma)?;
                data.sg_list = Some(sg);
                true
            } else {
                false
            }
        };

        let result = self.submit_async(request);
        if result.is_ok() {
            request.wait();
        }
        if temp_sg {
            request.lock().sg_list = None;
        }
        result
    }

    /// Removes a queued request and completes it as aborted.
    pub fn abort(&self, request: &Arc<Request>) -> AbortOutcome {
        let device = request.device().clone();
        let id = device.id();
        let removed = self.with_admission(|st| {
            if request.state() != RequestState::Queued {
                return false;
            }
            let Some(dev) = st.devices.get_mut(&id) else {
                return false;
            };
            let request_id = request.id();
            if dev.queue.remove_where(|r| r.id() == request_id).is_none() {
                return false;
            }
            request.transition(RequestState::Queued, RequestState::InWork);
            st.refresh_waiting(id);
            true
        });
        if !removed {
            return match request.state() {
                RequestState::Sent => AbortOutcome::InFlight,
                _ => AbortOutcome::NotQueued,
            };
        }

        request.lock().subsys_status = SubsysStatus::Aborted;
        device.dma.release(request, &*self.memory);
        self.stats.inc_aborted();
        debug!(request = request.id(), device = %id, "request aborted");
        request.finish();
        self.reap_if_removed(&device);
        AbortOutcome::Aborted
    }

    /// Aborts a queued request locally, or asks the controller to terminate one it holds.
    pub fn terminate(&self, request: &Arc<Request>) -> SubsysStatus {
        match self.abort(request) {
            AbortOutcome::Aborted => SubsysStatus::Aborted,
            AbortOutcome::InFlight => self.sim.terminate(request),
            AbortOutcome::NotQueued => SubsysStatus::InvalidRequest,
        }
    }

    // ---------------------------------------------------------------------
    // Controller callbacks
    // ---------------------------------------------------------------------

    /// Takes a request back from the controller (`Sent -> InWork`). Only one callback can win;
    /// a second answer for the same dispatch panics.
    fn claim_sent(request: &Request, what: &str) {
        if let Err(state) = request.try_transition(RequestState::Sent, RequestState::InWork) {
            panic!("{what} for request {} in state {state:?}", request.id());
        }
    }

    /// The controller is done with `request`. `observed` is the number of commands the controller
    /// had outstanding for the device, used to size the queue on QUEUE FULL.
    pub fn on_completion(&self, request: Arc<Request>, observed: usize) {
        Self::claim_sent(&request, "completion");
        let device = request.device().clone();
        let id = device.id();
        let (subsys, status, flags) = {
            let data = request.lock();
            (data.subsys_status, data.device_status, data.flags)
        };
        self.stats.inc_completed();

        if subsys == SubsysStatus::CompletedWithError && status == device_status::QUEUE_FULL {
            self.handle_queue_full(request, observed);
            return;
        }

        let fetch_sense = !request.is_autosense()
            && subsys == SubsysStatus::CompletedWithError
            && status == device_status::CHECK_CONDITION
            && device.config().manual_autosense
            && !flags.contains(RequestFlags::DIS_AUTOSENSE);
        if fetch_sense {
            request.lock().autosense_pending = true;
        }

        let ordered = request.is_ordered();
        let failed = self.with_admission(|st| {
            st.return_slots(id, ordered);
            st.clear_overflow(id);
            if fetch_sense {
                self.queue_autosense(st, &device, request.clone())
            } else {
                None
            }
        });
        device.dma.release(&request, &*self.memory);
        trace!(request = request.id(), device = %id, ?subsys, status, "completed");

        if request.is_autosense() {
            self.finish_autosense(&device, &request);
        } else if !fetch_sense {
            request.finish();
        }
        if let Some(failed) = failed {
            failed.finish();
        }
        self.reap_if_removed(&device);
    }

    fn handle_queue_full(&self, request: Arc<Request>, observed: usize) {
        self.stats.inc_queue_full();
        debug!(
            request = request.id(),
            device = %request.device().id(),
            observed,
            "queue full"
        );
        self.requeue_with(request, |st, id| {
            st.shrink_device_slots(id, observed);
            Overflow::Device
        });
    }

    /// The controller refused `request`; put it back at the head of its device queue and hold
    /// off either the bus or the device until a completion shows there is room again.
    pub fn requeue(&self, request: Arc<Request>, bus_overflow: bool) {
        Self::claim_sent(&request, "requeue");
        self.stats.inc_requeued();
        let side = if bus_overflow {
            Overflow::Bus
        } else {
            Overflow::Device
        };
        self.requeue_with(request, |_, _| side);
    }

    fn requeue_with(
        &self,
        request: Arc<Request>,
        adjust: impl FnOnce(&mut AdmissionState, DeviceId) -> Overflow,
    ) {
        let id = request.device().id();
        let ordered = request.is_ordered();
        let sort = {
            let mut data = request.lock();
            data.subsys_status = SubsysStatus::InProgress;
            data.device_status = device_status::GOOD;
            data.sort
        };
        let requeued = self.with_admission(|st| {
            st.return_slots(id, ordered);
            let side = adjust(st, id);
            if self.is_shutting_down() {
                return false;
            }
            request.transition(RequestState::InWork, RequestState::Queued);
            st.requeue_front(request.clone(), sort, ordered, side);
            true
        });
        if !requeued {
            self.fail_after_shutdown(&request);
        }
    }

    /// Puts `request` back at the very front of its device queue as an ordered request, e.g.
    /// after a controller-side error recovery.
    pub fn resubmit(&self, request: Arc<Request>) {
        Self::claim_sent(&request, "resubmit");
        let id = request.device().id();
        let was_ordered = request.is_ordered();
        let sort = request.lock().sort;
        self.stats.inc_resubmitted();

        let resubmitted = self.with_admission(|st| {
            st.return_slots(id, was_ordered);
            st.clear_overflow(id);
            if self.is_shutting_down() {
                return false;
            }
            request.set_ordered(true);
            request.transition(RequestState::InWork, RequestState::Queued);
            st.device_mut(id)
                .queue
                .push_front(QueueEntry::new(request.clone(), sort, true));
            st.promote(id);
            true
        });
        if resubmitted {
            trace!(request = request.id(), device = %id, "resubmitted");
        } else {
            self.fail_after_shutdown(&request);
        }
    }

    fn fail_after_shutdown(&self, request: &Arc<Request>) {
        request.lock().subsys_status = SubsysStatus::Aborted;
        request.device().dma.release(request, &*self.memory);
        self.stats.inc_aborted();
        request.finish();
    }

    pub fn block_bus(&self) {
        self.with_admission(AdmissionState::block_bus);
        debug!(bus = self.id, "bus blocked");
    }

    /// Lifts one [`Bus::block_bus`]. Panics if the bus is not blocked by the driver.
    pub fn unblock_bus(&self) {
        self.with_admission(AdmissionState::unblock_bus);
        debug!(bus = self.id, "bus unblocked");
    }

    /// Clears a bus overflow without waiting for a completion.
    pub fn continue_bus(&self) {
        self.with_admission(AdmissionState::continue_bus);
    }

    pub fn block_device(&self, device: &Device) {
        self.with_admission(|st| st.block_device(device.id()));
        debug!(device = %device.id(), "device blocked");
    }

    /// Lifts one [`Bus::block_device`]. Panics if the device is not blocked by the driver.
    pub fn unblock_device(&self, device: &Device) {
        self.with_admission(|st| st.unblock_device(device.id()));
        debug!(device = %device.id(), "device unblocked");
    }

    /// Clears a device overflow without waiting for a completion.
    pub fn continue_device(&self, device: &Device) {
        self.with_admission(|st| st.continue_device(device.id()));
    }

    // ---------------------------------------------------------------------
    // DPCs
    // ---------------------------------------------------------------------

    pub fn alloc_dpc(&self) -> Arc<Dpc> {
        Arc::new(Dpc::new(self.id))
    }

    /// Gives a DPC slot back. Panics if it is still scheduled or belongs to another bus.
    pub fn free_dpc(&self, dpc: Arc<Dpc>) {
        if dpc.bus_id() != self.id {
            panic!("DPC {} belongs to bus {}, not {}", dpc.id(), dpc.bus_id(), self.id);
        }
        if dpc.is_pending() {
            panic!("freeing DPC {} while it is scheduled", dpc.id());
        }
    }

    /// Runs `callback` on the service thread. Scheduling an already pending slot replaces its
    /// callback; the slot still runs once.
    pub fn schedule_dpc(&self, dpc: &Arc<Dpc>, callback: impl FnOnce() + Send + 'static) {
        if dpc.bus_id() != self.id {
            panic!("DPC {} belongs to bus {}, not {}", dpc.id(), dpc.bus_id(), self.id);
        }
        if self.dpc.schedule(dpc, Box::new(callback)) {
            trace!(dpc = dpc.id(), "DPC scheduled");
        }
        self.signal.post_no_reschedule();
    }

    // ---------------------------------------------------------------------
    // Devices
    // ---------------------------------------------------------------------

    /// Registers the logical unit `target:lun` and prepares its autosense command.
    pub fn register_device(
        self: &Arc<Self>,
        target: u8,
        lun: u8,
        config: DeviceConfig,
    ) -> Result<Arc<Device>> {
        if self.is_shutting_down() {
            return Err(BusError::ShuttingDown);
        }
        let id = DeviceId::new(target, lun);
        if lock(&self.admission).devices.contains_key(&id) {
            return Err(BusError::InvalidRequest("device already registered"));
        }

        let region = self.memory.allocate(
            MAX_SENSE_SIZE,
            Placement::Contiguous {
                alignment: self.config.dma.alignment + 1,
            },
        )?;
        let paddr = match self.memory.translate(region.vaddr()) {
            Ok(paddr) => paddr,
            Err(err) => {
                let _ = self.memory.free(region);
                return Err(err.into());
            }
        };

        let device = Arc::new(Device::new(id, self.clone(), config));
        let sense = Request::new_autosense(
            device.clone(),
            vec![PhysicalEntry::new(paddr, MAX_SENSE_SIZE as u64)],
        );
        device.install_autosense(Arc::new(sense), region);

        let inserted = {
            let mut st = lock(&self.admission);
            if st.devices.contains_key(&id) {
                false
            } else {
                st.devices.insert(id, DeviceState::new(config.queue_depth));
                true
            }
        };
        if !inserted {
            self.teardown_device(&device);
            return Err(BusError::InvalidRequest("device already registered"));
        }
        lock(&self.devices).push(Arc::downgrade(&device));

        info!(
            bus = self.id,
            device = %id,
            queue_depth = config.queue_depth,
            manual_autosense = config.manual_autosense,
            "device registered"
        );
        Ok(device)
    }

    /// Stops new submissions to `device`. Its scheduler state is dropped as soon as nothing is
    /// queued or in flight for it any more.
    pub fn remove_device(&self, device: &Device) {
        if !device.invalidate() {
            return;
        }
        info!(bus = self.id, device = %device.id(), "device removed");
        self.reap_if_removed(device);
    }

    fn reap_if_removed(&self, device: &Device) {
        if device.is_valid() {
            return;
        }
        let id = device.id();
        let reaped = {
            let mut st = lock(&self.admission);
            match st.devices.get(&id) {
                Some(dev) if dev.is_idle() => {
                    st.devices.remove(&id);
                    st.waiting.remove(id);
                    true
                }
                _ => false,
            }
        };
        if reaped {
            self.teardown_device(device);
            debug!(device = %id, "device state released");
        }
    }

    fn teardown_device(&self, device: &Device) {
        let (sense, region) = device.take_autosense();
        drop(sense);
        if let Some(region) = region {
            if let Err(err) = self.memory.free(region) {
                warn!(device = %device.id(), %err, "failed to free sense buffer");
            }
        }
        device.dma.free(&*self.memory);
        lock(&self.devices)
            .retain(|d| d.strong_count() > 0 && !std::ptr::eq(d.as_ptr(), device));
    }

    /// Admission state of `device`, or `None` once it has been released.
    pub fn device_snapshot(&self, device: &Device) -> Option<DeviceSnapshot> {
        let st = lock(&self.admission);
        let dev = st.devices.get(&device.id())?;
        Some(DeviceSnapshot {
            total_slots: dev.slots.total,
            left_slots: dev.slots.left,
            queued: dev.queue.len(),
            lock_count: dev.block.lock_count(),
            overflow: dev.block.overflow,
            waiting: st.waiting.contains(device.id()),
            last_sort: dev.last_sort,
        })
    }

    pub fn snapshot(&self) -> BusSnapshot {
        let st = lock(&self.admission);
        BusSnapshot {
            total_slots: st.slots.total,
            left_slots: st.slots.left,
            lock_count: st.block.lock_count(),
            overflow: st.block.overflow,
            waiting: st.waiting.to_vec(),
            pending_dpcs: self.dpc.len(),
        }
    }

    // ---------------------------------------------------------------------
    // Controller pass-throughs
    // ---------------------------------------------------------------------

    pub fn path_inquiry(&self) -> PathInquiry {
        self.sim.path_inquiry()
    }

    pub fn reset(&self) -> SubsysStatus {
        info!(bus = self.id, "resetting bus");
        self.sim.reset_bus()
    }

    pub fn reset_device(&self, device: &Device) -> SubsysStatus {
        info!(device = %device.id(), "resetting device");
        self.sim.reset_device(device.target(), device.lun())
    }

    pub fn ioctl(&self, op: u32, buf: &mut [u8]) -> std::result::Result<(), SubsysStatus> {
        self.sim.ioctl(op, buf)
    }

    // ---------------------------------------------------------------------
    // DMA buffer reclaim
    // ---------------------------------------------------------------------

    fn reclaim_loop(self: Arc<Self>) {
        let interval = self.config.dma_reclaim_interval();
        let timeout = self.config.dma_buffer_idle_timeout();
        loop {
            {
                let stop = lock(&self.reclaim_stop);
                let (stop, _) = match self.reclaim_cv.wait_timeout_while(stop, interval, |s| !*s)
                {
                    Ok(res) => res,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if *stop {
                    break;
                }
            }
            self.reclaim_dma_buffers(timeout);
        }
        debug!(bus = self.id, "DMA reclaimer exiting");
    }

    /// Frees every device bounce buffer that is unclaimed and idle for longer than `timeout`.
    /// Returns how many were freed.
    pub fn reclaim_dma_buffers(&self, timeout: Duration) -> usize {
        let devices: Vec<Arc<Device>> = lock(&self.devices)
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        let mut freed = 0;
        for device in devices {
            if device.dma.reclaim(timeout, &*self.memory) {
                self.stats.inc_dma_reclaimed();
                debug!(device = %device.id(), "idle DMA buffer freed");
                freed += 1;
            }
        }
        freed
    }

    // ---------------------------------------------------------------------
    // Teardown
    // ---------------------------------------------------------------------

    /// Stops both bus threads, completes every still-queued request as aborted and releases all
    /// idle devices. Requests already at the controller complete normally.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(bus = self.id, "bus shutting down");

        self.signal.post();
        *lock(&self.reclaim_stop) = true;
        self.reclaim_cv.notify_all();
        let workers = std::mem::take(&mut *lock(&self.workers));
        let me = thread::current().id();
        for handle in workers {
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                warn!(bus = self.id, "bus worker panicked");
            }
        }

        let dropped = self.dpc.clear();
        if dropped > 0 {
            debug!(bus = self.id, dropped, "pending DPCs dropped");
        }

        let mut failed = Vec::new();
        {
            let mut st = lock(&self.admission);
            st.waiting.clear();
            for dev in st.devices.values_mut() {
                for entry in dev.queue.drain() {
                    if entry.request.is_autosense() {
                        entry.request.set_state(RequestState::Finished);
                        if let Some(originator) = dev.autosense_for.take() {
                            failed.push((originator, SubsysStatus::AutosenseFailed));
                        }
                    } else {
                        failed.push((entry.request, SubsysStatus::Aborted));
                    }
                }
                failed.extend(
                    dev.autosense_waiters
                        .drain(..)
                        .map(|r| (r, SubsysStatus::AutosenseFailed)),
                );
            }
        }
        for (request, status) in failed {
            {
                let mut data = request.lock();
                data.subsys_status = status;
                data.autosense_pending = false;
            }
            request.device().dma.release(&request, &*self.memory);
            self.stats.inc_aborted();
            request.finish();
        }

        let devices: Vec<Arc<Device>> = lock(&self.devices)
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for device in devices {
            device.invalidate();
            self.reap_if_removed(&device);
        }
        info!(bus = self.id, "bus detached");
    }
}
