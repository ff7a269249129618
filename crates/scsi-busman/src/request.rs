//! SCSI requests: the command descriptor, its data description and its lifecycle state.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use bitflags::bitflags;
use scsi_memory::PhysicalEntry;

use crate::device::Device;
use crate::util::lock;

pub const MAX_CDB_SIZE: usize = 16;
pub const MAX_SENSE_SIZE: usize = 64;

/// SCSI operation code of REQUEST SENSE (6).
pub const REQUEST_SENSE: u8 = 0x03;

/// SCSI status bytes the core looks at. Everything else is passed through untouched.
pub mod device_status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const BUSY: u8 = 0x08;
    pub const QUEUE_FULL: u8 = 0x28;
}

/// Scatter-gather list: physical fragments in transfer order.
pub type SgList = Vec<PhysicalEntry>;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestState {
    Free = 0,
    InWork = 1,
    Queued = 2,
    Sent = 3,
    Finished = 4,
}

impl RequestState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => RequestState::Free,
            1 => RequestState::InWork,
            2 => RequestState::Queued,
            3 => RequestState::Sent,
            _ => RequestState::Finished,
        }
    }
}

/// Subsystem-level completion code. Opaque to the core apart from the few values it acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubsysStatus {
    #[default]
    InProgress,
    Completed,
    /// The command reached the device and failed; `device_status` holds the SCSI status.
    CompletedWithError,
    Aborted,
    /// A check condition was reported and the follow-up REQUEST SENSE failed.
    AutosenseFailed,
    InvalidRequest,
    NoDevice,
    /// Controller-specific code passed through verbatim.
    Other(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataDirection {
    #[default]
    None,
    /// Device to memory.
    In,
    /// Memory to device.
    Out,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RequestFlags: u32 {
        /// Never issue REQUEST SENSE on behalf of this request.
        const DIS_AUTOSENSE = 1 << 0;
        /// Must not be overtaken and must not overtake anything already queued.
        const ORDERED = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestKind {
    Normal,
    Autosense,
}

/// Caller fields swapped out while a request runs through a device's DMA scratch buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BufferedState {
    pub orig_sg_list: Option<SgList>,
    pub orig_data: Option<u64>,
}

/// Mutable part of a request: the command, its data description and its results.
#[derive(Debug, Clone)]
pub struct RequestData {
    pub cdb: [u8; MAX_CDB_SIZE],
    pub cdb_len: usize,
    pub direction: DataDirection,
    pub flags: RequestFlags,
    /// Elevator key (usually the LBA); negative means the command has no position.
    pub sort: i64,
    /// Virtual address of a flat data buffer, if the caller has one.
    pub data: Option<u64>,
    pub data_length: usize,
    pub sg_list: Option<SgList>,

    pub subsys_status: SubsysStatus,
    pub device_status: u8,
    pub data_resid: usize,
    pub sense: [u8; MAX_SENSE_SIZE],
    pub sense_resid: usize,
    pub autosense_valid: bool,

    pub(crate) buffered: Option<BufferedState>,
    pub(crate) autosense_pending: bool,
}

impl Default for RequestData {
    fn default() -> Self {
        Self {
            cdb: [0; MAX_CDB_SIZE],
            cdb_len: 0,
            direction: DataDirection::None,
            flags: RequestFlags::empty(),
            sort: -1,
            data: None,
            data_length: 0,
            sg_list: None,
            subsys_status: SubsysStatus::InProgress,
            device_status: device_status::GOOD,
            data_resid: 0,
            sense: [0; MAX_SENSE_SIZE],
            sense_resid: 0,
            autosense_valid: false,
            buffered: None,
            autosense_pending: false,
        }
    }
}

impl RequestData {
    /// Copies `cdb` into the command block. Panics if it is longer than [`MAX_CDB_SIZE`].
    pub fn set_cdb(&mut self, cdb: &[u8]) {
        assert!(cdb.len() <= MAX_CDB_SIZE, "CDB of {} bytes", cdb.len());
        self.cdb = [0; MAX_CDB_SIZE];
        self.cdb[..cdb.len()].copy_from_slice(cdb);
        self.cdb_len = cdb.len();
    }

    pub fn is_buffered(&self) -> bool {
        self.buffered.is_some()
    }

    /// Clears everything the previous owner may have left behind.
    pub(crate) fn reset(&mut self) {
        *self = RequestData::default();
    }

    fn clear_results(&mut self) {
        self.subsys_status = SubsysStatus::InProgress;
        self.device_status = device_status::GOOD;
        self.data_resid = 0;
        self.sense_resid = 0;
        self.autosense_valid = false;
        self.autosense_pending = false;
    }
}

#[derive(Debug, Default)]
struct Completion {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Completion {
    fn reset(&self) {
        *lock(&self.done) = false;
    }

    fn signal(&self) {
        *lock(&self.done) = true;
        self.cv.notify_all();
    }

    fn is_done(&self) -> bool {
        *lock(&self.done)
    }

    fn wait(&self) {
        let mut done = lock(&self.done);
        while !*done {
            done = match self.cv.wait(done) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        let done = lock(&self.done);
        let (done, _) = match self.cv.wait_timeout_while(done, timeout, |done| !*done) {
            Ok(res) => res,
            Err(poisoned) => poisoned.into_inner(),
        };
        *done
    }
}

/// One SCSI command on its way through the scheduler.
///
/// A request is shared as `Arc<Request>` between the submitter, the device queue and the
/// controller driver, but at any instant exactly one of them owns it logically; the
/// [`RequestState`] says which.
pub struct Request {
    id: u64,
    kind: RequestKind,
    device: Arc<Device>,
    state: AtomicU8,
    ordered: AtomicBool,
    data: Mutex<RequestData>,
    completion: Completion,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("device", &self.device.id())
            .field("state", &self.state())
            .field("ordered", &self.is_ordered())
            .finish()
    }
}

impl Request {
    /// Builds a request around recycled (or fresh) storage. The returned request is in the
    /// `Finished` state, the baseline every submission starts from.
    pub(crate) fn new(device: Arc<Device>, mut data: RequestData) -> Self {
        data.reset();
        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            kind: RequestKind::Normal,
            device,
            state: AtomicU8::new(RequestState::Finished as u8),
            ordered: AtomicBool::new(false),
            data: Mutex::new(data),
            completion: Completion::default(),
        }
    }

    /// The per-device REQUEST SENSE command; `sense_sg` describes its DMA-safe data area.
    pub(crate) fn new_autosense(device: Arc<Device>, sense_sg: SgList) -> Self {
        let lun = device.id().lun;
        let mut data = RequestData::default();
        data.set_cdb(&[REQUEST_SENSE, (lun & 0x7) << 5, 0, 0, MAX_SENSE_SIZE as u8, 0]);
        data.direction = DataDirection::In;
        data.flags = RequestFlags::DIS_AUTOSENSE;
        data.data_length = MAX_SENSE_SIZE;
        data.sg_list = Some(sense_sg);

        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            kind: RequestKind::Autosense,
            device,
            state: AtomicU8::new(RequestState::Finished as u8),
            ordered: AtomicBool::new(true),
            data: Mutex::new(data),
            completion: Completion::default(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn state(&self) -> RequestState {
        RequestState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_ordered(&self) -> bool {
        self.ordered.load(Ordering::Acquire)
    }

    pub(crate) fn is_autosense(&self) -> bool {
        self.kind == RequestKind::Autosense
    }

    /// Locks the command/result fields. Must not be held across a call into the bus.
    pub fn lock(&self) -> MutexGuard<'_, RequestData> {
        lock(&self.data)
    }

    pub fn is_completed(&self) -> bool {
        self.completion.is_done()
    }

    /// Blocks until the request's single completion signal fires.
    pub fn wait(&self) {
        self.completion.wait();
    }

    /// Like [`Request::wait`] with an upper bound. Returns whether the request completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.completion.wait_timeout(timeout)
    }

    pub(crate) fn set_state(&self, state: RequestState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn set_ordered(&self, ordered: bool) {
        self.ordered.store(ordered, Ordering::Release);
    }

    /// Atomically moves `from -> to`; on failure returns the state actually found.
    pub(crate) fn try_transition(
        &self,
        from: RequestState,
        to: RequestState,
    ) -> Result<(), RequestState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(RequestState::from_u8)
    }

    /// Moves `from -> to`, panicking if the request is in any other state.
    pub(crate) fn transition(&self, from: RequestState, to: RequestState) {
        if let Err(actual) = self.try_transition(from, to) {
            panic!(
                "request {} expected in state {:?} (moving to {:?}) but was {:?}",
                self.id, from, to, actual
            );
        }
    }

    /// Claims a finished request for a new submission and clears stale results.
    pub(crate) fn begin_submission(&self) {
        self.transition(RequestState::Finished, RequestState::InWork);
        self.completion.reset();
        self.lock().clear_results();
    }

    /// Undoes [`Request::begin_submission`] after an admission error.
    pub(crate) fn abandon_submission(&self) {
        self.transition(RequestState::InWork, RequestState::Finished);
    }

    /// Terminal step: state becomes `Finished`, then the waiter is released.
    pub(crate) fn finish(&self) {
        self.set_state(RequestState::Finished);
        self.completion.signal();
    }

    pub(crate) fn into_data(self) -> RequestData {
        match self.data.into_inner() {
            Ok(data) => data,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
