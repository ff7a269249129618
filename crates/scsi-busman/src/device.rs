//! Logical units attached to a bus.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use scsi_memory::Region;

use crate::bus::Bus;
use crate::config::DeviceConfig;
use crate::dma_buffer::DmaBufferSlot;
use crate::request::{Request, SubsysStatus};
use crate::util::lock;

/// Target/LUN address of a device on its bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId {
    pub target: u8,
    pub lun: u8,
}

impl DeviceId {
    pub const fn new(target: u8, lun: u8) -> Self {
        Self { target, lun }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.target, self.lun)
    }
}

/// A logical unit registered on a [`Bus`].
///
/// Devices are created by [`Bus::register_device`]. After [`Bus::remove_device`] the handle
/// stays usable for inspection but every new submission fails with
/// [`crate::BusError::DeviceGone`].
pub struct Device {
    id: DeviceId,
    bus: Arc<Bus>,
    config: DeviceConfig,
    valid: AtomicBool,
    pub(crate) dma: DmaBufferSlot,
    autosense: Mutex<Option<Arc<Request>>>,
    sense_region: Mutex<Option<Region>>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("bus", &self.bus.id())
            .field("config", &self.config)
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl Device {
    pub(crate) fn new(id: DeviceId, bus: Arc<Bus>, config: DeviceConfig) -> Self {
        Self {
            id,
            bus,
            config,
            valid: AtomicBool::new(true),
            dma: DmaBufferSlot::default(),
            autosense: Mutex::new(None),
            sense_region: Mutex::new(None),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn target(&self) -> u8 {
        self.id.target
    }

    pub fn lun(&self) -> u8 {
        self.id.lun
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Stops new submissions; requests already accepted still run to completion.
    pub(crate) fn invalidate(&self) -> bool {
        self.valid.swap(false, Ordering::AcqRel)
    }

    /// Resets this logical unit through the controller.
    pub fn reset(&self) -> SubsysStatus {
        self.bus.reset_device(self)
    }

    /// Size of the device's DMA bounce buffer, 0 when none is allocated.
    pub fn dma_buffer_size(&self) -> usize {
        self.dma.allocated_size()
    }

    pub(crate) fn install_autosense(&self, request: Arc<Request>, region: Region) {
        *lock(&self.autosense) = Some(request);
        *lock(&self.sense_region) = Some(region);
    }

    pub(crate) fn autosense_request(&self) -> Option<Arc<Request>> {
        lock(&self.autosense).clone()
    }

    /// Detaches the autosense request (which refers back to this device) and its data area.
    pub(crate) fn take_autosense(&self) -> (Option<Arc<Request>>, Option<Region>) {
        (lock(&self.autosense).take(), lock(&self.sense_region).take())
    }
}
