//! The interface a host controller driver implements to be driven by a [`crate::Bus`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::request::{Request, SubsysStatus};

/// Controller capabilities reported by [`ControllerDriver::path_inquiry`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathInquiry {
    pub initiator_id: u8,
    pub max_target: u8,
    pub max_lun: u8,
    pub hba_queue_size: u32,
    pub sim_vendor: String,
    pub hba_vendor: String,
    pub controller_family: String,
}

/// A host controller driver ("SIM").
///
/// [`ControllerDriver::submit`] is called from the bus without any bus lock held, from either
/// the submitting thread or the bus service thread. The driver answers every submitted request
/// exactly once, by calling one of [`crate::Bus::on_completion`], [`crate::Bus::requeue`] or
/// [`crate::Bus::resubmit`], from any thread.
pub trait ControllerDriver: Send + Sync {
    fn submit(&self, request: Arc<Request>);

    fn path_inquiry(&self) -> PathInquiry;

    fn reset_bus(&self) -> SubsysStatus;

    fn reset_device(&self, target: u8, lun: u8) -> SubsysStatus;

    /// Asks the controller to terminate a request it currently holds.
    fn terminate(&self, request: &Arc<Request>) -> SubsysStatus {
        let _ = request;
        SubsysStatus::InvalidRequest
    }

    /// Controller-specific control operation; `buf` is in/out.
    fn ioctl(&self, op: u32, buf: &mut [u8]) -> Result<(), SubsysStatus> {
        let _ = (op, buf);
        Err(SubsysStatus::InvalidRequest)
    }
}
