//! Command scheduling core of a SCSI bus manager.
//!
//! Peripheral drivers allocate [`Request`]s from a [`RequestPool`], fill in a CDB and a data
//! description, and hand them to [`Bus::submit_async`] or [`Bus::submit_sync`]. The bus decides
//! when each request reaches the host controller driver ([`ControllerDriver`]):
//!
//! - per-device queues ordered by an elevator over the request's sort key,
//! - slot accounting at device and bus level, with queue depth reduced on QUEUE FULL,
//! - one service thread per bus that dispatches round-robin across devices and runs DPCs,
//! - bounce buffering for data the controller cannot reach with its DMA constraints,
//! - REQUEST SENSE issued on the controller's behalf when it lacks autosense.
//!
//! Physical memory is abstracted by [`scsi_memory::PhysicalMemory`].

mod autosense;
mod bus;
mod config;
mod device;
mod dma_buffer;
mod dpc;
mod error;
mod flow;
mod pool;
mod queue;
mod request;
pub mod sg;
mod signal;
mod sim;
mod stats;
mod util;

pub use bus::{AbortOutcome, Bus, BusSnapshot, DeviceSnapshot};
pub use config::{BusConfig, DeviceConfig, DmaParams, PoolConfig};
pub use device::{Device, DeviceId};
pub use dpc::{Dpc, DpcCallback};
pub use error::{BusError, Result};
pub use pool::{LockedRequestPool, RequestPool};
pub use request::{
    device_status, DataDirection, Request, RequestData, RequestFlags, RequestState, SgList,
    SubsysStatus, MAX_CDB_SIZE, MAX_SENSE_SIZE, REQUEST_SENSE,
};
pub use sim::{ControllerDriver, PathInquiry};
pub use stats::{BusStats, BusStatsSnapshot};

pub use scsi_memory;
