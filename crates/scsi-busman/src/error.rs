//! Errors returned to submitters.

use scsi_memory::MemoryError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BusError>;

/// Errors reported synchronously to a submitter.
///
/// These all belong to the admission/resource class: when one is returned the request never
/// reached a device queue, and any scatter-gather list or DMA buffer claimed on its behalf has
/// already been given back. Transport and device failures are not errors at this level; they
/// travel inside the request as [`crate::SubsysStatus`] plus the raw device status byte.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    #[error("request pool exhausted")]
    PoolExhausted,

    #[error("cannot allocate DMA buffer of {len} bytes")]
    DmaBufferAlloc { len: usize },

    #[error("scatter-gather list too complex (more than {max} fragments)")]
    SgTooComplex { max: usize },

    #[error("cannot map {len} byte data buffer for DMA")]
    SgMapFailed { len: usize },

    #[error("device is gone")]
    DeviceGone,

    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("bus is shutting down")]
    ShuttingDown,

    #[error("cannot start {name} thread: {reason}")]
    ThreadSpawn { name: String, reason: String },

    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),
}
