//! Bus, device, pool and DMA constraint configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{BusError, Result};

/// Controller DMA constraints, supplied when a bus is attached and immutable afterwards.
///
/// `alignment` and `dma_boundary` are masks in the usual controller notation: a fragment must
/// start and end on an address with all `alignment` bits clear, and must not span two different
/// `dma_boundary + 1` sized windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DmaParams {
    pub alignment: u64,
    pub dma_boundary: u64,
    /// Largest single fragment in bytes; 0 means unlimited.
    pub max_sg_block_size: u64,
    pub max_sg_blocks: usize,
    /// Largest transfer the controller accepts, in blocks. Reported to peripheral drivers.
    pub max_blocks: u32,
}

impl DmaParams {
    pub const NO_BOUNDARY: u64 = u64::MAX;

    pub fn has_boundary(&self) -> bool {
        self.dma_boundary != Self::NO_BOUNDARY
    }

    /// True if any per-fragment restriction beyond the fragment count applies.
    pub fn is_restricted(&self) -> bool {
        self.has_boundary() || self.alignment != 0 || self.max_sg_block_size != 0
    }

    pub fn max_block_size(&self) -> u64 {
        match self.max_sg_block_size {
            0 => u64::MAX,
            n => n,
        }
    }

    /// Bytes left before `addr` crosses into the next boundary window.
    pub fn bytes_to_boundary(&self, addr: u64) -> u64 {
        if !self.has_boundary() {
            return u64::MAX;
        }
        (self.dma_boundary - (addr & self.dma_boundary)).saturating_add(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.alignment & self.alignment.wrapping_add(1) != 0 {
            return Err(BusError::InvalidConfig("alignment must be a 2^n-1 mask"));
        }
        if self.dma_boundary & self.dma_boundary.wrapping_add(1) != 0 {
            return Err(BusError::InvalidConfig("dma_boundary must be a 2^n-1 mask"));
        }
        if self.max_sg_blocks == 0 {
            return Err(BusError::InvalidConfig("max_sg_blocks must be > 0"));
        }
        if self.max_sg_block_size != 0 && self.max_sg_block_size & self.alignment != 0 {
            return Err(BusError::InvalidConfig(
                "max_sg_block_size must be a multiple of the alignment",
            ));
        }
        Ok(())
    }
}

impl Default for DmaParams {
    fn default() -> Self {
        Self {
            alignment: 0,
            dma_boundary: Self::NO_BOUNDARY,
            max_sg_block_size: 0,
            max_sg_blocks: 255,
            max_blocks: u32::MAX,
        }
    }
}

/// Per-bus configuration handed over by the registration layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub dma: DmaParams,
    /// Number of commands the controller accepts concurrently across all devices.
    pub hba_queue_size: u32,
    pub dma_buffer_idle_timeout_ms: u64,
    pub dma_reclaim_interval_ms: u64,
    pub service_thread_name: String,
}

impl BusConfig {
    pub fn dma_buffer_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.dma_buffer_idle_timeout_ms)
    }

    pub fn dma_reclaim_interval(&self) -> Duration {
        Duration::from_millis(self.dma_reclaim_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        self.dma.validate()?;
        if self.hba_queue_size == 0 {
            return Err(BusError::InvalidConfig("hba_queue_size must be > 0"));
        }
        if self.dma_reclaim_interval_ms == 0 {
            return Err(BusError::InvalidConfig("dma_reclaim_interval_ms must be > 0"));
        }
        Ok(())
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            dma: DmaParams::default(),
            hba_queue_size: 32,
            dma_buffer_idle_timeout_ms: 10_000,
            dma_reclaim_interval_ms: 1_000,
            service_thread_name: "scsi-bus-service".to_string(),
        }
    }
}

/// Per-device configuration, normally derived from INQUIRY data by the probing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Initial number of commands the device may have in flight. Clamped to at least 1.
    pub queue_depth: u32,
    /// The controller cannot fetch sense data itself; the core issues REQUEST SENSE.
    pub manual_autosense: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            queue_depth: 1,
            manual_autosense: false,
        }
    }
}

/// Sizing policy for [`crate::LockedRequestPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of requests handed out at once; 0 means unbounded.
    pub capacity: usize,
    /// Block in `allocate` instead of failing when the pool is exhausted.
    pub wait_when_exhausted: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 0,
            wait_when_exhausted: true,
        }
    }
}
