//! Physical memory model used by the SCSI bus manager core.
//!
//! Controllers only ever see *physical* fragments, while callers hand the core virtual
//! buffers. This crate provides:
//!
//! - [`PhysicalMemory`]: physical reads/writes, virtual-to-physical translation and region
//!   allocation (scattered or physically contiguous)
//! - [`PagedMemory`]: an in-process implementation backed by a page frame array whose frame
//!   placement policy is configurable, so scatter-gather behaviour is observable in tests
//! - [`PhysicalEntry`]: one `(address, length)` fragment of a scatter-gather list

mod paged;
mod phys;

pub use paged::{FramePolicy, PagedMemory};
pub use phys::{
    MemoryError, MemoryResult, PhysicalEntry, PhysicalMemory, Placement, Region, PAGE_SIZE,
};
