use thiserror::Error;

/// Page granularity of every [`PhysicalMemory`] implementation in this crate.
pub const PAGE_SIZE: usize = 4096;

/// Errors returned by [`PhysicalMemory`] backends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// The requested physical range is outside the backing store.
    #[error("physical access out of range: paddr=0x{paddr:x} len={len} size=0x{size:x}")]
    OutOfRange { paddr: u64, len: usize, size: u64 },

    /// A virtual address has no page mapped behind it.
    #[error("virtual address 0x{vaddr:x} is not mapped")]
    Unmapped { vaddr: u64 },

    /// Not enough free frames (or no suitable contiguous run) to satisfy an allocation.
    #[error("out of physical memory allocating {len} bytes")]
    OutOfMemory { len: usize },

    /// The requested size cannot be represented by the current platform's `usize`.
    #[error("memory size {size} does not fit in usize")]
    SizeTooLarge { size: u64 },

    /// A region handed back to [`PhysicalMemory::free`] was not allocated by this backend.
    #[error("region at 0x{vaddr:x} was not allocated here")]
    UnknownRegion { vaddr: u64 },
}

pub type MemoryResult<T> = Result<T, MemoryError>;

/// One physically contiguous fragment of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysicalEntry {
    pub address: u64,
    pub size: u64,
}

impl PhysicalEntry {
    pub const fn new(address: u64, size: u64) -> Self {
        Self { address, size }
    }

    /// First address past the fragment.
    pub fn end(&self) -> u64 {
        self.address.wrapping_add(self.size)
    }
}

/// Where the frames of a new region may come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Any free frames, in whatever physical order the backend prefers.
    Scattered,
    /// One physically contiguous run whose start is a multiple of `alignment` bytes
    /// (`alignment` is rounded up to at least one page).
    Contiguous { alignment: u64 },
}

/// A mapped virtual region handed out by [`PhysicalMemory::allocate`].
///
/// Regions are deliberately not `Clone`: freeing consumes the handle.
#[derive(Debug, PartialEq, Eq)]
pub struct Region {
    vaddr: u64,
    len: usize,
}

impl Region {
    pub fn new(vaddr: u64, len: usize) -> Self {
        Self { vaddr, len }
    }

    pub fn vaddr(&self) -> u64 {
        self.vaddr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Host physical memory as seen by a DMA-capable controller.
///
/// All methods take `&self`: the memory is shared between submitting threads, the bus service
/// thread and controller completion paths, so implementations synchronise internally.
pub trait PhysicalMemory: Send + Sync {
    fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    /// Total size of the physical address space in bytes.
    fn size(&self) -> u64;

    /// Reads bytes from physical memory into `dst`.
    fn read_physical(&self, paddr: u64, dst: &mut [u8]) -> MemoryResult<()>;

    /// Writes bytes from `src` into physical memory.
    fn write_physical(&self, paddr: u64, src: &[u8]) -> MemoryResult<()>;

    /// Translates one virtual address to its physical address.
    fn translate(&self, vaddr: u64) -> MemoryResult<u64>;

    /// Allocates and maps a region of at least `len` bytes (rounded up to whole pages).
    fn allocate(&self, len: usize, placement: Placement) -> MemoryResult<Region>;

    /// Unmaps a region and returns its frames.
    fn free(&self, region: Region) -> MemoryResult<()>;

    /// Reads through the virtual mapping, page by page.
    fn read_virtual(&self, vaddr: u64, dst: &mut [u8]) -> MemoryResult<()> {
        let page = self.page_size() as u64;
        let mut done = 0usize;
        while done < dst.len() {
            let cur = vaddr + done as u64;
            let in_page = (page - (cur % page)) as usize;
            let take = in_page.min(dst.len() - done);
            let paddr = self.translate(cur)?;
            self.read_physical(paddr, &mut dst[done..done + take])?;
            done += take;
        }
        Ok(())
    }

    /// Writes through the virtual mapping, page by page.
    fn write_virtual(&self, vaddr: u64, src: &[u8]) -> MemoryResult<()> {
        let page = self.page_size() as u64;
        let mut done = 0usize;
        while done < src.len() {
            let cur = vaddr + done as u64;
            let in_page = (page - (cur % page)) as usize;
            let take = in_page.min(src.len() - done);
            let paddr = self.translate(cur)?;
            self.write_physical(paddr, &src[done..done + take])?;
            done += take;
        }
        Ok(())
    }
}

pub(crate) fn check_range(size: u64, paddr: u64, len: usize) -> MemoryResult<()> {
    let end = paddr
        .checked_add(len as u64)
        .ok_or(MemoryError::OutOfRange { paddr, len, size })?;
    if end > size {
        return Err(MemoryError::OutOfRange { paddr, len, size });
    }
    Ok(())
}
