use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use crate::phys::{check_range, MemoryError, MemoryResult, PhysicalMemory, Placement, Region};
use crate::PAGE_SIZE;

/// Start of the virtual window regions are mapped into. Kept far above any physical address
/// the backing store can hold so mix-ups between the two spaces fail loudly.
const VIRTUAL_BASE: u64 = 0x10_0000_0000;

/// Order in which [`Placement::Scattered`] allocations take free frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FramePolicy {
    /// Lowest free frame first; consecutive pages usually end up physically adjacent.
    #[default]
    Ascending,
    /// Highest free frame first; consecutive virtual pages are never physically ascending,
    /// so every page becomes its own scatter-gather fragment.
    Descending,
}

#[derive(Debug)]
struct PagedState {
    frames: Box<[u8]>,
    free: BTreeSet<u64>,
    page_table: HashMap<u64, u64>,
    regions: HashMap<u64, usize>,
    next_vaddr: u64,
}

/// Page-frame backed [`PhysicalMemory`].
#[derive(Debug)]
pub struct PagedMemory {
    size: u64,
    policy: FramePolicy,
    state: Mutex<PagedState>,
}

impl PagedMemory {
    pub fn new(size: u64) -> MemoryResult<Self> {
        Self::with_policy(size, FramePolicy::default())
    }

    pub fn with_policy(size: u64, policy: FramePolicy) -> MemoryResult<Self> {
        let page = PAGE_SIZE as u64;
        let size = size - (size % page);
        let size_usize = usize::try_from(size).map_err(|_| MemoryError::SizeTooLarge { size })?;
        let free = (0..size / page).collect();
        Ok(Self {
            size,
            policy,
            state: Mutex::new(PagedState {
                frames: vec![0u8; size_usize].into_boxed_slice(),
                free,
                page_table: HashMap::new(),
                regions: HashMap::new(),
                next_vaddr: VIRTUAL_BASE,
            }),
        })
    }

    pub fn policy(&self) -> FramePolicy {
        self.policy
    }

    /// Number of page frames not currently backing any region.
    pub fn free_frames(&self) -> usize {
        self.lock().free.len()
    }

    /// Number of regions currently mapped.
    pub fn live_regions(&self) -> usize {
        self.lock().regions.len()
    }

    fn lock(&self) -> MutexGuard<'_, PagedState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn pick_scattered(&self, state: &PagedState, pages: usize) -> Option<Vec<u64>> {
        let picked: Vec<u64> = match self.policy {
            FramePolicy::Ascending => state.free.iter().copied().take(pages).collect(),
            FramePolicy::Descending => state.free.iter().rev().copied().take(pages).collect(),
        };
        (picked.len() == pages).then_some(picked)
    }

    fn pick_contiguous(state: &PagedState, pages: usize, alignment: u64) -> Option<Vec<u64>> {
        let page = PAGE_SIZE as u64;
        let step = alignment.max(page).div_ceil(page);
        let total = state.frames.len() as u64 / page;
        let mut start = 0u64;
        while start + pages as u64 <= total {
            if (start..start + pages as u64).all(|pfn| state.free.contains(&pfn)) {
                return Some((start..start + pages as u64).collect());
            }
            start += step;
        }
        None
    }
}

impl PhysicalMemory for PagedMemory {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_physical(&self, paddr: u64, dst: &mut [u8]) -> MemoryResult<()> {
        check_range(self.size, paddr, dst.len())?;
        let state = self.lock();
        let start = paddr as usize;
        dst.copy_from_slice(&state.frames[start..start + dst.len()]);
        Ok(())
    }

    fn write_physical(&self, paddr: u64, src: &[u8]) -> MemoryResult<()> {
        check_range(self.size, paddr, src.len())?;
        let mut state = self.lock();
        let start = paddr as usize;
        state.frames[start..start + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn translate(&self, vaddr: u64) -> MemoryResult<u64> {
        let page = PAGE_SIZE as u64;
        let state = self.lock();
        let pfn = state
            .page_table
            .get(&(vaddr / page))
            .ok_or(MemoryError::Unmapped { vaddr })?;
        Ok(pfn * page + vaddr % page)
    }

    fn allocate(&self, len: usize, placement: Placement) -> MemoryResult<Region> {
        let page = PAGE_SIZE as u64;
        let pages = len.div_ceil(PAGE_SIZE).max(1);
        let mut state = self.lock();

        let frames = match placement {
            Placement::Scattered => self.pick_scattered(&state, pages),
            Placement::Contiguous { alignment } => Self::pick_contiguous(&state, pages, alignment),
        }
        .ok_or(MemoryError::OutOfMemory { len })?;

        let vaddr = state.next_vaddr;
        // One unmapped guard page between regions.
        state.next_vaddr += (pages as u64 + 1) * page;

        for (i, pfn) in frames.into_iter().enumerate() {
            state.free.remove(&pfn);
            let start = (pfn * page) as usize;
            state.frames[start..start + PAGE_SIZE].fill(0);
            state.page_table.insert(vaddr / page + i as u64, pfn);
        }
        state.regions.insert(vaddr, pages);

        Ok(Region::new(vaddr, pages * PAGE_SIZE))
    }

    fn free(&self, region: Region) -> MemoryResult<()> {
        let page = PAGE_SIZE as u64;
        let mut state = self.lock();
        let pages = state
            .regions
            .remove(&region.vaddr())
            .ok_or(MemoryError::UnknownRegion {
                vaddr: region.vaddr(),
            })?;
        for i in 0..pages as u64 {
            if let Some(pfn) = state.page_table.remove(&(region.vaddr() / page + i)) {
                state.free.insert(pfn);
            }
        }
        Ok(())
    }
}
