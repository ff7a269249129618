//! Per-device bounce buffer for requests whose data the controller cannot reach directly.
//!
//! One scratch buffer exists per device and at most one request uses it at a time. The buffer
//! is grown on demand, kept around after use, and freed by the bus reclaimer once it has been
//! idle for the configured timeout.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use scsi_memory::{PhysicalEntry, PhysicalMemory, Placement, Region};
use tracing::{debug, trace, warn};

use crate::config::DmaParams;
use crate::request::{BufferedState, DataDirection, Request, SgList, SubsysStatus};
use crate::sg::{copy_sg, is_sg_list_dma_safe, split_for_constraints, MAX_TEMP_SG_FRAGMENTS};
use crate::util::{lock, round_up_mask};
use crate::{BusError, Result};

/// Binary semaphore that hands the scratch buffer to one request at a time.
#[derive(Debug, Default)]
struct OwnerToken {
    taken: Mutex<bool>,
    cv: Condvar,
}

impl OwnerToken {
    fn acquire(&self) {
        let mut taken = lock(&self.taken);
        while *taken {
            taken = match self.cv.wait(taken) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        *taken = true;
    }

    fn release(&self) {
        *lock(&self.taken) = false;
        self.cv.notify_one();
    }
}

#[derive(Debug)]
struct Scratch {
    region: Option<Region>,
    /// Offset of the usable window inside `region` (non-zero when carved to avoid a boundary).
    offset: u64,
    size: usize,
    sg_list: SgList,
    /// Caller's fragments while a request is buffered; the copy-back target.
    orig_sg_list: SgList,
    in_use: bool,
    last_use: Instant,
}

impl Default for Scratch {
    fn default() -> Self {
        Self {
            region: None,
            offset: 0,
            size: 0,
            sg_list: Vec::new(),
            orig_sg_list: Vec::new(),
            in_use: false,
            last_use: Instant::now(),
        }
    }
}

impl Scratch {
    fn free(&mut self, memory: &dyn PhysicalMemory) {
        if let Some(region) = self.region.take() {
            if let Err(err) = memory.free(region) {
                warn!(%err, "failed to free DMA buffer");
            }
        }
        self.offset = 0;
        self.size = 0;
        self.sg_list.clear();
    }

    /// Replaces the buffer with one of at least `len` bytes that satisfies `params`.
    fn grow(&mut self, len: usize, params: &DmaParams, memory: &dyn PhysicalMemory) -> Result<()> {
        self.free(memory);

        let page_mask = memory.page_size() as u64 - 1;
        let size = round_up_mask(round_up_mask(len as u64, params.alignment), page_mask);
        let size_usize = usize::try_from(size).map_err(|_| BusError::DmaBufferAlloc { len })?;
        let pages = size_usize / memory.page_size();

        if pages > params.max_sg_blocks || pages > MAX_TEMP_SG_FRAGMENTS {
            let mut alloc = size_usize;
            if params.has_boundary() {
                if size > params.dma_boundary.saturating_add(1) {
                    debug!(len, boundary = params.dma_boundary, "DMA buffer larger than boundary");
                    return Err(BusError::DmaBufferAlloc { len });
                }
                // Twice the size always contains a window that does not cross a boundary.
                alloc = size_usize * 2;
            }
            let region = memory
                .allocate(alloc, Placement::Contiguous {
                    alignment: params.alignment + 1,
                })
                .map_err(|_| BusError::DmaBufferAlloc { len })?;
            let vaddr = region.vaddr();
            self.region = Some(region);

            let base = memory.translate(vaddr)?;
            let offset = if params.bytes_to_boundary(base) >= size {
                0
            } else {
                params.bytes_to_boundary(base)
            };
            let mut sg = vec![PhysicalEntry::new(base + offset, size)];
            split_for_constraints(&mut sg, params, params.max_sg_blocks)?;
            self.offset = offset;
            self.sg_list = sg;
        } else {
            let region = memory
                .allocate(size_usize, Placement::Scattered)
                .map_err(|_| BusError::DmaBufferAlloc { len })?;
            let sg = map_pages(memory, &region, size_usize, params);
            self.region = Some(region);
            self.sg_list = sg?;
        }
        self.size = size_usize;
        debug!(len, size, fragments = self.sg_list.len(), "DMA buffer resized");
        Ok(())
    }

    fn vaddr(&self) -> Option<u64> {
        self.region.as_ref().map(|r| r.vaddr() + self.offset)
    }
}

/// Page-by-page fragment list for a freshly allocated scattered region.
fn map_pages(
    memory: &dyn PhysicalMemory,
    region: &Region,
    len: usize,
    params: &DmaParams,
) -> Result<SgList> {
    let page = memory.page_size() as u64;
    let mut sg: SgList = Vec::new();
    let mut done = 0u64;
    while done < len as u64 {
        let paddr = memory.translate(region.vaddr() + done)?;
        let take = page.min(len as u64 - done);
        match sg.last_mut() {
            Some(last) if last.end() == paddr => last.size += take,
            _ => sg.push(PhysicalEntry::new(paddr, take)),
        }
        done += take;
    }
    split_for_constraints(&mut sg, params, params.max_sg_blocks.min(MAX_TEMP_SG_FRAGMENTS))?;
    Ok(sg)
}

/// A device's scratch buffer plus the token that serialises its users.
///
/// `owner` is held for the whole time a request is buffered; `scratch` is the short-lived
/// metadata lock also taken by the reclaimer.
#[derive(Debug, Default)]
pub(crate) struct DmaBufferSlot {
    owner: OwnerToken,
    scratch: Mutex<Scratch>,
}

impl DmaBufferSlot {
    /// Routes `request` through the scratch buffer if its fragment list is not DMA-safe.
    ///
    /// Blocks while another request of the same device holds the buffer. On error nothing is
    /// left claimed and the request is untouched.
    pub fn prepare(
        &self,
        request: &Arc<Request>,
        params: &DmaParams,
        memory: &dyn PhysicalMemory,
    ) -> Result<bool> {
        let (orig_sg, data_length, direction) = {
            let data = request.lock();
            match &data.sg_list {
                Some(sg) if data.data_length > 0 => {
                    if is_sg_list_dma_safe(sg, params) {
                        return Ok(false);
                    }
                    (sg.clone(), data.data_length, data.direction)
                }
                _ => return Ok(false),
            }
        };
        trace!(request = request.id(), data_length, "buffering request for DMA");

        self.owner.acquire();
        let mut scratch = lock(&self.scratch);
        scratch.in_use = true;

        let mut setup = Ok(());
        if scratch.size < data_length || scratch.region.is_none() {
            setup = scratch.grow(data_length, params, memory);
        }
        if setup.is_ok() && direction == DataDirection::Out {
            setup = copy_sg(memory, &orig_sg, &scratch.sg_list, data_length);
        }
        if let Err(err) = setup {
            scratch.in_use = false;
            drop(scratch);
            self.owner.release();
            return Err(err);
        }

        scratch.orig_sg_list = orig_sg;
        let buffer_sg = scratch.sg_list.clone();
        let buffer_vaddr = scratch.vaddr();
        drop(scratch);

        let mut data = request.lock();
        let orig_sg_list = data.sg_list.replace(buffer_sg);
        let orig_data = std::mem::replace(&mut data.data, buffer_vaddr);
        data.buffered = Some(BufferedState {
            orig_sg_list,
            orig_data,
        });
        Ok(true)
    }

    /// Undoes [`DmaBufferSlot::prepare`]: copies inbound data back on success, restores the
    /// caller's fields and hands the buffer to the next waiter. No-op for unbuffered requests.
    pub fn release(&self, request: &Request, memory: &dyn PhysicalMemory) {
        let mut data = request.lock();
        let Some(saved) = data.buffered.take() else {
            return;
        };

        let mut scratch = lock(&self.scratch);
        if data.direction == DataDirection::In && data.subsys_status == SubsysStatus::Completed {
            let len = data.data_length.saturating_sub(data.data_resid);
            if let Err(err) = copy_sg(memory, &scratch.sg_list, &scratch.orig_sg_list, len) {
                warn!(request = request.id(), %err, "DMA buffer copy-back failed");
            }
        }
        data.sg_list = saved.orig_sg_list;
        data.data = saved.orig_data;
        drop(data);

        scratch.orig_sg_list.clear();
        scratch.last_use = Instant::now();
        scratch.in_use = false;
        drop(scratch);
        self.owner.release();
        trace!(request = request.id(), "DMA buffer released");
    }

    /// Frees the buffer if it is unused and has been idle for longer than `timeout`.
    pub fn reclaim(&self, timeout: Duration, memory: &dyn PhysicalMemory) -> bool {
        let mut scratch = lock(&self.scratch);
        if scratch.in_use || scratch.region.is_none() || scratch.last_use.elapsed() <= timeout {
            return false;
        }
        scratch.free(memory);
        true
    }

    /// Frees the buffer unconditionally. Only valid when no request can be using it.
    pub fn free(&self, memory: &dyn PhysicalMemory) {
        lock(&self.scratch).free(memory);
    }

    pub fn allocated_size(&self) -> usize {
        lock(&self.scratch).size
    }
}
