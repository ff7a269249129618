//! Scatter-gather list construction and checks.

use scsi_memory::{PhysicalEntry, PhysicalMemory};
use tracing::trace;

use crate::config::DmaParams;
use crate::request::SgList;
use crate::{BusError, Result};

/// Upper bound on fragments in a list built by [`build_sg_list`], independent of the
/// controller's own limit.
pub const MAX_TEMP_SG_FRAGMENTS: usize = 128;

/// Whether a controller with `params` can transfer `sg` directly.
///
/// The fragment count is checked first; alignment, boundary and size are only looked at when
/// the controller declares any such restriction.
pub fn is_sg_list_dma_safe(sg: &[PhysicalEntry], params: &DmaParams) -> bool {
    if sg.len() > params.max_sg_blocks {
        trace!(fragments = sg.len(), max = params.max_sg_blocks, "too many fragments");
        return false;
    }
    if !params.is_restricted() {
        return true;
    }
    let max_size = params.max_block_size();
    sg.iter().all(|e| {
        let aligned =
            e.address & params.alignment == 0 && e.end() & params.alignment == 0;
        let small = e.size <= max_size;
        let in_window = !params.has_boundary()
            || e.size == 0
            || (e.address & !params.dma_boundary)
                == ((e.end() - 1) & !params.dma_boundary);
        aligned && small && in_window
    })
}

/// Maps the virtual range `vaddr..vaddr + len` into a physical fragment list.
///
/// Physically adjacent pages are merged, then fragments are split so none exceeds the maximum
/// block size or crosses a DMA boundary. Fails with [`BusError::SgTooComplex`] when the result
/// would need more than `min(max_sg_blocks, MAX_TEMP_SG_FRAGMENTS)` fragments.
pub fn build_sg_list(
    memory: &dyn PhysicalMemory,
    vaddr: u64,
    len: usize,
    params: &DmaParams,
) -> Result<SgList> {
    let max = params.max_sg_blocks.min(MAX_TEMP_SG_FRAGMENTS);
    let page = memory.page_size() as u64;
    let mut sg: SgList = Vec::new();

    let mut done = 0u64;
    while done < len as u64 {
        let cur = vaddr + done;
        let take = (page - cur % page).min(len as u64 - done);
        let paddr = memory
            .translate(cur)
            .map_err(|_| BusError::SgMapFailed { len })?;
        match sg.last_mut() {
            Some(last) if last.end() == paddr => last.size += take,
            _ => {
                if sg.len() == max {
                    return Err(BusError::SgTooComplex { max });
                }
                sg.push(PhysicalEntry::new(paddr, take));
            }
        }
        done += take;
    }

    split_for_constraints(&mut sg, params, max)?;
    trace!(vaddr, len, fragments = sg.len(), "built scatter-gather list");
    Ok(sg)
}

/// Splits fragments in place at DMA boundaries and at the maximum block size.
pub fn split_for_constraints(sg: &mut SgList, params: &DmaParams, max: usize) -> Result<()> {
    let max_size = params.max_block_size();
    let mut i = 0;
    while i < sg.len() {
        let limit = params.bytes_to_boundary(sg[i].address).min(max_size);
        if sg[i].size > limit {
            if sg.len() == max {
                return Err(BusError::SgTooComplex { max });
            }
            let rest = PhysicalEntry::new(sg[i].address + limit, sg[i].size - limit);
            sg[i].size = limit;
            sg.insert(i + 1, rest);
        }
        i += 1;
    }
    Ok(())
}

/// Total number of bytes described by `sg`.
pub fn sg_len(sg: &[PhysicalEntry]) -> u64 {
    sg.iter().map(|e| e.size).sum()
}

/// Copies the first `len` bytes described by `from` into the buffer described by `to`.
pub(crate) fn copy_sg(
    memory: &dyn PhysicalMemory,
    from: &[PhysicalEntry],
    to: &[PhysicalEntry],
    len: usize,
) -> Result<()> {
    let mut buf = Vec::new();
    let (mut fi, mut fo) = (0usize, 0u64);
    let (mut ti, mut to_off) = (0usize, 0u64);
    let mut left = len as u64;

    while left > 0 {
        let (Some(src), Some(dst)) = (from.get(fi), to.get(ti)) else {
            return Err(BusError::InvalidRequest("scatter-gather list shorter than data length"));
        };
        let chunk = (src.size - fo).min(dst.size - to_off).min(left);
        buf.resize(chunk as usize, 0);
        memory.read_physical(src.address + fo, &mut buf)?;
        memory.write_physical(dst.address + to_off, &buf)?;

        left -= chunk;
        fo += chunk;
        to_off += chunk;
        if fo == src.size {
            fi += 1;
            fo = 0;
        }
        if to_off == dst.size {
            ti += 1;
            to_off = 0;
        }
    }
    Ok(())
}

/// Reads `dst.len()` bytes from the buffer described by `sg`.
pub(crate) fn read_sg(memory: &dyn PhysicalMemory, sg: &[PhysicalEntry], dst: &mut [u8]) -> Result<()> {
    let mut done = 0usize;
    for entry in sg {
        if done == dst.len() {
            break;
        }
        let take = (entry.size as usize).min(dst.len() - done);
        memory.read_physical(entry.address, &mut dst[done..done + take])?;
        done += take;
    }
    if done < dst.len() {
        return Err(BusError::InvalidRequest("scatter-gather list shorter than data length"));
    }
    Ok(())
}
