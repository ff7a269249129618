mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{Harness, Reply, TIMEOUT};
use scsi_busman::scsi_memory::{
    FramePolicy, PagedMemory, PhysicalEntry, PhysicalMemory, Placement, Region, PAGE_SIZE,
};
use scsi_busman::sg::sg_len;
use scsi_busman::{
    AbortOutcome, BusConfig, BusError, DataDirection, DeviceConfig, DmaParams, Request, SgList,
    SubsysStatus,
};

/// Memory whose scattered pages are never physically adjacent, so every page is a fragment.
fn fragmented_memory() -> PagedMemory {
    PagedMemory::with_policy(256 * PAGE_SIZE as u64, FramePolicy::Descending).unwrap()
}

fn single_fragment_controller() -> BusConfig {
    BusConfig {
        dma: DmaParams {
            max_sg_blocks: 1,
            ..DmaParams::default()
        },
        ..BusConfig::default()
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

fn page_fragments(memory: &PagedMemory, region: &Region) -> SgList {
    (0..region.len() / PAGE_SIZE)
        .map(|i| {
            let paddr = memory
                .translate(region.vaddr() + (i * PAGE_SIZE) as u64)
                .unwrap();
            PhysicalEntry::new(paddr, PAGE_SIZE as u64)
        })
        .collect()
}

fn read_fragments(memory: &PagedMemory, sg: &[PhysicalEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in sg {
        let mut buf = vec![0u8; entry.size as usize];
        memory.read_physical(entry.address, &mut buf).unwrap();
        out.extend_from_slice(&buf);
    }
    out
}

fn write_fragments(memory: &PagedMemory, sg: &[PhysicalEntry], data: &[u8]) {
    let mut done = 0;
    for entry in sg {
        let n = (entry.size as usize).min(data.len() - done);
        memory.write_physical(entry.address, &data[done..done + n]).unwrap();
        done += n;
    }
}

struct UserBuffer {
    region: Region,
    sg: SgList,
}

fn user_buffer(h: &Harness, pages: usize) -> UserBuffer {
    let region = h
        .memory
        .allocate(pages * PAGE_SIZE, Placement::Scattered)
        .unwrap();
    let sg = page_fragments(&h.memory, &region);
    assert_eq!(sg.len(), pages);
    UserBuffer { region, sg }
}

fn data_request(
    h: &Harness,
    device: &Arc<scsi_busman::Device>,
    buf: &UserBuffer,
    direction: DataDirection,
) -> Arc<Request> {
    let request = h.request(device, 0);
    {
        let mut data = request.lock();
        data.direction = direction;
        data.data = Some(buf.region.vaddr());
        data.data_length = buf.region.len();
        data.sg_list = Some(buf.sg.clone());
    }
    request
}

#[test]
fn outbound_data_is_bounced_through_the_device_buffer() {
    let h = Harness::with_memory(single_fragment_controller(), fragmented_memory());
    let dev = h.device(0, DeviceConfig::default());
    let buf = user_buffer(&h, 2);
    let payload = pattern(2 * PAGE_SIZE);
    h.memory.write_virtual(buf.region.vaddr(), &payload).unwrap();

    let request = data_request(&h, &dev, &buf, DataDirection::Out);
    h.bus.submit_async(&request).unwrap();
    assert!(h.sim.wait_held(1));

    let sent = h.sim.take_oldest().unwrap();
    let bounce = {
        let data = sent.lock();
        assert!(data.is_buffered());
        assert_ne!(data.data, Some(buf.region.vaddr()));
        data.sg_list.clone().unwrap()
    };
    assert_eq!(bounce.len(), 1);
    assert_eq!(sg_len(&bounce), (2 * PAGE_SIZE) as u64);
    assert_eq!(read_fragments(&h.memory, &bounce), payload);
    assert!(dev.dma_buffer_size() >= 2 * PAGE_SIZE);

    h.sim.complete(sent, Reply::GOOD);
    assert!(request.wait_timeout(TIMEOUT));
    let data = request.lock();
    assert!(!data.is_buffered());
    assert_eq!(data.sg_list.as_ref(), Some(&buf.sg));
    assert_eq!(data.data, Some(buf.region.vaddr()));
    drop(data);
    assert_eq!(h.bus.stats().dma_buffered, 1);
}

#[test]
fn inbound_data_is_copied_back_up_to_the_residual() {
    let h = Harness::with_memory(single_fragment_controller(), fragmented_memory());
    let dev = h.device(0, DeviceConfig::default());
    let buf = user_buffer(&h, 2);
    let len = 2 * PAGE_SIZE;
    let resid = 100;

    let request = data_request(&h, &dev, &buf, DataDirection::In);
    h.bus.submit_async(&request).unwrap();
    assert!(h.sim.wait_held(1));

    let sent = h.sim.take_oldest().unwrap();
    let bounce = sent.lock().sg_list.clone().unwrap();
    let incoming = pattern(len);
    write_fragments(&h.memory, &bounce, &incoming);
    h.sim.complete(
        sent,
        Reply {
            data_resid: resid,
            ..Reply::GOOD
        },
    );
    assert!(request.wait_timeout(TIMEOUT));

    let mut landed = vec![0u8; len];
    h.memory.read_virtual(buf.region.vaddr(), &mut landed).unwrap();
    assert_eq!(&landed[..len - resid], &incoming[..len - resid]);
    assert!(landed[len - resid..].iter().all(|&b| b == 0));
    assert_eq!(request.lock().data_resid, resid);
}

#[test]
fn failed_inbound_transfer_is_not_copied_back() {
    let h = Harness::with_memory(single_fragment_controller(), fragmented_memory());
    let dev = h.device(0, DeviceConfig::default());
    let buf = user_buffer(&h, 2);

    let request = data_request(&h, &dev, &buf, DataDirection::In);
    h.bus.submit_async(&request).unwrap();
    assert!(h.sim.wait_held(1));
    let sent = h.sim.take_oldest().unwrap();
    let bounce = sent.lock().sg_list.clone().unwrap();
    write_fragments(&h.memory, &bounce, &pattern(2 * PAGE_SIZE));
    h.sim.complete(sent, Reply::status(0x08));
    assert!(request.wait_timeout(TIMEOUT));

    let mut landed = vec![0xffu8; 2 * PAGE_SIZE];
    h.memory.read_virtual(buf.region.vaddr(), &mut landed).unwrap();
    assert!(landed.iter().all(|&b| b == 0));
    assert_eq!(request.lock().subsys_status, SubsysStatus::CompletedWithError);
}

#[test]
fn safe_lists_are_passed_through_untouched() {
    let h = Harness::with_memory(BusConfig::default(), fragmented_memory());
    let dev = h.device(0, DeviceConfig::default());
    let buf = user_buffer(&h, 3);

    let request = data_request(&h, &dev, &buf, DataDirection::Out);
    h.bus.submit_async(&request).unwrap();
    assert!(h.sim.wait_held(1));
    let sent = h.sim.take_oldest().unwrap();
    assert!(!sent.lock().is_buffered());
    assert_eq!(sent.lock().sg_list.as_ref(), Some(&buf.sg));
    h.sim.complete(sent, Reply::GOOD);
    assert_eq!(dev.dma_buffer_size(), 0);
    assert_eq!(h.bus.stats().dma_buffered, 0);
}

#[test]
fn idle_buffers_are_reclaimed() {
    let h = Harness::with_memory(single_fragment_controller(), fragmented_memory());
    let dev = h.device(0, DeviceConfig::default());
    h.sim.set_responder(|_| Some(Reply::GOOD));
    let buf = user_buffer(&h, 2);

    let request = data_request(&h, &dev, &buf, DataDirection::Out);
    h.bus.submit_sync(&request).unwrap();
    assert!(dev.dma_buffer_size() > 0);
    let regions = h.memory.live_regions();

    // Still fresh under the configured idle timeout.
    assert_eq!(h.bus.reclaim_dma_buffers(Duration::from_secs(3600)), 0);
    thread::sleep(Duration::from_millis(5));
    assert_eq!(h.bus.reclaim_dma_buffers(Duration::ZERO), 1);
    assert_eq!(dev.dma_buffer_size(), 0);
    assert_eq!(h.memory.live_regions(), regions - 1);
    assert_eq!(h.bus.stats().dma_reclaimed, 1);

    // The next buffered request grows a new one.
    h.bus.submit_sync(&request).unwrap();
    assert!(dev.dma_buffer_size() > 0);
}

#[test]
fn buffer_larger_than_a_boundary_window_is_refused() {
    let config = BusConfig {
        dma: DmaParams {
            max_sg_blocks: 1,
            dma_boundary: 0xfff,
            ..DmaParams::default()
        },
        ..BusConfig::default()
    };
    let h = Harness::with_memory(config, fragmented_memory());
    let dev = h.device(0, DeviceConfig::default());
    let buf = user_buffer(&h, 3);

    let request = data_request(&h, &dev, &buf, DataDirection::Out);
    assert!(matches!(
        h.bus.submit_async(&request),
        Err(BusError::DmaBufferAlloc { .. })
    ));
    assert_eq!(request.state(), scsi_busman::RequestState::Finished);
    let data = request.lock();
    assert!(!data.is_buffered());
    assert_eq!(data.sg_list.as_ref(), Some(&buf.sg));
    drop(data);
    assert_eq!(h.bus.stats().submitted, 0);

    // Nothing was left claimed; the device still takes work.
    let small = user_buffer(&h, 1);
    let ok = data_request(&h, &dev, &small, DataDirection::Out);
    h.sim.set_responder(|_| Some(Reply::GOOD));
    h.bus.submit_sync(&ok).unwrap();
    assert_eq!(ok.lock().subsys_status, SubsysStatus::Completed);
}

#[test]
fn requests_of_one_device_share_the_buffer_in_turn() {
    let h = Harness::with_memory(single_fragment_controller(), fragmented_memory());
    let dev = h.device(0, DeviceConfig {
        queue_depth: 4,
        ..DeviceConfig::default()
    });
    let a = user_buffer(&h, 2);
    let b = user_buffer(&h, 2);

    let first = data_request(&h, &dev, &a, DataDirection::Out);
    h.bus.submit_async(&first).unwrap();
    assert!(h.sim.wait_held(1));

    let second = data_request(&h, &dev, &b, DataDirection::Out);
    thread::scope(|s| {
        let submitter = s.spawn(|| h.bus.submit_async(&second));
        // Blocked on the buffer until the first request is done with it.
        thread::sleep(Duration::from_millis(50));
        assert!(!submitter.is_finished());
        h.sim.complete_oldest(Reply::GOOD).unwrap();
        submitter.join().unwrap().unwrap();
    });
    assert!(h.sim.wait_held(1));
    h.sim.complete_oldest(Reply::GOOD).unwrap();
    assert!(second.wait_timeout(TIMEOUT));
    assert_eq!(h.bus.stats().dma_buffered, 2);
}

#[test]
fn sync_submission_builds_a_temporary_list() {
    let h = Harness::with_memory(BusConfig::default(), fragmented_memory());
    let dev = h.device(0, DeviceConfig::default());
    let region = h.memory.allocate(3 * PAGE_SIZE, Placement::Scattered).unwrap();
    let incoming = pattern(3 * PAGE_SIZE);

    let memory = h.memory.clone();
    let expected = incoming.clone();
    h.sim.set_responder(move |request| {
        let sg = request.lock().sg_list.clone().unwrap();
        assert_eq!(sg.len(), 3);
        write_fragments(&memory, &sg, &expected);
        Some(Reply::GOOD)
    });

    let request = h.request(&dev, 0);
    {
        let mut data = request.lock();
        data.direction = DataDirection::In;
        data.data = Some(region.vaddr());
        data.data_length = region.len();
    }
    h.bus.submit_sync(&request).unwrap();

    assert!(request.lock().sg_list.is_none());
    let mut landed = vec![0u8; region.len()];
    h.memory.read_virtual(region.vaddr(), &mut landed).unwrap();
    assert_eq!(landed, incoming);
}

#[test]
fn sync_submission_rejects_lists_the_controller_cannot_take() {
    let h = Harness::with_memory(single_fragment_controller(), fragmented_memory());
    let dev = h.device(0, DeviceConfig::default());
    let region = h.memory.allocate(2 * PAGE_SIZE, Placement::Scattered).unwrap();

    let request = h.request(&dev, 0);
    {
        let mut data = request.lock();
        data.data = Some(region.vaddr());
        data.data_length = region.len();
    }
    assert!(matches!(
        h.bus.submit_sync(&request),
        Err(BusError::SgTooComplex { max: 1 })
    ));
    assert!(request.lock().sg_list.is_none());

    let unmapped = h.request(&dev, 0);
    {
        let mut data = unmapped.lock();
        data.data = Some(0x1000);
        data.data_length = 512;
    }
    assert!(matches!(
        h.bus.submit_sync(&unmapped),
        Err(BusError::SgMapFailed { len: 512 })
    ));
}

#[test]
fn aborting_a_queued_bounced_request_restores_the_caller_view() {
    let h = Harness::with_memory(single_fragment_controller(), fragmented_memory());
    let dev = h.device(0, DeviceConfig::default());
    let buf = user_buffer(&h, 2);
    let payload = pattern(2 * PAGE_SIZE);
    h.memory.write_virtual(buf.region.vaddr(), &payload).unwrap();

    h.bus.block_device(&dev);
    let request = data_request(&h, &dev, &buf, DataDirection::Out);
    h.bus.submit_async(&request).unwrap();
    assert!(request.lock().is_buffered());
    assert_eq!(h.bus.device_snapshot(&dev).unwrap().queued, 1);
    assert_eq!(h.sim.held(), 0);

    assert_eq!(h.bus.abort(&request), AbortOutcome::Aborted);
    {
        let data = request.lock();
        assert!(!data.is_buffered());
        assert_eq!(data.sg_list.as_ref(), Some(&buf.sg));
        assert_eq!(data.data, Some(buf.region.vaddr()));
        assert_eq!(data.data_length, 2 * PAGE_SIZE);
        assert_eq!(data.subsys_status, SubsysStatus::Aborted);
    }
    assert_eq!(read_fragments(&h.memory, &buf.sg), payload);

    // The device buffer was handed back: another request can claim it.
    h.bus.unblock_device(&dev);
    let next = data_request(&h, &dev, &buf, DataDirection::Out);
    let submitter = {
        let (bus, next) = (h.bus.clone(), next.clone());
        thread::spawn(move || bus.submit_async(&next))
    };
    assert!(h.sim.wait_held(1));
    submitter.join().unwrap().unwrap();
    assert!(next.lock().is_buffered());
    h.sim.complete_oldest(Reply::GOOD).unwrap();
    assert!(next.wait_timeout(TIMEOUT));
    assert_eq!(next.lock().sg_list.as_ref(), Some(&buf.sg));
    assert_eq!(h.bus.stats().dma_buffered, 2);
}
