//! REQUEST SENSE on behalf of controllers that cannot fetch sense data themselves.
//!
//! Each device owns one pre-built REQUEST SENSE request. When a command ends in CHECK CONDITION
//! it is parked (claimed back from the controller, not yet finished) while that request is pushed to the head of the device queue as
//! an ordered entry, so nothing is sorted ahead of it and nothing else runs on the device while
//! it is out. At most one sense fetch runs per device; later originators wait in line.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::bus::Bus;
use crate::device::Device;
use crate::flow::AdmissionState;
use crate::queue::QueueEntry;
use crate::request::{Request, RequestState, SubsysStatus, MAX_SENSE_SIZE};
use crate::sg::read_sg;
use crate::util::lock;

impl Bus {
    /// Starts (or lines up) a sense fetch for `originator`.
    ///
    /// Returns the originator when no fetch is possible any more; its status has then been set to
    /// [`SubsysStatus::AutosenseFailed`] and the caller must finish it outside the bus lock.
    pub(crate) fn queue_autosense(
        &self,
        st: &mut AdmissionState,
        device: &Device,
        originator: Arc<Request>,
    ) -> Option<Arc<Request>> {
        let id = device.id();
        let sense = match device.autosense_request() {
            Some(sense) if !self.is_shutting_down() => sense,
            _ => {
                let mut data = originator.lock();
                data.subsys_status = SubsysStatus::AutosenseFailed;
                data.autosense_pending = false;
                drop(data);
                return Some(originator);
            }
        };

        let dev = st.device_mut(id);
        if dev.autosense_for.is_some() {
            trace!(device = %id, request = originator.id(), "autosense busy, waiting");
            dev.autosense_waiters.push_back(originator);
            return None;
        }
        trace!(device = %id, request = originator.id(), "issuing REQUEST SENSE");
        dev.autosense_for = Some(originator);
        sense.begin_submission();
        sense.transition(RequestState::InWork, RequestState::Queued);
        dev.queue.push_front(QueueEntry::new(sense, -1, true));
        st.promote(id);
        self.stats.inc_autosense_issued();
        None
    }

    /// Completion of the device's REQUEST SENSE: hands the sense bytes to the originator,
    /// finishes it and starts the next waiting fetch.
    pub(crate) fn finish_autosense(&self, device: &Device, sense: &Arc<Request>) {
        let id = device.id();
        let originator = lock(&self.admission)
            .devices
            .get(&id)
            .and_then(|dev| dev.autosense_for.clone());
        let Some(originator) = originator else {
            panic!("REQUEST SENSE completed on device {id} with no request waiting for it");
        };

        let (status, got, sg) = {
            let data = sense.lock();
            let got = data
                .data_length
                .saturating_sub(data.data_resid)
                .min(MAX_SENSE_SIZE);
            (data.subsys_status, got, data.sg_list.clone().unwrap_or_default())
        };
        let mut buf = [0u8; MAX_SENSE_SIZE];
        let fetched =
            status == SubsysStatus::Completed && read_sg(&*self.memory, &sg, &mut buf[..got]).is_ok();

        {
            let mut data = originator.lock();
            data.autosense_pending = false;
            if fetched {
                data.sense = [0; MAX_SENSE_SIZE];
                data.sense[..got].copy_from_slice(&buf[..got]);
                data.sense_resid = MAX_SENSE_SIZE - got;
                data.autosense_valid = true;
            } else {
                data.subsys_status = SubsysStatus::AutosenseFailed;
            }
        }
        debug!(device = %id, request = originator.id(), valid = fetched, sense_len = got, "autosense done");
        sense.transition(RequestState::InWork, RequestState::Finished);

        let failed = self.with_admission(|st| {
            let dev = st.device_mut(id);
            dev.autosense_for = None;
            match dev.autosense_waiters.pop_front() {
                Some(next) => self.queue_autosense(st, device, next),
                None => None,
            }
        });
        originator.finish();
        if let Some(failed) = failed {
            failed.finish();
        }
    }
}
