// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use tracing::{debug, error, trace};
use zerocopy::byteorder::U32;

use crate::{
    ccb::{
        CcbHeader, CcbId, CcbState, DataPointer, SgEntry,
        hw_header::{SG_MAX_SEGMENT, store_sg},
    },
    control_block::{inquiry::INQUIRY, request_sense::REQUEST_SENSE},
    hba::{
        engine::{EngineState, Hba},
        error::HbaError,
        request::{CommandRequest, DataDirection, PendingHandle},
    },
    hw::{
        controller::ScriptsController,
        regs::{Istat, Reg},
        script::ScriptEntry,
    },
    models::{
        message::task_prologue,
        status::{HostStatus, TagPolicy},
    },
};

/// Status byte value meaning "not written by the target yet".
pub(crate) const S_ILLEGAL: u8 = 0xff;

impl<C: ScriptsController> Hba<C> {
    pub(crate) fn check_nexus(&self, target: u8, lun: u8) -> Result<(), HbaError> {
        let tcb = self
            .targets
            .get(usize::from(target))
            .ok_or(HbaError::InvalidTarget(target))?;
        if target == self.host_id {
            return Err(HbaError::InvalidTarget(target));
        }
        if lun >= self.max_luns {
            return Err(HbaError::InvalidLun(lun));
        }
        if tcb.settings.excluded.as_bool() {
            return Err(HbaError::ExcludedTarget(target));
        }
        Ok(())
    }

    fn check_request(&self, req: &CommandRequest) -> Result<(), HbaError> {
        self.check_nexus(req.target, req.lun)?;
        if req.cdb_len == 0 || req.cdb_len > 16 {
            return Err(HbaError::InvalidRequest("cdb length must be 1..=16"));
        }
        if req.segments.len() > self.max_sg {
            return Err(HbaError::InvalidRequest("too many data segments"));
        }
        if req.segments.is_empty() != (req.direction == DataDirection::None) {
            return Err(HbaError::InvalidRequest("data direction does not match segments"));
        }
        if req
            .segments
            .iter()
            .any(|s| s.len == 0 || s.len > SG_MAX_SEGMENT)
        {
            return Err(HbaError::InvalidRequest("segment length out of range"));
        }
        if req.data_len() > u64::from(u32::MAX) {
            return Err(HbaError::InvalidRequest("transfer too long"));
        }
        Ok(())
    }

    /// Hands a command to the controller. `Busy` means the LUN cannot take
    /// another task of this kind right now.
    pub fn submit(&mut self, req: &CommandRequest) -> Result<PendingHandle, HbaError> {
        self.check_request(req)?;
        let id = self.get_ccb(req.target, req.lun, req.tag_policy != TagPolicy::Untagged)?;
        if let Err(e) = self.setup_ccb(id, req) {
            self.drop_ccb(id);
            return Err(e);
        }

        let handle = PendingHandle(self.next_handle);
        self.next_handle += 1;
        self.ccbs.get_mut(id).handle = Some(handle);
        self.handles.insert(handle, id);
        self.stats.submitted += 1;

        if let Some(lcb) = self.targets[usize::from(req.target)].lun_mut(req.lun) {
            lcb.waiting.push_back(id);
        }
        if let Err(e) = self.start_waiting(req.target, req.lun) {
            if self.ccbs.get(id).state == CcbState::Waiting {
                self.drop_ccb(id);
                return Err(e);
            }
        }
        trace!(?handle, target = req.target, lun = req.lun, opcode = req.cdb[0], "submitted");
        Ok(handle)
    }

    fn drop_ccb(&mut self, id: CcbId) {
        if let Err(e) = self.free_ccb(id) {
            error!(error = %e, "failed to release ccb");
        }
    }

    /// Reserves a nexus slot on the LUN and binds a CCB to it.
    pub fn get_ccb(&mut self, target: u8, lun: u8, tagged: bool) -> Result<CcbId, HbaError> {
        self.check_nexus(target, lun)?;
        let t = usize::from(target);
        let slot = self.targets[t]
            .lun_or_create(lun)
            .reserve(tagged)
            .ok_or(HbaError::Busy)?;

        let id = match self.ccbs.alloc(&self.pool) {
            Ok(id) => id,
            Err(e) => {
                if let Some(lcb) = self.targets[t].lun_mut(lun) {
                    lcb.unbind(slot);
                }
                return Err(e);
            },
        };
        let ccb = self.ccbs.get_mut(id);
        ccb.target = target;
        ccb.lun = lun;
        ccb.tag = slot;
        if let Some(lcb) = self.targets[t].lun_mut(lun) {
            lcb.bind(id, slot);
        }
        debug!(ccb = id.0, target, lun, tag = ?slot, "ccb bound");
        Ok(id)
    }

    /// Unbinds a CCB from its LUN and puts it back on the free list.
    pub fn free_ccb(&mut self, id: CcbId) -> Result<(), HbaError> {
        let ccb = self.ccbs.get(id);
        if ccb.state == CcbState::Free {
            return Err(HbaError::UnknownCcb);
        }
        let (target, lun, tag, state, handle) = (ccb.target, ccb.lun, ccb.tag, ccb.state, ccb.handle);

        if let Some(tcb) = self.targets.get_mut(usize::from(target)) {
            if tcb.nego.is_some_and(|n| n.ccb == id) {
                tcb.nego = None;
                tcb.check_nego = tcb.goal != tcb.active;
            }
            if let Some(lcb) = tcb.lun_mut(lun) {
                lcb.unbind(tag);
                lcb.unbind_sense(id);
                lcb.waiting.retain(|&w| w != id);
                if state == CcbState::Started {
                    lcb.started = lcb.started.saturating_sub(1);
                }
            }
        }
        if state == CcbState::Started {
            self.started = self.started.saturating_sub(1);
        }
        if let Some(h) = handle {
            self.handles.remove(&h);
        }
        self.ccbs.release(id)
    }

    fn setup_ccb(&mut self, id: CcbId, req: &CommandRequest) -> Result<(), HbaError> {
        let entries: Vec<SgEntry> = req
            .segments
            .iter()
            .map(|s| SgEntry::new(s.addr, s.len))
            .collect();
        let sg_ba = self.ccbs.get(id).sg.bus;
        store_sg(&self.pool, sg_ba, &entries)?;

        let ccb = self.ccbs.get_mut(id);
        ccb.cdb = req.cdb;
        ccb.cdb_len = req.cdb_len;
        ccb.direction = req.direction;
        ccb.data_len = req.data_len() as u32;
        ccb.sg_count = entries.len() as u8;
        ccb.tag_policy = if ccb.tag.is_some() {
            req.tag_policy
        } else {
            TagPolicy::Untagged
        };
        Ok(())
    }

    /// Starts waiting CCBs of a LUN while its depth allows.
    pub(crate) fn start_waiting(&mut self, target: u8, lun: u8) -> Result<(), HbaError> {
        if self.abort_target == Some(target) {
            return Ok(());
        }
        loop {
            let Some(lcb) = self
                .targets
                .get_mut(usize::from(target))
                .and_then(|tcb| tcb.lun_mut(lun))
            else {
                return Ok(());
            };
            if !lcb.can_start() {
                return Ok(());
            }
            let Some(id) = lcb.waiting.pop_front() else {
                return Ok(());
            };
            if let Err(e) = self.enqueue(id) {
                if let Some(lcb) = self.targets[usize::from(target)].lun_mut(lun) {
                    lcb.waiting.push_front(id);
                }
                return Err(e);
            }
        }
    }

    /// Writes the CCB header, appends the CCB to the start queue and rings
    /// the doorbell.
    pub(crate) fn enqueue(&mut self, id: CcbId) -> Result<(), HbaError> {
        if self.started + 1 >= self.squeue.slots() {
            error!(started = self.started, slots = self.squeue.slots(), "start queue overflow");
            return Err(HbaError::StartQueueOverflow);
        }
        let header = self.build_header(id);
        let ba = self.ccbs.get(id).ba;
        header.store(&self.pool, ba)?;
        self.squeue.push(&self.pool, ba)?;

        let ccb = self.ccbs.get_mut(id);
        ccb.state = CcbState::Started;
        ccb.start_seq = self.next_seq;
        self.next_seq += 1;
        let (target, lun, negotiating) = (ccb.target, ccb.lun, ccb.nego_status.is_some());
        if let Some(lcb) = self.targets[usize::from(target)].lun_mut(lun) {
            lcb.started += 1;
        }
        self.started += 1;

        self.ctrl.write_reg8(Reg::Istat, Istat::SIGP.bits());
        self.state = if negotiating {
            EngineState::Negotiating
        } else {
            EngineState::Selecting
        };
        trace!(ccb = id.0, %ba, "ccb started");
        Ok(())
    }

    /// Fills the bus-visible header: data pointers, selection timings and
    /// the message-out bytes, with a negotiation appended when one is due.
    fn build_header(&mut self, id: CcbId) -> CcbHeader {
        let ccb = self.ccbs.get(id);
        let (target, lun, sense_phase) = (ccb.target, ccb.lun, ccb.is_sense_phase());
        let tag = ccb.tag.zip(ccb.tag_policy.message());
        let force = matches!(ccb.cdb[0], INQUIRY | REQUEST_SENSE);

        let tcb = &mut self.targets[usize::from(target)];
        let mut msg = if sense_phase {
            task_prologue(lun, false, None)
        } else {
            task_prologue(lun, tcb.may_disconnect(), tag.map(|(t, m)| (m, t)))
        };
        let mut nego = None;
        if tcb.nego.is_none() && (tcb.check_nego || force) {
            if let Some((kind, m)) = self.nego.propose(tcb, force) {
                self.nego.start(tcb, id, kind);
                m.encode_into(&mut msg);
                nego = Some(kind);
            }
        }
        let regs = tcb.regs;

        let ccb = self.ccbs.get_mut(id);
        ccb.nego_status = nego;
        ccb.host_status = if nego.is_some() {
            HostStatus::Negotiating
        } else {
            HostStatus::Busy
        };
        let goal = DataPointer::new(ccb.sg_count, 0).encode();
        let first = if ccb.sg_count > 0 {
            DataPointer::new(0, 0).encode()
        } else {
            goal
        };

        let mut h = CcbHeader {
            start: U32::new(ScriptEntry::SelDone.encode()),
            savep: U32::new(first),
            lastp: U32::new(first),
            goalp: U32::new(goal),
            sg_ba: U32::new(ccb.sg.bus.0),
            sense_ba: U32::new(ccb.sense.bus.0),
            host_status: u8::from(ccb.host_status),
            scsi_status: S_ILLEGAL,
            nego_status: nego.map_or(0, |k| k.code()),
            sel_id: target,
            sel_scntl3: regs.scntl3,
            sel_sxfer: regs.sxfer,
            sel_scntl4: regs.scntl4,
            cdb_len: ccb.cdb_len,
            sg_count: ccb.sg_count,
            cdb: ccb.cdb,
            ..Default::default()
        };
        h.set_msgout(&msg);
        h
    }
}
