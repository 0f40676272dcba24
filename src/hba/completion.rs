// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use tracing::{debug, error, warn};

use crate::{
    ccb::{
        Ccb, CcbHeader, CcbId, CcbState, DataPointer,
        hw_header::residual_from,
    },
    hba::{
        engine::{EngineState, Hba},
        error::HbaError,
        request::{CommandResult, DataDirection},
    },
    hw::{controller::ScriptsController, regs::Reg},
    models::status::{ExtendedError, HostStatus, ScsiStatus, TransportStatus},
};

impl<C: ScriptsController> Hba<C> {
    /// Takes every CCB the controller posted to the done queue and routes it
    /// to good or error completion. Returns how many entries were consumed.
    pub fn drain_completions(&mut self) -> usize {
        let posted = match self.dqueue.drain(&self.pool) {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "done queue unreadable");
                return 0;
            },
        };
        for &dsa in &posted {
            match self.ccbs.lookup(dsa) {
                Some(id) if self.ccbs.get(id).state == CcbState::Started => {
                    self.complete_from_header(id)
                },
                Some(id) => warn!(ccb = id.0, %dsa, "done queue names a ccb that is not started"),
                None => {
                    self.stats.bad_dsa += 1;
                    warn!(%dsa, "bad DSA in done queue");
                },
            }
        }
        posted.len()
    }

    /// Reads back the header of a finished CCB and completes it.
    pub(crate) fn complete_from_header(&mut self, id: CcbId) {
        let ba = self.ccbs.get(id).ba;
        let hdr = match CcbHeader::load(&self.pool, ba) {
            Ok(h) => h,
            Err(e) => {
                error!(ccb = id.0, error = %e, "ccb header unreadable");
                self.finish(id, TransportStatus::Error);
                return;
            },
        };
        let host = hdr.host().unwrap_or(HostStatus::CompleteError);
        let good = host == HostStatus::Complete
            && hdr.status() == ScsiStatus::Good
            && hdr.xerr().is_empty()
            && hdr.extra_bytes.get() == 0;

        if self.ccbs.get(id).is_sense_phase() {
            self.finish_sense(id, &hdr);
        } else if good {
            self.complete_ok(id, &hdr);
        } else {
            self.complete_error(id, &hdr);
        }
    }

    fn complete_ok(&mut self, id: CcbId, hdr: &CcbHeader) {
        let residual = self.residual_of(id, hdr);
        let ratchet = self.policy.ratchet_up;
        let ccb = self.ccbs.get_mut(id);
        ccb.host_status = HostStatus::Complete;
        ccb.scsi_status = ScsiStatus::Good;
        ccb.residual = residual;
        let (target, lun) = (ccb.target, ccb.lun);
        if let Some(lcb) = self.targets[usize::from(target)].lun_mut(lun) {
            lcb.on_good_completion(ratchet);
        }
        self.state = EngineState::CompletingOk;
        self.finish(id, TransportStatus::Ok);
    }

    /// Bytes of the data buffer that were not transferred, from the last
    /// data pointer the sequencer saved.
    pub(crate) fn residual_of(&self, id: CcbId, hdr: &CcbHeader) -> u32 {
        let ccb = self.ccbs.get(id);
        if ccb.direction == DataDirection::None || ccb.sg_count == 0 || hdr.extra_bytes.get() > 0 {
            return 0;
        }
        let lastp = DataPointer::decode(hdr.lastp.get());
        residual_from(&self.pool, ccb.sg.bus, ccb.sg_count, lastp).unwrap_or_else(|e| {
            warn!(ccb = id.0, error = %e, "scatter list unreadable, reporting full residual");
            ccb.data_len
        })
    }

    /// Drops the start-queue accounting of a CCB that leaves the controller.
    pub(crate) fn retire(&mut self, id: CcbId) {
        let ccb = self.ccbs.get_mut(id);
        if ccb.state != CcbState::Started {
            return;
        }
        ccb.state = CcbState::Waiting;
        let (target, lun) = (ccb.target, ccb.lun);
        self.started = self.started.saturating_sub(1);
        if let Some(lcb) = self.targets[usize::from(target)].lun_mut(lun) {
            lcb.started = lcb.started.saturating_sub(1);
        }
    }

    /// Marks a CCB done with `transport` and queues its result, without
    /// starting anything else.
    pub(crate) fn mark_done(&mut self, id: CcbId, transport: TransportStatus) {
        self.retire(id);
        let ccb = self.ccbs.get_mut(id);
        if !ccb.in_flight() {
            return;
        }
        ccb.state = CcbState::Done;
        ccb.transport = transport;
        let (target, lun, sense_phase) = (ccb.target, ccb.lun, ccb.is_sense_phase());
        if sense_phase {
            // the sense never arrived; report what the command itself returned
            restore_saved(ccb);
        }

        let tcb = &mut self.targets[usize::from(target)];
        if tcb.nego.is_some_and(|n| n.ccb == id) {
            tcb.nego = None;
            tcb.check_nego = tcb.goal != tcb.active;
        }
        if let Some(lcb) = tcb.lun_mut(lun) {
            lcb.waiting.retain(|&w| w != id);
            if sense_phase {
                lcb.sense_pending = false;
                lcb.unbind_sense(id);
            }
        }
        self.completed.push_back(id);
        self.stats.completed += 1;
        debug!(ccb = id.0, target, lun, ?transport, "ccb done");
    }

    /// Completes a CCB and lets the next waiting command of its LUN start.
    pub(crate) fn finish(&mut self, id: CcbId, transport: TransportStatus) {
        let (target, lun) = {
            let ccb = self.ccbs.get(id);
            (ccb.target, ccb.lun)
        };
        self.mark_done(id, transport);
        if let Err(e) = self.start_waiting(target, lun) {
            error!(target, lun, error = %e, "failed to start waiting commands");
        }
    }

    /// Fails every bound CCB, started or waiting, with `transport`.
    pub(crate) fn fail_all(&mut self, transport: TransportStatus) -> usize {
        let mut failed = 0;
        for id in self.ccbs.busy_snapshot() {
            if self.ccbs.get(id).in_flight() {
                self.mark_done(id, transport);
                failed += 1;
            }
        }
        failed
    }

    /// Pulls not yet fetched CCBs matching `pred` off the start queue. They
    /// are left in the `Waiting` state for the caller to place.
    pub(crate) fn dequeue_where(
        &mut self,
        pred: impl Fn(&Ccb) -> bool,
    ) -> Result<Vec<CcbId>, HbaError> {
        let get = self.ctrl.read_reg(Reg::SqueueGet) as usize;
        let ccbs = &self.ccbs;
        let removed = self.squeue.remove_where(&self.pool, get, |ba| {
            ccbs.lookup(ba).is_some_and(|id| pred(ccbs.get(id)))
        })?;
        let ids: Vec<CcbId> = removed
            .into_iter()
            .filter_map(|ba| self.ccbs.lookup(ba))
            .collect();
        for &id in &ids {
            self.retire(id);
        }
        Ok(ids)
    }

    /// Removes from the start queue every unfetched CCB of `target`,
    /// optionally restricted to one LUN and one tag (`Some(None)` for the
    /// untagged task).
    pub fn dequeue_all(
        &mut self,
        target: u8,
        lun: Option<u8>,
        tag: Option<Option<u8>>,
    ) -> Result<Vec<CcbId>, HbaError> {
        self.dequeue_where(|c| {
            c.target == target && lun.is_none_or(|l| c.lun == l) && tag.is_none_or(|t| c.tag == t)
        })
    }

    /// Puts dequeued CCBs back at the head of their LUN wait queues, keeping
    /// their relative order.
    pub(crate) fn hold(&mut self, ids: &[CcbId]) {
        for &id in ids.iter().rev() {
            let ccb = self.ccbs.get(id);
            let (target, lun) = (ccb.target, ccb.lun);
            if let Some(lcb) = self.targets[usize::from(target)].lun_mut(lun) {
                lcb.waiting.push_front(id);
            }
        }
    }

    /// Results of every command finished since the last call. Each
    /// submitted command shows up exactly once; its CCB is freed here.
    pub fn poll_completions(&mut self) -> Vec<CommandResult> {
        let mut out = Vec::with_capacity(self.completed.len());
        while let Some(id) = self.completed.pop_front() {
            let ccb = self.ccbs.get(id);
            if ccb.state != CcbState::Done {
                continue;
            }
            let result = ccb.handle.map(|handle| CommandResult {
                handle,
                target: ccb.target,
                lun: ccb.lun,
                transport: ccb.transport,
                scsi_status: ccb.scsi_status,
                residual: ccb.residual,
                xerr: ccb.xerr,
                sense: ccb.sense_data.clone(),
            });
            if let Err(e) = self.free_ccb(id) {
                warn!(ccb = id.0, error = %e, "failed to free completed ccb");
            }
            out.extend(result);
        }
        if self.started == 0 && self.state != EngineState::ResettingBus {
            self.state = EngineState::Idle;
        }
        out
    }
}

/// Puts back the status saved before the automatic REQUEST SENSE.
pub(crate) fn restore_saved(ccb: &mut Ccb) {
    if let Some(saved) = ccb.saved.take() {
        ccb.scsi_status = saved.scsi_status;
        ccb.residual = saved.residual;
        ccb.xerr = saved.xerr;
        ccb.sg_count = saved.sg_count;
        ccb.cdb = saved.cdb;
        ccb.cdb_len = saved.cdb_len;
    }
}

/// Extended error bits implied by a finished header.
pub(crate) fn header_xerr(hdr: &CcbHeader) -> ExtendedError {
    let mut x = hdr.xerr();
    if hdr.extra_bytes.get() > 0 {
        x |= ExtendedError::EXTRA_DATA;
    }
    x
}
