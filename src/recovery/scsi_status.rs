// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::{
    ccb::{
        AbortMark, CcbHeader, CcbId, CcbState, SavedStatus, SgEntry,
        hw_header::{DataPointer, residual_from, store_sg},
    },
    control_block::request_sense::fill_request_sense,
    hba::{
        completion::{header_xerr, restore_saved},
        engine::{EngineState, ErrorKind, Hba},
        error::HbaError,
        request::DataDirection,
    },
    hw::controller::ScriptsController,
    models::status::{ExtendedError, HostStatus, ScsiStatus, TransportStatus},
};

impl<C: ScriptsController> Hba<C> {
    /// Completion of a CCB whose header reports anything but a clean GOOD.
    pub(crate) fn complete_error(&mut self, id: CcbId, hdr: &CcbHeader) {
        let host = hdr.host().unwrap_or(HostStatus::CompleteError);
        let status = hdr.status();
        let xerr = header_xerr(hdr);
        let residual = self.residual_of(id, hdr);
        {
            let ccb = self.ccbs.get_mut(id);
            ccb.host_status = host;
            ccb.scsi_status = status;
            ccb.xerr = xerr;
            ccb.extra_bytes = hdr.extra_bytes.get();
            ccb.residual = residual;
        }
        debug!(ccb = id.0, ?host, ?status, ?xerr, residual, "error completion");

        match host {
            HostStatus::Complete if status.wants_sense() => {
                self.state = EngineState::CompletingError(ErrorKind::ScsiStatus);
                if let Err(e) = self.start_auto_sense(id, residual) {
                    warn!(ccb = id.0, error = %e, "automatic REQUEST SENSE not started");
                    self.finish(id, TransportStatus::Ok);
                }
            },
            HostStatus::Complete if status.is_transient() => self.requeue_transient(id, status),
            HostStatus::Complete => {
                let (kind, transport) = if xerr.contains(ExtendedError::PARITY_ERR) {
                    (ErrorKind::Parity, TransportStatus::Error)
                } else if xerr.contains(ExtendedError::BAD_PHASE) {
                    (ErrorKind::PhaseMismatch, TransportStatus::Error)
                } else {
                    (ErrorKind::ScsiStatus, TransportStatus::Ok)
                };
                self.state = EngineState::CompletingError(kind);
                self.finish(id, transport);
            },
            HostStatus::SelectionTimeout => {
                self.state = EngineState::CompletingError(ErrorKind::SelectionTimeout);
                self.finish(id, TransportStatus::SelectionTimeout);
            },
            HostStatus::UnexpectedDisconnect => {
                self.state = EngineState::CompletingError(ErrorKind::UnexpectedDisconnect);
                self.finish(id, TransportStatus::UnexpectedDisconnect);
            },
            _ => {
                let mark = self.ccbs.get(id).to_abort;
                let transport = if mark == AbortMark::None {
                    TransportStatus::Error
                } else {
                    mark.transport()
                };
                self.state = EngineState::CompletingError(ErrorKind::Protocol);
                self.finish(id, transport);
            },
        }
    }

    /// Re-arms the CCB as REQUEST SENSE to the same LUN, keeping the status
    /// of the original command aside. The LUN starts nothing else until the
    /// sense is back.
    fn start_auto_sense(&mut self, id: CcbId, residual: u32) -> Result<(), HbaError> {
        let (target, lun) = {
            let c = self.ccbs.get(id);
            (c.target, c.lun)
        };
        let held = self.dequeue_where(|c| c.target == target && c.lun == lun && c.id != id)?;
        self.hold(&held);

        let sense_len = self.policy.sense_len;
        let ccb = self.ccbs.get_mut(id);
        ccb.saved = Some(SavedStatus {
            scsi_status: ccb.scsi_status,
            residual,
            xerr: ccb.xerr,
            sg_count: ccb.sg_count,
            cdb: ccb.cdb,
            cdb_len: ccb.cdb_len,
        });
        let mut cdb = [0u8; 16];
        let n = fill_request_sense(&mut cdb, false, sense_len);
        ccb.cdb = cdb;
        ccb.cdb_len = n as u8;
        ccb.direction = DataDirection::In;
        ccb.data_len = u32::from(sense_len);
        ccb.sg_count = 1;
        ccb.xerr = ExtendedError::empty();
        ccb.extra_bytes = 0;
        ccb.nego_status = None;
        let (sg, sense) = (ccb.sg.bus, ccb.sense.bus);
        store_sg(&self.pool, sg, &[SgEntry::new(sense, u32::from(sense_len))])?;

        if let Some(lcb) = self.targets[usize::from(target)].lun_mut(lun) {
            lcb.sense_pending = true;
            lcb.bind_sense(id);
        }
        self.retire(id);
        self.stats.sense_requests += 1;
        debug!(ccb = id.0, target, lun, held = held.len(), "requesting sense");
        self.enqueue(id)
    }

    /// The REQUEST SENSE issued for a CHECK CONDITION came back.
    pub(crate) fn finish_sense(&mut self, id: CcbId, hdr: &CcbHeader) {
        let ok = hdr.host() == Some(HostStatus::Complete) && hdr.status() == ScsiStatus::Good;
        let ccb = self.ccbs.get_mut(id);
        if ok {
            let left = residual_from(
                &self.pool,
                ccb.sg.bus,
                1,
                DataPointer::decode(hdr.lastp.get()),
            )
            .unwrap_or(ccb.data_len);
            let got = ccb.data_len.saturating_sub(left) as usize;
            let mut buf = vec![0u8; got];
            match self.pool.read(ccb.sense.bus, &mut buf) {
                Ok(()) if got > 0 => ccb.sense_data = Some(Bytes::from(buf)),
                Ok(()) => {},
                Err(e) => error!(ccb = id.0, error = %e, "sense buffer unreadable"),
            }
        } else {
            warn!(ccb = id.0, host = ?hdr.host(), status = ?hdr.status(), "REQUEST SENSE failed");
        }
        restore_saved(ccb);
        let (target, lun) = (ccb.target, ccb.lun);
        if let Some(lcb) = self.targets[usize::from(target)].lun_mut(lun) {
            lcb.sense_pending = false;
            lcb.unbind_sense(id);
        }
        self.finish(id, TransportStatus::Ok);
    }

    /// BUSY or QUEUE FULL: lower the LUN depth on QUEUE FULL and replay the
    /// command ahead of everything queued behind it.
    fn requeue_transient(&mut self, id: CcbId, status: ScsiStatus) {
        let max_retries = self.policy.max_retries;
        let ccb = self.ccbs.get_mut(id);
        ccb.retries = ccb.retries.saturating_add(1);
        let (target, lun, retries) = (ccb.target, ccb.lun, ccb.retries);
        if retries > max_retries {
            info!(ccb = id.0, target, lun, ?status, retries, "retries exhausted");
            self.state = EngineState::CompletingError(ErrorKind::ScsiStatus);
            self.finish(id, TransportStatus::Ok);
            return;
        }

        // tasks the device accepted up to and including the refused one
        let seq = self.ccbs.get(id).start_seq;
        let outstanding = self
            .ccbs
            .busy()
            .iter()
            .map(|&b| self.ccbs.get(b))
            .filter(|c| {
                c.target == target
                    && c.lun == lun
                    && c.state == CcbState::Started
                    && c.start_seq <= seq
            })
            .count() as u16;

        let held = match self.dequeue_where(|c| c.target == target && c.lun == lun && c.id != id) {
            Ok(h) => h,
            Err(e) => {
                error!(error = %e, "start queue unreadable, resetting");
                self.start_reset();
                return;
            },
        };
        self.retire(id);
        if let Some(lcb) = self.targets[usize::from(target)].lun_mut(lun) {
            if status == ScsiStatus::QueueFull {
                let before = lcb.depth;
                lcb.on_queue_full(outstanding);
                info!(target, lun, outstanding, from = before, to = lcb.depth, "queue full");
            }
        }
        self.hold(&held);
        if let Some(lcb) = self.targets[usize::from(target)].lun_mut(lun) {
            lcb.waiting.push_front(id);
        }
        let ccb = self.ccbs.get_mut(id);
        ccb.host_status = HostStatus::Busy;
        ccb.scsi_status = ScsiStatus::Good;
        ccb.xerr = ExtendedError::empty();
        ccb.residual = 0;
        self.stats.requeued += 1;
        debug!(ccb = id.0, ?status, retries, "requeued");
        if let Err(e) = self.start_waiting(target, lun) {
            error!(target, lun, error = %e, "failed to restart lun");
        }
    }
}
