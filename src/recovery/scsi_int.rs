// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use tracing::{error, warn};

use crate::{
    ccb::{CcbId, CcbState},
    hba::engine::{EngineState, ErrorKind, HCB_MSGOUT, Hba},
    hw::{
        controller::{ScriptsController, SequencerCommand},
        regs::{BusPhase, Reg, SCNTL1_ISCON, Sist},
        script::ScriptEntry,
    },
    models::{
        message::{M_ID_ERROR, M_PARITY},
        status::{ExtendedError, HostStatus, TransportStatus},
    },
};

impl<C: ScriptsController> Hba<C> {
    /// Selection timeout. Only expected while the sequencer waits for a
    /// selection to complete.
    pub(crate) fn handle_selection_timeout(&mut self) {
        match ScriptEntry::decode(self.ctrl.read_reg(Reg::Dsp)) {
            Some(ScriptEntry::SelDone) => self.recover_scsi_int(HostStatus::SelectionTimeout),
            other => {
                error!(dsp = ?other, "selection timeout outside selection");
                self.start_reset();
            },
        }
    }

    /// Ends the nexus in DSA with `hsts` and restarts the sequencer at its
    /// idle loop. Without a nexus, or while the sequencer is fetching the
    /// next job, nothing can be resynchronized and the bus is reset.
    pub(crate) fn recover_scsi_int(&mut self, hsts: HostStatus) {
        let dsp = ScriptEntry::decode(self.ctrl.read_reg(Reg::Dsp));
        if matches!(dsp, None | Some(ScriptEntry::Init) | Some(ScriptEntry::Start)) {
            error!(?hsts, ?dsp, "SCSI interrupt with no nexus to recover");
            self.start_reset();
            return;
        }
        self.ctrl.issue(SequencerCommand::PurgeFifo);

        match self.current_ccb() {
            Some(id) if self.ccbs.get(id).state == CcbState::Started => {
                let (target, lun) = {
                    let c = self.ccbs.get_mut(id);
                    c.host_status = hsts;
                    (c.target, c.lun)
                };
                let (kind, transport) = match hsts {
                    HostStatus::SelectionTimeout => (ErrorKind::SelectionTimeout, TransportStatus::SelectionTimeout),
                    _ => {
                        warn!(ccb = id.0, target, lun, "unexpected disconnect");
                        (ErrorKind::UnexpectedDisconnect, TransportStatus::UnexpectedDisconnect)
                    },
                };
                self.state = EngineState::CompletingError(kind);
                self.finish(id, transport);
            },
            _ => {
                warn!(?hsts, "SCSI interrupt without a started ccb");
                self.ctrl.write_reg(Reg::Dsa, 0x00ff_ffff);
            },
        }
        self.jump(ScriptEntry::Start);
    }

    /// SCSI parity error or ATN raised on a parity error.
    ///
    /// In message and status phases the target is told with MESSAGE PARITY
    /// ERROR or INITIATOR DETECTED ERROR and asked to retry. Data-in resumes
    /// through the phase dispatcher. Output phases have no resync point.
    pub(crate) fn handle_parity(&mut self, sist: Sist) {
        self.stats.parity_errors += 1;
        let phase = BusPhase::from_bits(self.ctrl.read_reg8(Reg::Sbcl));
        let connected = self.ctrl.read_reg8(Reg::Scntl1) & SCNTL1_ISCON != 0;
        warn!(?phase, ?sist, connected, "SCSI parity error");

        if !connected {
            self.recover_scsi_int(HostStatus::UnexpectedDisconnect);
            return;
        }
        let Some(id) = self.current_ccb() else {
            error!(?phase, "parity error without a nexus");
            self.start_reset();
            return;
        };
        self.add_xerr(id, ExtendedError::PARITY_ERR);
        self.state = EngineState::Connected;

        let msg = if phase == BusPhase::MsgIn {
            M_PARITY
        } else {
            M_ID_ERROR
        };
        match phase {
            BusPhase::DataOut | BusPhase::DtDataOut | BusPhase::Command => {
                error!(ccb = id.0, ?phase, "parity error in an output phase");
                self.start_reset();
            },
            _ => {
                if let Err(e) = self.write_hcb_msg(HCB_MSGOUT, &[msg]) {
                    error!(error = %e, "cannot queue parity message");
                    self.start_reset();
                    return;
                }
                if phase.is_data() && sist.contains(Sist::MA) {
                    self.handle_phase_mismatch();
                } else {
                    self.jump(ScriptEntry::Dispatch);
                }
            },
        }
    }

    /// ORs extended error bits into both the host copy and the header the
    /// sequencer completes from.
    pub(crate) fn add_xerr(&mut self, id: CcbId, bits: ExtendedError) {
        self.ccbs.get_mut(id).xerr |= bits;
        if let Err(e) = self.update_header(id, |h| h.xerr_status |= bits.bits()) {
            error!(ccb = id.0, error = %e, "cannot update ccb header");
        }
    }
}
