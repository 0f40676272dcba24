// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use tracing::{debug, error, info, warn};

use crate::{
    ccb::{AbortMark, Ccb, CcbId, CcbState},
    hba::{
        engine::{EngineState, ErrorKind, HCB_ABORT_MSG, Hba},
        error::HbaError,
        request::PendingHandle,
    },
    hw::{
        controller::{ScriptsController, SequencerCommand},
        regs::{Istat, Reg},
        script::ScriptEntry,
    },
    models::{
        message::{M_ABORT, M_ABORT_TAG, M_NOOP, M_RESET, M_SIMPLE_TAG, identify, tag_from_number, tag_number},
        status::TransportStatus,
    },
};

impl<C: ScriptsController> Hba<C> {
    /// Aborts a submitted command. A command that has not reached the
    /// controller yet is finished at once; a started one is aborted on the
    /// bus at the next recovery point. Either way its result shows up in
    /// [`poll_completions`](Self::poll_completions) as `Aborted`.
    pub fn abort(&mut self, handle: PendingHandle) -> Result<(), HbaError> {
        self.abort_with(handle, AbortMark::Requested)
    }

    /// Same as [`abort`](Self::abort) for a command the host gave up
    /// waiting for; it completes as `TimedOut`.
    pub fn abort_timed_out(&mut self, handle: PendingHandle) -> Result<(), HbaError> {
        self.abort_with(handle, AbortMark::TimedOut)
    }

    fn abort_with(&mut self, handle: PendingHandle, mark: AbortMark) -> Result<(), HbaError> {
        let id = *self.handles.get(&handle).ok_or(HbaError::UnknownHandle(handle))?;
        let ccb = self.ccbs.get_mut(id);
        match ccb.state {
            CcbState::Waiting => {
                self.stats.aborts += 1;
                debug!(ccb = id.0, ?handle, "aborting waiting command");
                self.finish(id, mark.transport());
            },
            CcbState::Started => {
                if ccb.to_abort.pending() {
                    return Ok(());
                }
                ccb.to_abort = mark;
                self.stats.aborts += 1;
                info!(ccb = id.0, ?handle, target = ccb.target, lun = ccb.lun, ?mark, "abort requested");
                self.request_stop();
            },
            // result already waiting for collection
            CcbState::Done => {},
            CcbState::Free => return Err(HbaError::UnknownHandle(handle)),
        }
        Ok(())
    }

    /// Sends BUS DEVICE RESET to `target` at the next recovery point. Every
    /// started command of the target completes as `DeviceReset`.
    pub fn reset_target(&mut self, target: u8) -> Result<(), HbaError> {
        if target == self.host_id {
            return Err(HbaError::InvalidTarget(target));
        }
        let tcb = self
            .targets
            .get_mut(usize::from(target))
            .ok_or(HbaError::InvalidTarget(target))?;
        tcb.to_reset = true;
        info!(target, "device reset requested");
        self.request_stop();
        Ok(())
    }

    /// Asks the sequencer to stop at its next idle point.
    pub(crate) fn request_stop(&mut self) {
        if self.abort_pending {
            return;
        }
        self.abort_pending = true;
        self.ctrl.write_reg8(Reg::Istat, (Istat::SIGP | Istat::SEM).bits());
        self.ctrl.issue(SequencerCommand::PauseChannel);
    }

    fn aborts_outstanding(&self) -> bool {
        self.targets.iter().any(|t| t.to_reset)
            || self.ccbs.busy().iter().any(|&b| {
                let c = self.ccbs.get(b);
                c.state == CcbState::Started && c.to_abort.pending()
            })
    }

    /// The sequencer stopped on our request. Commands it never fetched are
    /// aborted right here; for the rest a target is picked and selected
    /// with ATN to receive the abort message.
    pub(crate) fn handle_script_stopped(&mut self) {
        self.abort_pending = false;
        let unissued = match self.dequeue_where(|c| c.to_abort.pending()) {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "start queue unreadable, resetting");
                self.start_reset();
                return;
            },
        };
        for id in unissued {
            let mark = self.ccbs.get(id).to_abort;
            debug!(ccb = id.0, "aborted before the controller fetched it");
            self.finish(id, mark.transport());
        }

        let victim = self.targets.iter().find(|t| t.to_reset).map(|t| t.id).or_else(|| {
            self.ccbs.busy().iter().find_map(|&b| {
                let c = self.ccbs.get(b);
                (c.state == CcbState::Started && c.to_abort.pending()).then_some(c.target)
            })
        });
        let Some(target) = victim else {
            self.jump(ScriptEntry::Start);
            return;
        };

        // nothing else goes to this target until the abort is through
        match self.dequeue_all(target, None, None) {
            Ok(held) => self.hold(&held),
            Err(e) => {
                error!(error = %e, "start queue unreadable, resetting");
                self.start_reset();
                return;
            },
        }
        self.abort_target = Some(target);
        debug!(target, "selecting for abort");
        self.ctrl.issue(SequencerCommand::SelectWithAtn { target });
        self.jump(ScriptEntry::SelForAbort);
    }

    /// Selection for abort succeeded; choose the message to send.
    pub(crate) fn handle_target_selected(&mut self) {
        let target = self.ctrl.read_reg8(Reg::Sdid) & 0x0f;
        if self.abort_target != Some(target) {
            warn!(target, expected = ?self.abort_target, "selected target is not the abort target");
        }
        let Some(tcb) = self.targets.get(usize::from(target)) else {
            self.start_reset();
            return;
        };
        let victim = self.ccbs.busy().iter().copied().find(|&b| {
            let c = self.ccbs.get(b);
            c.target == target && c.state == CcbState::Started && c.to_abort.pending()
        });

        let msg = if tcb.to_reset {
            vec![M_RESET]
        } else if let Some(id) = victim {
            let c = self.ccbs.get(id);
            match c.tag {
                Some(tag) => vec![identify(c.lun, false), M_SIMPLE_TAG, tag_number(tag), M_ABORT_TAG],
                None => vec![identify(c.lun, false), M_ABORT],
            }
        } else {
            // the command finished on its own meanwhile
            vec![M_NOOP]
        };
        info!(target, msg = %hex::encode(&msg), "sending task management message");
        if let Err(e) = self.write_hcb_msg(HCB_ABORT_MSG, &msg) {
            error!(error = %e, "cannot queue abort message");
            self.start_reset();
            return;
        }
        self.abort_msg = msg;
        self.resume();
    }

    /// The abort message went out. Every task the target dropped because
    /// of it is completed.
    pub(crate) fn handle_abort_sent(&mut self) {
        let target = match self.abort_target.take() {
            Some(t) => t,
            None => self.ctrl.read_reg8(Reg::Sdid) & 0x0f,
        };
        let msg = std::mem::take(&mut self.abort_msg);
        if usize::from(target) >= self.targets.len() {
            warn!(target, "abort sent to an unknown target");
            self.jump(ScriptEntry::Start);
            return;
        }
        self.state = EngineState::CompletingError(ErrorKind::Aborted);

        match msg.last().copied() {
            Some(M_RESET) => {
                let dropped = self.started_of(target, |_| true);
                for &id in &dropped {
                    self.mark_done(id, TransportStatus::DeviceReset);
                }
                let limits = *self.nego.limits();
                let tcb = &mut self.targets[usize::from(target)];
                tcb.to_reset = false;
                tcb.reset_transfer(&limits);
                self.sync_target_regs(target);
                info!(target, completed = dropped.len(), "device reset done");
            },
            Some(M_ABORT_TAG) => {
                let lun = msg[0] & 0x3f;
                let tag = msg.get(2).copied().and_then(tag_from_number);
                let dropped = self.started_of(target, |c| c.lun == lun && c.tag == tag);
                self.complete_aborted(&dropped);
                info!(target, lun, ?tag, "task aborted");
            },
            Some(M_ABORT) => {
                let lun = (msg.len() > 1).then(|| msg[0] & 0x3f);
                let dropped = self.started_of(target, |c| lun.is_none_or(|l| c.lun == l));
                self.complete_aborted(&dropped);
                info!(target, ?lun, completed = dropped.len(), "task set aborted");
            },
            _ => debug!(target, "nothing was aborted"),
        }

        let luns: Vec<u8> = self.targets[usize::from(target)].luns().map(|l| l.lun).collect();
        for lun in luns {
            if let Err(e) = self.start_waiting(target, lun) {
                error!(target, lun, error = %e, "failed to restart lun");
            }
        }
        self.jump(ScriptEntry::Start);
        if self.aborts_outstanding() {
            self.request_stop();
        }
    }

    fn started_of(&self, target: u8, pred: impl Fn(&Ccb) -> bool) -> Vec<CcbId> {
        self.ccbs
            .busy()
            .iter()
            .copied()
            .filter(|&b| {
                let c = self.ccbs.get(b);
                c.target == target && c.state == CcbState::Started && pred(c)
            })
            .collect()
    }

    fn complete_aborted(&mut self, ids: &[CcbId]) {
        for &id in ids {
            let mark = self.ccbs.get(id).to_abort;
            let transport = if mark.pending() {
                mark.transport()
            } else {
                TransportStatus::Aborted
            };
            self.mark_done(id, transport);
        }
    }
}
