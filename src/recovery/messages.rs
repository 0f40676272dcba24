// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use tracing::{debug, error, info, warn};
use zerocopy::byteorder::U32;

use crate::{
    ccb::{
        CcbHeader, CcbId, DataPointer,
        hw_header::{pointer_at, position_of},
    },
    hba::engine::{EngineState, HCB_MSGOUT, Hba},
    hw::{
        controller::ScriptsController,
        regs::Reg,
        script::{ScriptEntry, ScriptInterrupt},
    },
    models::{
        message::{
            ExtendedMessage, M_ABORT, M_ABORT_TAG, M_EXTENDED, M_IGN_RESIDUE, M_NOOP, M_REJECT,
            M_RESET,
        },
        status::ExtendedError,
    },
    nego::{NegoKind, NegoOutcome},
};

impl<C: ScriptsController> Hba<C> {
    /// A message the sequencer does not handle by itself is in the HCB
    /// message-in buffer.
    pub(crate) fn handle_message_received(&mut self) {
        let msg = match self.read_msgin() {
            Ok(m) => m,
            Err(e) => {
                error!(error = %e, "message buffer unreadable");
                self.start_reset();
                return;
            },
        };
        let Some(id) = self.current_ccb() else {
            warn!(msg = %hex::encode(&msg[..4]), "message without a nexus");
            self.reject_message();
            return;
        };
        match msg[0] {
            M_EXTENDED => match ExtendedMessage::parse(&msg) {
                Ok(ExtendedMessage::ModifyDataPointer(delta)) => self.modify_data_pointer(id, delta),
                Ok(m) => self.negotiation_message(id, &m),
                Err(e) => {
                    info!(ccb = id.0, error = %e, "extended message not understood");
                    self.reject_message();
                },
            },
            M_IGN_RESIDUE => self.ignore_wide_residue(id, msg[1]),
            M_REJECT => self.message_rejected(id),
            other => {
                info!(ccb = id.0, msg = other, "message not supported");
                self.reject_message();
            },
        }
    }

    fn negotiation_message(&mut self, id: CcbId, msg: &ExtendedMessage) {
        let target = self.ccbs.get(id).target;
        let Some(kind) = NegoKind::of(msg) else {
            self.reject_message();
            return;
        };
        let tcb = &mut self.targets[usize::from(target)];
        let outcome = self.nego.on_response(tcb, msg);
        debug!(ccb = id.0, target, ?msg, ?outcome, "negotiation message");

        let (reply, next, status) = match outcome {
            NegoOutcome::Accepted {
                reply: Some(reply),
                chained: Some(chained),
            } => (reply.to_bytes(), chained.send_entry(), Some(chained)),
            NegoOutcome::Accepted {
                reply: Some(reply),
                chained: None,
            } => (reply.to_bytes(), kind.response_entry(), None),
            NegoOutcome::Accepted { reply: None, .. } => (Vec::new(), ScriptEntry::Clrack, None),
            NegoOutcome::Rejected => (vec![M_REJECT], ScriptEntry::MsgBad, None),
        };
        self.ccbs.get_mut(id).nego_status = status;
        let code = status.map_or(0, |k| k.code());
        if let Err(e) = self.update_header(id, |h| h.nego_status = code) {
            error!(ccb = id.0, error = %e, "cannot update ccb header");
        }
        self.sync_target_regs(target);

        if !reply.is_empty() {
            if let Err(e) = self.write_hcb_msg(HCB_MSGOUT, &reply) {
                error!(error = %e, "cannot queue negotiation reply");
                self.start_reset();
                return;
            }
        }
        self.state = if status.is_some() {
            EngineState::Negotiating
        } else {
            EngineState::Connected
        };
        self.jump(next);
    }

    /// Copies the agreement of `target` into the chip and into the
    /// selection bytes of every CCB of that target.
    pub(crate) fn sync_target_regs(&mut self, target: u8) {
        let regs = self.targets[usize::from(target)].regs;
        self.ctrl.write_reg8(Reg::Scntl3, regs.scntl3);
        self.ctrl.write_reg8(Reg::Sxfer, regs.sxfer);
        self.ctrl.write_reg8(Reg::Scntl4, regs.scntl4);

        let ids: Vec<CcbId> = self
            .ccbs
            .busy()
            .iter()
            .copied()
            .filter(|&b| self.ccbs.get(b).target == target)
            .collect();
        for id in ids {
            let updated = self.update_header(id, |h| {
                h.sel_scntl3 = regs.scntl3;
                h.sel_sxfer = regs.sxfer;
                h.sel_scntl4 = regs.scntl4;
            });
            if let Err(e) = updated {
                warn!(ccb = id.0, error = %e, "cannot patch selection registers");
            }
        }
        debug!(target, ?regs, "transfer registers updated");
    }

    /// MODIFY DATA POINTER: moves the current pointer by `delta` bytes
    /// within the buffer.
    fn modify_data_pointer(&mut self, id: CcbId, delta: i32) {
        let (ba, sg_ba, sg_count) = {
            let c = self.ccbs.get(id);
            (c.ba, c.sg.bus, c.sg_count)
        };
        let seek = CcbHeader::load(&self.pool, ba).and_then(|hdr| {
            let pos = position_of(&self.pool, sg_ba, DataPointer::decode(hdr.lastp.get()))?;
            let Some(new_pos) = pos.checked_add_signed(delta) else {
                return Ok(None);
            };
            pointer_at(&self.pool, sg_ba, sg_count, new_pos)
        });
        match seek {
            Ok(Some(p)) => {
                if let Err(e) = self.update_header(id, |h| h.lastp = U32::new(p.encode())) {
                    error!(ccb = id.0, error = %e, "cannot update ccb header");
                }
                debug!(ccb = id.0, delta, ?p, "data pointer modified");
                self.jump(ScriptEntry::Clrack);
            },
            Ok(None) => {
                info!(ccb = id.0, delta, "data pointer outside the buffer");
                self.reject_message();
            },
            Err(e) => {
                error!(ccb = id.0, error = %e, "scatter list unreadable");
                self.reject_message();
            },
        }
    }

    /// IGNORE WIDE RESIDUE: the last `count` bytes of a wide input were
    /// padding.
    fn ignore_wide_residue(&mut self, id: CcbId, count: u8) {
        let (ba, sg_ba, sg_count) = {
            let c = self.ccbs.get(id);
            (c.ba, c.sg.bus, c.sg_count)
        };
        let back = CcbHeader::load(&self.pool, ba).and_then(|hdr| {
            let pos = position_of(&self.pool, sg_ba, DataPointer::decode(hdr.lastp.get()))?;
            match pos.checked_sub(u32::from(count.max(1))) {
                Some(p) => pointer_at(&self.pool, sg_ba, sg_count, p),
                None => Ok(None),
            }
        });
        match back {
            Ok(Some(p)) => {
                if let Err(e) = self.update_header(id, |h| h.lastp = U32::new(p.encode())) {
                    error!(ccb = id.0, error = %e, "cannot update ccb header");
                }
                debug!(ccb = id.0, count, "wide residue ignored");
            },
            Ok(None) => debug!(ccb = id.0, "wide residue before any data"),
            Err(e) => error!(ccb = id.0, error = %e, "scatter list unreadable"),
        }
        self.jump(ScriptEntry::Clrack);
    }

    /// MESSAGE REJECT from the target. Only a negotiation in flight makes
    /// this meaningful; anything else is logged and acknowledged.
    fn message_rejected(&mut self, id: CcbId) {
        let target = self.ccbs.get(id).target;
        let tcb = &mut self.targets[usize::from(target)];
        if tcb.nego.is_some_and(|n| n.ccb == id) {
            self.nego.on_rejected(tcb);
            self.ccbs.get_mut(id).nego_status = None;
            if let Err(e) = self.update_header(id, |h| h.nego_status = 0) {
                error!(ccb = id.0, error = %e, "cannot update ccb header");
            }
            self.sync_target_regs(target);
            self.state = EngineState::Connected;
        } else {
            info!(ccb = id.0, target, "MESSAGE REJECT received");
        }
        self.jump(ScriptEntry::Clrack);
    }

    /// Answers the last message with MESSAGE REJECT.
    pub(crate) fn reject_message(&mut self) {
        if let Err(e) = self.write_hcb_msg(HCB_MSGOUT, &[M_REJECT]) {
            error!(error = %e, "cannot queue MESSAGE REJECT");
            self.start_reset();
            return;
        }
        self.jump(ScriptEntry::MsgBad);
    }

    /// Negotiation broke down: the target went to an unexpected phase or
    /// answered with nonsense.
    pub(crate) fn handle_nego_failure(&mut self, code: ScriptInterrupt) {
        let Some(id) = self.current_ccb() else {
            self.start_reset();
            return;
        };
        let target = self.ccbs.get(id).target;
        let tcb = &mut self.targets[usize::from(target)];
        info!(ccb = id.0, target, ?code, "negotiation failed");
        if tcb.nego.is_some() {
            self.nego.on_rejected(tcb);
        }
        self.ccbs.get_mut(id).nego_status = None;
        if let Err(e) = self.update_header(id, |h| h.nego_status = 0) {
            error!(ccb = id.0, error = %e, "cannot update ccb header");
        }
        self.sync_target_regs(target);
        self.state = EngineState::Connected;
        match code {
            ScriptInterrupt::NegoProto => self.reject_message(),
            _ => self.jump(ScriptEntry::Dispatch),
        }
    }

    /// The sequencer has something to say but no message queued.
    pub(crate) fn handle_reject_to_send(&mut self) {
        match self.write_hcb_msg(HCB_MSGOUT, &[M_REJECT]) {
            Ok(()) => self.jump(ScriptEntry::Clrack),
            Err(e) => {
                error!(error = %e, "cannot queue MESSAGE REJECT");
                self.start_reset();
            },
        }
    }

    pub(crate) fn handle_msg_weird(&mut self) {
        warn!("weird message from target");
        match self.write_hcb_msg(HCB_MSGOUT, &[M_REJECT]) {
            Ok(()) => self.jump(ScriptEntry::MsgWeird),
            Err(e) => {
                error!(error = %e, "cannot queue MESSAGE REJECT");
                self.start_reset();
            },
        }
    }

    pub(crate) fn handle_msgout_done(&mut self) {
        if let Err(e) = self.write_hcb_msg(HCB_MSGOUT, &[M_NOOP]) {
            warn!(error = %e, "cannot clear message out buffer");
        }
        self.resume();
    }

    /// Data anomalies the sequencer noticed and kept going through.
    pub(crate) fn handle_transfer_anomaly(&mut self, code: ScriptInterrupt) {
        let Some(id) = self.current_ccb() else {
            warn!(?code, "transfer anomaly without a nexus");
            self.resume();
            return;
        };
        match code {
            ScriptInterrupt::SwideOverrun => self.add_xerr(id, ExtendedError::SWIDE_OVRUN),
            ScriptInterrupt::SodlUnderrun => self.add_xerr(id, ExtendedError::SODL_UNRUN),
            ScriptInterrupt::DataOverrun => {
                let extra = self.ctrl.read_reg(Reg::Scratcha);
                self.add_xerr(id, ExtendedError::EXTRA_DATA);
                let ccb = self.ccbs.get_mut(id);
                ccb.extra_bytes = ccb.extra_bytes.saturating_add(extra);
                let total = ccb.extra_bytes;
                if let Err(e) = self.update_header(id, |h| h.extra_bytes = U32::new(total)) {
                    error!(ccb = id.0, error = %e, "cannot update ccb header");
                }
                warn!(ccb = id.0, extra, "data overrun");
            },
            _ => {
                warn!(ccb = id.0, ?code, "bad phase");
                self.add_xerr(id, ExtendedError::BAD_PHASE);
            },
        }
        self.resume();
    }

    /// The sequencer could not make sense of a reselection. Tell the
    /// reselecting target what to drop.
    pub(crate) fn handle_reselection_anomaly(&mut self, code: ScriptInterrupt) {
        let target = self.ctrl.read_reg8(Reg::Sdid) & 0x0f;
        let msg = match code {
            ScriptInterrupt::ReselNoMsgIn | ScriptInterrupt::ReselNoIdentify => {
                // a target that skips IDENTIFY can only mean LUN 0 untagged
                let task = self
                    .targets
                    .get(usize::from(target))
                    .and_then(|t| t.lun(0))
                    .and_then(|l| l.task(None))
                    .map(|id| self.ccbs.get(id).ba);
                if let Some(ba) = task {
                    info!(target, ?code, "reselection without IDENTIFY, assuming LUN 0");
                    self.ctrl.write_reg(Reg::Dsa, ba.0);
                    self.jump(ScriptEntry::ReselGo);
                    return;
                }
                M_RESET
            },
            ScriptInterrupt::ReselBadLun => M_RESET,
            ScriptInterrupt::ReselBadItl => M_ABORT,
            _ => M_ABORT_TAG,
        };
        warn!(target, ?code, msg, "bad reselection");
        match self.write_hcb_msg(HCB_MSGOUT, &[msg]) {
            Ok(()) => self.resume(),
            Err(e) => {
                error!(error = %e, "cannot queue reselection answer");
                self.start_reset();
            },
        }
    }
}
