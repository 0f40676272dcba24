// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use tracing::{debug, info, warn};

use crate::{
    ccb::CcbId,
    hw::script::ScriptEntry,
    models::message::{ExtendedMessage, PprOptions},
    nego::{
        NegoError,
        sync::{ChipLimits, SyncDivisor, SyncRegisters, compute_divisor},
    },
    target::{TargetControl, TransferParams, tcb::NegoInFlight},
};

/// Which negotiation a CCB carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegoKind {
    Sync,
    Wide,
    Ppr,
}

impl NegoKind {
    /// Value stored in the CCB header `nego_status` byte.
    pub fn code(self) -> u8 {
        match self {
            NegoKind::Sync => 1,
            NegoKind::Wide => 2,
            NegoKind::Ppr => 3,
        }
    }

    pub fn of(msg: &ExtendedMessage) -> Option<Self> {
        match msg {
            ExtendedMessage::Sync { .. } => Some(NegoKind::Sync),
            ExtendedMessage::Wide { .. } => Some(NegoKind::Wide),
            ExtendedMessage::Ppr { .. } => Some(NegoKind::Ppr),
            ExtendedMessage::ModifyDataPointer(_) => None,
        }
    }

    /// Script that sends our proposal of this kind.
    pub fn send_entry(self) -> ScriptEntry {
        match self {
            NegoKind::Sync => ScriptEntry::SendSdtr,
            NegoKind::Wide => ScriptEntry::SendWdtr,
            NegoKind::Ppr => ScriptEntry::SendPpr,
        }
    }

    /// Script that sends our reply to a target request of this kind.
    pub fn response_entry(self) -> ScriptEntry {
        match self {
            NegoKind::Sync => ScriptEntry::SdtrResp,
            NegoKind::Wide => ScriptEntry::WdtrResp,
            NegoKind::Ppr => ScriptEntry::PprResp,
        }
    }
}

/// Result of handling a negotiation message from the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegoOutcome {
    /// Agreement applied. `reply` goes back to the target: either the answer
    /// to its request or, when `chained` is set, our next proposal.
    Accepted {
        reply: Option<ExtendedMessage>,
        chained: Option<NegoKind>,
    },
    /// Answer with MESSAGE REJECT; the target runs with safe defaults.
    Rejected,
}

/// Negotiation policy for every target of one controller.
#[derive(Debug, Clone)]
pub struct NegotiationEngine {
    limits: ChipLimits,
}

impl NegotiationEngine {
    pub fn new(limits: ChipLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ChipLimits {
        &self.limits
    }

    pub fn compute_divisor(&self, dt: bool, factor: u8) -> Result<SyncDivisor, NegoError> {
        compute_divisor(&self.limits, dt, factor)
    }

    /// Brings parameters inside what the chip supports.
    pub fn clamp(&self, mut p: TransferParams) -> TransferParams {
        let l = &self.limits;
        if !l.u3en {
            p.options = PprOptions::empty();
        }
        p.width = p.width.min(l.maxwide);
        if p.width == 0 {
            p.options = PprOptions::empty();
        }
        if p.offset == 0 {
            p.period = 0;
            p.options.remove(PprOptions::DT);
            return p;
        }
        let (minp, maxo) = if p.is_dt() {
            (l.minsync_dt, l.maxoffs_dt)
        } else {
            (l.minsync, l.maxoffs)
        };
        p.period = p.period.max(minp);
        p.offset = p.offset.min(maxo);
        if p.period > l.maxsync || p.offset == 0 {
            p.period = 0;
            p.offset = 0;
            p.options.remove(PprOptions::DT);
        }
        p
    }

    /// Picks the negotiation to run for the goal of `tcb`, if any. With
    /// `force` a negotiation is started even when the agreement already
    /// matches the goal.
    pub fn propose(&self, tcb: &mut TargetControl, force: bool) -> Option<(NegoKind, ExtendedMessage)> {
        if tcb.nego.is_some() {
            return None;
        }
        let goal = self.clamp(tcb.goal);
        tcb.goal = goal;

        let kind = if goal == tcb.active && !force {
            None
        } else if !goal.options.is_empty() {
            Some(NegoKind::Ppr)
        } else if goal.width != tcb.active.width || (force && goal.is_wide()) {
            Some(NegoKind::Wide)
        } else if goal.period != tcb.active.period
            || goal.offset != tcb.active.offset
            || (force && goal.is_sync())
        {
            Some(NegoKind::Sync)
        } else {
            None
        };

        let Some(kind) = kind else {
            tcb.check_nego = false;
            return None;
        };
        debug!(target = tcb.id, ?kind, ?goal, "proposing negotiation");
        Some((kind, message_for(kind, &goal)))
    }

    /// Records that `ccb` carries the proposal returned by [`propose`].
    pub fn start(&self, tcb: &mut TargetControl, ccb: CcbId, kind: NegoKind) {
        tcb.nego = Some(NegoInFlight {
            ccb,
            kind,
            proposed: tcb.goal,
        });
    }

    /// Handles SDTR, WDTR or PPR received from the target.
    pub fn on_response(&self, tcb: &mut TargetControl, msg: &ExtendedMessage) -> NegoOutcome {
        let Some(kind) = NegoKind::of(msg) else {
            return NegoOutcome::Rejected;
        };
        match tcb.nego {
            Some(inflight) if inflight.kind != kind => {
                warn!(target = tcb.id, sent = ?inflight.kind, got = ?kind, "negotiation answer of wrong kind");
                self.fall_back(tcb, inflight.kind);
                self.default_on_failure(tcb, inflight.kind);
                NegoOutcome::Rejected
            },
            Some(inflight) => self.on_answer(tcb, inflight, msg),
            None => self.on_request(tcb, kind, msg),
        }
    }

    fn on_answer(&self, tcb: &mut TargetControl, inflight: NegoInFlight, msg: &ExtendedMessage) -> NegoOutcome {
        let kind = inflight.kind;
        let mut answered = params_of(msg, &tcb.active);
        if answered.offset == 0 {
            // asynchronous: the period byte carries no meaning
            answered.period = 0;
            answered.options.remove(PprOptions::DT);
        }
        let proposed = inflight.proposed;
        let clamped = self.clamp(answered);

        let widened = answered.width > proposed.width
            || answered.offset > proposed.offset
            || (answered.offset != 0 && answered.period < proposed.period)
            || !proposed.options.contains(answered.options);

        if clamped != answered || widened || self.apply(tcb, answered).is_err() {
            info!(target = tcb.id, ?kind, ?answered, ?proposed, "negotiation answer not acceptable");
            self.fall_back(tcb, kind);
            if kind == NegoKind::Ppr && !answered.is_dt() {
                // try the answered values again with legacy messages
                tcb.goal.period = tcb.goal.period.max(clamped.period);
                tcb.goal.offset = tcb.goal.offset.min(clamped.offset);
                tcb.goal.width = tcb.goal.width.min(clamped.width);
                tcb.goal.options = PprOptions::empty();
                tcb.check_nego = true;
            } else {
                self.default_on_failure(tcb, kind);
            }
            return NegoOutcome::Rejected;
        }

        tcb.nego = None;
        info!(target = tcb.id, ?kind, agreed = ?tcb.active, "negotiation complete");

        if kind == NegoKind::Wide
            && tcb.goal.offset != 0
            && (tcb.goal.offset != tcb.active.offset || tcb.goal.period != tcb.active.period)
        {
            let msg = message_for(NegoKind::Sync, &tcb.goal);
            self.start(tcb, inflight.ccb, NegoKind::Sync);
            return NegoOutcome::Accepted {
                reply: Some(msg),
                chained: Some(NegoKind::Sync),
            };
        }
        tcb.check_nego = false;
        NegoOutcome::Accepted {
            reply: None,
            chained: None,
        }
    }

    fn on_request(&self, tcb: &mut TargetControl, kind: NegoKind, msg: &ExtendedMessage) -> NegoOutcome {
        let asked = params_of(msg, &tcb.active);
        let ours = self.clamp(asked);
        if self.apply(tcb, ours).is_err() {
            self.fall_back(tcb, kind);
            return NegoOutcome::Rejected;
        }
        info!(target = tcb.id, ?kind, ?asked, agreed = ?ours, "target initiated negotiation");
        NegoOutcome::Accepted {
            reply: Some(message_for(kind, &ours)),
            chained: None,
        }
    }

    /// The target rejected our negotiation message.
    pub fn on_rejected(&self, tcb: &mut TargetControl) {
        let Some(inflight) = tcb.nego else {
            return;
        };
        info!(target = tcb.id, kind = ?inflight.kind, "negotiation rejected by target");
        self.fall_back(tcb, inflight.kind);
        self.default_on_failure(tcb, inflight.kind);
    }

    /// Lowers the goal after a failed negotiation of `kind`. The goal never
    /// rises here.
    pub fn default_on_failure(&self, tcb: &mut TargetControl, kind: NegoKind) {
        let l = &self.limits;
        match kind {
            NegoKind::Ppr => {
                if tcb.goal.offset != 0 {
                    tcb.goal.period = tcb.goal.period.max(l.minsync);
                    tcb.goal.offset = tcb.goal.offset.min(l.maxoffs);
                }
                tcb.goal.options = PprOptions::empty();
            },
            NegoKind::Wide => {
                tcb.goal.width = 0;
                tcb.goal.options = PprOptions::empty();
            },
            NegoKind::Sync => {
                tcb.goal.offset = 0;
                tcb.goal.period = 0;
                tcb.goal.options = PprOptions::empty();
            },
        }
        tcb.nego = None;
        tcb.check_nego = tcb.goal != tcb.active;
        debug!(target = tcb.id, ?kind, goal = ?tcb.goal, "negotiation goal lowered");
    }

    /// Puts the transfer agreement touched by `kind` back to asynchronous
    /// (and narrow for WIDE and PPR).
    fn fall_back(&self, tcb: &mut TargetControl, kind: NegoKind) {
        let mut p = tcb.active;
        p.offset = 0;
        p.period = 0;
        p.options = PprOptions::empty();
        if kind != NegoKind::Sync {
            p.width = 0;
        }
        tcb.active = p;
        tcb.regs = SyncRegisters::encode(&self.limits, 0, 0, p.is_wide(), None, PprOptions::empty());
        tcb.nego = None;
    }

    /// Programs `p` as the agreement of `tcb`.
    pub fn apply(&self, tcb: &mut TargetControl, p: TransferParams) -> Result<(), NegoError> {
        let sync = if p.offset != 0 {
            Some(self.compute_divisor(p.is_dt(), p.period)?)
        } else {
            None
        };
        tcb.regs = SyncRegisters::encode(&self.limits, p.offset, p.period, p.is_wide(), sync, p.options);
        tcb.active = p;
        Ok(())
    }
}

/// Parameters described by a negotiation message. WDTR drops any previous
/// synchronous agreement; SDTR keeps the width.
fn params_of(msg: &ExtendedMessage, active: &TransferParams) -> TransferParams {
    match *msg {
        ExtendedMessage::Sync { period, offset } => TransferParams {
            period,
            offset,
            width: active.width,
            options: PprOptions::empty(),
        },
        ExtendedMessage::Wide { width } => TransferParams {
            width,
            ..Default::default()
        },
        ExtendedMessage::Ppr {
            period,
            offset,
            width,
            options,
        } => TransferParams {
            period,
            offset,
            width,
            options,
        },
        ExtendedMessage::ModifyDataPointer(_) => *active,
    }
}

fn message_for(kind: NegoKind, p: &TransferParams) -> ExtendedMessage {
    match kind {
        NegoKind::Sync => ExtendedMessage::Sync {
            period: p.period,
            offset: p.offset,
        },
        NegoKind::Wide => ExtendedMessage::Wide { width: p.width },
        NegoKind::Ppr => ExtendedMessage::Ppr {
            period: p.period,
            offset: p.offset,
            width: p.width,
            options: p.options,
        },
    }
}
