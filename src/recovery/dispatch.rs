// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use tracing::{debug, error, info, trace, warn};

use crate::{
    ccb::CcbState,
    hba::engine::Hba,
    hw::{
        controller::ScriptsController,
        regs::{DSTAT_FATAL, Dstat, Istat, Reg, SIST_FATAL, Sist},
        script::{ScriptEntry, ScriptInterrupt},
    },
    models::status::{HostStatus, TransportStatus},
};

/// Upper bound on status reads per call to [`Hba::interrupt`].
const MAX_ROUNDS: usize = 64;

/// What one interrupt status snapshot asks the engine to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptCause {
    /// RST seen on the bus, ours or someone else's.
    BusReset,
    /// Bus mode (SE/LVD/HVD) changed.
    BusModeChange,
    SelectionTimeout,
    UnexpectedDisconnect,
    Parity,
    PhaseMismatch,
    /// INT instruction; the code is in DSPS.
    ScriptInterrupt,
    SingleStep,
    /// No defined recovery: reset the bus.
    Fatal,
    /// Status bits clear.
    Spurious,
}

/// Maps SIST/DSTAT bits to the cause handled first. Without any fatal bit
/// the ordinary conditions are checked in priority order; with one, the
/// conditions that have their own recovery win over a plain reset.
pub fn classify(sist: Sist, dstat: Dstat) -> InterruptCause {
    if sist.is_empty() && dstat.is_empty() {
        return InterruptCause::Spurious;
    }
    if !sist.intersects(SIST_FATAL) && !dstat.intersects(DSTAT_FATAL) {
        return if sist.contains(Sist::PAR) {
            InterruptCause::Parity
        } else if sist.contains(Sist::MA) {
            InterruptCause::PhaseMismatch
        } else if dstat.contains(Dstat::SIR) {
            InterruptCause::ScriptInterrupt
        } else if dstat.contains(Dstat::SSI) {
            InterruptCause::SingleStep
        } else {
            InterruptCause::Fatal
        };
    }
    if sist.contains(Sist::RST) {
        InterruptCause::BusReset
    } else if sist.contains(Sist::SBMC) {
        InterruptCause::BusModeChange
    } else if sist.contains(Sist::STO) {
        InterruptCause::SelectionTimeout
    } else if sist.contains(Sist::UDC) {
        InterruptCause::UnexpectedDisconnect
    } else {
        InterruptCause::Fatal
    }
}

impl<C: ScriptsController> Hba<C> {
    /// Interrupt service routine. Drains the done queue whenever the
    /// controller flags it and handles every pending status until the chip
    /// reports nothing more. Returns the number of causes handled.
    pub fn interrupt(&mut self) -> usize {
        let mut handled = 0;
        for _ in 0..MAX_ROUNDS {
            let st = self.ctrl.interrupt_status();
            let intf = st.istat.contains(Istat::INTF);
            if intf {
                self.drain_completions();
            }
            if !st.pending() {
                if intf {
                    continue;
                }
                return handled;
            }
            let cause = classify(st.sist, st.dstat);
            trace!(istat = ?st.istat, sist = ?st.sist, dstat = ?st.dstat, ?cause, "interrupt");
            self.handle_cause(cause, st.sist, st.dstat);
            handled += 1;
        }
        warn!(adapter = %self.name, handled, "interrupt still pending after {MAX_ROUNDS} rounds");
        handled
    }

    fn handle_cause(&mut self, cause: InterruptCause, sist: Sist, dstat: Dstat) {
        match cause {
            InterruptCause::BusReset => {
                info!(adapter = %self.name, "SCSI bus reset detected");
                self.reinit(TransportStatus::BusReset);
            },
            InterruptCause::BusModeChange => {
                info!(adapter = %self.name, "SCSI bus mode change");
                self.reinit(TransportStatus::BusReset);
            },
            InterruptCause::SelectionTimeout => self.handle_selection_timeout(),
            InterruptCause::UnexpectedDisconnect => {
                self.recover_scsi_int(HostStatus::UnexpectedDisconnect)
            },
            InterruptCause::Parity => self.handle_parity(sist),
            InterruptCause::PhaseMismatch => self.handle_phase_mismatch(),
            InterruptCause::ScriptInterrupt => {
                let code = self.ctrl.read_reg(Reg::Dsps);
                match ScriptInterrupt::try_from(code) {
                    Ok(sir) => self.handle_script_interrupt(sir),
                    Err(e) => {
                        error!(error = %e, "resetting");
                        self.start_reset();
                    },
                }
            },
            InterruptCause::SingleStep => self.resume(),
            InterruptCause::Fatal => {
                let dsp = self.ctrl.read_reg(Reg::Dsp);
                error!(?sist, ?dstat, dsp = format_args!("{dsp:#x}"), "unrecoverable interrupt");
                self.start_reset();
            },
            InterruptCause::Spurious => debug!("spurious interrupt"),
        }
    }

    /// Routes one script interrupt code to its handler.
    pub(crate) fn handle_script_interrupt(&mut self, code: ScriptInterrupt) {
        debug!(?code, "script interrupt");
        match code {
            ScriptInterrupt::MsgReceived => self.handle_message_received(),
            ScriptInterrupt::NegoFailed | ScriptInterrupt::NegoProto => self.handle_nego_failure(code),
            ScriptInterrupt::RejectToSend => self.handle_reject_to_send(),
            ScriptInterrupt::MsgWeird => self.handle_msg_weird(),
            ScriptInterrupt::SwideOverrun
            | ScriptInterrupt::SodlUnderrun
            | ScriptInterrupt::DataOverrun
            | ScriptInterrupt::BadPhase => self.handle_transfer_anomaly(code),
            ScriptInterrupt::ReselNoMsgIn
            | ScriptInterrupt::ReselNoIdentify
            | ScriptInterrupt::ReselBadLun
            | ScriptInterrupt::ReselBadItl
            | ScriptInterrupt::ReselBadItlq => self.handle_reselection_anomaly(code),
            ScriptInterrupt::ReselAborted => {
                info!("reselection aborted by the target");
                self.resume();
            },
            ScriptInterrupt::MsgOutDone => self.handle_msgout_done(),
            ScriptInterrupt::CompleteError | ScriptInterrupt::BadScsiStatus => {
                match self.current_ccb() {
                    Some(id) if self.ccbs.get(id).state == CcbState::Started => {
                        self.complete_from_header(id)
                    },
                    _ => warn!(?code, "error completion without a started ccb"),
                }
                self.jump(ScriptEntry::Start);
            },
            ScriptInterrupt::SelAtnNoMsgOut => {
                error!("selected with ATN but no message out, resetting");
                self.start_reset();
            },
            ScriptInterrupt::DmapDirty => self.resume(),
            ScriptInterrupt::ScriptStopped => self.handle_script_stopped(),
            ScriptInterrupt::TargetSelected => self.handle_target_selected(),
            ScriptInterrupt::AbortSent => self.handle_abort_sent(),
        }
    }
}
