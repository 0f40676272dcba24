// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use tracing::{error, info, warn};

use crate::{
    hba::engine::{EngineState, Hba},
    hw::controller::{ScriptsController, SequencerCommand},
    models::status::TransportStatus,
};

impl<C: ScriptsController> Hba<C> {
    /// Asserts RST on the bus. The controller reports the reset back as an
    /// RST interrupt, which is where outstanding work is failed.
    pub fn reset_bus(&mut self) {
        info!(adapter = %self.name, "bus reset requested");
        self.start_reset();
    }

    pub(crate) fn start_reset(&mut self) {
        warn!(adapter = %self.name, outstanding = self.handles.len(), "resetting SCSI bus");
        self.state = EngineState::ResettingBus;
        self.ctrl.issue(SequencerCommand::ResetChannel);
    }

    /// Brings the chip and every target back to power-on defaults after a
    /// bus reset or bus mode change. Whatever the controller already
    /// finished is delivered first; everything else fails with `reason`.
    pub(crate) fn reinit(&mut self, reason: TransportStatus) {
        self.ctrl.issue(SequencerCommand::AbortChannel);
        self.ctrl.issue(SequencerCommand::PurgeFifo);
        self.drain_completions();
        let failed = self.fail_all(reason);

        let limits = *self.nego.limits();
        for tcb in &mut self.targets {
            tcb.reset_transfer(&limits);
            tcb.to_reset = false;
            for lcb in tcb.luns_mut() {
                lcb.waiting.clear();
                lcb.started = 0;
                lcb.sense_pending = false;
            }
        }
        self.started = 0;
        self.abort_pending = false;
        self.abort_target = None;
        self.abort_msg.clear();

        if let Err(e) = self.squeue.reset(&self.pool) {
            error!(error = %e, "start queue reset failed");
        }
        if let Err(e) = self.dqueue.reset(&self.pool) {
            error!(error = %e, "done queue reset failed");
        }
        self.init_chip();
        self.stats.bus_resets += 1;
        self.state = EngineState::Idle;
        info!(adapter = %self.name, failed, ?reason, "controller reinitialized");
    }
}
