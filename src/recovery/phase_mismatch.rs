// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use tracing::{debug, error, warn};
use zerocopy::byteorder::U32;

use crate::{
    ccb::{CcbHeader, CcbId, DataPointer, hw_header::load_sg},
    hba::engine::{EngineState, Hba},
    hw::{
        controller::{ScriptsController, SequencerCommand},
        regs::{BusPhase, Reg, SCNTL2_WSR, SCNTL3_EWS, SSTAT_OLF, SSTAT_ORF},
        script::ScriptEntry,
    },
};

impl<C: ScriptsController> Hba<C> {
    /// The target left a phase before the sequencer's move finished.
    ///
    /// Inside a data move the bytes actually transferred are worked out from
    /// DBC and the FIFO counters, the CCB's data pointer is advanced to the
    /// exact byte and the remainder of the entry is parked in the phase
    /// mismatch save area for the sequencer to resume from. Mismatches while
    /// sending IDENTIFY or a negotiation message have their own script
    /// continuations. Anything else resets the bus.
    pub(crate) fn handle_phase_mismatch(&mut self) {
        self.stats.phase_mismatches += 1;
        let dsp = ScriptEntry::decode(self.ctrl.read_reg(Reg::Dsp));
        let dbc = self.ctrl.read_reg(Reg::Dbc);
        let cmd_phase = BusPhase::from_bits((dbc >> 24) as u8);
        let new_phase = BusPhase::from_bits(self.ctrl.read_reg8(Reg::Sbcl));

        let Some(id) = self.current_ccb() else {
            error!(?dsp, "phase mismatch without a nexus");
            self.start_reset();
            return;
        };
        debug!(ccb = id.0, ?dsp, ?cmd_phase, ?new_phase, "phase mismatch");
        self.state = EngineState::Connected;

        let next = match dsp {
            Some(ScriptEntry::DataIn(n)) => self.save_data_pointer(id, n, true, dbc),
            Some(ScriptEntry::DataOut(n)) => self.save_data_pointer(id, n, false, dbc),
            Some(ScriptEntry::SendIdent) => {
                // the target did not take the tag bytes; go on untagged
                if self.ccbs.get(id).tag.is_some() {
                    Some(ScriptEntry::IdentBreakAtn)
                } else {
                    Some(ScriptEntry::IdentBreak)
                }
            },
            Some(e) if e.is_nego_send() => Some(ScriptEntry::NegoBadPhase),
            Some(ScriptEntry::Dispatch) if cmd_phase == BusPhase::Command => Some(ScriptEntry::Dispatch),
            _ => None,
        };
        match next {
            Some(entry) => self.jump(entry),
            None => {
                error!(ccb = id.0, ?dsp, ?cmd_phase, ?new_phase, "phase mismatch with no resume point");
                self.start_reset();
            },
        }
    }

    /// Records how far a data move got. Returns the script to continue at,
    /// or `None` if the counters are inconsistent.
    fn save_data_pointer(&mut self, id: CcbId, index: u16, input: bool, dbc: u32) -> Option<ScriptEntry> {
        let (ba, sg_ba, sg_count) = {
            let c = self.ccbs.get(id);
            (c.ba, c.sg.bus, c.sg_count)
        };
        let index = u8::try_from(index).ok().filter(|&i| i < sg_count)?;
        let mut hdr = match CcbHeader::load(&self.pool, ba) {
            Ok(h) => h,
            Err(e) => {
                error!(ccb = id.0, error = %e, "ccb header unreadable");
                return None;
            },
        };
        let wide = hdr.sel_scntl3 & SCNTL3_EWS != 0;

        let mut rest = dbc & 0x00ff_ffff;
        if !input {
            // bytes still in the DMA FIFO never reached the bus
            let fifo = self.ctrl.read_reg8(Reg::Dfifo);
            rest += u32::from(fifo.wrapping_sub((rest & 0x7f) as u8) & 0x7f);
            let ss0 = self.ctrl.read_reg8(Reg::Sstat0);
            rest += u32::from(ss0 & SSTAT_OLF != 0) + u32::from(ss0 & SSTAT_ORF != 0);
            if wide {
                let ss2 = self.ctrl.read_reg8(Reg::Sstat2);
                rest += u32::from(ss2 & SSTAT_OLF != 0) + u32::from(ss2 & SSTAT_ORF != 0);
            }
            self.ctrl.issue(SequencerCommand::PurgeFifo);
        }

        let entry = match load_sg(&self.pool, sg_ba, index) {
            Ok(e) => e,
            Err(e) => {
                error!(ccb = id.0, error = %e, "scatter list unreadable");
                return None;
            },
        };
        if rest > entry.len() {
            warn!(ccb = id.0, rest, len = entry.len(), "residual larger than the move");
            return None;
        }

        // a wide input that stopped on an odd byte keeps it in SWIDE
        let mut next = ScriptEntry::Dispatch;
        if input && wide && self.ctrl.read_reg8(Reg::Scntl2) & SCNTL2_WSR != 0 && rest > 0 {
            let done = entry.len() - rest;
            hdr.wresid_addr = U32::new(entry.addr.get().wrapping_add(done));
            hdr.wresid_size = U32::new(1);
            rest -= 1;
            next = ScriptEntry::WsrMaHelper;
        }

        let done = entry.len() - rest;
        let pointer = DataPointer::new(index, done);
        hdr.lastp = U32::new(pointer.encode());
        hdr.pm_addr = U32::new(entry.addr.get().wrapping_add(done));
        hdr.pm_size = U32::new(rest);
        hdr.pm_ret = U32::new(DataPointer::new(index + 1, 0).encode());
        if let Err(e) = hdr.store(&self.pool, ba) {
            error!(ccb = id.0, error = %e, "cannot update ccb header");
            return None;
        }
        debug!(ccb = id.0, index, done, rest, "data pointer saved");
        Some(next)
    }
}
