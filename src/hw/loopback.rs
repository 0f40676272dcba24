// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use tracing::{debug, trace, warn};
use zerocopy::byteorder::U32;

use crate::{
    ccb::{
        CcbHeader,
        hw_header::{DataPointer, load_sg, pointer_at},
    },
    dma::{BusAddr, DmaError, DmaPool},
    hba::engine::{HCB_ABORT_MSG, HCB_MSGIN, HCB_MSGOUT},
    hw::{
        controller::{ScriptsController, SequencerCommand},
        regs::{Dstat, InterruptStatus, Istat, Reg, Sist},
        script::{ScriptEntry, ScriptInterrupt},
    },
    models::status::{ExtendedError, HostStatus},
};

/// How the simulated target finished a CCB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub host_status: HostStatus,
    pub scsi_status: u8,
    pub xerr: ExtendedError,
    /// Bytes moved; `None` means the whole buffer.
    pub transferred: Option<u32>,
    pub extra_bytes: u32,
}

impl Completion {
    pub fn status(scsi_status: u8) -> Self {
        Self {
            host_status: HostStatus::Complete,
            scsi_status,
            xerr: ExtendedError::empty(),
            transferred: None,
            extra_bytes: 0,
        }
    }

    pub fn transferred(mut self, bytes: u32) -> Self {
        self.transferred = Some(bytes);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AbortStage {
    Idle,
    /// TargetSelected raised, waiting for the message to be taken.
    Selected,
}

#[derive(Debug, Clone)]
struct PendingSir {
    code: ScriptInterrupt,
    regs: Vec<(Reg, u32)>,
}

/// Software model of a SCRIPTS controller and the targets behind it.
///
/// It fetches CCBs from the start queue in DMA memory, writes their status
/// back into the CCB header, posts them to the done queue and raises the
/// interrupts a real chip would. Tests drive the bus side through the
/// helper methods; the engine only sees [`ScriptsController`].
pub struct LoopbackController {
    pool: Arc<DmaPool>,
    regs: HashMap<Reg, u32>,
    sist: Sist,
    dstat: Dstat,
    mask_sist: Sist,
    mask_dstat: Dstat,
    intf: bool,
    halted: bool,
    sirs: VecDeque<PendingSir>,
    abort_stage: AbortStage,
    dq_put: usize,
    commands: Vec<SequencerCommand>,
}

impl LoopbackController {
    pub fn new(pool: Arc<DmaPool>) -> Self {
        Self {
            pool,
            regs: HashMap::new(),
            sist: Sist::empty(),
            dstat: Dstat::empty(),
            mask_sist: Sist::empty(),
            mask_dstat: Dstat::empty(),
            intf: false,
            halted: true,
            sirs: VecDeque::new(),
            abort_stage: AbortStage::Idle,
            dq_put: 0,
            commands: Vec::new(),
        }
    }

    pub fn reg(&self, reg: Reg) -> u32 {
        self.regs.get(&reg).copied().unwrap_or(0)
    }

    pub fn set_reg(&mut self, reg: Reg, value: u32) {
        self.regs.insert(reg, value);
    }

    /// Every sequencer command issued so far, oldest first.
    pub fn commands(&self) -> &[SequencerCommand] {
        &self.commands
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    /// Whether the sequencer was told to continue since the last interrupt.
    pub fn is_running(&self) -> bool {
        !self.halted
    }

    pub fn dsp(&self) -> Option<ScriptEntry> {
        ScriptEntry::decode(self.reg(Reg::Dsp))
    }

    /// Takes the next entry of the start queue, as the idle loop does.
    pub fn fetch(&mut self) -> Option<BusAddr> {
        let base = BusAddr(self.reg(Reg::SqueueBa));
        let slots = self.reg(Reg::QueueSlots).max(1);
        let get = self.reg(Reg::SqueueGet) % slots;
        let ba = self.pool.read_u32(base.offset(get * 4)).ok()?;
        if ba == self.reg(Reg::IdleBa) {
            return None;
        }
        self.set_reg(Reg::SqueueGet, (get + 1) % slots);
        trace!(slot = get, ccb = %BusAddr(ba), "loopback fetch");
        Some(BusAddr(ba))
    }

    pub fn fetch_all(&mut self) -> Vec<BusAddr> {
        std::iter::from_fn(|| self.fetch()).collect()
    }

    pub fn header(&self, ba: BusAddr) -> Result<CcbHeader, DmaError> {
        CcbHeader::load(&self.pool, ba)
    }

    /// Finishes a fetched CCB with a status byte and a full transfer.
    pub fn complete(&mut self, ba: BusAddr, scsi_status: u8) -> Result<(), DmaError> {
        self.complete_with(ba, Completion::status(scsi_status))
    }

    /// Writes the final status into the header and posts the CCB to the
    /// done queue.
    pub fn complete_with(&mut self, ba: BusAddr, c: Completion) -> Result<(), DmaError> {
        let mut hdr = CcbHeader::load(&self.pool, ba)?;
        hdr.host_status = u8::from(c.host_status);
        hdr.scsi_status = c.scsi_status;
        hdr.xerr_status |= c.xerr.bits();
        hdr.extra_bytes = U32::new(c.extra_bytes);
        let lastp = match c.transferred {
            None => DataPointer::decode(hdr.goalp.get()),
            Some(n) => {
                let sg_ba = BusAddr(hdr.sg_ba.get());
                pointer_at(&self.pool, sg_ba, hdr.sg_count, n)?
                    .unwrap_or_else(|| DataPointer::decode(hdr.goalp.get()))
            },
        };
        hdr.lastp = U32::new(lastp.encode());
        hdr.store(&self.pool, ba)?;
        self.post_done(ba)
    }

    /// Completes the REQUEST SENSE a CCB was re-armed with, handing back
    /// `sense` as the data.
    pub fn complete_sense(&mut self, ba: BusAddr, sense: &[u8]) -> Result<(), DmaError> {
        self.write_data_in(ba, sense)?;
        self.complete_with(ba, Completion::status(0).transferred(sense.len() as u32))
    }

    /// Writes `data` through the scatter list of a CCB, as a data-in phase
    /// would.
    pub fn write_data_in(&mut self, ba: BusAddr, data: &[u8]) -> Result<(), DmaError> {
        let hdr = CcbHeader::load(&self.pool, ba)?;
        let sg_ba = BusAddr(hdr.sg_ba.get());
        let mut left = data;
        for i in 0..hdr.sg_count {
            if left.is_empty() {
                break;
            }
            let e = load_sg(&self.pool, sg_ba, i)?;
            let n = (e.len() as usize).min(left.len());
            self.pool.write(BusAddr(e.addr.get()), &left[..n])?;
            left = &left[n..];
        }
        Ok(())
    }

    fn post_done(&mut self, ba: BusAddr) -> Result<(), DmaError> {
        let base = BusAddr(self.reg(Reg::DqueueBa));
        let slots = self.reg(Reg::QueueSlots).max(1) as usize;
        self.pool.write_u32(base.offset((self.dq_put * 4) as u32), ba.0)?;
        self.dq_put = (self.dq_put + 1) % slots;
        self.intf = true;
        debug!(ccb = %ba, "loopback posted completion");
        Ok(())
    }

    /// Queues a script interrupt. `regs` are loaded when it is presented.
    pub fn raise_sir(&mut self, code: ScriptInterrupt, dsa: Option<BusAddr>, regs: &[(Reg, u32)]) {
        let mut regs = regs.to_vec();
        if let Some(dsa) = dsa {
            regs.push((Reg::Dsa, dsa.0));
        }
        self.sirs.push_back(PendingSir { code, regs });
    }

    /// Puts `msg` in the message-in buffer and raises `MsgReceived` for the
    /// nexus `dsa`.
    pub fn deliver_message(&mut self, dsa: BusAddr, msg: &[u8]) -> Result<(), DmaError> {
        let mut buf = [0u8; 16];
        let n = msg.len().min(buf.len());
        buf[..n].copy_from_slice(&msg[..n]);
        self.pool.write(self.hcb(HCB_MSGIN), &buf)?;
        self.raise_sir(ScriptInterrupt::MsgReceived, Some(dsa), &[]);
        Ok(())
    }

    /// Latches SCSI interrupt bits after loading `regs`.
    pub fn raise_scsi_interrupt(&mut self, sist: Sist, regs: &[(Reg, u32)]) {
        for &(r, v) in regs {
            self.set_reg(r, v);
        }
        self.sist |= sist;
    }

    pub fn raise_dma_interrupt(&mut self, dstat: Dstat, regs: &[(Reg, u32)]) {
        for &(r, v) in regs {
            self.set_reg(r, v);
        }
        self.dstat |= dstat;
    }

    /// Another initiator reset the bus.
    pub fn bus_reset(&mut self) {
        self.sist |= Sist::RST;
    }

    /// Message the engine left for the next message-out phase.
    pub fn msgout(&self) -> Vec<u8> {
        self.hcb_message(HCB_MSGOUT)
    }

    /// Message the engine chose for select-for-abort.
    pub fn abort_message(&self) -> Vec<u8> {
        self.hcb_message(HCB_ABORT_MSG)
    }

    fn hcb(&self, at: usize) -> BusAddr {
        BusAddr(self.reg(Reg::HcbBa)).offset(at as u32)
    }

    fn hcb_message(&self, at: usize) -> Vec<u8> {
        let mut buf = [0u8; 16];
        if let Err(e) = self.pool.read(self.hcb(at), &mut buf) {
            warn!(error = %e, "host control area unreadable");
            return Vec::new();
        }
        let n = usize::from(buf[0]).min(15);
        buf[1..=n].to_vec()
    }

    fn start_channel(&mut self) {
        self.halted = false;
        match self.abort_stage {
            AbortStage::Selected => {
                self.abort_stage = AbortStage::Idle;
                self.raise_sir(ScriptInterrupt::AbortSent, None, &[]);
            },
            AbortStage::Idle if self.dsp() == Some(ScriptEntry::SelForAbort) => {
                self.abort_stage = AbortStage::Selected;
                self.raise_sir(ScriptInterrupt::TargetSelected, None, &[]);
            },
            AbortStage::Idle => {},
        }
    }
}

impl ScriptsController for LoopbackController {
    fn read_reg(&mut self, reg: Reg) -> u32 {
        self.reg(reg)
    }

    fn write_reg(&mut self, reg: Reg, value: u32) {
        self.set_reg(reg, value);
    }

    fn issue(&mut self, cmd: SequencerCommand) {
        trace!(?cmd, "loopback command");
        self.commands.push(cmd);
        match cmd {
            SequencerCommand::ResetChannel => {
                self.halted = true;
                self.sist |= Sist::RST;
            },
            SequencerCommand::StartChannel => self.start_channel(),
            SequencerCommand::PauseChannel => {
                self.raise_sir(ScriptInterrupt::ScriptStopped, None, &[]);
            },
            SequencerCommand::AbortChannel => self.halted = true,
            SequencerCommand::InitializeChannel => {
                self.sirs.clear();
                self.abort_stage = AbortStage::Idle;
                self.dq_put = 0;
                self.intf = false;
                self.set_reg(Reg::SqueueGet, 0);
            },
            SequencerCommand::PurgeFifo => {
                self.set_reg(Reg::Dfifo, 0);
                self.set_reg(Reg::Sstat0, 0);
                self.set_reg(Reg::Sstat2, 0);
            },
            SequencerCommand::SelectWithAtn { target } | SequencerCommand::SelectWithoutAtn { target } => {
                self.set_reg(Reg::Sdid, u32::from(target));
            },
        }
    }

    fn interrupt_status(&mut self) -> InterruptStatus {
        let mut st = InterruptStatus::default();
        if std::mem::take(&mut self.intf) {
            st.istat |= Istat::INTF;
        }
        let sist = std::mem::take(&mut self.sist) & self.mask_sist;
        let dstat = std::mem::take(&mut self.dstat) & self.mask_dstat;
        if !sist.is_empty() || !dstat.is_empty() {
            st.sist = sist;
            st.dstat = dstat;
        } else if !self.halted && self.mask_dstat.contains(Dstat::SIR) {
            if let Some(sir) = self.sirs.pop_front() {
                for (r, v) in sir.regs {
                    self.set_reg(r, v);
                }
                self.set_reg(Reg::Dsps, sir.code as u32);
                self.halted = true;
                st.dstat = Dstat::SIR;
            }
        }
        if !st.sist.is_empty() {
            st.istat |= Istat::SIP;
            self.halted = true;
        }
        if !st.dstat.is_empty() {
            st.istat |= Istat::DIP;
        }
        st
    }

    fn set_interrupt_mask(&mut self, sist: Sist, dstat: Dstat) {
        self.mask_sist = sist;
        self.mask_dstat = dstat;
    }
}
