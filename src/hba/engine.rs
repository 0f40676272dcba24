// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use tracing::{debug, info, warn};
use zerocopy::byteorder::U32;

use crate::{
    ccb::{CcbHeader, CcbId, CcbRegistry, hw_header::CCB_CHUNK},
    cfg::config::{Config, ControllerConfig, PolicyConfig},
    dma::{BusAddr, DmaChunk, DmaError, DmaPool, LinearPages},
    hba::{error::HbaError, request::PendingHandle},
    hw::{
        controller::{ScriptsController, SequencerCommand},
        regs::{Dstat, Reg, Sist},
        script::ScriptEntry,
    },
    nego::{NegotiationEngine, sync::ChipLimits},
    queue::{DoneQueue, StartQueue},
    target::{TargetControl, TransferParams},
};

/// Size of the host control area shared with the sequencer.
pub(crate) const HCB_LEN: usize = 64;
/// Message bytes received from the target.
pub(crate) const HCB_MSGIN: usize = 0;
/// Length byte followed by the message the sequencer sends next.
pub(crate) const HCB_MSGOUT: usize = 16;
/// Length byte followed by the task management message for select-for-abort.
pub(crate) const HCB_ABORT_MSG: usize = 32;
pub(crate) const HCB_MSG_MAX: usize = 15;

/// SCSI interrupt sources the core handles.
const INT_SIST: Sist = Sist::PAR
    .union(Sist::RST)
    .union(Sist::UDC)
    .union(Sist::SGE)
    .union(Sist::MA)
    .union(Sist::HTH)
    .union(Sist::GEN)
    .union(Sist::STO)
    .union(Sist::SBMC);
const INT_DSTAT: Dstat = Dstat::MDPE
    .union(Dstat::BF)
    .union(Dstat::ABRT)
    .union(Dstat::SSI)
    .union(Dstat::SIR)
    .union(Dstat::IID);

/// Why the last command was completed with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ScsiStatus,
    SelectionTimeout,
    UnexpectedDisconnect,
    Parity,
    PhaseMismatch,
    Aborted,
    Protocol,
}

/// Controller-wide recovery state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineState {
    #[default]
    Idle,
    Selecting,
    Negotiating,
    Connected,
    /// Work is outstanding but no nexus is active.
    Disconnected,
    CompletingOk,
    CompletingError(ErrorKind),
    ResettingBus,
}

/// Counters for what the engine did since attach.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HbaStats {
    pub submitted: u64,
    pub completed: u64,
    pub requeued: u64,
    pub sense_requests: u64,
    pub aborts: u64,
    pub bus_resets: u64,
    pub bad_dsa: u64,
    pub phase_mismatches: u64,
    pub parity_errors: u64,
}

/// Builds the DMA pool described by the controller profile.
pub fn dma_pool(c: &ControllerConfig) -> Arc<DmaPool> {
    Arc::new(DmaPool::new(
        c.name.clone(),
        Box::new(LinearPages::new(c.dma_base, c.dma_page_limit)),
        c.dma_coalesce.as_bool(),
    ))
}

/// One SCRIPTS host bus adapter: owns every CCB, the per-target state and
/// both hardware queues.
///
/// All methods expect to be called under a single lock; none of them
/// blocks.
pub struct Hba<C: ScriptsController> {
    pub(crate) name: String,
    pub(crate) ctrl: C,
    pub(crate) pool: Arc<DmaPool>,
    pub(crate) policy: PolicyConfig,
    pub(crate) host_id: u8,
    pub(crate) max_luns: u8,
    pub(crate) max_sg: usize,
    pub(crate) nego: NegotiationEngine,
    pub(crate) ccbs: CcbRegistry,
    pub(crate) targets: Vec<TargetControl>,
    pub(crate) squeue: StartQueue,
    pub(crate) dqueue: DoneQueue,
    pub(crate) hcb: DmaChunk,
    pub(crate) idle: DmaChunk,
    /// Finished CCBs waiting for [`poll_completions`](Self::poll_completions).
    pub(crate) completed: VecDeque<CcbId>,
    pub(crate) handles: HashMap<PendingHandle, CcbId>,
    pub(crate) next_handle: u64,
    pub(crate) next_seq: u64,
    /// CCBs on the start queue or owned by the controller.
    pub(crate) started: usize,
    pub(crate) state: EngineState,
    /// A pause was requested and `ScriptStopped` has not arrived yet.
    pub(crate) abort_pending: bool,
    /// Target currently addressed by select-for-abort.
    pub(crate) abort_target: Option<u8>,
    pub(crate) abort_msg: Vec<u8>,
    pub(crate) stats: HbaStats,
}

impl<C: ScriptsController> Hba<C> {
    /// Sets up queues and CCBs in `pool`, programs the controller and starts
    /// the sequencer at its idle loop.
    pub fn attach(cfg: &Config, ctrl: C, pool: Arc<DmaPool>) -> Result<Self, HbaError> {
        let c = &cfg.controller;
        let limits = ChipLimits::from_config(c);
        let slots = usize::from(c.queue_slots);

        let idle = pool.allocate(CCB_CHUNK)?;
        CcbHeader {
            start: U32::new(ScriptEntry::Start.encode()),
            ..Default::default()
        }
        .store(&pool, idle.bus)?;
        let hcb = pool.allocate(HCB_LEN)?;
        let squeue = StartQueue::new(&pool, slots, idle.bus)?;
        let dqueue = DoneQueue::new(&pool, slots)?;

        let mut ccbs = CcbRegistry::new(
            usize::from(c.max_ccbs),
            usize::from(c.max_sg),
            usize::from(cfg.policy.sense_len),
        );
        ccbs.prealloc(&pool, usize::from(c.prealloc_ccbs))?;

        let targets = (0..c.max_targets)
            .map(|id| TargetControl::new(id, cfg.targets.settings_for(id), &limits))
            .collect();

        let mut hba = Self {
            name: c.name.clone(),
            ctrl,
            pool,
            policy: cfg.policy.clone(),
            host_id: c.host_id,
            max_luns: c.max_luns,
            max_sg: usize::from(c.max_sg),
            nego: NegotiationEngine::new(limits),
            ccbs,
            targets,
            squeue,
            dqueue,
            hcb,
            idle,
            completed: VecDeque::new(),
            handles: HashMap::new(),
            next_handle: 1,
            next_seq: 0,
            started: 0,
            state: EngineState::Idle,
            abort_pending: false,
            abort_target: None,
            abort_msg: Vec::new(),
            stats: HbaStats::default(),
        };
        hba.init_chip();
        info!(
            adapter = %hba.name,
            family = %c.family,
            clock_khz = c.clock_khz,
            minsync = limits.minsync,
            ccbs = hba.ccbs.total(),
            slots,
            "controller attached"
        );
        Ok(hba)
    }

    /// Loads queue pointers and default timings, unmasks interrupts and
    /// points the sequencer at the idle loop.
    pub(crate) fn init_chip(&mut self) {
        let limits = *self.nego.limits();
        self.ctrl.issue(SequencerCommand::InitializeChannel);
        self.ctrl.write_reg(Reg::SqueueBa, self.squeue.base().0);
        self.ctrl.write_reg(Reg::DqueueBa, self.dqueue.base().0);
        self.ctrl.write_reg(Reg::QueueSlots, self.squeue.slots() as u32);
        self.ctrl.write_reg(Reg::SqueueGet, 0);
        self.ctrl.write_reg(Reg::IdleBa, self.idle.bus.0);
        self.ctrl.write_reg(Reg::HcbBa, self.hcb.bus.0);
        self.ctrl.write_reg8(Reg::Scntl3, limits.rv_scntl3);
        self.ctrl.write_reg8(Reg::Sxfer, 0);
        self.ctrl.write_reg8(Reg::Scntl4, 0);
        self.ctrl.set_interrupt_mask(INT_SIST, INT_DSTAT);
        self.jump(ScriptEntry::Start);
    }

    /// Restarts the sequencer at `entry`.
    pub(crate) fn jump(&mut self, entry: ScriptEntry) {
        self.ctrl.write_reg(Reg::Dsp, entry.encode());
        self.ctrl.issue(SequencerCommand::StartChannel);
    }

    /// Lets the sequencer continue where it stopped.
    pub(crate) fn resume(&mut self) {
        self.ctrl.issue(SequencerCommand::StartChannel);
    }

    pub(crate) fn write_hcb_msg(&self, at: usize, bytes: &[u8]) -> Result<(), DmaError> {
        let n = bytes.len().min(HCB_MSG_MAX);
        let mut buf = [0u8; HCB_MSG_MAX + 1];
        buf[0] = n as u8;
        buf[1..=n].copy_from_slice(&bytes[..n]);
        self.pool.write(self.hcb.at(at), &buf)
    }

    pub(crate) fn read_msgin(&self) -> Result<[u8; 16], DmaError> {
        let mut buf = [0u8; 16];
        self.pool.read(self.hcb.at(HCB_MSGIN), &mut buf)?;
        Ok(buf)
    }

    /// Loads the header of `id`, lets `f` change it and stores it back.
    pub(crate) fn update_header(
        &mut self,
        id: CcbId,
        f: impl FnOnce(&mut CcbHeader),
    ) -> Result<(), DmaError> {
        let ba = self.ccbs.get(id).ba;
        let mut hdr = CcbHeader::load(&self.pool, ba)?;
        f(&mut hdr);
        hdr.store(&self.pool, ba)
    }

    /// CCB the controller reported in DSA, if it is one of ours.
    pub(crate) fn current_ccb(&mut self) -> Option<CcbId> {
        let dsa = BusAddr(self.ctrl.read_reg(Reg::Dsa));
        let id = self.ccbs.lookup(dsa);
        if id.is_none() {
            debug!(%dsa, "DSA does not name a live ccb");
        }
        id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn stats(&self) -> HbaStats {
        self.stats
    }

    pub fn pool(&self) -> &Arc<DmaPool> {
        &self.pool
    }

    pub fn controller(&self) -> &C {
        &self.ctrl
    }

    pub fn controller_mut(&mut self) -> &mut C {
        &mut self.ctrl
    }

    pub fn negotiation(&self) -> &NegotiationEngine {
        &self.nego
    }

    pub fn target(&self, id: u8) -> Option<&TargetControl> {
        self.targets.get(usize::from(id))
    }

    /// Current allowed depth of a LUN that has been used.
    pub fn lun_depth(&self, target: u8, lun: u8) -> Option<u16> {
        self.target(target)?.lun(lun).map(|l| l.depth)
    }

    pub fn free_ccbs(&self) -> usize {
        self.ccbs.free_count()
    }

    pub fn busy_ccbs(&self) -> usize {
        self.ccbs.busy().len()
    }

    /// Submitted commands whose result was not collected yet.
    pub fn outstanding(&self) -> usize {
        self.handles.len()
    }

    /// Read-only view of the CCB arena.
    pub fn ccbs(&self) -> &CcbRegistry {
        &self.ccbs
    }

    /// Bus address of the header of a submitted command.
    pub fn ccb_address(&self, handle: PendingHandle) -> Option<BusAddr> {
        self.handles.get(&handle).map(|&id| self.ccbs.get(id).ba)
    }

    /// Replaces the negotiation goal of a target. The next command to it
    /// negotiates if the goal differs from the current agreement.
    pub fn set_goal(&mut self, target: u8, goal: TransferParams) -> Result<(), HbaError> {
        let goal = self.nego.clamp(goal);
        let tcb = self
            .targets
            .get_mut(usize::from(target))
            .ok_or(HbaError::InvalidTarget(target))?;
        tcb.goal = goal;
        tcb.check_nego = tcb.goal != tcb.active;
        debug!(target, ?goal, "goal changed");
        Ok(())
    }

    /// Binds an upper-layer cookie to a target.
    pub fn set_upper(&mut self, target: u8, cookie: Option<u64>) -> Result<(), HbaError> {
        let tcb = self
            .targets
            .get_mut(usize::from(target))
            .ok_or(HbaError::InvalidTarget(target))?;
        tcb.upper = cookie;
        Ok(())
    }

    /// Forgets an idle LUN.
    pub fn remove_lun(&mut self, target: u8, lun: u8) -> Result<(), HbaError> {
        let tcb = self
            .targets
            .get_mut(usize::from(target))
            .ok_or(HbaError::InvalidTarget(target))?;
        if tcb.remove_lun(lun) {
            Ok(())
        } else {
            Err(HbaError::LunBusy { target, lun })
        }
    }

    /// Stops the controller, fails whatever is still outstanding and gives
    /// every DMA chunk back. Returns the results nobody collected.
    pub fn detach(mut self) -> Vec<crate::hba::request::CommandResult> {
        self.ctrl.set_interrupt_mask(Sist::empty(), Dstat::empty());
        self.ctrl.issue(SequencerCommand::AbortChannel);
        self.drain_completions();
        self.fail_all(crate::models::status::TransportStatus::Aborted);
        let left = self.poll_completions();

        self.ccbs.destroy(&self.pool);
        for chunk in [self.squeue.chunk(), self.dqueue.chunk(), self.hcb, self.idle] {
            if let Err(e) = self.pool.free(chunk) {
                warn!(error = %e, "failed to release controller memory");
            }
        }
        info!(adapter = %self.name, uncollected = left.len(), "controller detached");
        left
    }
}
