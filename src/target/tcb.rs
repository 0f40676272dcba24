// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::BTreeMap;

use crate::{
    ccb::CcbId,
    cfg::config::TargetSettings,
    models::message::PprOptions,
    nego::{
        engine::NegoKind,
        sync::{ChipLimits, SyncRegisters},
    },
    target::lcb::LunControl,
};

/// Transfer agreement: period factor, REQ/ACK offset, width exponent and
/// PPR protocol options. All zero means asynchronous narrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferParams {
    pub period: u8,
    pub offset: u8,
    pub width: u8,
    pub options: PprOptions,
}

impl TransferParams {
    pub fn is_wide(&self) -> bool {
        self.width != 0
    }

    pub fn is_sync(&self) -> bool {
        self.offset != 0
    }

    pub fn is_dt(&self) -> bool {
        self.options.contains(PprOptions::DT)
    }
}

/// Negotiation started by us and not yet answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegoInFlight {
    pub ccb: CcbId,
    pub kind: NegoKind,
    pub proposed: TransferParams,
}

/// Per-target control.
#[derive(Debug)]
pub struct TargetControl {
    pub id: u8,
    pub settings: TargetSettings,
    /// What the target currently runs with.
    pub active: TransferParams,
    /// What we want; only ever lowered by failed negotiations.
    pub goal: TransferParams,
    pub regs: SyncRegisters,
    /// Negotiate on the next command.
    pub check_nego: bool,
    pub nego: Option<NegoInFlight>,
    /// Send BUS DEVICE RESET at the next recovery point.
    pub to_reset: bool,
    /// Cookie of the upper-layer object bound to this target.
    pub upper: Option<u64>,
    luns: BTreeMap<u8, LunControl>,
}

impl TargetControl {
    pub fn new(id: u8, settings: TargetSettings, limits: &ChipLimits) -> Self {
        let goal = settings.goal();
        Self {
            id,
            settings,
            active: TransferParams::default(),
            goal,
            regs: SyncRegisters::asynchronous(limits),
            check_nego: goal != TransferParams::default(),
            nego: None,
            to_reset: false,
            upper: None,
            luns: BTreeMap::new(),
        }
    }

    pub fn lun(&self, lun: u8) -> Option<&LunControl> {
        self.luns.get(&lun)
    }

    pub fn lun_mut(&mut self, lun: u8) -> Option<&mut LunControl> {
        self.luns.get_mut(&lun)
    }

    /// LUN control, created on first use.
    pub fn lun_or_create(&mut self, lun: u8) -> &mut LunControl {
        let tagged = self.settings.tagged_queuing.as_bool();
        let max_tags = self.settings.max_tags;
        self.luns
            .entry(lun)
            .or_insert_with(|| LunControl::new(lun, tagged, max_tags))
    }

    /// Drops an idle LUN; returns false if it still has tasks.
    pub fn remove_lun(&mut self, lun: u8) -> bool {
        match self.luns.get(&lun) {
            Some(l) if !l.is_idle() || !l.waiting.is_empty() => false,
            _ => {
                self.luns.remove(&lun);
                true
            },
        }
    }

    pub fn luns(&self) -> impl Iterator<Item = &LunControl> {
        self.luns.values()
    }

    pub fn luns_mut(&mut self) -> impl Iterator<Item = &mut LunControl> {
        self.luns.values_mut()
    }

    /// Back to asynchronous narrow; the next command renegotiates.
    pub fn reset_transfer(&mut self, limits: &ChipLimits) {
        self.active = TransferParams::default();
        self.regs = SyncRegisters::asynchronous(limits);
        self.nego = None;
        self.check_nego = self.goal != self.active;
    }

    /// IDENTIFY disconnect privilege for untagged tasks.
    pub fn may_disconnect(&self) -> bool {
        self.settings.disconnect.as_bool()
    }
}
