// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::VecDeque;

use tracing::debug;

use crate::ccb::CcbId;

/// Per-LUN control: tag allocation, the I_T_L_Q table used on reselection,
/// the wait queue and the adaptive queue depth.
#[derive(Debug)]
pub struct LunControl {
    pub lun: u8,
    pub tags_enabled: bool,
    /// Ceiling for `depth`, from configuration.
    pub max_tags: u16,
    itlq: Vec<Option<CcbId>>,
    free_tags: VecDeque<u8>,
    itl_task: Option<CcbId>,
    pub busy_tagged: u16,
    pub busy_untagged: u16,
    /// CCBs of this LUN on the start queue or owned by the controller.
    pub started: u16,
    /// Current number of tasks allowed at the device.
    pub depth: u16,
    good_since_full: u32,
    /// Bound CCBs not started yet, in submission order.
    pub waiting: VecDeque<CcbId>,
    /// Frozen while an automatic REQUEST SENSE is outstanding.
    pub sense_pending: bool,
}

impl LunControl {
    pub fn new(lun: u8, tagged: bool, max_tags: u8) -> Self {
        let tags_enabled = tagged && max_tags > 1;
        let slots = if tags_enabled { max_tags } else { 0 };
        Self {
            lun,
            tags_enabled,
            max_tags: if tags_enabled { u16::from(max_tags) } else { 1 },
            itlq: vec![None; slots as usize],
            free_tags: (0..slots).collect(),
            itl_task: None,
            busy_tagged: 0,
            busy_untagged: 0,
            started: 0,
            depth: if tags_enabled { u16::from(max_tags) } else { 1 },
            good_since_full: 0,
            waiting: VecDeque::new(),
            sense_pending: false,
        }
    }

    /// Reserves a nexus slot. Tagged and untagged tasks never coexist on a
    /// LUN and at most one untagged task exists.
    pub fn reserve(&mut self, want_tag: bool) -> Option<Option<u8>> {
        if self.busy_untagged > 0 {
            return None;
        }
        if want_tag && self.tags_enabled {
            let tag = self.free_tags.pop_front()?;
            self.busy_tagged += 1;
            Some(Some(tag))
        } else {
            if self.busy_tagged > 0 {
                return None;
            }
            self.busy_untagged = 1;
            Some(None)
        }
    }

    /// Records `id` as the owner of the slot returned by [`reserve`].
    pub fn bind(&mut self, id: CcbId, tag: Option<u8>) {
        match tag {
            Some(t) => {
                if let Some(slot) = self.itlq.get_mut(t as usize) {
                    *slot = Some(id);
                }
            },
            None => {
                self.itl_task = Some(id);
            },
        }
    }

    /// Gives the slot back; safe to call for a slot that was reserved but
    /// never bound.
    pub fn unbind(&mut self, tag: Option<u8>) {
        match tag {
            Some(t) => {
                if let Some(slot) = self.itlq.get_mut(t as usize) {
                    *slot = None;
                }
                self.free_tags.push_back(t);
                self.busy_tagged = self.busy_tagged.saturating_sub(1);
            },
            None => {
                self.itl_task = None;
                self.busy_untagged = 0;
            },
        }
    }

    /// A tagged CCB re-armed as REQUEST SENSE goes out without its tag, so
    /// an untagged reselection has to find it.
    pub fn bind_sense(&mut self, id: CcbId) {
        if self.itl_task.is_none() {
            self.itl_task = Some(id);
        }
    }

    /// Drops the binding made by [`bind_sense`]. A genuinely untagged task
    /// keeps its slot until [`unbind`].
    pub fn unbind_sense(&mut self, id: CcbId) {
        if self.busy_untagged == 0 && self.itl_task == Some(id) {
            self.itl_task = None;
        }
    }

    /// CCB a reselecting target refers to.
    pub fn task(&self, tag: Option<u8>) -> Option<CcbId> {
        match tag {
            Some(t) => self.itlq.get(t as usize).copied().flatten(),
            None => self.itl_task,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.busy_tagged == 0 && self.busy_untagged == 0
    }

    pub fn can_start(&self) -> bool {
        !self.sense_pending && self.started < self.depth
    }

    /// Counts a good completion; after `threshold` of them in a row the
    /// depth grows by one, up to `max_tags`.
    pub fn on_good_completion(&mut self, threshold: u32) {
        if self.depth >= self.max_tags {
            return;
        }
        self.good_since_full += 1;
        if self.good_since_full >= threshold {
            self.good_since_full = 0;
            self.depth += 1;
            debug!(lun = self.lun, depth = self.depth, "queue depth raised");
        }
    }

    /// Lowers the depth after QUEUE FULL. `outstanding` counts the started
    /// tasks up to and including the refused one, so the device held one
    /// fewer.
    pub fn on_queue_full(&mut self, outstanding: u16) {
        let depth = outstanding.saturating_sub(1).max(1).min(self.depth);
        self.good_since_full = 0;
        if depth != self.depth {
            debug!(lun = self.lun, from = self.depth, to = depth, "queue depth lowered");
        }
        self.depth = depth;
    }
}
