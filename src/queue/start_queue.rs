// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use tracing::trace;

use crate::dma::{BusAddr, DmaChunk, DmaError, DmaPool};

/// Ring of CCB bus addresses the SCRIPTS processor fetches work from.
///
/// The slot after the newest entry always holds the idle task, so the
/// sequencer stops there instead of running past the producer. The idle
/// sentinel is written before the new entry for the same reason.
#[derive(Debug)]
pub struct StartQueue {
    ring: DmaChunk,
    slots: usize,
    put: usize,
    idle: BusAddr,
}

impl StartQueue {
    pub fn new(pool: &DmaPool, slots: usize, idle: BusAddr) -> Result<Self, DmaError> {
        let ring = pool.allocate(slots * 4)?;
        let mut q = Self {
            ring,
            slots,
            put: 0,
            idle,
        };
        q.reset(pool)?;
        Ok(q)
    }

    pub fn base(&self) -> BusAddr {
        self.ring.bus
    }

    pub fn chunk(&self) -> DmaChunk {
        self.ring
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Fills every slot with the idle task and rewinds the producer.
    pub fn reset(&mut self, pool: &DmaPool) -> Result<(), DmaError> {
        for i in 0..self.slots {
            self.write_slot(pool, i, self.idle)?;
        }
        self.put = 0;
        Ok(())
    }

    #[inline]
    fn slot_addr(&self, i: usize) -> BusAddr {
        self.ring.at(i * 4)
    }

    fn write_slot(&self, pool: &DmaPool, i: usize, ba: BusAddr) -> Result<(), DmaError> {
        pool.write_u32(self.slot_addr(i), ba.0)
    }

    fn read_slot(&self, pool: &DmaPool, i: usize) -> Result<BusAddr, DmaError> {
        pool.read_u32(self.slot_addr(i)).map(BusAddr)
    }

    /// Appends `ba`. The caller keeps the number of outstanding entries below
    /// `slots - 1`.
    pub fn push(&mut self, pool: &DmaPool, ba: BusAddr) -> Result<(), DmaError> {
        let next = (self.put + 1) % self.slots;
        self.write_slot(pool, next, self.idle)?;
        self.write_slot(pool, self.put, ba)?;
        trace!(slot = self.put, ccb = %ba, "start queue push");
        self.put = next;
        Ok(())
    }

    /// Removes, between `get` and the producer, every entry for which
    /// `matches` holds, compacting the rest in order. Returns the removed
    /// entries in queue order.
    pub fn remove_where(
        &mut self,
        pool: &DmaPool,
        get: usize,
        mut matches: impl FnMut(BusAddr) -> bool,
    ) -> Result<Vec<BusAddr>, DmaError> {
        let mut removed = Vec::new();
        let mut i = get % self.slots;
        let mut j = i;
        while i != self.put {
            let ba = self.read_slot(pool, i)?;
            if matches(ba) {
                removed.push(ba);
            } else {
                if j != i {
                    self.write_slot(pool, j, ba)?;
                }
                j = (j + 1) % self.slots;
            }
            i = (i + 1) % self.slots;
        }
        if !removed.is_empty() {
            self.write_slot(pool, j, self.idle)?;
            self.put = j;
        }
        Ok(removed)
    }
}
