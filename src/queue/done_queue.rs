// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::dma::{BusAddr, DmaChunk, DmaError, DmaPool};

/// Ring the SCRIPTS processor posts finished CCB addresses to. Zero marks an
/// empty slot.
#[derive(Debug)]
pub struct DoneQueue {
    ring: DmaChunk,
    slots: usize,
    get: usize,
}

impl DoneQueue {
    pub fn new(pool: &DmaPool, slots: usize) -> Result<Self, DmaError> {
        let ring = pool.allocate(slots * 4)?;
        let mut q = Self {
            ring,
            slots,
            get: 0,
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

    pub fn reset(&mut self, pool: &DmaPool) -> Result<(), DmaError> {
        for i in 0..self.slots {
            pool.write_u32(self.ring.at(i * 4), 0)?;
        }
        self.get = 0;
        Ok(())
    }

    /// Takes every posted entry, clearing each slot as it goes. Returns an
    /// empty vector when nothing is posted.
    pub fn drain(&mut self, pool: &DmaPool) -> Result<Vec<BusAddr>, DmaError> {
        let mut out = Vec::new();
        for _ in 0..self.slots {
            let at = self.ring.at(self.get * 4);
            let dsa = pool.read_u32(at)?;
            if dsa == 0 {
                break;
            }
            pool.write_u32(at, 0)?;
            out.push(BusAddr(dsa));
            self.get = (self.get + 1) % self.slots;
        }
        Ok(out)
    }
}
