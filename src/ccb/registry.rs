// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::{
    ccb::{
        ccb::{Ccb, CcbId, CcbState},
        hw_header::{CCB_CHUNK, SG_ENTRY_LEN},
    },
    dma::{BusAddr, DmaPool},
    hba::error::HbaError,
};

pub const CCB_HASH_SHIFT: u32 = 6;
pub const CCB_HASH_SIZE: usize = 1 << CCB_HASH_SHIFT;
const CCB_HASH_MASK: u32 = (CCB_HASH_SIZE as u32) - 1;

#[inline]
fn hash_code(ba: BusAddr) -> usize {
    ((ba.0 >> CCB_CHUNK.trailing_zeros()) & CCB_HASH_MASK) as usize
}

/// Arena of CCBs with a free list, an ordered busy list and a hash from the
/// header bus address back to the CCB.
///
/// Only CCBs that are handed out are present in the hash, so a lookup of a
/// stale address after release misses.
#[derive(Debug)]
pub struct CcbRegistry {
    ccbs: Vec<Ccb>,
    free: VecDeque<CcbId>,
    busy: Vec<CcbId>,
    hash: Vec<Vec<CcbId>>,
    max_ccbs: usize,
    max_sg: usize,
    sense_len: usize,
}

impl CcbRegistry {
    pub fn new(max_ccbs: usize, max_sg: usize, sense_len: usize) -> Self {
        Self {
            ccbs: Vec::with_capacity(max_ccbs),
            free: VecDeque::with_capacity(max_ccbs),
            busy: Vec::with_capacity(max_ccbs),
            hash: vec![Vec::new(); CCB_HASH_SIZE],
            max_ccbs,
            max_sg,
            sense_len,
        }
    }

    /// Creates CCBs up front until `count` exist.
    pub fn prealloc(&mut self, pool: &DmaPool, count: usize) -> Result<(), HbaError> {
        while self.ccbs.len() < count.min(self.max_ccbs) {
            let id = self.create(pool)?;
            self.free.push_back(id);
        }
        Ok(())
    }

    fn create(&mut self, pool: &DmaPool) -> Result<CcbId, HbaError> {
        let id = CcbId(self.ccbs.len() as u16);
        let header = pool.allocate(CCB_CHUNK)?;
        let sg = match pool.allocate(self.max_sg * SG_ENTRY_LEN) {
            Ok(c) => c,
            Err(e) => {
                let _ = pool.free(header);
                return Err(e.into());
            },
        };
        let sense = match pool.allocate(self.sense_len) {
            Ok(c) => c,
            Err(e) => {
                let _ = pool.free(header);
                let _ = pool.free(sg);
                return Err(e.into());
            },
        };
        debug!(ccb = id.0, ba = %header.bus, "created ccb");
        self.ccbs.push(Ccb::new(id, header, sg, sense));
        Ok(id)
    }

    /// Takes a CCB off the free list, creating one when the list is empty and
    /// the ceiling allows. The CCB is moved to the busy list and hashed.
    pub fn alloc(&mut self, pool: &DmaPool) -> Result<CcbId, HbaError> {
        let id = match self.free.pop_front() {
            Some(id) => id,
            None if self.ccbs.len() < self.max_ccbs => self.create(pool)?,
            None => return Err(HbaError::Busy),
        };
        let ccb = &mut self.ccbs[id.index()];
        ccb.state = CcbState::Waiting;
        let ba = ccb.ba;
        self.busy.push(id);
        self.hash[hash_code(ba)].push(id);
        Ok(id)
    }

    /// Returns a CCB to the free list. Releasing a CCB that is already free
    /// is refused.
    pub fn release(&mut self, id: CcbId) -> Result<(), HbaError> {
        let Some(ccb) = self.ccbs.get_mut(id.index()) else {
            return Err(HbaError::UnknownCcb);
        };
        if ccb.state == CcbState::Free {
            warn!(ccb = id.0, "release of a free ccb");
            return Err(HbaError::UnknownCcb);
        }
        let ba = ccb.ba;
        ccb.reset();
        self.busy.retain(|&b| b != id);
        self.hash[hash_code(ba)].retain(|&b| b != id);
        self.free.push_back(id);
        Ok(())
    }

    /// Maps a bus address reported by the controller back to a live CCB.
    pub fn lookup(&self, ba: BusAddr) -> Option<CcbId> {
        self.hash[hash_code(ba)]
            .iter()
            .copied()
            .find(|id| self.ccbs[id.index()].ba == ba)
    }

    pub fn get(&self, id: CcbId) -> &Ccb {
        &self.ccbs[id.index()]
    }

    pub fn get_mut(&mut self, id: CcbId) -> &mut Ccb {
        &mut self.ccbs[id.index()]
    }

    /// Busy CCBs in the order they were handed out.
    pub fn busy(&self) -> &[CcbId] {
        &self.busy
    }

    pub fn busy_snapshot(&self) -> Vec<CcbId> {
        self.busy.clone()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// CCBs that could still be handed out, created or not.
    pub fn available(&self) -> usize {
        self.free.len() + (self.max_ccbs - self.ccbs.len())
    }

    pub fn total(&self) -> usize {
        self.ccbs.len()
    }

    /// Gives every DMA chunk back to the pool.
    pub fn destroy(&mut self, pool: &DmaPool) {
        for ccb in self.ccbs.drain(..) {
            for chunk in [ccb.header, ccb.sg, ccb.sense] {
                if let Err(e) = pool.free(chunk) {
                    warn!(error = %e, "failed to release ccb memory");
                }
            }
        }
        self.free.clear();
        self.busy.clear();
        self.hash.iter_mut().for_each(Vec::clear);
    }
}
