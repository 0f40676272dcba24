//! Bus-addressable memory used for every structure the SCRIPTS processor
//! reads or writes.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

/// Power-of-two chunk pool carved out of mapped pages.
pub mod pool;

pub use pool::{DmaChunk, DmaPool, LinearPages, PAGE_SIZE, PageProvider};

/// 32-bit address as seen by the controller on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BusAddr(pub u32);

impl BusAddr {
    #[inline]
    pub fn offset(self, bytes: u32) -> Self {
        BusAddr(self.0.wrapping_add(bytes))
    }
}

impl fmt::Display for BusAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl From<BusAddr> for u32 {
    fn from(b: BusAddr) -> Self {
        b.0
    }
}

/// Errors reported by the DMA pool.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DmaError {
    #[error("no page could be mapped for a {0}-byte chunk")]
    OutOfMemory(usize),
    #[error("requested {0} bytes, larger than one page")]
    TooLarge(usize),
    #[error("chunk {0} is not allocated from this pool")]
    UnknownChunk(BusAddr),
    #[error("access of {len} bytes at {addr} is outside any mapped page")]
    OutOfBounds { addr: BusAddr, len: usize },
}
