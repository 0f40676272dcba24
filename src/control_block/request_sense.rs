// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! REQUEST SENSE (6), used by the automatic sense fetch after CHECK
//! CONDITION.
//!
//! CDB layout (SPC):
//!   [0] = 0x03 (REQUEST SENSE)
//!   [1] = DESC (bit 0)
//!   [4] = ALLOCATION LENGTH
//!   [5] = CONTROL

pub const REQUEST_SENSE: u8 = 0x03;
pub const REQUEST_SENSE_LEN: usize = 6;

/// Fills a REQUEST SENSE CDB into `cdb[0..6]` and returns its length.
#[inline]
pub fn fill_request_sense(cdb: &mut [u8; 16], desc: bool, allocation_len: u8) -> usize {
    cdb.fill(0);
    cdb[0] = REQUEST_SENSE;
    cdb[1] = u8::from(desc);
    cdb[4] = allocation_len;
    REQUEST_SENSE_LEN
}
