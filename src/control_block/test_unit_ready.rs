// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub const TEST_UNIT_READY: u8 = 0x00;

/// Builds TEST UNIT READY (6) and returns the CDB length.
#[inline]
pub fn build_test_unit_ready(cdb: &mut [u8; 16], control: u8) -> usize {
    cdb.fill(0);
    cdb[0] = TEST_UNIT_READY;
    cdb[5] = control;
    6
}
