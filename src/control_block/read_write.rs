// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Builds READ(10): opcode 0x28, LBA in bytes 2..6, block count in 7..9.
/// `flags` keeps RDPROTECT/DPO/FUA only. Returns the CDB length.
#[inline]
pub fn build_read10(cdb: &mut [u8; 16], lba: u32, blocks: u16, flags: u8) -> usize {
    cdb.fill(0);
    cdb[0] = 0x28;
    cdb[1] = flags & 0b1111_1000;
    cdb[2..6].copy_from_slice(&lba.to_be_bytes());
    cdb[7..9].copy_from_slice(&blocks.to_be_bytes());
    10
}

/// Builds WRITE(10), opcode 0x2a, same layout as READ(10).
#[inline]
pub fn build_write10(cdb: &mut [u8; 16], lba: u32, blocks: u16, flags: u8) -> usize {
    cdb.fill(0);
    cdb[0] = 0x2a;
    cdb[1] = flags & 0b1111_1010;
    cdb[2..6].copy_from_slice(&lba.to_be_bytes());
    cdb[7..9].copy_from_slice(&blocks.to_be_bytes());
    10
}
