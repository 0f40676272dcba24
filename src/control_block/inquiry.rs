// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! INQUIRY (6).
//!
//!   [0] = 0x12
//!   [1] = EVPD (bit 0)
//!   [2] = Page Code
//!   [3..4] = Allocation Length (big-endian)
//!   [5] = Control

pub const INQUIRY: u8 = 0x12;

/// Standard INQUIRY (EVPD=0). Returns the CDB length.
#[inline]
pub fn fill_inquiry_standard(cdb: &mut [u8; 16], allocation_len: u16) -> usize {
    fill_inquiry(cdb, None, allocation_len)
}

/// INQUIRY for a VPD page when `page` is set.
#[inline]
pub fn fill_inquiry(cdb: &mut [u8; 16], page: Option<u8>, allocation_len: u16) -> usize {
    cdb.fill(0);
    cdb[0] = INQUIRY;
    if let Some(p) = page {
        cdb[1] = 0x01;
        cdb[2] = p;
    }
    cdb[3..5].copy_from_slice(&allocation_len.to_be_bytes());
    6
}

/// Peripheral qualifier/device type and vendor strings of standard INQUIRY
/// data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InquirySummary {
    pub peripheral_qualifier: u8,
    pub device_type: u8,
    pub wide16: bool,
    pub sync: bool,
    pub cmd_queue: bool,
    pub vendor: String,
    pub product: String,
}

/// Parses the first 36 bytes of standard INQUIRY data.
pub fn parse_inquiry_summary(buf: &[u8]) -> anyhow::Result<InquirySummary> {
    anyhow::ensure!(buf.len() >= 36, "inquiry data too short: {}", buf.len());
    let text = |r: std::ops::Range<usize>| String::from_utf8_lossy(&buf[r]).trim_end().to_string();
    Ok(InquirySummary {
        peripheral_qualifier: buf[0] >> 5,
        device_type: buf[0] & 0x1f,
        wide16: buf[7] & 0x20 != 0,
        sync: buf[7] & 0x10 != 0,
        cmd_queue: buf[7] & 0x02 != 0,
        vendor: text(8..16),
        product: text(16..32),
    })
}
