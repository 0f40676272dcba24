// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt;

use anyhow::{Context, Result, anyhow, bail};

/// Fixed format sense data is at least 18 bytes.
pub const FIXED_MIN_LEN: usize = 18;
/// Descriptor format header size.
pub const DESC_HEADER_LEN: usize = 8;

/// Sense keys (SPC-4 Table 54).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenseKey {
    NoSense,
    RecoveredError,
    NotReady,
    MediumError,
    HardwareError,
    IllegalRequest,
    UnitAttention,
    DataProtect,
    BlankCheck,
    VendorSpecific,
    CopyAborted,
    AbortedCommand,
    VolumeOverflow,
    Miscompare,
    Reserved(u8),
}

impl From<u8> for SenseKey {
    fn from(k: u8) -> Self {
        match k & 0x0f {
            0x0 => SenseKey::NoSense,
            0x1 => SenseKey::RecoveredError,
            0x2 => SenseKey::NotReady,
            0x3 => SenseKey::MediumError,
            0x4 => SenseKey::HardwareError,
            0x5 => SenseKey::IllegalRequest,
            0x6 => SenseKey::UnitAttention,
            0x7 => SenseKey::DataProtect,
            0x8 => SenseKey::BlankCheck,
            0x9 => SenseKey::VendorSpecific,
            0xa => SenseKey::CopyAborted,
            0xb => SenseKey::AbortedCommand,
            0xd => SenseKey::VolumeOverflow,
            0xe => SenseKey::Miscompare,
            other => SenseKey::Reserved(other),
        }
    }
}

/// Sense data fetched by the automatic REQUEST SENSE, either format.
#[derive(Default, PartialEq, Clone)]
pub struct SenseData {
    pub valid: bool,
    pub response_code: u8,
    pub sense_key: u8,
    pub ili: bool,
    pub eom: bool,
    pub filemark: bool,
    pub information: u64,
    pub additional_len: u8,
    pub cmd_specific: u32,
    pub asc: u8,
    pub ascq: u8,
}

impl SenseData {
    /// Parses fixed (0x70/0x71) or descriptor (0x72/0x73) format sense data.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let first = *buf.first().context("empty sense buffer")?;
        match first & 0x7f {
            0x70 | 0x71 => Self::parse_fixed(buf),
            0x72 | 0x73 => Self::parse_descriptor(buf),
            other => bail!("unsupported sense response code {other:#04x}"),
        }
    }

    fn parse_fixed(buf: &[u8]) -> Result<Self> {
        if buf.len() < FIXED_MIN_LEN {
            return Err(anyhow!(
                "sense buffer too small: {} < {FIXED_MIN_LEN}",
                buf.len()
            ));
        }

        let information = u32::from_be_bytes(
            buf[3..7]
                .try_into()
                .context("failed to read Information field (bytes 3..6)")?,
        );
        let cmd_specific = u32::from_be_bytes(
            buf[8..12]
                .try_into()
                .context("failed to read Cmd-specific field (bytes 8..11)")?,
        );

        Ok(Self {
            valid: buf[0] & 0x80 != 0,
            response_code: buf[0] & 0x7f,
            filemark: buf[2] & 0x80 != 0,
            eom: buf[2] & 0x40 != 0,
            ili: buf[2] & 0x20 != 0,
            sense_key: buf[2] & 0x0f,
            information: u64::from(information),
            additional_len: buf[7],
            cmd_specific,
            asc: buf[12],
            ascq: buf[13],
        })
    }

    fn parse_descriptor(buf: &[u8]) -> Result<Self> {
        if buf.len() < DESC_HEADER_LEN {
            bail!(
                "descriptor sense too small: {} < {DESC_HEADER_LEN}",
                buf.len()
            );
        }
        let mut s = Self {
            response_code: buf[0] & 0x7f,
            sense_key: buf[1] & 0x0f,
            asc: buf[2],
            ascq: buf[3],
            additional_len: buf[7],
            ..Default::default()
        };

        // walk descriptors looking for Information (0x00)
        let end = (DESC_HEADER_LEN + s.additional_len as usize).min(buf.len());
        let mut at = DESC_HEADER_LEN;
        while at + 2 <= end {
            let (kind, len) = (buf[at], buf[at + 1] as usize);
            if kind == 0x00 && len >= 0x0a && at + 12 <= end {
                s.valid = buf[at + 2] & 0x80 != 0;
                s.information = u64::from_be_bytes(
                    buf[at + 4..at + 12]
                        .try_into()
                        .context("failed to read Information descriptor")?,
                );
            }
            at += 2 + len;
        }
        Ok(s)
    }

    pub fn key(&self) -> SenseKey {
        SenseKey::from(self.sense_key)
    }

    /// UNIT ATTENTION after a reset or power on (ASC 0x29).
    pub fn is_reset_attention(&self) -> bool {
        self.key() == SenseKey::UnitAttention && self.asc == 0x29
    }
}

impl fmt::Debug for SenseData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SenseData")
            .field("valid", &self.valid)
            .field(
                "response_code",
                &format_args!("{:#04x}", self.response_code),
            )
            .field("sense_key", &self.key())
            .field("filemark", &self.filemark)
            .field("eom", &self.eom)
            .field("ili", &self.ili)
            .field("information", &self.information)
            .field("asc", &format_args!("{:#04x}", self.asc))
            .field("ascq", &format_args!("{:#04x}", self.ascq))
            .field("description", &asc_ascq_to_str(self.asc, self.ascq))
            .finish()
    }
}

/// SPC-4 description for an ASC/ASCQ pair, or a generic fallback.
#[inline]
pub fn asc_ascq_to_str(asc: u8, ascq: u8) -> &'static str {
    known_pairs(asc, ascq).unwrap_or("UNSPECIFIED / vendor specific")
}

fn known_pairs(asc: u8, ascq: u8) -> Option<&'static str> {
    Some(match (asc, ascq) {
        (0x00, 0x00) => "No additional sense information",
        (0x04, 0x01) => "Logical unit is in process of becoming ready",
        (0x04, 0x02) => "Logical unit not ready, initializing command required",
        (0x11, 0x00) => "Unrecovered read error",
        (0x20, 0x00) => "Invalid command operation code",
        (0x24, 0x00) => "Invalid field in CDB",
        (0x25, 0x00) => "Logical unit not supported",
        (0x28, 0x00) => "Not ready to ready change, medium may have changed",
        (0x29, 0x00) => "Power on, reset, or bus device reset occurred",
        (0x29, 0x02) => "SCSI bus reset occurred",
        (0x29, 0x03) => "Bus device reset function occurred",
        (0x2a, 0x01) => "Mode parameters changed",
        (0x3a, 0x00) => "Medium not present",
        (0x47, 0x00) => "SCSI parity error",
        (0x48, 0x00) => "Initiator detected error message received",
        (0x4e, 0x00) => "Overlapped commands attempted",
        _ => return None,
    })
}
