// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

pub const M_COMPLETE: u8 = 0x00;
pub const M_EXTENDED: u8 = 0x01;
pub const M_SAVE_DP: u8 = 0x02;
pub const M_RESTORE_DP: u8 = 0x03;
pub const M_DISCONNECT: u8 = 0x04;
pub const M_ID_ERROR: u8 = 0x05;
pub const M_ABORT: u8 = 0x06;
pub const M_REJECT: u8 = 0x07;
pub const M_NOOP: u8 = 0x08;
pub const M_PARITY: u8 = 0x09;
pub const M_RESET: u8 = 0x0c;
pub const M_ABORT_TAG: u8 = 0x0d;
pub const M_CLEAR_QUEUE: u8 = 0x0e;
pub const M_SIMPLE_TAG: u8 = 0x20;
pub const M_HEAD_TAG: u8 = 0x21;
pub const M_ORDERED_TAG: u8 = 0x22;
pub const M_IGN_RESIDUE: u8 = 0x23;
pub const M_IDENTIFY: u8 = 0x80;

pub const M_X_MODIFY_DP: u8 = 0x00;
pub const M_X_SYNC_REQ: u8 = 0x01;
pub const M_X_WIDE_REQ: u8 = 0x03;
pub const M_X_PPR_REQ: u8 = 0x04;

/// Identify bit granting the target the right to disconnect.
pub const IDENTIFY_DISC_PRIV: u8 = 0x40;

bitflags::bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    /// Protocol options byte of a PPR message.
    pub struct PprOptions: u8 {
        const IU  = 0x01;
        const DT  = 0x02;
        const QAS = 0x04;
    }
}

#[inline]
pub fn identify(lun: u8, disconnect: bool) -> u8 {
    let mut m = M_IDENTIFY | (lun & 0x3f);
    if disconnect {
        m |= IDENTIFY_DISC_PRIV;
    }
    m
}

/// Tag byte sent after a queue tag message. Odd values keep zero free for
/// "no tag" in the reselection tables.
#[inline]
pub fn tag_number(tag: u8) -> u8 {
    tag.wrapping_mul(2).wrapping_add(1)
}

#[inline]
pub fn tag_from_number(n: u8) -> Option<u8> {
    (n & 1 == 1).then_some(n >> 1)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("message truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("not an extended message (first byte 0x{0:02x})")]
    NotExtended(u8),
    #[error("unsupported extended message code 0x{0:02x}")]
    UnknownExtended(u8),
    #[error("extended message 0x{code:02x} has length {len}")]
    BadLength { code: u8, len: u8 },
}

/// Extended messages the engine sends or understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendedMessage {
    Sync { period: u8, offset: u8 },
    /// `width` is the exponent: 0 narrow, 1 wide (16 bit).
    Wide { width: u8 },
    Ppr {
        period: u8,
        offset: u8,
        width: u8,
        options: PprOptions,
    },
    ModifyDataPointer(i32),
}

impl ExtendedMessage {
    fn code_and_len(&self) -> (u8, u8) {
        match self {
            ExtendedMessage::Sync { .. } => (M_X_SYNC_REQ, 3),
            ExtendedMessage::Wide { .. } => (M_X_WIDE_REQ, 2),
            ExtendedMessage::Ppr { .. } => (M_X_PPR_REQ, 6),
            ExtendedMessage::ModifyDataPointer(_) => (M_X_MODIFY_DP, 5),
        }
    }

    /// Full encoded size, including the leading EXTENDED byte.
    pub fn wire_len(&self) -> usize {
        self.code_and_len().1 as usize + 2
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let (code, len) = self.code_and_len();
        out.extend_from_slice(&[M_EXTENDED, len, code]);
        match *self {
            ExtendedMessage::Sync { period, offset } => out.extend_from_slice(&[period, offset]),
            ExtendedMessage::Wide { width } => out.push(width),
            ExtendedMessage::Ppr {
                period,
                offset,
                width,
                options,
            } => out.extend_from_slice(&[period, 0, offset, width, options.bits()]),
            ExtendedMessage::ModifyDataPointer(arg) => {
                out.extend_from_slice(&arg.to_be_bytes())
            },
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(self.wire_len());
        self.encode_into(&mut v);
        v
    }

    pub fn parse(buf: &[u8]) -> Result<Self, MessageError> {
        let first = *buf.first().ok_or(MessageError::Truncated { need: 1, have: 0 })?;
        if first != M_EXTENDED {
            return Err(MessageError::NotExtended(first));
        }
        if buf.len() < 3 {
            return Err(MessageError::Truncated {
                need: 3,
                have: buf.len(),
            });
        }
        let (len, code) = (buf[1], buf[2]);
        let need = len as usize + 2;
        if buf.len() < need {
            return Err(MessageError::Truncated {
                need,
                have: buf.len(),
            });
        }
        let body = &buf[3..need];
        let expect = match code {
            M_X_SYNC_REQ => 3,
            M_X_WIDE_REQ => 2,
            M_X_PPR_REQ => 6,
            M_X_MODIFY_DP => 5,
            other => return Err(MessageError::UnknownExtended(other)),
        };
        if len != expect {
            return Err(MessageError::BadLength { code, len });
        }
        Ok(match code {
            M_X_SYNC_REQ => ExtendedMessage::Sync {
                period: body[0],
                offset: body[1],
            },
            M_X_WIDE_REQ => ExtendedMessage::Wide { width: body[0] },
            M_X_PPR_REQ => ExtendedMessage::Ppr {
                period: body[0],
                offset: body[2],
                width: body[3],
                options: PprOptions::from_bits_truncate(body[4]),
            },
            _ => ExtendedMessage::ModifyDataPointer(i32::from_be_bytes([
                body[0], body[1], body[2], body[3],
            ])),
        })
    }
}

/// Message-out bytes opening a task: IDENTIFY then the optional queue tag.
pub fn task_prologue(lun: u8, disconnect: bool, tag: Option<(u8, u8)>) -> Vec<u8> {
    let mut out = Vec::with_capacity(3);
    out.push(identify(lun, disconnect || tag.is_some()));
    if let Some((msg, tag)) = tag {
        out.extend_from_slice(&[msg, tag_number(tag)]);
    }
    out
}
