// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use thiserror::Error;

/// Status byte returned by the target in the STATUS phase (SAM-5 § 5.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScsiStatus {
    #[default]
    Good,
    CheckCondition,
    ConditionMet,
    Busy,
    ReservationConflict,
    CommandTerminated,
    /// TASK SET FULL, historically QUEUE FULL.
    QueueFull,
    AcaActive,
    TaskAborted,
    /// Any other status codes defined in SAM-x or reserved
    Other(u8),
}

impl From<ScsiStatus> for u8 {
    fn from(s: ScsiStatus) -> Self {
        match s {
            ScsiStatus::Good => 0x00,
            ScsiStatus::CheckCondition => 0x02,
            ScsiStatus::ConditionMet => 0x04,
            ScsiStatus::Busy => 0x08,
            ScsiStatus::ReservationConflict => 0x18,
            ScsiStatus::CommandTerminated => 0x22,
            ScsiStatus::QueueFull => 0x28,
            ScsiStatus::AcaActive => 0x30,
            ScsiStatus::TaskAborted => 0x40,
            ScsiStatus::Other(b) => b,
        }
    }
}

impl From<u8> for ScsiStatus {
    fn from(b: u8) -> Self {
        match b {
            0x00 => ScsiStatus::Good,
            0x02 => ScsiStatus::CheckCondition,
            0x04 => ScsiStatus::ConditionMet,
            0x08 => ScsiStatus::Busy,
            0x18 => ScsiStatus::ReservationConflict,
            0x22 => ScsiStatus::CommandTerminated,
            0x28 => ScsiStatus::QueueFull,
            0x30 => ScsiStatus::AcaActive,
            0x40 => ScsiStatus::TaskAborted,
            other => ScsiStatus::Other(other),
        }
    }
}

impl ScsiStatus {
    /// Statuses that ask for the command to be replayed later.
    pub fn is_transient(self) -> bool {
        matches!(self, ScsiStatus::Busy | ScsiStatus::QueueFull)
    }

    /// Statuses that carry sense data worth fetching.
    pub fn wants_sense(self) -> bool {
        matches!(
            self,
            ScsiStatus::CheckCondition | ScsiStatus::CommandTerminated
        )
    }
}

/// Progress of a CCB as recorded by the SCRIPTS processor in its header.
///
/// Values with the 0x80 bit set mean the CCB is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostStatus {
    #[default]
    Idle,
    Busy,
    Negotiating,
    Disconnected,
    Wait,
    Complete,
    SelectionTimeout,
    UnexpectedDisconnect,
    CompleteError,
}

pub const HS_DONEMASK: u8 = 0x80;

#[derive(Debug, Error)]
#[error("invalid host status: 0x{0:02x}")]
pub struct UnknownHostStatus(pub u8);

impl From<HostStatus> for u8 {
    fn from(h: HostStatus) -> Self {
        match h {
            HostStatus::Idle => 0,
            HostStatus::Busy => 1,
            HostStatus::Negotiating => 2,
            HostStatus::Disconnected => 3,
            HostStatus::Wait => 4,
            HostStatus::Complete => 4 | HS_DONEMASK,
            HostStatus::SelectionTimeout => 5 | HS_DONEMASK,
            HostStatus::UnexpectedDisconnect => 6 | HS_DONEMASK,
            HostStatus::CompleteError => 7 | HS_DONEMASK,
        }
    }
}

impl TryFrom<u8> for HostStatus {
    type Error = UnknownHostStatus;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        Ok(match b {
            0 => HostStatus::Idle,
            1 => HostStatus::Busy,
            2 => HostStatus::Negotiating,
            3 => HostStatus::Disconnected,
            4 => HostStatus::Wait,
            0x84 => HostStatus::Complete,
            0x85 => HostStatus::SelectionTimeout,
            0x86 => HostStatus::UnexpectedDisconnect,
            0x87 => HostStatus::CompleteError,
            other => return Err(UnknownHostStatus(other)),
        })
    }
}

impl HostStatus {
    pub fn is_done(self) -> bool {
        u8::from(self) & HS_DONEMASK != 0
    }
}

bitflags::bitflags! {
    #[derive(Default, Clone, Copy, PartialEq, Eq)]
    /// Transfer anomalies accumulated while a CCB was connected.
    pub struct ExtendedError: u8 {
        /// target sent more data than the buffers could hold
        const EXTRA_DATA  = 0x01;
        const BAD_PHASE   = 0x02;
        const PARITY_ERR  = 0x04;
        const SODL_UNRUN  = 0x08;
        const SWIDE_OVRUN = 0x10;
    }
}

impl fmt::Debug for ExtendedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "ExtendedError(-)");
        }
        write!(f, "ExtendedError(")?;
        let mut sep = "";
        for (name, _) in self.iter_names() {
            write!(f, "{sep}{name}")?;
            sep = "|";
        }
        write!(f, ")")
    }
}

/// How the transport side of a command ended, independent of the device
/// status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportStatus {
    #[default]
    Ok,
    SelectionTimeout,
    UnexpectedDisconnect,
    /// Aborted on request of the host.
    Aborted,
    /// Aborted because the host gave up waiting.
    TimedOut,
    BusReset,
    DeviceReset,
    /// Transfer or protocol failure not covered above.
    Error,
}

impl TransportStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, TransportStatus::Ok)
    }
}

/// Tag attribute requested for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TagPolicy {
    Untagged,
    #[default]
    Simple,
    Ordered,
    HeadOfQueue,
}

impl TagPolicy {
    /// Queue tag message byte, if the policy is tagged.
    pub fn message(self) -> Option<u8> {
        use crate::models::message::{M_HEAD_TAG, M_ORDERED_TAG, M_SIMPLE_TAG};
        match self {
            TagPolicy::Untagged => None,
            TagPolicy::Simple => Some(M_SIMPLE_TAG),
            TagPolicy::Ordered => Some(M_ORDERED_TAG),
            TagPolicy::HeadOfQueue => Some(M_HEAD_TAG),
        }
    }
}
