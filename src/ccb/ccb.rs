// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::Bytes;

use crate::{
    dma::{BusAddr, DmaChunk},
    hba::request::{DataDirection, PendingHandle},
    models::status::{ExtendedError, HostStatus, ScsiStatus, TagPolicy, TransportStatus},
    nego::engine::NegoKind,
};

/// Index of a CCB inside the registry arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CcbId(pub(crate) u16);

impl CcbId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Where a CCB sits in its lifecycle, as seen by the host side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CcbState {
    #[default]
    Free,
    /// Bound to a LUN but not started yet.
    Waiting,
    /// Placed on the start queue or owned by the controller.
    Started,
    /// Finished; result waiting for the host to collect it.
    Done,
}

/// Reason a CCB is flagged for abortion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AbortMark {
    #[default]
    None,
    Requested,
    TimedOut,
}

impl AbortMark {
    pub fn pending(self) -> bool {
        matches!(self, AbortMark::Requested | AbortMark::TimedOut)
    }

    pub fn transport(self) -> TransportStatus {
        match self {
            AbortMark::TimedOut => TransportStatus::TimedOut,
            _ => TransportStatus::Aborted,
        }
    }
}

/// Status of the original command kept while its sense is being fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedStatus {
    pub scsi_status: ScsiStatus,
    pub residual: u32,
    pub xerr: ExtendedError,
    pub sg_count: u8,
    pub cdb: [u8; 16],
    pub cdb_len: u8,
}

/// Host-private part of a command control block. The bus-visible header lives
/// at `ba` in DMA memory.
#[derive(Debug)]
pub struct Ccb {
    pub id: CcbId,
    pub ba: BusAddr,
    pub header: DmaChunk,
    pub sg: DmaChunk,
    pub sense: DmaChunk,

    pub state: CcbState,
    pub handle: Option<PendingHandle>,
    pub target: u8,
    pub lun: u8,
    pub tag: Option<u8>,
    pub tag_policy: TagPolicy,
    pub direction: DataDirection,
    pub data_len: u32,
    pub sg_count: u8,
    pub cdb: [u8; 16],
    pub cdb_len: u8,

    pub host_status: HostStatus,
    pub scsi_status: ScsiStatus,
    pub xerr: ExtendedError,
    pub nego_status: Option<NegoKind>,
    pub extra_bytes: u32,
    pub residual: u32,
    pub transport: TransportStatus,
    pub sense_data: Option<Bytes>,
    pub saved: Option<SavedStatus>,

    pub to_abort: AbortMark,
    pub retries: u8,
    /// Order in which the CCB was put on the start queue.
    pub start_seq: u64,
}

impl Ccb {
    pub(crate) fn new(id: CcbId, header: DmaChunk, sg: DmaChunk, sense: DmaChunk) -> Self {
        Self {
            id,
            ba: header.bus,
            header,
            sg,
            sense,
            state: CcbState::Free,
            handle: None,
            target: 0,
            lun: 0,
            tag: None,
            tag_policy: TagPolicy::Untagged,
            direction: DataDirection::None,
            data_len: 0,
            sg_count: 0,
            cdb: [0; 16],
            cdb_len: 0,
            host_status: HostStatus::Idle,
            scsi_status: ScsiStatus::Good,
            xerr: ExtendedError::empty(),
            nego_status: None,
            extra_bytes: 0,
            residual: 0,
            transport: TransportStatus::Ok,
            sense_data: None,
            saved: None,
            to_abort: AbortMark::None,
            retries: 0,
            start_seq: 0,
        }
    }

    /// Drops everything bound to the previous command, keeping the DMA
    /// chunks.
    pub(crate) fn reset(&mut self) {
        *self = Self::new(self.id, self.header, self.sg, self.sense);
    }

    pub fn in_flight(&self) -> bool {
        matches!(self.state, CcbState::Waiting | CcbState::Started)
    }

    pub fn is_sense_phase(&self) -> bool {
        self.saved.is_some()
    }
}
