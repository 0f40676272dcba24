// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use bytes::Bytes;

use crate::{
    dma::BusAddr,
    models::{
        sense_data::SenseData,
        status::{ExtendedError, ScsiStatus, TagPolicy, TransportStatus},
    },
};

/// Opaque token identifying a submitted command until its result is
/// collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PendingHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataDirection {
    #[default]
    None,
    /// Device to host.
    In,
    /// Host to device.
    Out,
}

/// One already-mapped buffer segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataSegment {
    pub addr: BusAddr,
    pub len: u32,
}

/// A SCSI command as handed to [`Hba::submit`](crate::hba::Hba::submit).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub target: u8,
    pub lun: u8,
    pub cdb: [u8; 16],
    pub cdb_len: u8,
    pub direction: DataDirection,
    pub segments: Vec<DataSegment>,
    pub tag_policy: TagPolicy,
}

impl CommandRequest {
    /// Builds a request without data. `cdb` longer than 16 bytes is cut.
    pub fn new(target: u8, lun: u8, cdb: &[u8]) -> Self {
        let mut buf = [0u8; 16];
        let n = cdb.len().min(16);
        buf[..n].copy_from_slice(&cdb[..n]);
        Self {
            target,
            lun,
            cdb: buf,
            cdb_len: n as u8,
            direction: DataDirection::None,
            segments: Vec::new(),
            tag_policy: TagPolicy::Simple,
        }
    }

    pub fn with_data(mut self, direction: DataDirection, segments: Vec<DataSegment>) -> Self {
        self.direction = direction;
        self.segments = segments;
        self
    }

    pub fn with_tag(mut self, policy: TagPolicy) -> Self {
        self.tag_policy = policy;
        self
    }

    pub fn cdb(&self) -> &[u8] {
        &self.cdb[..self.cdb_len as usize]
    }

    pub fn data_len(&self) -> u64 {
        self.segments.iter().map(|s| u64::from(s.len)).sum()
    }
}

/// What the host gets back for every submitted command, exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub handle: PendingHandle,
    pub target: u8,
    pub lun: u8,
    pub transport: TransportStatus,
    pub scsi_status: ScsiStatus,
    /// Bytes of the data buffer that were not transferred.
    pub residual: u32,
    pub xerr: ExtendedError,
    /// Sense bytes fetched after CHECK CONDITION, trimmed to what arrived.
    pub sense: Option<Bytes>,
}

impl CommandResult {
    pub fn is_good(&self) -> bool {
        self.transport.is_ok() && self.scsi_status == ScsiStatus::Good
    }

    pub fn sense_data(&self) -> Option<Result<SenseData>> {
        self.sense.as_deref().map(SenseData::parse)
    }
}
