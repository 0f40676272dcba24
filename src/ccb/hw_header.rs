// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Bus-visible part of a CCB, shared with the SCRIPTS processor.
//!
//! Everything here is little-endian and byte aligned so the layout is the
//! same on every host.

use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout,
    byteorder::{LittleEndian, U32},
};

use crate::{
    dma::{BusAddr, DmaError, DmaPool},
    models::status::{ExtendedError, HostStatus, ScsiStatus},
};

/// Longest message-out sequence: IDENTIFY, two tag bytes and a PPR.
pub const MSGOUT_MAX: usize = 12;
pub const CDB_MAX: usize = 16;

/// One scatter/gather element: byte count in the low 24 bits, then address.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SgEntry {
    pub size: U32<LittleEndian>,
    pub addr: U32<LittleEndian>,
}

pub const SG_ENTRY_LEN: usize = core::mem::size_of::<SgEntry>();
/// Largest byte count one table move can carry.
pub const SG_MAX_SEGMENT: u32 = 0x00ff_ffff;

impl SgEntry {
    pub fn new(addr: BusAddr, size: u32) -> Self {
        Self {
            size: U32::new(size & SG_MAX_SEGMENT),
            addr: U32::new(addr.0),
        }
    }

    pub fn len(&self) -> u32 {
        self.size.get() & SG_MAX_SEGMENT
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Position inside a CCB's scatter/gather table.
///
/// Encoded as `index << 24 | offset`. `index == sg_count` means every entry
/// was consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataPointer {
    pub index: u8,
    pub offset: u32,
}

impl DataPointer {
    pub fn new(index: u8, offset: u32) -> Self {
        Self {
            index,
            offset: offset & SG_MAX_SEGMENT,
        }
    }

    pub fn encode(self) -> u32 {
        (u32::from(self.index) << 24) | (self.offset & SG_MAX_SEGMENT)
    }

    pub fn decode(raw: u32) -> Self {
        Self {
            index: (raw >> 24) as u8,
            offset: raw & SG_MAX_SEGMENT,
        }
    }
}

/// Header the SCRIPTS processor reads when it selects a CCB and updates while
/// the nexus is connected.
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct CcbHeader {
    /// Encoded entry point the sequencer jumps to after selection.
    pub start: U32<LittleEndian>,
    /// Saved data pointer (SAVE DATA POINTER).
    pub savep: U32<LittleEndian>,
    /// Data pointer reached so far.
    pub lastp: U32<LittleEndian>,
    /// Data pointer value once every byte moved.
    pub goalp: U32<LittleEndian>,
    pub sg_ba: U32<LittleEndian>,
    pub sense_ba: U32<LittleEndian>,
    /// Bytes the target offered beyond the end of the buffers.
    pub extra_bytes: U32<LittleEndian>,
    // phase mismatch save area
    pub pm_addr: U32<LittleEndian>,
    pub pm_size: U32<LittleEndian>,
    pub pm_ret: U32<LittleEndian>,
    // wide residue byte
    pub wresid_addr: U32<LittleEndian>,
    pub wresid_size: U32<LittleEndian>,
    pub host_status: u8,
    pub scsi_status: u8,
    pub xerr_status: u8,
    pub nego_status: u8,
    pub sel_id: u8,
    pub sel_scntl3: u8,
    pub sel_sxfer: u8,
    pub sel_scntl4: u8,
    pub msgout_len: u8,
    pub cdb_len: u8,
    pub sg_count: u8,
    pub _rsvd: u8,
    pub msgout: [u8; MSGOUT_MAX],
    pub cdb: [u8; CDB_MAX],
}

pub const CCB_HEADER_LEN: usize = core::mem::size_of::<CcbHeader>();
/// DMA chunk reserved per header; also the shift of the lookup hash.
pub const CCB_CHUNK: usize = 128;
const _: () = assert!(CCB_HEADER_LEN <= CCB_CHUNK);

impl CcbHeader {
    pub fn load(pool: &DmaPool, ba: BusAddr) -> Result<Self, DmaError> {
        let mut buf = [0u8; CCB_HEADER_LEN];
        pool.read(ba, &mut buf)?;
        Self::read_from_bytes(&buf).map_err(|_| DmaError::OutOfBounds {
            addr: ba,
            len: CCB_HEADER_LEN,
        })
    }

    pub fn store(&self, pool: &DmaPool, ba: BusAddr) -> Result<(), DmaError> {
        pool.write(ba, self.as_bytes())
    }

    pub fn host(&self) -> Option<HostStatus> {
        HostStatus::try_from(self.host_status).ok()
    }

    pub fn status(&self) -> ScsiStatus {
        ScsiStatus::from(self.scsi_status)
    }

    pub fn xerr(&self) -> ExtendedError {
        ExtendedError::from_bits_truncate(self.xerr_status)
    }

    pub fn msgout(&self) -> &[u8] {
        &self.msgout[..(self.msgout_len as usize).min(MSGOUT_MAX)]
    }

    pub fn set_msgout(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(MSGOUT_MAX);
        self.msgout = [0; MSGOUT_MAX];
        self.msgout[..n].copy_from_slice(&bytes[..n]);
        self.msgout_len = n as u8;
    }
}

/// Reads entry `index` of the scatter/gather table at `sg_ba`.
pub fn load_sg(pool: &DmaPool, sg_ba: BusAddr, index: u8) -> Result<SgEntry, DmaError> {
    let mut buf = [0u8; SG_ENTRY_LEN];
    let at = sg_ba.offset(u32::from(index) * SG_ENTRY_LEN as u32);
    pool.read(at, &mut buf)?;
    SgEntry::read_from_bytes(&buf).map_err(|_| DmaError::OutOfBounds {
        addr: at,
        len: SG_ENTRY_LEN,
    })
}

pub fn store_sg(pool: &DmaPool, sg_ba: BusAddr, entries: &[SgEntry]) -> Result<(), DmaError> {
    pool.write(sg_ba, entries.as_bytes())
}

/// Bytes still to move from `pointer` to the end of the table.
pub fn residual_from(pool: &DmaPool, sg_ba: BusAddr, sg_count: u8, pointer: DataPointer) -> Result<u32, DmaError> {
    if pointer.index >= sg_count {
        return Ok(0);
    }
    let first = load_sg(pool, sg_ba, pointer.index)?;
    let mut resid = first.len().saturating_sub(pointer.offset);
    for i in pointer.index + 1..sg_count {
        resid += load_sg(pool, sg_ba, i)?.len();
    }
    Ok(resid)
}

/// Byte position in the whole buffer that `pointer` stands for.
pub fn position_of(pool: &DmaPool, sg_ba: BusAddr, pointer: DataPointer) -> Result<u32, DmaError> {
    let mut pos = pointer.offset;
    for i in 0..pointer.index {
        pos += load_sg(pool, sg_ba, i)?.len();
    }
    Ok(pos)
}

/// Data pointer for byte `pos` of the buffer, `None` past its end.
pub fn pointer_at(pool: &DmaPool, sg_ba: BusAddr, sg_count: u8, pos: u32) -> Result<Option<DataPointer>, DmaError> {
    let mut left = pos;
    for i in 0..sg_count {
        let len = load_sg(pool, sg_ba, i)?.len();
        if left < len {
            return Ok(Some(DataPointer::new(i, left)));
        }
        left -= len;
    }
    Ok((left == 0).then(|| DataPointer::new(sg_count, 0)))
}
