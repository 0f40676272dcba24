// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

/// Logical register names. A concrete controller maps them to its own
/// offsets; the core never touches raw addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    /// Interrupt status; also the doorbell (SIGP) and semaphore (SEM).
    Istat,
    /// SCSI control 1: connected flag and bus reset assertion.
    Scntl1,
    /// SCSI control 2: wide receive residue flag.
    Scntl2,
    /// Clock conversion, wide enable and ultra enable.
    Scntl3,
    /// Ultra3 extended clocking (C10 family only).
    Scntl4,
    /// Synchronous transfer offset and period factor.
    Sxfer,
    /// Destination id of the last selection / reselection.
    Sdid,
    /// Bus control lines: current phase in the low three bits.
    Sbcl,
    Sstat0,
    Sstat1,
    Sstat2,
    /// Data structure address: bus address of the current CCB.
    Dsa,
    /// Script instruction pointer.
    Dsp,
    /// Script interrupt code latched by an INT instruction.
    Dsps,
    /// Byte count of the interrupted move in the low 24 bits, opcode above.
    Dbc,
    /// DMA FIFO byte counter.
    Dfifo,
    /// Scratch register carrying the overrun byte count.
    Scratcha,
    /// Base of the start queue ring.
    SqueueBa,
    /// Base of the done queue ring.
    DqueueBa,
    /// Number of entries in both rings.
    QueueSlots,
    /// Hardware consumer index into the start queue.
    SqueueGet,
    /// Bus address of the idle task.
    IdleBa,
    /// Bus address of the host control area (message buffers).
    HcbBa,
}

bitflags::bitflags! {
    #[derive(Default, Clone, Copy, PartialEq, Eq)]
    /// ISTAT: interrupt status and host signalling.
    pub struct Istat: u8 {
        const ABRT = 0x80;
        const SRST = 0x40;
        const SIGP = 0x20;
        const SEM  = 0x10;
        const CON  = 0x08;
        /// interrupt on the fly: done queue has entries
        const INTF = 0x04;
        const SIP  = 0x02;
        const DIP  = 0x01;
    }
}

bitflags::bitflags! {
    #[derive(Default, Clone, Copy, PartialEq, Eq)]
    /// SIST0 in the low byte, SIST1 in the high byte.
    pub struct Sist: u16 {
        const PAR  = 0x0001;
        const RST  = 0x0002;
        const UDC  = 0x0004;
        const SGE  = 0x0008;
        const RSL  = 0x0010;
        const SEL  = 0x0020;
        const CMP  = 0x0040;
        const MA   = 0x0080;
        const HTH  = 0x0100;
        const GEN  = 0x0200;
        const STO  = 0x0400;
        const SBMC = 0x1000;
    }
}

bitflags::bitflags! {
    #[derive(Default, Clone, Copy, PartialEq, Eq)]
    pub struct Dstat: u8 {
        const DFE  = 0x80;
        const MDPE = 0x40;
        const BF   = 0x20;
        const ABRT = 0x10;
        const SSI  = 0x08;
        const SIR  = 0x04;
        const IID  = 0x01;
    }
}

macro_rules! flag_names {
    ($ty:ident, $f:ident, $self:ident, [$($flag:ident),* $(,)?]) => {{
        write!($f, concat!(stringify!($ty), "("))?;
        let mut sep = "";
        $(
            if $self.contains($ty::$flag) {
                write!($f, concat!("{}", stringify!($flag)), sep)?;
                sep = "|";
            }
        )*
        let _ = sep;
        write!($f, ")")
    }};
}

impl fmt::Debug for Istat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        flag_names!(Istat, f, self, [ABRT, SRST, SIGP, SEM, CON, INTF, SIP, DIP])
    }
}

impl fmt::Debug for Sist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        flag_names!(Sist, f, self, [
            PAR, RST, UDC, SGE, RSL, SEL, CMP, MA, HTH, GEN, STO, SBMC
        ])
    }
}

impl fmt::Debug for Dstat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        flag_names!(Dstat, f, self, [DFE, MDPE, BF, ABRT, SSI, SIR, IID])
    }
}

/// Fatal SCSI interrupt sources: any of these routes to the slow path.
pub const SIST_FATAL: Sist = Sist::STO
    .union(Sist::GEN)
    .union(Sist::HTH)
    .union(Sist::SGE)
    .union(Sist::UDC)
    .union(Sist::SBMC)
    .union(Sist::RST);

/// DMA faults that force a reset.
pub const DSTAT_FATAL: Dstat = Dstat::MDPE
    .union(Dstat::BF)
    .union(Dstat::ABRT)
    .union(Dstat::IID);

// SCNTL1
pub const SCNTL1_CRST: u8 = 0x08;
pub const SCNTL1_ISCON: u8 = 0x10;
// SCNTL2
pub const SCNTL2_WSR: u8 = 0x01;
// SCNTL3
pub const SCNTL3_ULTRA: u8 = 0x80;
pub const SCNTL3_EWS: u8 = 0x08;
// SCNTL4 (C10)
pub const SCNTL4_U3EN: u8 = 0x80;
pub const SCNTL4_AIPCKEN: u8 = 0x40;
pub const SCNTL4_XCLKH_DT: u8 = 0x08;
pub const SCNTL4_XCLKH_ST: u8 = 0x04;
pub const SCNTL4_XCLKS_DT: u8 = 0x02;
pub const SCNTL4_XCLKS_ST: u8 = 0x01;
// SSTAT0 / SSTAT2 latch bits
pub const SSTAT_ILF: u8 = 0x80;
pub const SSTAT_ORF: u8 = 0x40;
pub const SSTAT_OLF: u8 = 0x20;

/// Snapshot returned by one read of the interrupt status registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterruptStatus {
    pub istat: Istat,
    pub sist: Sist,
    pub dstat: Dstat,
}

impl InterruptStatus {
    pub fn pending(&self) -> bool {
        self.istat.intersects(Istat::SIP | Istat::DIP)
    }
}

/// Information transfer phase encoded by the MSG, C/D and I/O lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusPhase {
    DataOut = 0,
    DataIn = 1,
    Command = 2,
    Status = 3,
    DtDataOut = 4,
    DtDataIn = 5,
    MsgOut = 6,
    MsgIn = 7,
}

impl BusPhase {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 7 {
            0 => BusPhase::DataOut,
            1 => BusPhase::DataIn,
            2 => BusPhase::Command,
            3 => BusPhase::Status,
            4 => BusPhase::DtDataOut,
            5 => BusPhase::DtDataIn,
            6 => BusPhase::MsgOut,
            _ => BusPhase::MsgIn,
        }
    }

    #[inline]
    pub fn is_input(self) -> bool {
        (self as u8) & 1 == 1
    }

    #[inline]
    pub fn is_data(self) -> bool {
        matches!(
            self,
            BusPhase::DataIn | BusPhase::DataOut | BusPhase::DtDataIn | BusPhase::DtDataOut
        )
    }
}
