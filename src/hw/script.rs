// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

/// Logical SCRIPTS entry points. The core only ever steers the sequencer to
/// one of these; the encoding is what lands in DSP and in CCB headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptEntry {
    Init,
    /// Idle loop fetching the next start-queue entry.
    Start,
    /// Waiting for selection to complete.
    SelDone,
    /// Phase dispatcher of a connected nexus.
    Dispatch,
    Clrack,
    SendIdent,
    SendSdtr,
    SendWdtr,
    SendPpr,
    SdtrResp,
    WdtrResp,
    PprResp,
    MsgBad,
    MsgWeird,
    NegoBadPhase,
    IdentBreak,
    IdentBreakAtn,
    /// Report the CCB in DSA as completed with an error.
    CompleteError,
    SelForAbort,
    AbortResel,
    ReselGo,
    /// Resume a data phase from the phase-mismatch save area.
    PmHandle,
    /// Move the wide residue byte, then resume.
    WsrMaHelper,
    SendMsgOut,
    /// Data-in move of scatter/gather entry `n`.
    DataIn(u16),
    /// Data-out move of scatter/gather entry `n`.
    DataOut(u16),
}

const DATA_IN_BASE: u32 = 0x0001_0000;
const DATA_OUT_BASE: u32 = 0x0002_0000;
const SCRIPTS_BASE: u32 = 0x0000_0100;

const FIXED: [ScriptEntry; 24] = [
    ScriptEntry::Init,
    ScriptEntry::Start,
    ScriptEntry::SelDone,
    ScriptEntry::Dispatch,
    ScriptEntry::Clrack,
    ScriptEntry::SendIdent,
    ScriptEntry::SendSdtr,
    ScriptEntry::SendWdtr,
    ScriptEntry::SendPpr,
    ScriptEntry::SdtrResp,
    ScriptEntry::WdtrResp,
    ScriptEntry::PprResp,
    ScriptEntry::MsgBad,
    ScriptEntry::MsgWeird,
    ScriptEntry::NegoBadPhase,
    ScriptEntry::IdentBreak,
    ScriptEntry::IdentBreakAtn,
    ScriptEntry::CompleteError,
    ScriptEntry::SelForAbort,
    ScriptEntry::AbortResel,
    ScriptEntry::ReselGo,
    ScriptEntry::PmHandle,
    ScriptEntry::WsrMaHelper,
    ScriptEntry::SendMsgOut,
];

impl ScriptEntry {
    pub fn encode(self) -> u32 {
        match self {
            ScriptEntry::DataIn(n) => DATA_IN_BASE | u32::from(n),
            ScriptEntry::DataOut(n) => DATA_OUT_BASE | u32::from(n),
            fixed => {
                let idx = FIXED.iter().position(|e| *e == fixed).unwrap_or(0);
                SCRIPTS_BASE + (idx as u32) * 8
            },
        }
    }

    pub fn decode(dsp: u32) -> Option<Self> {
        match dsp & 0xffff_0000 {
            DATA_IN_BASE => Some(ScriptEntry::DataIn((dsp & 0xffff) as u16)),
            DATA_OUT_BASE => Some(ScriptEntry::DataOut((dsp & 0xffff) as u16)),
            0 if dsp >= SCRIPTS_BASE && (dsp - SCRIPTS_BASE) % 8 == 0 => {
                FIXED.get(((dsp - SCRIPTS_BASE) / 8) as usize).copied()
            },
            _ => None,
        }
    }

    /// Entry points a negotiation message is sent from.
    pub fn is_nego_send(self) -> bool {
        matches!(
            self,
            ScriptEntry::SendSdtr | ScriptEntry::SendWdtr | ScriptEntry::SendPpr
        )
    }
}

/// Codes raised by an INT instruction, read back from DSPS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptInterrupt {
    BadScsiStatus = 1,
    SelAtnNoMsgOut = 2,
    MsgReceived = 3,
    MsgWeird = 4,
    NegoFailed = 5,
    NegoProto = 6,
    ScriptStopped = 7,
    RejectToSend = 8,
    SwideOverrun = 9,
    SodlUnderrun = 10,
    ReselNoMsgIn = 11,
    ReselNoIdentify = 12,
    ReselBadLun = 13,
    TargetSelected = 14,
    ReselBadItl = 15,
    ReselBadItlq = 16,
    AbortSent = 17,
    ReselAborted = 18,
    MsgOutDone = 19,
    CompleteError = 20,
    DataOverrun = 21,
    BadPhase = 22,
    DmapDirty = 23,
}

#[derive(Debug, Error)]
#[error("unknown script interrupt code {0}")]
pub struct UnknownScriptInterrupt(pub u32);

impl TryFrom<u32> for ScriptInterrupt {
    type Error = UnknownScriptInterrupt;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        use ScriptInterrupt::*;
        Ok(match code {
            1 => BadScsiStatus,
            2 => SelAtnNoMsgOut,
            3 => MsgReceived,
            4 => MsgWeird,
            5 => NegoFailed,
            6 => NegoProto,
            7 => ScriptStopped,
            8 => RejectToSend,
            9 => SwideOverrun,
            10 => SodlUnderrun,
            11 => ReselNoMsgIn,
            12 => ReselNoIdentify,
            13 => ReselBadLun,
            14 => TargetSelected,
            15 => ReselBadItl,
            16 => ReselBadItlq,
            17 => AbortSent,
            18 => ReselAborted,
            19 => MsgOutDone,
            20 => CompleteError,
            21 => DataOverrun,
            22 => BadPhase,
            23 => DmapDirty,
            other => return Err(UnknownScriptInterrupt(other)),
        })
    }
}
