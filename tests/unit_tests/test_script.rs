// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::HashSet;

use sym53c8xx_rs::{
    hw::{
        regs::{BusPhase, Dstat, Sist},
        script::{ScriptEntry, ScriptInterrupt},
    },
    recovery::{InterruptCause, classify},
};

const FIXED: [ScriptEntry; 8] = [
    ScriptEntry::Init,
    ScriptEntry::Start,
    ScriptEntry::SelDone,
    ScriptEntry::SendPpr,
    ScriptEntry::CompleteError,
    ScriptEntry::SelForAbort,
    ScriptEntry::PmHandle,
    ScriptEntry::SendMsgOut,
];

#[test]
fn entry_addresses_are_distinct_and_decode() {
    let mut seen = HashSet::new();
    for e in FIXED {
        let dsp = e.encode();
        assert!(seen.insert(dsp), "{e:?} shares address {dsp:#x}");
        assert_eq!(ScriptEntry::decode(dsp), Some(e));
    }
    assert_eq!(ScriptEntry::decode(ScriptEntry::DataIn(95).encode()), Some(ScriptEntry::DataIn(95)));
    assert_eq!(ScriptEntry::decode(ScriptEntry::Start.encode() + 4), None);
}

#[test]
fn nego_send_entries() {
    assert!(ScriptEntry::SendSdtr.is_nego_send());
    assert!(ScriptEntry::SendWdtr.is_nego_send());
    assert!(!ScriptEntry::SdtrResp.is_nego_send());
}

#[test]
fn interrupt_codes() {
    for code in 1..=23u32 {
        let sir = ScriptInterrupt::try_from(code).expect("known code");
        assert_eq!(sir as u32, code);
    }
    assert!(ScriptInterrupt::try_from(0).is_err());
    assert!(ScriptInterrupt::try_from(24).is_err());
}

#[test]
fn classification_order() {
    assert_eq!(classify(Sist::UDC, Dstat::empty()), InterruptCause::UnexpectedDisconnect);
    assert_eq!(classify(Sist::SBMC | Sist::STO, Dstat::empty()), InterruptCause::BusModeChange);
    assert_eq!(classify(Sist::empty(), Dstat::SIR), InterruptCause::ScriptInterrupt);
    assert_eq!(classify(Sist::empty(), Dstat::SSI), InterruptCause::SingleStep);
}

#[test]
fn bus_phases() {
    assert_eq!(BusPhase::from_bits(0x0f), BusPhase::MsgIn);
    assert!(BusPhase::DtDataIn.is_input() && BusPhase::DtDataIn.is_data());
    assert!(!BusPhase::Command.is_data());
    assert!(!BusPhase::MsgOut.is_input());
}
