// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result};
use sym53c8xx_rs::{
    ccb::DataPointer,
    hba::EngineState,
    hw::{regs::SCNTL4_U3EN, script::ScriptEntry},
    models::message::{ExtendedMessage, M_REJECT, PprOptions},
    target::TransferParams,
};

use crate::integration_tests::common::{
    TestHba, attach, ba_of, find, load_config, read10, service, tur,
};

const WDTR_16: [u8; 4] = [0x01, 0x02, 0x03, 0x01];

/// Submits a TUR and returns the header address the loopback fetched.
fn start_tur(hba: &mut TestHba, target: u8) -> Result<sym53c8xx_rs::dma::BusAddr> {
    let h = hba.submit(&tur(target, 0))?;
    let ba = ba_of(hba, h)?;
    assert_eq!(hba.controller_mut().fetch_all(), vec![ba]);
    Ok(ba)
}

#[test]
fn first_command_negotiates_wide_then_sync() -> Result<()> {
    let cfg = load_config()?;
    let (mut hba, _pool) = attach(&cfg)?;
    let ba = start_tur(&mut hba, 1)?;

    let hdr = hba.controller().header(ba)?;
    assert!(hdr.msgout().ends_with(&WDTR_16));
    assert_eq!(hdr.nego_status, 2);

    hba.controller_mut().deliver_message(ba, &WDTR_16)?;
    assert!(service(&mut hba).is_empty());
    assert_eq!(hba.controller().msgout(), vec![0x01, 0x03, 0x01, 10, 31]);
    assert_eq!(hba.controller().dsp(), Some(ScriptEntry::SendSdtr));
    assert_eq!(hba.state(), EngineState::Negotiating);
    assert_eq!(hba.controller().header(ba)?.nego_status, 1);

    hba.controller_mut()
        .deliver_message(ba, &ExtendedMessage::Sync { period: 10, offset: 31 }.to_bytes())?;
    assert!(service(&mut hba).is_empty());
    assert_eq!(hba.controller().dsp(), Some(ScriptEntry::Clrack));
    let t = hba.target(1).context("target 1")?;
    assert_eq!(t.active, TransferParams { period: 10, offset: 31, width: 1, options: PprOptions::empty() });
    assert!(!t.check_nego);

    // the agreement reaches the header the sequencer selects with
    let hdr = hba.controller().header(ba)?;
    assert_eq!(hdr.sel_scntl3, t.regs.scntl3);
    assert_eq!(hdr.sel_sxfer, t.regs.sxfer);

    hba.controller_mut().complete(ba, 0)?;
    service(&mut hba);
    let next = start_tur(&mut hba, 1)?;
    let hdr = hba.controller().header(next)?;
    assert_eq!(hdr.nego_status, 0);
    assert_eq!(hdr.msgout().len(), 3, "IDENTIFY and tag only");
    Ok(())
}

#[test]
fn rejected_wide_falls_back_to_sync() -> Result<()> {
    let cfg = load_config()?;
    let (mut hba, _pool) = attach(&cfg)?;
    let ba = start_tur(&mut hba, 2)?;

    hba.controller_mut().deliver_message(ba, &[M_REJECT])?;
    assert!(service(&mut hba).is_empty());
    assert_eq!(hba.controller().dsp(), Some(ScriptEntry::Clrack));
    assert_eq!(hba.controller().header(ba)?.nego_status, 0);
    let t = hba.target(2).context("target 2")?;
    assert_eq!(t.goal.width, 0);
    assert!(t.nego.is_none());
    assert!(t.check_nego);

    hba.controller_mut().complete(ba, 0)?;
    service(&mut hba);
    let next = start_tur(&mut hba, 2)?;
    let hdr = hba.controller().header(next)?;
    assert!(hdr.msgout().ends_with(&[0x01, 0x03, 0x01, 10, 31]));
    assert_eq!(hdr.nego_status, 1);
    Ok(())
}

#[test]
fn answer_of_the_wrong_kind_is_rejected() -> Result<()> {
    let cfg = load_config()?;
    let (mut hba, _pool) = attach(&cfg)?;
    let ba = start_tur(&mut hba, 3)?;

    // WDTR was sent, an SDTR comes back
    hba.controller_mut().deliver_message(ba, &[0x01, 0x03, 0x01, 10, 31])?;
    service(&mut hba);
    assert_eq!(hba.controller().msgout(), vec![M_REJECT]);
    assert_eq!(hba.controller().dsp(), Some(ScriptEntry::MsgBad));
    let t = hba.target(3).context("target 3")?;
    assert!(!t.active.is_sync());
    assert!(t.nego.is_none());
    Ok(())
}

#[test]
fn dual_edge_agreement_enables_ultra3() -> Result<()> {
    let cfg = load_config()?;
    let (mut hba, _pool) = attach(&cfg)?;
    let goal = TransferParams { period: 9, offset: 31, width: 1, options: PprOptions::DT };
    hba.set_goal(6, goal)?;
    assert!(hba.target(6).context("target 6")?.check_nego);

    let ba = start_tur(&mut hba, 6)?;
    let hdr = hba.controller().header(ba)?;
    let ppr = ExtendedMessage::Ppr { period: 9, offset: 31, width: 1, options: PprOptions::DT }.to_bytes();
    assert!(hdr.msgout().ends_with(&ppr));
    assert_eq!(hdr.nego_status, 3);

    hba.controller_mut().deliver_message(ba, &ppr)?;
    service(&mut hba);
    let t = hba.target(6).context("target 6")?;
    assert!(t.active.is_dt());
    assert!(t.regs.scntl4 & SCNTL4_U3EN != 0);
    assert_eq!(hba.controller().header(ba)?.sel_scntl4, t.regs.scntl4);
    Ok(())
}

#[test]
fn target_initiated_sync_is_answered() -> Result<()> {
    let cfg = load_config()?;
    let (mut hba, _pool) = attach(&cfg)?;
    hba.set_goal(0, TransferParams::default())?;
    let ba = start_tur(&mut hba, 0)?;
    assert_eq!(hba.controller().header(ba)?.nego_status, 0);

    hba.controller_mut()
        .deliver_message(ba, &ExtendedMessage::Sync { period: 12, offset: 20 }.to_bytes())?;
    service(&mut hba);
    assert_eq!(hba.controller().msgout(), vec![0x01, 0x03, 0x01, 12, 20]);
    assert_eq!(hba.controller().dsp(), Some(ScriptEntry::SdtrResp));
    let t = hba.target(0).context("target 0")?;
    assert_eq!((t.active.period, t.active.offset), (12, 20));
    Ok(())
}

#[test]
fn data_pointer_messages() -> Result<()> {
    let cfg = load_config()?;
    let (mut hba, pool) = attach(&cfg)?;
    hba.set_goal(3, TransferParams::default())?;
    let buf = pool.allocate(2048)?;
    let h = hba.submit(&read10(3, 0, 4, &buf))?;
    let ba = ba_of(&hba, h)?;
    hba.controller_mut().fetch_all();

    // MODIFY DATA POINTER +100
    hba.controller_mut().deliver_message(ba, &[0x01, 0x05, 0x00, 0, 0, 0, 100])?;
    service(&mut hba);
    assert_eq!(hba.controller().header(ba)?.lastp.get(), DataPointer::new(0, 100).encode());
    assert_eq!(hba.controller().dsp(), Some(ScriptEntry::Clrack));

    // IGNORE WIDE RESIDUE of one byte
    hba.controller_mut().deliver_message(ba, &[0x23, 0x01])?;
    service(&mut hba);
    assert_eq!(hba.controller().header(ba)?.lastp.get(), DataPointer::new(0, 99).encode());

    // moving before the start of the buffer is refused
    hba.controller_mut().deliver_message(ba, &[0x01, 0x05, 0x00, 0xff, 0xff, 0xfc, 0x00])?;
    service(&mut hba);
    assert_eq!(hba.controller().msgout(), vec![M_REJECT]);
    assert_eq!(hba.controller().header(ba)?.lastp.get(), DataPointer::new(0, 99).encode());

    hba.controller_mut().complete(ba, 0)?;
    assert!(find(&service(&mut hba), h)?.is_good());
    pool.free(buf)?;
    Ok(())
}

#[test]
fn unsupported_message_is_rejected() -> Result<()> {
    let cfg = load_config()?;
    let (mut hba, _pool) = attach(&cfg)?;
    let ba = start_tur(&mut hba, 3)?;
    hba.controller_mut().deliver_message(ba, &[0x0f])?;
    service(&mut hba);
    assert_eq!(hba.controller().msgout(), vec![M_REJECT]);
    assert_eq!(hba.controller().dsp(), Some(ScriptEntry::MsgBad));
    Ok(())
}
