// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result};
use sym53c8xx_rs::{
    ccb::DataPointer,
    hba::{EngineState, HbaError, PendingHandle},
    hw::{
        Completion, SequencerCommand,
        regs::{Dstat, Reg, SCNTL1_ISCON, Sist},
        script::{ScriptEntry, ScriptInterrupt},
    },
    models::{
        message::{M_ABORT, M_ABORT_TAG, M_PARITY, M_RESET, M_SIMPLE_TAG},
        status::{ExtendedError, ScsiStatus, TransportStatus},
    },
    target::TransferParams,
};

use crate::integration_tests::common::{
    attach, ba_of, complete_all_good, find, load_config, read_split, service, tur,
};

const MSG_IN_PHASE: u32 = 7;
const STATUS_PHASE: u32 = 3;

#[test]
fn abort_of_a_frozen_command_is_immediate() -> Result<()> {
    let cfg = load_config()?;
    let (mut hba, _pool) = attach(&cfg)?;
    let h1 = hba.submit(&tur(2, 0))?;
    let ba = ba_of(&hba, h1)?;
    hba.controller_mut().fetch_all();
    hba.controller_mut().complete(ba, 0x02)?;
    service(&mut hba);

    // waits behind the REQUEST SENSE
    let h2 = hba.submit(&tur(2, 0))?;
    hba.abort(h2)?;
    let results = hba.poll_completions();
    assert_eq!(results.len(), 1);
    assert_eq!(find(&results, h2)?.transport, TransportStatus::Aborted);
    assert_eq!(hba.stats().aborts, 1);

    assert_eq!(hba.controller_mut().fetch_all(), vec![ba]);
    hba.controller_mut().complete_sense(ba, &[0x70, 0, 0x06, 0, 0, 0, 0, 10, 0, 0, 0, 0, 0x29, 0, 0, 0, 0, 0])?;
    let results = service(&mut hba);
    assert_eq!(find(&results, h1)?.scsi_status, ScsiStatus::CheckCondition);
    Ok(())
}

#[test]
fn sense_of_a_tagged_command_answers_untagged_reselection() -> Result<()> {
    let cfg = load_config()?;
    let (mut hba, _pool) = attach(&cfg)?;
    hba.set_goal(2, TransferParams::default())?;
    let h = hba.submit(&tur(2, 0))?;
    let ba = ba_of(&hba, h)?;
    hba.controller_mut().fetch_all();
    hba.controller_mut().complete(ba, 0x02)?;
    service(&mut hba);

    // REQUEST SENSE goes out with IDENTIFY only
    assert_eq!(hba.controller_mut().fetch_all(), vec![ba]);
    assert_eq!(hba.controller().header(ba)?.msgout().len(), 1);

    hba.controller_mut()
        .raise_sir(ScriptInterrupt::ReselNoIdentify, None, &[(Reg::Sdid, 2)]);
    assert!(service(&mut hba).is_empty());
    assert_eq!(hba.controller().reg(Reg::Dsa), ba.0);
    assert_eq!(hba.controller().dsp(), Some(ScriptEntry::ReselGo));

    hba.controller_mut().complete_sense(ba, &[0x70, 0, 0x06, 0, 0, 0, 0, 10, 0, 0, 0, 0, 0x29, 0, 0, 0, 0, 0])?;
    let results = service(&mut hba);
    assert_eq!(find(&results, h)?.scsi_status, ScsiStatus::CheckCondition);

    // nothing untagged is left on the LUN
    hba.controller_mut()
        .raise_sir(ScriptInterrupt::ReselNoIdentify, None, &[(Reg::Sdid, 2)]);
    service(&mut hba);
    assert_eq!(hba.controller().msgout(), vec![M_RESET]);
    Ok(())
}

#[test]
fn abort_before_fetch_leaves_the_bus_alone() -> Result<()> {
    let cfg = load_config()?;
    let (mut hba, _pool) = attach(&cfg)?;
    let h = hba.submit(&tur(3, 0))?;
    hba.controller_mut().clear_commands();

    hba.abort(h)?;
    assert!(hba.controller().commands().contains(&SequencerCommand::PauseChannel));
    let results = service(&mut hba);
    assert_eq!(find(&results, h)?.transport, TransportStatus::Aborted);

    assert!(hba.controller_mut().fetch_all().is_empty(), "removed from the start queue");
    assert!(
        !hba.controller()
            .commands()
            .iter()
            .any(|c| matches!(c, SequencerCommand::SelectWithAtn { .. }))
    );
    assert_eq!(hba.controller().dsp(), Some(ScriptEntry::Start));
    assert_eq!(hba.outstanding(), 0);
    Ok(())
}

#[test]
fn abort_tag_of_a_started_command() -> Result<()> {
    let cfg = load_config()?;
    let (mut hba, _pool) = attach(&cfg)?;
    let victim = hba.submit(&tur(0, 0))?;
    let other = hba.submit(&tur(0, 0))?;
    let bas = hba.controller_mut().fetch_all();
    assert_eq!(bas.len(), 2);

    hba.abort(victim)?;
    let results = service(&mut hba);
    assert_eq!(results.len(), 1);
    assert_eq!(find(&results, victim)?.transport, TransportStatus::Aborted);
    assert_eq!(
        hba.controller().abort_message(),
        vec![0x80, M_SIMPLE_TAG, 0x01, M_ABORT_TAG],
        "first tag goes out as 1"
    );
    assert!(
        hba.controller()
            .commands()
            .contains(&SequencerCommand::SelectWithAtn { target: 0 })
    );

    // the sibling task is untouched
    hba.controller_mut().complete(bas[1], 0)?;
    let results = service(&mut hba);
    assert!(find(&results, other)?.is_good());
    Ok(())
}

#[test]
fn timed_out_untagged_command() -> Result<()> {
    let cfg = load_config()?;
    let (mut hba, _pool) = attach(&cfg)?;
    let h = hba.submit(&tur(4, 0))?;
    hba.controller_mut().fetch_all();

    hba.abort_timed_out(h)?;
    // a second request while the first is in flight changes nothing
    hba.abort(h)?;
    let results = service(&mut hba);
    assert_eq!(results.len(), 1);
    assert_eq!(find(&results, h)?.transport, TransportStatus::TimedOut);
    assert_eq!(hba.controller().abort_message(), vec![0x80, M_ABORT]);
    assert_eq!(hba.stats().aborts, 1);
    Ok(())
}

#[test]
fn abort_of_unknown_handle() -> Result<()> {
    let cfg = load_config()?;
    let (mut hba, _pool) = attach(&cfg)?;
    let bogus = PendingHandle(4242);
    assert_eq!(hba.abort(bogus), Err(HbaError::UnknownHandle(bogus)));
    assert_eq!(hba.reset_target(7), Err(HbaError::InvalidTarget(7)));
    assert_eq!(hba.reset_target(16), Err(HbaError::InvalidTarget(16)));
    Ok(())
}

#[test]
fn device_reset_completes_every_task() -> Result<()> {
    let cfg = load_config()?;
    let (mut hba, _pool) = attach(&cfg)?;
    let a = hba.submit(&tur(1, 0))?;
    let b = hba.submit(&tur(1, 0))?;
    let c = hba.submit(&tur(2, 0))?;
    let bas = hba.controller_mut().fetch_all();

    hba.reset_target(1)?;
    let results = service(&mut hba);
    assert_eq!(results.len(), 2);
    assert_eq!(find(&results, a)?.transport, TransportStatus::DeviceReset);
    assert_eq!(find(&results, b)?.transport, TransportStatus::DeviceReset);
    assert_eq!(hba.controller().abort_message(), vec![M_RESET]);

    let t1 = hba.target(1).context("target 1")?;
    assert!(!t1.to_reset);
    assert!(t1.check_nego);
    assert!(!t1.active.is_sync());

    hba.controller_mut().complete(bas[2], 0)?;
    assert!(find(&service(&mut hba), c)?.is_good());
    Ok(())
}

#[test]
fn selection_timeout_fails_only_that_command() -> Result<()> {
    let cfg = load_config()?;
    let (mut hba, _pool) = attach(&cfg)?;
    let h = hba.submit(&tur(9, 0))?;
    let ba = ba_of(&hba, h)?;
    hba.controller_mut().fetch_all();

    hba.controller_mut().raise_scsi_interrupt(
        Sist::STO,
        &[(Reg::Dsp, ScriptEntry::SelDone.encode()), (Reg::Dsa, ba.0)],
    );
    let results = service(&mut hba);
    assert_eq!(find(&results, h)?.transport, TransportStatus::SelectionTimeout);
    assert_eq!(hba.stats().bus_resets, 0);
    assert_eq!(hba.controller().dsp(), Some(ScriptEntry::Start));
    assert!(hba.controller().commands().contains(&SequencerCommand::PurgeFifo));
    Ok(())
}

#[test]
fn selection_timeout_outside_selection_resets() -> Result<()> {
    let cfg = load_config()?;
    let (mut hba, _pool) = attach(&cfg)?;
    let h = hba.submit(&tur(9, 0))?;
    hba.controller_mut().fetch_all();

    hba.controller_mut()
        .raise_scsi_interrupt(Sist::STO, &[(Reg::Dsp, ScriptEntry::Start.encode())]);
    let results = service(&mut hba);
    assert_eq!(find(&results, h)?.transport, TransportStatus::BusReset);
    assert_eq!(hba.stats().bus_resets, 1);
    Ok(())
}

#[test]
fn unexpected_disconnect() -> Result<()> {
    let cfg = load_config()?;
    let (mut hba, _pool) = attach(&cfg)?;
    let h = hba.submit(&tur(3, 0))?;
    let other = hba.submit(&tur(3, 0))?;
    let ba = ba_of(&hba, h)?;
    let bas = hba.controller_mut().fetch_all();

    hba.controller_mut().raise_scsi_interrupt(
        Sist::UDC,
        &[(Reg::Dsp, ScriptEntry::Dispatch.encode()), (Reg::Dsa, ba.0)],
    );
    let results = service(&mut hba);
    assert_eq!(results.len(), 1);
    assert_eq!(find(&results, h)?.transport, TransportStatus::UnexpectedDisconnect);

    hba.controller_mut().complete(bas[1], 0)?;
    assert!(find(&service(&mut hba), other)?.is_good());
    Ok(())
}

#[test]
fn parity_in_message_in_is_reported_to_the_target() -> Result<()> {
    let cfg = load_config()?;
    let (mut hba, _pool) = attach(&cfg)?;
    let h = hba.submit(&tur(3, 0))?;
    let ba = ba_of(&hba, h)?;
    hba.controller_mut().fetch_all();

    hba.controller_mut().raise_scsi_interrupt(
        Sist::PAR,
        &[
            (Reg::Sbcl, MSG_IN_PHASE),
            (Reg::Scntl1, u32::from(SCNTL1_ISCON)),
            (Reg::Dsa, ba.0),
        ],
    );
    assert!(service(&mut hba).is_empty());
    assert_eq!(hba.controller().msgout(), vec![M_PARITY]);
    assert_eq!(hba.controller().dsp(), Some(ScriptEntry::Dispatch));
    assert_eq!(hba.state(), EngineState::Connected);
    assert_eq!(hba.stats().parity_errors, 1);

    // the target finishes the command, the parity mark stays on it
    hba.controller_mut().complete(ba, 0)?;
    let results = service(&mut hba);
    let r = find(&results, h)?;
    assert_eq!(r.transport, TransportStatus::Error);
    assert!(r.xerr.contains(ExtendedError::PARITY_ERR));
    Ok(())
}

#[test]
fn parity_in_data_out_resets() -> Result<()> {
    let cfg = load_config()?;
    let (mut hba, _pool) = attach(&cfg)?;
    let h = hba.submit(&tur(3, 0))?;
    let ba = ba_of(&hba, h)?;
    hba.controller_mut().fetch_all();

    hba.controller_mut().raise_scsi_interrupt(
        Sist::PAR,
        &[(Reg::Sbcl, 0), (Reg::Scntl1, u32::from(SCNTL1_ISCON)), (Reg::Dsa, ba.0)],
    );
    let results = service(&mut hba);
    assert_eq!(find(&results, h)?.transport, TransportStatus::BusReset);
    Ok(())
}

#[test]
fn phase_mismatch_saves_the_data_pointer() -> Result<()> {
    let cfg = load_config()?;
    let (mut hba, pool) = attach(&cfg)?;
    let buf = pool.allocate(1024)?;
    let h = hba.submit(&read_split(2, &[(buf.bus, 512), (buf.bus.offset(512), 512)]))?;
    let ba = ba_of(&hba, h)?;
    hba.controller_mut().fetch_all();

    // 200 of the first 512 bytes arrived, then the target went to status
    hba.controller_mut().raise_scsi_interrupt(
        Sist::MA,
        &[
            (Reg::Dsp, ScriptEntry::DataIn(0).encode()),
            (Reg::Dbc, (1 << 24) | 312),
            (Reg::Sbcl, STATUS_PHASE),
            (Reg::Dsa, ba.0),
        ],
    );
    assert!(service(&mut hba).is_empty());
    assert_eq!(hba.stats().phase_mismatches, 1);
    assert_eq!(hba.controller().dsp(), Some(ScriptEntry::Dispatch));

    let hdr = hba.controller().header(ba)?;
    assert_eq!(hdr.lastp.get(), DataPointer::new(0, 200).encode());
    assert_eq!(hdr.pm_addr.get(), buf.bus.offset(200).0);
    assert_eq!(hdr.pm_size.get(), 312);
    assert_eq!(hdr.pm_ret.get(), DataPointer::new(1, 0).encode());

    hba.controller_mut()
        .complete_with(ba, Completion::status(0).transferred(700))?;
    let results = service(&mut hba);
    let r = find(&results, h)?;
    assert!(r.is_good());
    assert_eq!(r.residual, 324);
    pool.free(buf)?;
    Ok(())
}

#[test]
fn phase_mismatch_outside_a_move_resets() -> Result<()> {
    let cfg = load_config()?;
    let (mut hba, _pool) = attach(&cfg)?;
    let h = hba.submit(&tur(2, 0))?;
    let ba = ba_of(&hba, h)?;
    hba.controller_mut().fetch_all();

    hba.controller_mut().raise_scsi_interrupt(
        Sist::MA,
        &[(Reg::Dsp, ScriptEntry::Start.encode()), (Reg::Dsa, ba.0)],
    );
    let results = service(&mut hba);
    assert_eq!(find(&results, h)?.transport, TransportStatus::BusReset);
    Ok(())
}

#[test]
fn bus_fault_resets_and_recovers() -> Result<()> {
    let cfg = load_config()?;
    let (mut hba, _pool) = attach(&cfg)?;
    let a = hba.submit(&tur(0, 0))?;
    let b = hba.submit(&tur(3, 0))?;
    hba.controller_mut().fetch_all();

    hba.controller_mut().raise_dma_interrupt(Dstat::BF, &[]);
    let results = service(&mut hba);
    assert_eq!(results.len(), 2);
    assert_eq!(find(&results, a)?.transport, TransportStatus::BusReset);
    assert_eq!(find(&results, b)?.transport, TransportStatus::BusReset);
    assert_eq!(hba.state(), EngineState::Idle);

    let h = hba.submit(&tur(0, 0))?;
    assert!(find(&complete_all_good(&mut hba)?, h)?.is_good());
    Ok(())
}

#[test]
fn foreign_done_queue_entry_is_counted() -> Result<()> {
    let cfg = load_config()?;
    let (mut hba, pool) = attach(&cfg)?;
    let junk = pool.allocate(1024)?;
    hba.controller_mut().complete(junk.bus, 0)?;
    assert!(service(&mut hba).is_empty());
    assert_eq!(hba.stats().bad_dsa, 1);
    pool.free(junk)?;
    Ok(())
}

#[test]
fn nothing_pending_is_spurious() -> Result<()> {
    let cfg = load_config()?;
    let (mut hba, _pool) = attach(&cfg)?;
    assert_eq!(hba.interrupt(), 0);
    assert_eq!(hba.state(), EngineState::Idle);
    Ok(())
}
