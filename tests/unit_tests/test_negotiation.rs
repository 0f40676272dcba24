// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use sym53c8xx_rs::{
    ccb::{CcbId, CcbRegistry},
    cfg::{
        config::{ControllerConfig, TargetSettings},
        enums::{BusGeneration, ChipFamily, YesNo},
    },
    dma::{DmaPool, LinearPages},
    models::message::{ExtendedMessage, PprOptions},
    nego::{
        NegoError, NegoKind, NegoOutcome, NegotiationEngine,
        sync::{ChipLimits, SyncDivisor, compute_divisor},
    },
    target::{TargetControl, TransferParams},
};

fn legacy_80mhz() -> ChipLimits {
    ChipLimits::from_config(&ControllerConfig::default())
}

fn c10_160mhz() -> ChipLimits {
    ChipLimits::from_config(&ControllerConfig {
        family: ChipFamily::C10,
        generation: BusGeneration::Ultra3,
        u3en: YesNo::Yes,
        clock_khz: 160_000,
        max_offset: 62,
        max_offset_dt: 62,
        ..Default::default()
    })
}

/// Any live CCB id; the engine only compares it.
fn some_ccb() -> Result<CcbId> {
    let pool = DmaPool::new("nego", Box::new(LinearPages::new(0x0080_0000, None)), true);
    let mut reg = CcbRegistry::new(1, 1, 18);
    Ok(reg.alloc(&pool)?)
}

#[test]
fn legacy_limits() {
    let l = legacy_80mhz();
    assert_eq!(l.minsync, 12);
    assert_eq!(l.maxsync, 137);
    assert_eq!(l.rv_scntl3, 4);
    assert!(!l.u3en);
    assert_eq!(l.maxoffs_dt, 0);
}

#[test]
fn c10_limits() {
    let l = c10_160mhz();
    assert_eq!(l.minsync, 10);
    assert_eq!(l.minsync_dt, 9);
    assert_eq!(l.rv_scntl3, 0);
    assert_eq!(l.offset_mask(), 0x3f);
}

#[test]
fn divisor_search() {
    let l = legacy_80mhz();
    assert_eq!(compute_divisor(&l, false, 12), Ok(SyncDivisor { div: 0, fak: 0 }));
    assert_eq!(compute_divisor(&l, false, 25), Ok(SyncDivisor { div: 2, fak: 0 }));
    assert_eq!(compute_divisor(&l, false, 50), Ok(SyncDivisor { div: 3, fak: 0 }));
    assert_eq!(compute_divisor(&l, false, 11), Err(NegoError::Unreachable { factor: 11 }));

    let c10 = c10_160mhz();
    assert_eq!(compute_divisor(&c10, true, 9), Ok(SyncDivisor { div: 0, fak: 0 }));
}

#[test]
fn wide_then_sync() -> Result<()> {
    let limits = legacy_80mhz();
    let engine = NegotiationEngine::new(limits);
    let mut tcb = TargetControl::new(2, TargetSettings::default(), &limits);
    let ccb = some_ccb()?;

    let (kind, msg) = engine.propose(&mut tcb, false).expect("proposal");
    assert_eq!(kind, NegoKind::Wide);
    assert_eq!(msg, ExtendedMessage::Wide { width: 1 });
    engine.start(&mut tcb, ccb, kind);

    let out = engine.on_response(&mut tcb, &ExtendedMessage::Wide { width: 1 });
    assert_eq!(
        out,
        NegoOutcome::Accepted {
            reply: Some(ExtendedMessage::Sync { period: 12, offset: 31 }),
            chained: Some(NegoKind::Sync),
        }
    );
    assert!(tcb.active.is_wide());

    let out = engine.on_response(&mut tcb, &ExtendedMessage::Sync { period: 12, offset: 31 });
    assert_eq!(out, NegoOutcome::Accepted { reply: None, chained: None });
    assert_eq!(tcb.active, TransferParams { period: 12, offset: 31, width: 1, options: PprOptions::empty() });
    assert!(!tcb.check_nego);
    assert!(tcb.nego.is_none());
    Ok(())
}

#[test]
fn slower_answer_is_taken() -> Result<()> {
    let limits = legacy_80mhz();
    let engine = NegotiationEngine::new(limits);
    let settings = TargetSettings {
        wide: YesNo::No,
        ..Default::default()
    };
    let mut tcb = TargetControl::new(1, settings, &limits);
    let (kind, _) = engine.propose(&mut tcb, false).expect("proposal");
    assert_eq!(kind, NegoKind::Sync);
    engine.start(&mut tcb, some_ccb()?, kind);

    let out = engine.on_response(&mut tcb, &ExtendedMessage::Sync { period: 25, offset: 8 });
    assert!(matches!(out, NegoOutcome::Accepted { reply: None, .. }));
    assert_eq!((tcb.active.period, tcb.active.offset), (25, 8));
    Ok(())
}

#[test]
fn larger_offset_answer_goes_async() -> Result<()> {
    let limits = legacy_80mhz();
    let engine = NegotiationEngine::new(limits);
    let settings = TargetSettings {
        wide: YesNo::No,
        sync_offset: 15,
        ..Default::default()
    };
    let mut tcb = TargetControl::new(1, settings, &limits);
    let (kind, _) = engine.propose(&mut tcb, false).expect("proposal");
    engine.start(&mut tcb, some_ccb()?, kind);

    let out = engine.on_response(&mut tcb, &ExtendedMessage::Sync { period: 12, offset: 31 });
    assert_eq!(out, NegoOutcome::Rejected);
    assert!(!tcb.active.is_sync());
    assert_eq!(tcb.goal.offset, 0);
    Ok(())
}

#[test]
fn async_answer_ignores_the_period() -> Result<()> {
    let limits = legacy_80mhz();
    let engine = NegotiationEngine::new(limits);
    let settings = TargetSettings {
        wide: YesNo::No,
        ..Default::default()
    };
    let mut tcb = TargetControl::new(1, settings, &limits);
    let (kind, _) = engine.propose(&mut tcb, false).expect("proposal");
    assert_eq!(kind, NegoKind::Sync);
    engine.start(&mut tcb, some_ccb()?, kind);

    // offset 0 means asynchronous whatever period comes with it
    let out = engine.on_response(&mut tcb, &ExtendedMessage::Sync { period: 12, offset: 0 });
    assert_eq!(out, NegoOutcome::Accepted { reply: None, chained: None });
    assert!(!tcb.active.is_sync());
    assert_eq!(tcb.active.period, 0);
    assert!(!tcb.check_nego);
    assert!(tcb.nego.is_none());
    Ok(())
}

#[test]
fn async_ppr_answer_drops_dual_edge() -> Result<()> {
    let settings = TargetSettings {
        ppr: sym53c8xx_rs::cfg::config::PprConfig {
            dt: YesNo::Yes,
            iu: YesNo::No,
            qas: YesNo::No,
        },
        sync_period: 9,
        ..Default::default()
    };
    let limits = c10_160mhz();
    let engine = NegotiationEngine::new(limits);
    let mut tcb = TargetControl::new(0, settings, &limits);
    let (kind, _) = engine.propose(&mut tcb, false).expect("proposal");
    assert_eq!(kind, NegoKind::Ppr);
    engine.start(&mut tcb, some_ccb()?, kind);

    let answer = ExtendedMessage::Ppr { period: 9, offset: 0, width: 1, options: PprOptions::DT };
    let out = engine.on_response(&mut tcb, &answer);
    assert_eq!(out, NegoOutcome::Accepted { reply: None, chained: None });
    assert!(!tcb.active.is_sync());
    assert!(!tcb.active.is_dt());
    assert!(tcb.active.is_wide());
    assert!(!tcb.check_nego);
    Ok(())
}

#[test]
fn reject_lowers_goal_once() -> Result<()> {
    let limits = legacy_80mhz();
    let engine = NegotiationEngine::new(limits);
    let mut tcb = TargetControl::new(4, TargetSettings::default(), &limits);
    let (kind, _) = engine.propose(&mut tcb, false).expect("proposal");
    assert_eq!(kind, NegoKind::Wide);
    engine.start(&mut tcb, some_ccb()?, kind);

    engine.on_rejected(&mut tcb);
    assert_eq!(tcb.goal.width, 0);
    assert!(tcb.nego.is_none());
    // sync is still wanted, so the next command negotiates SDTR
    assert!(tcb.check_nego);
    let (kind, _) = engine.propose(&mut tcb, false).expect("proposal");
    assert_eq!(kind, NegoKind::Sync);
    Ok(())
}

#[test]
fn target_initiated_request_is_clamped() {
    let limits = legacy_80mhz();
    let engine = NegotiationEngine::new(limits);
    let mut tcb = TargetControl::new(0, TargetSettings::default(), &limits);

    let out = engine.on_response(&mut tcb, &ExtendedMessage::Sync { period: 10, offset: 60 });
    assert_eq!(
        out,
        NegoOutcome::Accepted {
            reply: Some(ExtendedMessage::Sync { period: 12, offset: 31 }),
            chained: None,
        }
    );
    assert_eq!((tcb.active.period, tcb.active.offset), (12, 31));
}

#[test]
fn ppr_only_with_ultra3() {
    let settings = TargetSettings {
        ppr: sym53c8xx_rs::cfg::config::PprConfig {
            dt: YesNo::Yes,
            iu: YesNo::No,
            qas: YesNo::No,
        },
        sync_period: 9,
        ..Default::default()
    };

    let limits = c10_160mhz();
    let engine = NegotiationEngine::new(limits);
    let mut tcb = TargetControl::new(0, settings.clone(), &limits);
    let (kind, msg) = engine.propose(&mut tcb, false).expect("proposal");
    assert_eq!(kind, NegoKind::Ppr);
    assert!(matches!(msg, ExtendedMessage::Ppr { period: 9, options, .. } if options == PprOptions::DT));

    let limits = legacy_80mhz();
    let engine = NegotiationEngine::new(limits);
    let mut tcb = TargetControl::new(0, settings, &limits);
    let (kind, _) = engine.propose(&mut tcb, false).expect("proposal");
    assert_eq!(kind, NegoKind::Wide);
}
