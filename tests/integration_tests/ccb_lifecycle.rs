// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::HashSet;

use anyhow::Result;
use rand::RngExt;
use sym53c8xx_rs::{ccb::CcbId, dma::BusAddr, hba::HbaError};

use crate::integration_tests::common::{TestHba, attach, load_config};

/// Every live CCB resolves from its bus address, no LUN sees a tag twice and
/// released headers resolve to nothing.
fn check(hba: &TestHba, live: &[(CcbId, BusAddr)], released: &[BusAddr]) {
    let mut tags = HashSet::new();
    for &(id, ba) in live {
        assert_eq!(hba.ccbs().lookup(ba), Some(id));
        let c = hba.ccbs().get(id);
        if let Some(tag) = c.tag {
            assert!(
                tags.insert((c.target, c.lun, tag)),
                "tag {tag} used twice on {}:{}",
                c.target,
                c.lun
            );
        }
    }
    for &ba in released {
        assert_eq!(hba.ccbs().lookup(ba), None, "{ba:?} still resolves");
    }
}

#[test]
fn random_get_and_free() -> Result<()> {
    let cfg = load_config()?;
    let (mut hba, _pool) = attach(&cfg)?;
    let mut rng = rand::rng();
    let mut live: Vec<(CcbId, BusAddr)> = Vec::new();
    let mut released: Vec<BusAddr> = Vec::new();
    let mut refused = 0;

    for _ in 0..2000 {
        if live.is_empty() || rng.random_bool(0.6) {
            let target = rng.random_range(0..4u8);
            let lun = rng.random_range(0..2u8);
            match hba.get_ccb(target, lun, true) {
                Ok(id) => {
                    let ba = hba.ccbs().get(id).ba;
                    released.retain(|&b| b != ba);
                    live.push((id, ba));
                },
                Err(HbaError::Busy) => refused += 1,
                Err(e) => return Err(e.into()),
            }
        } else {
            let (id, ba) = live.swap_remove(rng.random_range(0..live.len()));
            hba.free_ccb(id)?;
            released.push(ba);
        }
        check(&hba, &live, &released);
        assert!(hba.busy_ccbs() <= usize::from(cfg.controller.max_ccbs));
    }
    assert!(refused > 0, "the arena never filled up");

    for (id, ba) in live.drain(..) {
        hba.free_ccb(id)?;
        released.push(ba);
    }
    check(&hba, &live, &released);
    assert_eq!(hba.busy_ccbs(), 0);
    Ok(())
}

#[test]
fn double_free_is_refused() -> Result<()> {
    let cfg = load_config()?;
    let (mut hba, _pool) = attach(&cfg)?;
    let id = hba.get_ccb(0, 0, true)?;
    let ba = hba.ccbs().get(id).ba;
    hba.free_ccb(id)?;
    assert_eq!(hba.free_ccb(id), Err(HbaError::UnknownCcb));
    assert_eq!(hba.ccbs().lookup(ba), None);
    Ok(())
}
