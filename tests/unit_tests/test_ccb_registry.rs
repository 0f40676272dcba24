// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use sym53c8xx_rs::{
    ccb::{CcbRegistry, CcbState},
    dma::{DmaPool, LinearPages},
    hba::HbaError,
};

fn pool() -> DmaPool {
    DmaPool::new("unit", Box::new(LinearPages::new(0x0040_0000, None)), true)
}

#[test]
fn prealloc_then_grow_to_ceiling() -> Result<()> {
    let pool = pool();
    let mut reg = CcbRegistry::new(4, 8, 32);
    reg.prealloc(&pool, 2)?;
    assert_eq!(reg.total(), 2);
    assert_eq!(reg.free_count(), 2);
    assert_eq!(reg.available(), 4);

    let ids: Vec<_> = (0..4).map(|_| reg.alloc(&pool)).collect::<Result<_, _>>()?;
    assert_eq!(reg.total(), 4);
    assert_eq!(reg.alloc(&pool), Err(HbaError::Busy));
    assert_eq!(reg.busy(), ids.as_slice());
    assert!(ids.iter().all(|&id| reg.get(id).state == CcbState::Waiting));
    Ok(())
}

#[test]
fn lookup_maps_header_address() -> Result<()> {
    let pool = pool();
    let mut reg = CcbRegistry::new(8, 8, 32);
    let a = reg.alloc(&pool)?;
    let b = reg.alloc(&pool)?;
    assert_eq!(reg.lookup(reg.get(a).ba), Some(a));
    assert_eq!(reg.lookup(reg.get(b).ba), Some(b));
    assert_eq!(reg.lookup(reg.get(a).sg.bus), None);
    Ok(())
}

#[test]
fn release_twice_is_refused() -> Result<()> {
    let pool = pool();
    let mut reg = CcbRegistry::new(2, 8, 32);
    let id = reg.alloc(&pool)?;
    reg.release(id)?;
    assert_eq!(reg.release(id), Err(HbaError::UnknownCcb));
    assert_eq!(reg.free_count(), 1);
    assert!(reg.busy().is_empty());
    Ok(())
}

#[test]
fn destroy_returns_all_memory() -> Result<()> {
    let pool = pool();
    let mut reg = CcbRegistry::new(6, 16, 32);
    reg.prealloc(&pool, 6)?;
    assert_eq!(pool.live_chunks(), 18);
    reg.destroy(&pool);
    assert_eq!(pool.live_chunks(), 0);
    assert_eq!(pool.mapped_pages(), 0);
    Ok(())
}
