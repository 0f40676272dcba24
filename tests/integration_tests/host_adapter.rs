// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use sym53c8xx_rs::{
    cfg::config::Config,
    client::host_adapter::HostAdapter,
    hw::LoopbackController,
    models::status::TransportStatus,
};
use tokio::{task::JoinSet, time::sleep};
use tokio_util::sync::CancellationToken;

use crate::integration_tests::common::{attach, load_config, tur};

type Adapter = Arc<HostAdapter<LoopbackController>>;

fn adapter(cfg: &Config) -> Result<Adapter> {
    let (hba, _pool) = attach(cfg)?;
    Ok(HostAdapter::new(hba, cfg.runtime.clone()))
}

/// Plays every device on the bus: whatever the controller fetched ends
/// GOOD on the next tick.
fn spawn_targets(adapter: &Adapter, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    let adapter = Arc::clone(adapter);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(Duration::from_millis(2)) => {
                    adapter
                        .with_hba(|hba| {
                            let ctrl = hba.controller_mut();
                            for ba in ctrl.fetch_all() {
                                let _ = ctrl.complete(ba, 0);
                            }
                        })
                        .await;
                    adapter.on_interrupt().await;
                },
            }
        }
    })
}

#[tokio::test]
async fn execute_runs_to_completion() -> Result<()> {
    let cfg = load_config()?;
    let adapter = adapter(&cfg)?;
    let stop = CancellationToken::new();
    let targets = spawn_targets(&adapter, stop.clone());

    let r = adapter.execute(tur(3, 0), &CancellationToken::new()).await?;
    assert!(r.is_good());
    assert_eq!(adapter.pending(), 0);

    stop.cancel();
    targets.await?;
    adapter.shutdown().await
}

#[tokio::test]
async fn untagged_commands_wait_their_turn() -> Result<()> {
    let cfg = load_config()?;
    let adapter = adapter(&cfg)?;
    let stop = CancellationToken::new();
    let targets = spawn_targets(&adapter, stop.clone());

    // target 4 takes one command at a time; the rest retry on Busy
    let mut set = JoinSet::new();
    for _ in 0..4 {
        let a = Arc::clone(&adapter);
        set.spawn(async move { a.execute(tur(4, 0), &CancellationToken::new()).await });
    }
    for _ in 0..4 {
        let a = Arc::clone(&adapter);
        set.spawn(async move { a.execute(tur(0, 0), &CancellationToken::new()).await });
    }
    let mut good = 0;
    while let Some(joined) = set.join_next().await {
        assert!(joined??.is_good());
        good += 1;
    }
    assert_eq!(good, 8);

    stop.cancel();
    targets.await?;
    adapter.shutdown().await
}

#[tokio::test]
async fn silent_target_times_out() -> Result<()> {
    let mut cfg = load_config()?;
    cfg.runtime.command_timeout = Duration::from_millis(50);
    let adapter = adapter(&cfg)?;
    let stop = CancellationToken::new();
    // interrupts are serviced, but no device ever answers
    let service = adapter.spawn_service(Duration::from_millis(2), stop.clone());

    let r = adapter.execute(tur(2, 0), &CancellationToken::new()).await?;
    assert_eq!(r.transport, TransportStatus::TimedOut);
    let stats = adapter.with_hba(|hba| hba.stats()).await;
    assert_eq!(stats.aborts, 1);

    stop.cancel();
    service.await?;
    adapter.shutdown().await
}

#[tokio::test]
async fn cancelled_command_is_aborted() -> Result<()> {
    let cfg = load_config()?;
    let adapter = adapter(&cfg)?;
    let stop = CancellationToken::new();
    let service = adapter.spawn_service(Duration::from_millis(2), stop.clone());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });
    let r = adapter.execute(tur(1, 0), &cancel).await?;
    assert_eq!(r.transport, TransportStatus::Aborted);

    stop.cancel();
    service.await?;
    adapter.shutdown().await
}

#[tokio::test]
async fn bus_reset_reaches_waiters() -> Result<()> {
    let cfg = load_config()?;
    let adapter = adapter(&cfg)?;
    let (_, rx) = adapter.submit(&tur(0, 0)).await?;
    adapter.with_hba(|hba| hba.controller_mut().fetch_all()).await;

    adapter.reset_bus().await;
    let r = rx.await.context("waiter dropped")?;
    assert_eq!(r.transport, TransportStatus::BusReset);
    assert_eq!(adapter.pending(), 0);
    adapter.shutdown().await
}

#[tokio::test]
async fn shutdown_fails_pending_commands() -> Result<()> {
    let cfg = load_config()?;
    let adapter = adapter(&cfg)?;
    let (_, rx) = adapter.submit(&tur(3, 0)).await?;
    assert_eq!(adapter.pending(), 1);

    let extra = Arc::clone(&adapter);
    assert!(extra.shutdown().await.is_err(), "still shared");

    adapter.shutdown().await?;
    let r = rx.await.context("waiter dropped")?;
    assert_eq!(r.transport, TransportStatus::Aborted);
    Ok(())
}
