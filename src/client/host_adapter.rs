// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use dashmap::DashMap;
use tokio::{
    sync::{Mutex, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::config::RuntimeConfig,
    hba::{CommandRequest, CommandResult, Hba, HbaError, PendingHandle},
    hw::ScriptsController,
    state_machine::{command_states::CommandCtx, common::StateMachineCtx},
};

/// Async front end of one adapter.
///
/// Every engine call runs under one coarse lock. Results are routed to
/// per-command `oneshot` waiters by [`on_interrupt`](Self::on_interrupt),
/// which the interrupt source (or a polling task) calls.
pub struct HostAdapter<C: ScriptsController> {
    hba: Mutex<Hba<C>>,
    waiters: DashMap<PendingHandle, oneshot::Sender<CommandResult>>,
    runtime: RuntimeConfig,
}

impl<C: ScriptsController + 'static> HostAdapter<C> {
    pub fn new(hba: Hba<C>, runtime: RuntimeConfig) -> Arc<Self> {
        Arc::new(Self {
            hba: Mutex::new(hba),
            waiters: DashMap::new(),
            runtime,
        })
    }

    pub fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    /// Hands `req` to the engine, retrying while the LUN is busy. The
    /// receiver yields the result once the command completes.
    pub async fn submit(
        &self,
        req: &CommandRequest,
    ) -> Result<(PendingHandle, oneshot::Receiver<CommandResult>)> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let submitted = {
                let mut hba = self.hba.lock().await;
                hba.submit(req).map(|handle| {
                    // registered under the lock so no result can overtake it
                    let (tx, rx) = oneshot::channel();
                    self.waiters.insert(handle, tx);
                    (handle, rx)
                })
            };
            match submitted {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < self.runtime.max_submit_attempts => {
                    debug!(attempt, error = %e, "submit refused, retrying");
                    self.on_interrupt().await;
                    tokio::time::sleep(self.runtime.busy_retry_delay).await;
                },
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!(
                            "submit to target {} lun {} failed after {attempt} attempts",
                            req.target, req.lun
                        )
                    });
                },
            }
        }
    }

    /// Services the controller and delivers every finished command to its
    /// waiter. Returns how many results were delivered.
    pub async fn on_interrupt(&self) -> usize {
        let results = {
            let mut hba = self.hba.lock().await;
            hba.interrupt();
            hba.poll_completions()
        };
        self.route(results)
    }

    fn route(&self, results: Vec<CommandResult>) -> usize {
        let mut delivered = 0;
        for r in results {
            match self.waiters.remove(&r.handle) {
                Some((_, tx)) => {
                    if tx.send(r).is_ok() {
                        delivered += 1;
                    }
                },
                None => warn!(handle = ?r.handle, "result without a waiter"),
            }
        }
        delivered
    }

    /// Runs one command to completion. The command is aborted when
    /// `cancel` fires or the configured timeout passes.
    pub async fn execute(
        &self,
        req: CommandRequest,
        cancel: &CancellationToken,
    ) -> Result<CommandResult> {
        let mut ctx = CommandCtx::new(self, req, self.runtime.command_timeout);
        ctx.execute(cancel).await
    }

    pub async fn abort(&self, handle: PendingHandle) -> Result<(), HbaError> {
        self.with_engine(|hba| hba.abort(handle)).await
    }

    pub async fn abort_timed_out(&self, handle: PendingHandle) -> Result<(), HbaError> {
        self.with_engine(|hba| hba.abort_timed_out(handle)).await
    }

    pub async fn reset_target(&self, target: u8) -> Result<(), HbaError> {
        self.with_engine(|hba| hba.reset_target(target)).await
    }

    pub async fn reset_bus(&self) {
        self.with_engine(|hba| hba.reset_bus()).await;
        self.on_interrupt().await;
    }

    /// Runs `f` under the lock and delivers whatever it finished.
    async fn with_engine<R>(&self, f: impl FnOnce(&mut Hba<C>) -> R) -> R {
        let (out, results) = {
            let mut hba = self.hba.lock().await;
            let out = f(&mut hba);
            (out, hba.poll_completions())
        };
        self.route(results);
        out
    }

    /// Direct access to the engine, e.g. to drive a loopback controller.
    pub async fn with_hba<R>(&self, f: impl FnOnce(&mut Hba<C>) -> R) -> R {
        let mut hba = self.hba.lock().await;
        f(&mut hba)
    }

    /// Commands submitted through this adapter and not delivered yet.
    pub fn pending(&self) -> usize {
        self.waiters.len()
    }

    /// Polls the controller every `period` until `cancel` fires, for
    /// controllers without an interrupt line.
    pub fn spawn_service(self: &Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        this.on_interrupt().await;
                    },
                }
            }
        })
    }

    /// Stops the adapter and fails every waiter still pending.
    pub async fn shutdown(self: Arc<Self>) -> Result<()> {
        let Ok(this) = Arc::try_unwrap(self) else {
            bail!("host adapter still shared");
        };
        let left = this.hba.into_inner().detach();
        let delivered = left
            .into_iter()
            .filter_map(|r| this.waiters.remove(&r.handle).map(|(_, tx)| tx.send(r)))
            .filter(Result::is_ok)
            .count();
        debug!(delivered, "host adapter shut down");
        Ok(())
    }
}
