// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{pin::Pin, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    client::host_adapter::HostAdapter,
    hba::{CommandRequest, CommandResult, PendingHandle},
    hw::ScriptsController,
    state_machine::common::{StateMachine, StateMachineCtx, Transition},
};

/// One command driven through the async adapter.
pub struct CommandCtx<'a, C: ScriptsController + 'static> {
    pub adapter: &'a HostAdapter<C>,
    pub request: CommandRequest,
    pub handle: Option<PendingHandle>,
    pub timeout: Duration,
    pub result: Option<CommandResult>,

    rx: Option<oneshot::Receiver<CommandResult>>,
    cancel: CancellationToken,
    state: Option<CommandStates>,
}

enum Interrupted {
    TimedOut,
    Cancelled,
}

impl<'a, C: ScriptsController + 'static> CommandCtx<'a, C> {
    pub fn new(adapter: &'a HostAdapter<C>, request: CommandRequest, timeout: Duration) -> Self {
        Self {
            adapter,
            request,
            handle: None,
            timeout,
            result: None,
            rx: None,
            cancel: CancellationToken::new(),
            state: Some(CommandStates::Submit(Submit)),
        }
    }

    async fn submit(&mut self) -> Result<()> {
        let (handle, rx) = self.adapter.submit(&self.request).await?;
        debug!(?handle, target = self.request.target, lun = self.request.lun, "command submitted");
        self.handle = Some(handle);
        self.rx = Some(rx);
        Ok(())
    }

    async fn wait_result(&mut self) -> Result<()> {
        let handle = self.handle.context("command was never submitted")?;
        let mut rx = self.rx.take().context("no completion channel")?;

        let interrupted = tokio::select! {
            r = &mut rx => {
                self.result = Some(r.map_err(|_| anyhow!("adapter dropped command {handle:?}"))?);
                return Ok(());
            },
            _ = tokio::time::sleep(self.timeout) => Interrupted::TimedOut,
            _ = self.cancel.cancelled() => Interrupted::Cancelled,
        };

        let aborted = match interrupted {
            Interrupted::TimedOut => {
                warn!(?handle, timeout = ?self.timeout, "command timed out, aborting");
                self.adapter.abort_timed_out(handle).await
            },
            Interrupted::Cancelled => {
                debug!(?handle, "command cancelled, aborting");
                self.adapter.abort(handle).await
            },
        };
        aborted.with_context(|| format!("abort of {handle:?} failed"))?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(r)) => {
                self.result = Some(r);
                Ok(())
            },
            Ok(Err(_)) => bail!("adapter dropped command {handle:?}"),
            Err(_) => bail!("command {handle:?} did not finish after abort"),
        }
    }
}

#[derive(Debug)]
pub struct Submit;
#[derive(Debug)]
pub struct Wait;

#[derive(Debug)]
pub enum CommandStates {
    Submit(Submit),
    Wait(Wait),
}

type CommandStepOut = Transition<CommandStates, Result<()>>;

impl<'ctx, C: ScriptsController + 'static> StateMachine<CommandCtx<'ctx, C>, CommandStepOut> for Submit {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = CommandStepOut> + Send + 'a>>
    where
        Self: 'a,
        CommandCtx<'ctx, C>: 'a;

    fn step<'a>(&'a self, ctx: &'a mut CommandCtx<'ctx, C>) -> Self::StepResult<'a> {
        Box::pin(async move {
            match ctx.submit().await {
                Ok(()) => Transition::Next(CommandStates::Wait(Wait), Ok(())),
                Err(e) => Transition::Done(Err(e)),
            }
        })
    }
}

impl<'ctx, C: ScriptsController + 'static> StateMachine<CommandCtx<'ctx, C>, CommandStepOut> for Wait {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = CommandStepOut> + Send + 'a>>
    where
        Self: 'a,
        CommandCtx<'ctx, C>: 'a;

    fn step<'a>(&'a self, ctx: &'a mut CommandCtx<'ctx, C>) -> Self::StepResult<'a> {
        Box::pin(async move { Transition::Done(ctx.wait_result().await) })
    }
}

impl<'ctx, C: ScriptsController + 'static> StateMachineCtx<CommandCtx<'ctx, C>, CommandResult>
    for CommandCtx<'ctx, C>
{
    async fn execute(&mut self, cancel: &CancellationToken) -> Result<CommandResult> {
        self.cancel = cancel.clone();
        loop {
            let state = self.state.take().context("state must be set CommandCtx")?;
            let tr = match state {
                CommandStates::Submit(s) => s.step(self).await,
                CommandStates::Wait(s) => s.step(self).await,
            };

            match tr {
                Transition::Next(next, r) => {
                    r?;
                    self.state = Some(next);
                },
                Transition::Stay(Ok(())) => {},
                Transition::Stay(Err(e)) => return Err(e),
                Transition::Done(r) => {
                    r?;
                    return self
                        .result
                        .take()
                        .ok_or_else(|| anyhow!("no result in ctx"));
                },
            }
        }
    }
}
