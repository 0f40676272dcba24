// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use tokio_util::sync::CancellationToken;

/// Outcome of one step of a command state machine.
pub enum Transition<S, R> {
    /// Move on to `S` after recording `R`.
    Next(S, R),
    /// Run the same state again.
    Stay(R),
    /// The command is finished.
    Done(R),
}

/// One state of a command. A step may await the engine, the completion
/// channel or a timer.
pub trait StateMachine<Ctx, Resp>: Sized {
    type StepResult<'a>: Future<Output = Resp> + Send + 'a
    where
        Self: 'a,
        Resp: 'a,
        Ctx: 'a;

    fn step<'a>(&'a self, ctx: &'a mut Ctx) -> Self::StepResult<'a>;
}

/// Drives a context through its states until a result is produced or
/// `cancel` fires.
pub trait StateMachineCtx<Ctx, Out = ()>: Sized {
    fn execute(&mut self, cancel: &CancellationToken) -> impl Future<Output = Result<Out>>;
}
