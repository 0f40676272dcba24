//! The host bus adapter engine: submission, completion and the state it
//! shares with the recovery paths.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Done queue draining and result delivery.
pub mod completion;
/// The adapter aggregate, its state and accessors.
pub mod engine;
pub mod error;
/// What callers submit and what they get back.
pub mod request;
/// CCB binding and the start queue path.
pub mod submit;

pub use engine::{EngineState, ErrorKind, Hba, HbaStats, dma_pool};
pub use error::HbaError;
pub use request::{CommandRequest, CommandResult, DataDirection, DataSegment, PendingHandle};
