//! Transfer agreement negotiation (SDTR, WDTR and PPR).

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

/// Proposals, answers, fallbacks and goal downgrades.
pub mod engine;
/// Clock divisor search and register encoding.
pub mod sync;

pub use engine::{NegoKind, NegoOutcome, NegotiationEngine};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NegoError {
    #[error("period factor {factor} cannot be produced from this clock")]
    Unreachable { factor: u8 },
}
