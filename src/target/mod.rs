//! Per-target and per-LUN control blocks.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Per-LUN tags, wait queue and queue depth.
pub mod lcb;
/// Per-target transfer agreement and negotiation state.
pub mod tcb;

pub use lcb::LunControl;
pub use tcb::{NegoInFlight, TargetControl, TransferParams};
