//! Interrupt service and every recovery path of the engine.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Interrupt classification and the service loop.
pub mod dispatch;
/// Messages received from targets, negotiation included.
pub mod messages;
/// Data pointer recovery after a phase mismatch.
pub mod phase_mismatch;
/// Bus reset and controller reinitialization.
pub mod reset;
/// Selection timeout, unexpected disconnect and parity errors.
pub mod scsi_int;
/// CHECK CONDITION, BUSY and QUEUE FULL handling.
pub mod scsi_status;
/// Abort and device reset through select-for-abort.
pub mod task_mgmt;

pub use dispatch::{InterruptCause, classify};
