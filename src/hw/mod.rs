//! Register and sequencer interface of a SCRIPTS controller.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// The trait the engine drives a controller through.
pub mod controller;
/// Software controller used by tests and the demo.
pub mod loopback;
/// Register names and status bit layouts.
pub mod regs;
/// Script entry points and interrupt codes.
pub mod script;

pub use controller::{ScriptsController, SequencerCommand};
pub use loopback::{Completion, LoopbackController};
