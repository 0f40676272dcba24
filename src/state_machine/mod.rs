//! State machines driving commands through the async adapter.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Common structures and traits for state machines.
pub mod common;
/// Submit, wait, and abort-on-timeout for one command.
pub mod command_states;
