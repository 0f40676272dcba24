//! Async front end over the synchronous engine.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Lock-guarded adapter that routes results to per-command waiters.
pub mod host_adapter;

pub use host_adapter::HostAdapter;
