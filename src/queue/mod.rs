//! Start and done rings shared with the SCRIPTS processor.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod done_queue;
pub mod start_queue;

pub use done_queue::DoneQueue;
pub use start_queue::StartQueue;
