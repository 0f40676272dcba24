//! Command control blocks: the per-command record shared between the host
//! and the SCRIPTS processor.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Host-side CCB record and lifecycle markers.
#[allow(clippy::module_inception)]
pub mod ccb;
/// Bus-visible CCB header and scatter/gather layout.
pub mod hw_header;
/// Arena, free list and bus-address lookup.
pub mod registry;

pub use ccb::{AbortMark, Ccb, CcbId, CcbState, SavedStatus};
pub use hw_header::{CcbHeader, DataPointer, SgEntry};
pub use registry::CcbRegistry;
