//! SCSI-level vocabulary shared by the engine: statuses, bus messages and
//! sense data.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// SCSI bus messages and their encodings.
pub mod message;
/// Fixed and descriptor format sense data.
pub mod sense_data;
/// Device status, host status and extended error bits.
pub mod status;
