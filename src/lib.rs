//! Core of a driver for SYM53C8XX-family SCSI host bus adapters: command
//! lifecycle, queue management, transfer negotiation and the
//! interrupt-driven recovery engine, written against an abstract SCRIPTS
//! controller.
// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Command control blocks, their registry and the controller-visible header.
pub mod ccb;
/// Handles configuration, command-line parsing, and logging.
pub mod cfg;
/// Async host adapter.
pub mod client;
/// Builders for the SCSI CDBs the engine and the demo issue.
pub mod control_block;
/// Bus-addressable memory shared with the controller.
pub mod dma;
/// The adapter engine: attach, submit, completion.
pub mod hba;
/// Register model, SCRIPTS entry points and the controller abstraction.
pub mod hw;
/// SCSI messages, status codes and sense data.
pub mod models;
/// Sync/wide/PPR negotiation.
pub mod nego;
/// Start and done queues.
pub mod queue;
/// Interrupt dispatch and every recovery path.
pub mod recovery;
/// State machines for async command execution.
pub mod state_machine;
/// Per-target and per-LUN control.
pub mod target;
