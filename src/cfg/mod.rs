//! This module handles configuration, command-line parsing, and logging.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Command-line parsing of the demo binary.
pub mod cli;
/// Controller profile, recovery policy and per-target settings.
pub mod config;
/// Enumerations used in configuration.
pub mod enums;
/// JSON logger initialization.
pub mod logger;
