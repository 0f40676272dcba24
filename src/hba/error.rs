// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

use crate::{dma::DmaError, hba::request::PendingHandle};

/// Errors surfaced to the caller of the engine.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HbaError {
    /// No CCB, tag or nexus slot is free right now; retry later.
    #[error("resources busy, retry later")]
    Busy,
    #[error("DMA memory exhausted")]
    OutOfMemory,
    #[error("start queue overflow")]
    StartQueueOverflow,
    #[error("invalid target id {0}")]
    InvalidTarget(u8),
    #[error("invalid lun {0}")]
    InvalidLun(u8),
    #[error("target {0} is excluded from use")]
    ExcludedTarget(u8),
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    #[error("unknown handle {0:?}")]
    UnknownHandle(PendingHandle),
    #[error("unknown or free ccb")]
    UnknownCcb,
    #[error("lun {lun} of target {target} still has commands")]
    LunBusy { target: u8, lun: u8 },
    #[error(transparent)]
    Dma(DmaError),
}

impl From<DmaError> for HbaError {
    fn from(e: DmaError) -> Self {
        match e {
            DmaError::OutOfMemory(_) => HbaError::OutOfMemory,
            other => HbaError::Dma(other),
        }
    }
}

impl HbaError {
    /// Whether waiting for completions may make the request succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HbaError::Busy | HbaError::OutOfMemory)
    }
}
