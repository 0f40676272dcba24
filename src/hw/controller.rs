// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::hw::regs::{Dstat, InterruptStatus, Reg, Sist};

/// Commands the core can issue to the SCRIPTS sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerCommand {
    /// Assert RST on the bus.
    ResetChannel,
    /// Resume fetching at the current DSP.
    StartChannel,
    /// Ask the sequencer to stop at its next idle point and raise
    /// `ScriptStopped`.
    PauseChannel,
    /// Stop immediately (ISTAT ABRT).
    AbortChannel,
    /// Soft reset of the chip core and reload of the queue pointers.
    InitializeChannel,
    /// Clear the DMA and SCSI FIFOs.
    PurgeFifo,
    SelectWithoutAtn { target: u8 },
    SelectWithAtn { target: u8 },
}

/// Register window and sequencer control of one SCRIPTS controller.
///
/// Reads of the interrupt status are read-to-clear: every call to
/// [`interrupt_status`](Self::interrupt_status) consumes what it returns.
pub trait ScriptsController: Send {
    fn read_reg(&mut self, reg: Reg) -> u32;
    fn write_reg(&mut self, reg: Reg, value: u32);

    fn read_reg8(&mut self, reg: Reg) -> u8 {
        (self.read_reg(reg) & 0xff) as u8
    }

    fn write_reg8(&mut self, reg: Reg, value: u8) {
        self.write_reg(reg, u32::from(value));
    }

    fn read_reg16(&mut self, reg: Reg) -> u16 {
        (self.read_reg(reg) & 0xffff) as u16
    }

    fn write_reg16(&mut self, reg: Reg, value: u16) {
        self.write_reg(reg, u32::from(value));
    }

    fn issue(&mut self, cmd: SequencerCommand);

    fn interrupt_status(&mut self) -> InterruptStatus;

    /// Enables exactly the given interrupt sources.
    fn set_interrupt_mask(&mut self, sist: Sist, dstat: Dstat);
}
