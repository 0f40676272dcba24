// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::{
    cfg::{
        config::ControllerConfig,
        enums::{BusGeneration, ChipFamily},
    },
    hw::regs::{
        SCNTL3_EWS, SCNTL3_ULTRA, SCNTL4_AIPCKEN, SCNTL4_U3EN, SCNTL4_XCLKH_DT,
        SCNTL4_XCLKH_ST, SCNTL4_XCLKS_DT, SCNTL4_XCLKS_ST,
    },
    models::message::PprOptions,
    nego::NegoError,
};

/// SCSI clock divisors, scaled by 10 MHz: 1, 1.5, 2, 3, 4, 6, 8.
pub const DIV_10M: [u64; 7] = [
    2 * 5_000_000,
    3 * 5_000_000,
    4 * 5_000_000,
    6 * 5_000_000,
    8 * 5_000_000,
    12 * 5_000_000,
    16 * 5_000_000,
];

/// Slowest asynchronous clock allowed, in ns.
const MIN_ASYNC_NS: u64 = 40;

/// What the chip can do on the wire, derived once from the controller
/// profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipLimits {
    pub c10: bool,
    pub u3en: bool,
    pub clock_khz: u32,
    pub clock_divn: usize,
    pub minsync: u8,
    pub maxsync: u8,
    pub minsync_dt: u8,
    pub maxoffs: u8,
    pub maxoffs_dt: u8,
    pub maxwide: u8,
    /// Clock conversion bits used for asynchronous transfers.
    pub rv_scntl3: u8,
}

impl ChipLimits {
    pub fn from_config(c: &ControllerConfig) -> Self {
        let c10 = c.family == ChipFamily::C10;
        let u3en = c10 && c.u3en.as_bool();
        let clk = u64::from(c.clock_khz.max(1));
        let divn = usize::from(c.clock_divn).clamp(1, DIV_10M.len());

        // async clock divisor, at most 25 MHz
        let rv_scntl3 = if c10 {
            0
        } else {
            let mut i = divn as i32 - 1;
            loop {
                i -= 1;
                if i < 0 {
                    break;
                }
                if 10 * MIN_ASYNC_NS * clk > DIV_10M[i as usize] {
                    i += 1;
                    break;
                }
            }
            (i + 1) as u8
        };

        // fastest period in tenths of ns
        let period = (4 * DIV_10M[0] + clk - 1) / clk;
        let mut minsync: u8 = match period {
            0..=250 => 10,
            251..=303 => 11,
            304..=500 => 12,
            p => ((p + 40 - 1) / 40).min(255) as u8,
        };
        match c.generation {
            BusGeneration::Fast if minsync < 25 => minsync = 25,
            BusGeneration::Ultra if minsync < 12 => minsync = 12,
            _ => {},
        }
        if let Some(floor) = c.min_sync {
            minsync = minsync.max(floor);
        }

        let slowest = 11 * DIV_10M[divn - 1] / (4 * clk);
        let maxsync = if slowest > 2540 {
            254
        } else {
            (slowest / 10) as u8
        };

        Self {
            c10,
            u3en,
            clock_khz: c.clock_khz,
            clock_divn: divn,
            minsync,
            maxsync,
            minsync_dt: if u3en { c.min_sync_dt } else { minsync },
            maxoffs: c.max_offset,
            maxoffs_dt: if u3en { c.max_offset_dt } else { 0 },
            maxwide: c.max_width.min(1),
            rv_scntl3,
        }
    }

    /// Offset mask of SXFER on this family.
    pub fn offset_mask(&self) -> u8 {
        if self.c10 { 0x3f } else { 0x1f }
    }
}

/// Transfer period, in tenths of ns, for a period factor.
pub fn period_tenths(dt: bool, factor: u8) -> u32 {
    match factor {
        f if dt && f <= 9 => 125,
        0..=10 => 250,
        11 => 303,
        12 => 500,
        f => 40 * u32::from(f),
    }
}

/// Clock divisor index and extra clocks selected for a period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncDivisor {
    pub div: u8,
    pub fak: u8,
}

/// Chooses the divisor for `factor`. Fails when no divisor and extra clock
/// combination reaches the period.
pub fn compute_divisor(limits: &ChipLimits, dt: bool, factor: u8) -> Result<SyncDivisor, NegoError> {
    let clk = u64::from(limits.clock_khz);
    let mut kpc = u64::from(period_tenths(dt, factor)) * clk;
    if dt {
        kpc <<= 1;
    }
    let divn = limits.clock_divn;
    let mut div = divn;

    if limits.c10 && !limits.u3en {
        // lowest divisor whose output is not faster than the period
        while div > 0 {
            div -= 1;
            if kpc > (DIV_10M[div] << 2) {
                div += 1;
                break;
            }
        }
        if div == divn {
            return Err(NegoError::Unreachable { factor });
        }
        return Ok(SyncDivisor {
            div: div as u8,
            fak: 0,
        });
    }

    loop {
        div -= 1;
        if div == 0 || kpc >= (DIV_10M[div] << 2) {
            break;
        }
    }

    let fak = if dt {
        ((kpc - 1) / (DIV_10M[div] << 1) + 1) as i64 - 2
    } else {
        ((kpc - 1) / DIV_10M[div] + 1) as i64 - 4
    };
    if !(0..=2).contains(&fak) {
        return Err(NegoError::Unreachable { factor });
    }
    Ok(SyncDivisor {
        div: div as u8,
        fak: fak as u8,
    })
}

/// Values of SXFER, SCNTL3 and SCNTL4 for one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncRegisters {
    pub sxfer: u8,
    pub scntl3: u8,
    pub scntl4: u8,
}

impl SyncRegisters {
    /// Asynchronous narrow settings.
    pub fn asynchronous(limits: &ChipLimits) -> Self {
        Self {
            sxfer: 0,
            scntl3: limits.rv_scntl3,
            scntl4: 0,
        }
    }

    /// Encodes a negotiated agreement into register values.
    pub fn encode(
        limits: &ChipLimits,
        offset: u8,
        period: u8,
        wide: bool,
        sync: Option<SyncDivisor>,
        options: PprOptions,
    ) -> Self {
        let mut r = Self::asynchronous(limits);
        r.sxfer = offset & limits.offset_mask();

        if let Some(SyncDivisor { div, fak }) = sync.filter(|_| offset != 0) {
            r.scntl3 = (r.scntl3 & !0x70) | ((div + 1) << 4);
            if !limits.c10 {
                r.sxfer |= fak << 5;
            } else {
                if fak >= 1 {
                    r.scntl4 |= SCNTL4_XCLKH_ST | SCNTL4_XCLKH_DT;
                }
                if fak >= 2 {
                    r.scntl4 |= SCNTL4_XCLKS_ST | SCNTL4_XCLKS_DT;
                }
            }
        }

        if wide {
            r.scntl3 |= SCNTL3_EWS;
        }

        if limits.c10 {
            r.scntl4 &= !(SCNTL4_U3EN | SCNTL4_AIPCKEN);
            if !options.is_empty() {
                r.scntl4 |= SCNTL4_U3EN;
            }
        } else if offset != 0 && period <= 12 {
            r.scntl3 |= SCNTL3_ULTRA;
        }
        r
    }
}
