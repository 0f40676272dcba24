// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use serde::{Deserialize, Serialize};

/// Boolean enumeration with string serialization support
///
/// Represents yes/no values with support for various string representations
/// including "Yes"/"No", "true"/"false", and "1"/"0".
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum YesNo {
    #[serde(
        rename = "Yes",
        alias = "yes",
        alias = "YES",
        alias = "true",
        alias = "True",
        alias = "1"
    )]
    Yes,
    #[serde(
        rename = "No",
        alias = "no",
        alias = "NO",
        alias = "false",
        alias = "False",
        alias = "0"
    )]
    No,
}
impl fmt::Display for YesNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            YesNo::Yes => "Yes",
            YesNo::No => "No",
        })
    }
}
impl From<bool> for YesNo {
    fn from(b: bool) -> Self {
        if b { YesNo::Yes } else { YesNo::No }
    }
}
impl YesNo {
    pub fn as_bool(self) -> bool {
        matches!(self, YesNo::Yes)
    }
}

/// Controller family. C10 parts (53C1010) use hardwired async divisors, a
/// 6-bit offset field and SCNTL4 for Ultra3 clocking.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipFamily {
    #[serde(rename = "Legacy", alias = "legacy", alias = "LEGACY")]
    Legacy,
    #[serde(rename = "C10", alias = "c10", alias = "1010")]
    C10,
}
impl fmt::Display for ChipFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChipFamily::Legacy => "Legacy",
            ChipFamily::C10 => "C10",
        })
    }
}

/// Fastest SCSI generation the bus interface supports. Caps the minimum
/// synchronous period factor: Fast 25, Ultra 12, Ultra2 and Ultra3 by clock.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusGeneration {
    #[serde(rename = "Fast", alias = "fast")]
    Fast,
    #[serde(rename = "Ultra", alias = "ultra")]
    Ultra,
    #[serde(rename = "Ultra2", alias = "ultra2")]
    Ultra2,
    #[serde(rename = "Ultra3", alias = "ultra3")]
    Ultra3,
}
impl fmt::Display for BusGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BusGeneration::Fast => "Fast",
            BusGeneration::Ultra => "Ultra",
            BusGeneration::Ultra2 => "Ultra2",
            BusGeneration::Ultra3 => "Ultra3",
        })
    }
}
