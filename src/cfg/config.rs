// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::{
    cfg::enums::{BusGeneration, ChipFamily, YesNo},
    models::message::PprOptions,
    target::TransferParams,
};

/// Highest tag count per LUN; tag bytes are `2 * tag + 1`.
pub const MAX_TAGS: u8 = 64;
/// Longest scatter/gather table one CCB can carry.
pub const MAX_SG: u16 = 255;

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Config {
    /// Chip profile and resource limits of the host adapter.
    pub controller: ControllerConfig,
    /// Error recovery and queue depth policy.
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Per-target capabilities and overrides.
    #[serde(default)]
    pub targets: TargetsConfig,
    /// Settings of the async host adapter wrapper.
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Chip profile and resource sizing.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ControllerConfig {
    #[serde(default = "default_name", rename = "Name")]
    /// Name used in log records.
    pub name: String,

    #[serde(rename = "Family")]
    pub family: ChipFamily,

    #[serde(rename = "BusGeneration")]
    pub generation: BusGeneration,

    #[serde(rename = "U3Enable")]
    /// Ultra3 (DT, PPR) support; only meaningful on C10 parts.
    pub u3en: YesNo,

    #[serde(rename = "ClockKhz")]
    /// SCSI core clock after any doubler or quadrupler.
    pub clock_khz: u32,

    #[serde(rename = "ClockDivisors")]
    /// Number of usable entries in the divisor table (1..=7).
    pub clock_divn: u8,

    #[serde(default, rename = "MinSyncFactor")]
    /// Floor for the synchronous period factor, on top of the clock limit.
    pub min_sync: Option<u8>,

    #[serde(rename = "MinSyncFactorDt")]
    pub min_sync_dt: u8,

    #[serde(rename = "MaxOffset")]
    pub max_offset: u8,

    #[serde(rename = "MaxOffsetDt")]
    pub max_offset_dt: u8,

    #[serde(rename = "MaxWidth")]
    /// Width exponent: 0 for 8-bit, 1 for 16-bit.
    pub max_width: u8,

    #[serde(rename = "HostId")]
    pub host_id: u8,

    #[serde(rename = "MaxTargets")]
    pub max_targets: u8,

    #[serde(rename = "MaxLuns")]
    pub max_luns: u8,

    #[serde(rename = "MaxCcbs")]
    pub max_ccbs: u16,

    #[serde(default, rename = "PreallocatedCcbs")]
    pub prealloc_ccbs: u16,

    #[serde(rename = "QueueSlots")]
    /// Entries in the start and done rings.
    pub queue_slots: u16,

    #[serde(rename = "MaxSgEntries")]
    pub max_sg: u16,

    #[serde(rename = "DmaCoalesce")]
    /// Merge freed DMA chunks with their buddies.
    pub dma_coalesce: YesNo,

    #[serde(default, rename = "DmaPageLimit")]
    pub dma_page_limit: Option<usize>,

    #[serde(rename = "DmaBase")]
    /// First bus address handed out for DMA pages.
    pub dma_base: u32,
}

fn default_name() -> String {
    "sym0".to_string()
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            family: ChipFamily::Legacy,
            generation: BusGeneration::Ultra2,
            u3en: YesNo::No,
            clock_khz: 80_000,
            clock_divn: 4,
            min_sync: None,
            min_sync_dt: 9,
            max_offset: 31,
            max_offset_dt: 31,
            max_width: 1,
            host_id: 7,
            max_targets: 16,
            max_luns: 64,
            max_ccbs: 128,
            prealloc_ccbs: 8,
            queue_slots: 256,
            max_sg: 96,
            dma_coalesce: YesNo::No,
            dma_page_limit: None,
            dma_base: 0x0010_0000,
        }
    }
}

/// Recovery policy.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PolicyConfig {
    #[serde(rename = "QueueDepthRatchetUp")]
    /// Good completions needed before the queue depth grows by one.
    pub ratchet_up: u32,

    #[serde(rename = "MaxRetries")]
    /// Replays of a BUSY or QUEUE FULL command before it is reported.
    pub max_retries: u8,

    #[serde(rename = "SenseLength")]
    /// Allocation length of the automatic REQUEST SENSE.
    pub sense_len: u8,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            ratchet_up: 200,
            max_retries: 3,
            sense_len: 32,
        }
    }
}

/// Protocol options asked for in PPR.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PprConfig {
    #[serde(rename = "DT")]
    pub dt: YesNo,
    #[serde(rename = "IU")]
    pub iu: YesNo,
    #[serde(rename = "QAS")]
    pub qas: YesNo,
}

impl Default for PprConfig {
    fn default() -> Self {
        Self {
            dt: YesNo::No,
            iu: YesNo::No,
            qas: YesNo::No,
        }
    }
}

impl PprConfig {
    pub fn options(&self) -> PprOptions {
        let mut o = PprOptions::empty();
        o.set(PprOptions::DT, self.dt.as_bool());
        o.set(PprOptions::IU, self.iu.as_bool());
        o.set(PprOptions::QAS, self.qas.as_bool());
        o
    }
}

/// Capabilities the host allows for one target.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct TargetSettings {
    #[serde(rename = "Disconnect")]
    pub disconnect: YesNo,

    #[serde(rename = "TaggedQueuing")]
    pub tagged_queuing: YesNo,

    #[serde(rename = "MaxTags")]
    pub max_tags: u8,

    #[serde(rename = "SyncPeriodFactor")]
    pub sync_period: u8,

    #[serde(rename = "SyncOffset")]
    /// 0 keeps the target asynchronous.
    pub sync_offset: u8,

    #[serde(rename = "WideBus")]
    pub wide: YesNo,

    #[serde(default, rename = "Ppr")]
    pub ppr: PprConfig,

    #[serde(default = "no", rename = "Excluded")]
    /// Never issue commands to this id.
    pub excluded: YesNo,
}

fn no() -> YesNo {
    YesNo::No
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            disconnect: YesNo::Yes,
            tagged_queuing: YesNo::Yes,
            max_tags: 16,
            sync_period: 10,
            sync_offset: 31,
            wide: YesNo::Yes,
            ppr: PprConfig::default(),
            excluded: YesNo::No,
        }
    }
}

impl TargetSettings {
    /// Starting negotiation goal.
    pub fn goal(&self) -> TransferParams {
        TransferParams {
            period: if self.sync_offset == 0 { 0 } else { self.sync_period },
            offset: self.sync_offset,
            width: u8::from(self.wide.as_bool()),
            options: self.ppr.options(),
        }
    }
}

/// Per-id changes on top of the defaults.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetOverride {
    #[serde(rename = "Id")]
    pub id: u8,
    #[serde(default, rename = "Disconnect", skip_serializing_if = "Option::is_none")]
    pub disconnect: Option<YesNo>,
    #[serde(default, rename = "TaggedQueuing", skip_serializing_if = "Option::is_none")]
    pub tagged_queuing: Option<YesNo>,
    #[serde(default, rename = "MaxTags", skip_serializing_if = "Option::is_none")]
    pub max_tags: Option<u8>,
    #[serde(default, rename = "SyncPeriodFactor", skip_serializing_if = "Option::is_none")]
    pub sync_period: Option<u8>,
    #[serde(default, rename = "SyncOffset", skip_serializing_if = "Option::is_none")]
    pub sync_offset: Option<u8>,
    #[serde(default, rename = "WideBus", skip_serializing_if = "Option::is_none")]
    pub wide: Option<YesNo>,
    #[serde(default, rename = "Ppr", skip_serializing_if = "Option::is_none")]
    pub ppr: Option<PprConfig>,
    #[serde(default, rename = "Excluded", skip_serializing_if = "Option::is_none")]
    pub excluded: Option<YesNo>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct TargetsConfig {
    #[serde(default, rename = "Defaults")]
    pub defaults: TargetSettings,
    #[serde(default, rename = "Overrides")]
    pub overrides: Vec<TargetOverride>,
}

impl TargetsConfig {
    /// Effective settings of target `id`.
    pub fn settings_for(&self, id: u8) -> TargetSettings {
        let mut s = self.defaults.clone();
        for o in self.overrides.iter().filter(|o| o.id == id) {
            if let Some(v) = o.disconnect {
                s.disconnect = v;
            }
            if let Some(v) = o.tagged_queuing {
                s.tagged_queuing = v;
            }
            if let Some(v) = o.max_tags {
                s.max_tags = v;
            }
            if let Some(v) = o.sync_period {
                s.sync_period = v;
            }
            if let Some(v) = o.sync_offset {
                s.sync_offset = v;
            }
            if let Some(v) = o.wide {
                s.wide = v;
            }
            if let Some(v) = &o.ppr {
                s.ppr = v.clone();
            }
            if let Some(v) = o.excluded {
                s.excluded = v;
            }
        }
        s
    }
}

/// Settings of the async wrapper around the engine.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RuntimeConfig {
    #[serde(rename = "CommandTimeout", with = "serde_secs")]
    /// How long `execute` waits before aborting a command.
    pub command_timeout: Duration,

    #[serde(rename = "BusyRetryDelayMs", with = "serde_millis")]
    /// Pause before resubmitting after a Busy refusal.
    pub busy_retry_delay: Duration,

    #[serde(rename = "MaxSubmitAttempts")]
    pub max_submit_attempts: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(30),
            busy_retry_delay: Duration::from_millis(5),
            max_submit_attempts: 100,
        }
    }
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        let c = &mut self.controller;

        if c.family == ChipFamily::Legacy && c.u3en.as_bool() {
            c.u3en = YesNo::No;
        }
        ensure!(
            (1..=7).contains(&c.clock_divn),
            "ClockDivisors must be within 1..=7"
        );
        ensure!(c.clock_khz >= 1_000, "ClockKhz must be at least 1000");
        ensure!(
            (1..=16).contains(&c.max_targets),
            "MaxTargets must be within 1..=16"
        );
        ensure!(c.host_id < c.max_targets, "HostId must be below MaxTargets");
        ensure!((1..=64).contains(&c.max_luns), "MaxLuns must be within 1..=64");
        ensure!(c.max_width <= 1, "MaxWidth must be 0 or 1");
        ensure!(c.max_ccbs >= 1, "MaxCcbs must be >= 1");
        ensure!(
            c.queue_slots.is_power_of_two() && (8..=1024).contains(&c.queue_slots),
            "QueueSlots must be a power of two within 8..=1024"
        );
        ensure!(
            usize::from(c.max_ccbs) + 2 <= usize::from(c.queue_slots),
            "QueueSlots must exceed MaxCcbs by at least 2"
        );
        ensure!(
            (1..=MAX_SG).contains(&c.max_sg),
            "MaxSgEntries must be within 1..={MAX_SG}"
        );
        if c.prealloc_ccbs > c.max_ccbs {
            c.prealloc_ccbs = c.max_ccbs;
        }
        let offset_mask = if c.family == ChipFamily::C10 { 0x3f } else { 0x1f };
        ensure!(c.max_offset <= offset_mask, "MaxOffset exceeds the SXFER field");
        ensure!(
            c.max_offset_dt <= offset_mask,
            "MaxOffsetDt exceeds the SXFER field"
        );

        let p = &self.policy;
        ensure!(p.ratchet_up >= 1, "QueueDepthRatchetUp must be >= 1");
        ensure!(p.sense_len >= 18, "SenseLength must hold fixed format sense");

        let t = &mut self.targets;
        t.defaults.max_tags = t.defaults.max_tags.clamp(1, MAX_TAGS);
        for o in &mut t.overrides {
            ensure!(
                o.id < self.controller.max_targets,
                "override for target {} beyond MaxTargets",
                o.id
            );
            if let Some(m) = o.max_tags.as_mut() {
                *m = (*m).clamp(1, MAX_TAGS);
            }
        }

        ensure!(
            self.runtime.max_submit_attempts >= 1,
            "MaxSubmitAttempts must be >= 1"
        );
        Ok(())
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}
