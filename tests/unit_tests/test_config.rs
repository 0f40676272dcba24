// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use sym53c8xx_rs::cfg::{
    cli::{DEFAULT_CONFIG, parse_args, resolve_config_path},
    config::Config,
    enums::{BusGeneration, ChipFamily, YesNo},
};

fn args(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

#[test]
fn load_test_config() -> Result<()> {
    let cfg = Config::load_from_file(resolve_config_path(DEFAULT_CONFIG)?)?;
    assert_eq!(cfg.controller.name, "sym0");
    assert_eq!(cfg.controller.family, ChipFamily::C10);
    assert_eq!(cfg.controller.generation, BusGeneration::Ultra3);
    assert_eq!(cfg.controller.dma_base, 0x0010_0000);
    assert_eq!(cfg.controller.queue_slots, 64);
    assert_eq!(cfg.policy.sense_len, 32);
    assert_eq!(cfg.runtime.command_timeout, Duration::from_secs(5));
    assert_eq!(cfg.runtime.busy_retry_delay, Duration::from_millis(1));
    Ok(())
}

#[test]
fn overrides_apply_per_target() -> Result<()> {
    let cfg = Config::load_from_file(resolve_config_path(DEFAULT_CONFIG)?)?;
    let t = &cfg.targets;
    assert_eq!(t.settings_for(0).tagged_queuing, YesNo::Yes);
    assert_eq!(t.settings_for(4).tagged_queuing, YesNo::No);
    assert_eq!(t.settings_for(4).max_tags, 16);
    assert_eq!(t.settings_for(5).excluded, YesNo::Yes);
    assert_eq!(t.settings_for(6).excluded, YesNo::No);
    Ok(())
}

#[test]
fn legacy_chip_drops_ultra3() -> Result<()> {
    let mut cfg = Config::default();
    cfg.controller.u3en = YesNo::Yes;
    cfg.validate_and_normalize()?;
    assert_eq!(cfg.controller.u3en, YesNo::No);
    Ok(())
}

#[test]
fn bad_queue_sizes_are_refused() {
    let mut cfg = Config::default();
    cfg.controller.queue_slots = 100;
    assert!(cfg.validate_and_normalize().is_err());

    let mut cfg = Config::default();
    cfg.controller.queue_slots = 128;
    cfg.controller.max_ccbs = 127;
    assert!(cfg.validate_and_normalize().is_err());

    let mut cfg = Config::default();
    cfg.policy.sense_len = 8;
    assert!(cfg.validate_and_normalize().is_err());
}

#[test]
fn prealloc_is_capped() -> Result<()> {
    let mut cfg = Config::default();
    cfg.controller.max_ccbs = 4;
    cfg.controller.prealloc_ccbs = 10;
    cfg.validate_and_normalize()?;
    assert_eq!(cfg.controller.prealloc_ccbs, 4);
    Ok(())
}

const TINY: &str = r#"
controller:
  Name: tiny
  Family: Legacy
  BusGeneration: Ultra2
  U3Enable: No
  ClockKhz: 80000
  ClockDivisors: 4
  MinSyncFactorDt: 9
  MaxOffset: 16
  MaxOffsetDt: 0
  MaxWidth: 1
  HostId: 7
  MaxTargets: 8
  MaxLuns: 1
  MaxCcbs: 6
  QueueSlots: 8
  MaxSgEntries: 16
  DmaCoalesce: No
  DmaBase: 0x00200000
targets:
  Overrides:
    - Id: 2
      MaxTags: 200
"#;

#[test]
fn omitted_sections_take_defaults() -> Result<()> {
    let mut cfg: Config = serde_yaml::from_str(TINY)?;
    cfg.validate_and_normalize()?;
    assert_eq!(cfg.controller.name, "tiny");
    assert_eq!(cfg.controller.prealloc_ccbs, 0);
    assert_eq!(cfg.policy.max_retries, 3);
    assert_eq!(cfg.runtime.max_submit_attempts, 100);
    assert_eq!(cfg.targets.settings_for(2).max_tags, 64);
    assert_eq!(cfg.targets.settings_for(1).wide, YesNo::Yes);
    Ok(())
}

#[test]
fn override_beyond_max_targets_is_refused() -> Result<()> {
    let mut cfg: Config = serde_yaml::from_str(&TINY.replace("Id: 2", "Id: 9"))?;
    assert!(cfg.validate_and_normalize().is_err());
    Ok(())
}

#[test]
fn missing_chip_field_fails_to_parse() {
    let broken = TINY.replace("  ClockKhz: 80000\n", "");
    assert!(serde_yaml::from_str::<Config>(&broken).is_err());
}

#[test]
fn cli_arguments() -> Result<()> {
    let a = parse_args(args(&["--config", "a.yaml", "--target", "2", "--target", "4"]))?;
    assert_eq!(a.config.to_string_lossy(), "a.yaml");
    assert_eq!(a.targets, vec![2, 4]);

    let a = parse_args(args(&[]))?;
    assert_eq!(a.targets, vec![0]);

    assert!(parse_args(args(&["--target"])).is_err());
    assert!(parse_args(args(&["--target", "x"])).is_err());
    assert!(parse_args(args(&["--verbose"])).is_err());
    Ok(())
}
