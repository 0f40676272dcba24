// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::PathBuf};

use anyhow::Result;
use serial_test::serial;
use sym53c8xx_rs::cfg::logger::init_logger;

fn write_config(name: &str, body: &str) -> Result<PathBuf> {
    let path = std::env::temp_dir().join(format!("symhba-{}-{name}.yaml", std::process::id()));
    fs::write(&path, body)?;
    Ok(path)
}

#[test]
#[serial]
fn missing_config_file() {
    let err = init_logger("tests/no_such_logger.yaml").expect_err("must fail");
    assert!(format!("{err:#}").contains("failed to read logger config"));
}

#[test]
#[serial]
fn unknown_output_is_refused() -> Result<()> {
    let path = write_config(
        "nowhere",
        "logger:\n  level: info\n  output: nowhere\n  is_show_line: false\n  is_show_module_path: false\n  is_show_target: false\n",
    )?;
    let err = init_logger(path.to_str().unwrap_or_default()).expect_err("must fail");
    assert!(format!("{err:#}").contains("invalid log output"));
    fs::remove_file(path)?;
    Ok(())
}

#[test]
#[serial]
fn file_output_needs_a_path() -> Result<()> {
    let path = write_config(
        "nofile",
        "logger:\n  level: info\n  output: file\n  is_show_line: true\n  is_show_module_path: false\n  is_show_target: false\n",
    )?;
    let err = init_logger(path.to_str().unwrap_or_default()).expect_err("must fail");
    assert!(format!("{err:#}").contains("no file section"));
    fs::remove_file(path)?;
    Ok(())
}

#[test]
#[serial]
fn malformed_yaml_is_reported() -> Result<()> {
    let path = write_config("broken", "logger: [1, 2\n")?;
    let err = init_logger(path.to_str().unwrap_or_default()).expect_err("must fail");
    assert!(format!("{err:#}").contains("failed to parse logger config"));
    fs::remove_file(path)?;
    Ok(())
}
