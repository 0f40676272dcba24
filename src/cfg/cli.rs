// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

pub const DEFAULT_CONFIG: &str = "tests/config.yaml";
pub const DEFAULT_LOGGER: &str = "tests/config_logger.yaml";

/// Options of the `symhba` demo binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliArgs {
    pub config: PathBuf,
    pub logger: PathBuf,
    /// Target ids to exercise.
    pub targets: Vec<u8>,
}

/// Parses `--config PATH`, `--logger PATH` and `--target ID` (repeatable).
pub fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<CliArgs> {
    let mut config = PathBuf::from(DEFAULT_CONFIG);
    let mut logger = PathBuf::from(DEFAULT_LOGGER);
    let mut targets = Vec::new();

    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        let mut value = || it.next().with_context(|| format!("{arg} needs a value"));
        match arg.as_str() {
            "--config" => config = PathBuf::from(value()?),
            "--logger" => logger = PathBuf::from(value()?),
            "--target" => {
                let v = value()?;
                targets.push(v.parse().with_context(|| format!("bad target id {v:?}"))?);
            },
            other => bail!("unknown argument {other:?}"),
        }
    }
    if targets.is_empty() {
        targets.push(0);
    }
    Ok(CliArgs {
        config,
        logger,
        targets,
    })
}

pub fn resolve_config_path<P: AsRef<Path>>(rel: P) -> Result<PathBuf> {
    let p = rel.as_ref();

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    abs.canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))
}
