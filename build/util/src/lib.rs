// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use std::env;
use std::path::{Path, PathBuf};

/// Name of the environment variable that selects a board description.
pub const BOARD_VAR: &str = "DSP_BOARD";

/// Board used when `DSP_BOARD` is unset.
pub const DEFAULT_BOARD: &str = "l4";

/// Exposes the CPU's M-profile architecture version. This isn't available in
/// rustc's standard environment.
///
/// This will set one of `cfg(armv6m`), `cfg(armv7m)`, or `cfg(armv8m)`
/// depending on the value of the `TARGET` environment variable. Host builds
/// (used for tests) get none of them.
pub fn expose_m_profile() -> Result<()> {
    println!("cargo::rustc-check-cfg=cfg(armv6m)");
    println!("cargo::rustc-check-cfg=cfg(armv7m)");
    println!("cargo::rustc-check-cfg=cfg(armv8m)");

    let target = env::var("TARGET")?;

    if target.starts_with("thumbv6m") {
        println!("cargo:rustc-cfg=armv6m");
    } else if target.starts_with("thumbv7m") || target.starts_with("thumbv7em")
    {
        println!("cargo:rustc-cfg=armv7m");
    } else if target.starts_with("thumbv8m") {
        println!("cargo:rustc-cfg=armv8m");
    } else if target.starts_with("thumb") {
        bail!("Don't know the target {target}");
    }
    Ok(())
}

/// Returns the selected board name, and arranges for the build script to be
/// re-run if the selection changes.
pub fn board_name() -> String {
    println!("cargo:rerun-if-env-changed={BOARD_VAR}");
    env::var(BOARD_VAR).unwrap_or_else(|_| DEFAULT_BOARD.to_string())
}

/// Exposes the board name into `cfg(target_board="...")`.
pub fn expose_target_board() {
    let board = board_name();
    println!("cargo::rustc-check-cfg=cfg(target_board, values(any()))");
    println!("cargo:rustc-cfg=target_board=\"{board}\"");
}

/// Directory holding the board description files, at the workspace root.
pub fn boards_dir() -> Result<PathBuf> {
    let manifest = env::var("CARGO_MANIFEST_DIR")?;
    for dir in Path::new(&manifest).ancestors() {
        let candidate = dir.join("boards");
        if candidate.is_dir() {
            return Ok(candidate);
        }
    }
    bail!("no boards/ directory above {manifest}");
}

///
/// Pulls the board description for purposes of a build task. This will fail
/// if the description for the selected board doesn't exist or can't parse.
/// Note that -- thanks to the magic of Serde -- `T` need not contain the
/// entire description, only those parts that a particular build script cares
/// about.
///
pub fn board_config<T: DeserializeOwned>() -> Result<T> {
    let board = board_name();
    let path = boards_dir()?.join(format!("{board}.toml"));
    println!("cargo:rerun-if-changed={}", path.display());
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading board file {}", path.display()))?;
    parse_config(&text)
        .with_context(|| format!("parsing board file {}", path.display()))
}

/// Parses a board description from TOML text.
pub fn parse_config<T: DeserializeOwned>(text: &str) -> Result<T> {
    Ok(toml::from_str(text)?)
}
