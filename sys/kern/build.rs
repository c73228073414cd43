// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::env;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

fn main() -> Result<()> {
    build_util::expose_m_profile()?;
    build_util::expose_target_board();

    let board: BoardConfig = build_util::board_config()?;
    board.check()?;
    generate_board(&board)?;

    Ok(())
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct BoardConfig {
    identifier: String,
    timer_frequency: u32,
    rate_dividers: [u32; 6],
    memory: MemoryMap,
    #[serde(default)]
    algorithm: Vec<AlgorithmRegion>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct MemoryMap {
    flash: Region,
    runner_ram: Region,
    input: Region,
    output: Region,
    generator: Region,
    runner_stack: Region,
}

#[derive(Copy, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct Region {
    base: u32,
    size: u32,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct AlgorithmRegion {
    name: String,
    base: u32,
    size: u32,
    #[serde(default)]
    execute: bool,
}

/// Sample exchanges hold at most this many bytes.
const MAX_EXCHANGE_BYTES: u32 = 8192 * 2;

impl BoardConfig {
    fn check(&self) -> Result<()> {
        if self.identifier.len() != 7 || !self.identifier.is_ascii() {
            bail!("identifier {:?} must be 7 ASCII bytes", self.identifier);
        }
        if self.rate_dividers.iter().any(|&d| d == 0) {
            bail!("rate dividers must be nonzero");
        }
        if self.algorithm.is_empty() {
            bail!("board defines no algorithm regions");
        }

        let m = &self.memory;
        for (name, r) in [
            ("flash", m.flash),
            ("runner_ram", m.runner_ram),
            ("input", m.input),
            ("output", m.output),
            ("generator", m.generator),
            ("runner_stack", m.runner_stack),
        ] {
            check_mpu_region(name, r)?;
        }
        for (name, r) in [
            ("input", m.input),
            ("output", m.output),
            ("generator", m.generator),
        ] {
            if r.size > MAX_EXCHANGE_BYTES {
                bail!("{name} region is larger than a sample exchange");
            }
        }
        if m.runner_stack.base % 8 != 0 || m.runner_stack.size % 8 != 0 {
            bail!("runner stack must be 8-byte aligned");
        }
        for a in &self.algorithm {
            check_mpu_region(
                &a.name,
                Region {
                    base: a.base,
                    size: a.size,
                },
            )?;
        }
        Ok(())
    }
}

/// ARMv7-M regions are power-of-two sized, at least 32 bytes, and aligned to
/// their size. A region whose size isn't a power of two is protected by the
/// next power of two up, so that one needs checking too.
fn check_mpu_region(name: &str, r: Region) -> Result<()> {
    let mpu_size = r
        .size
        .checked_next_power_of_two()
        .with_context(|| format!("{name} region is too large"))?;
    if mpu_size < 32 {
        bail!("{name} region is smaller than 32 bytes");
    }
    if r.base % mpu_size != 0 {
        bail!(
            "{name} region base {:#x} isn't aligned to {mpu_size:#x}",
            r.base
        );
    }
    Ok(())
}

fn region(r: Region) -> String {
    format!(
        "Region {{ base: {:#010x}, size: {:#x} }}",
        r.base, r.size
    )
}

fn generate_board(board: &BoardConfig) -> Result<()> {
    let out = &PathBuf::from(env::var_os("OUT_DIR").context("OUT_DIR")?);
    let mut file = File::create(out.join("board.rs"))?;

    writeln!(file, "// See build.rs for details")?;
    writeln!(
        file,
        "pub const IDENTIFIER: [u8; abi::IDENTIFIER_LEN] = *b{:?};",
        board.identifier
    )?;
    writeln!(
        file,
        "pub const TIMER_FREQUENCY: u32 = {};",
        board.timer_frequency
    )?;
    writeln!(
        file,
        "pub const RATE_DIVIDERS: [u32; abi::Rate::COUNT] = {:?};",
        board.rate_dividers
    )?;

    let m = &board.memory;
    for (name, r) in [
        ("FLASH", m.flash),
        ("RUNNER_RAM", m.runner_ram),
        ("INPUT", m.input),
        ("OUTPUT", m.output),
        ("GENERATOR", m.generator),
        ("RUNNER_STACK", m.runner_stack),
    ] {
        writeln!(file, "pub const {name}: Region = {};", region(r))?;
    }

    writeln!(
        file,
        "pub const ALGORITHM_REGIONS: [AlgorithmRegion; {}] = [",
        board.algorithm.len()
    )?;
    for a in &board.algorithm {
        writeln!(
            file,
            "    AlgorithmRegion {{ name: {:?}, region: {}, execute: {} }},",
            a.name,
            region(Region {
                base: a.base,
                size: a.size
            }),
            a.execute
        )?;
    }
    writeln!(file, "];")?;

    Ok(())
}
