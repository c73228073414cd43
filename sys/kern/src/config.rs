// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Board description, generated at build time from `boards/<board>.toml`.
//!
//! The board is chosen with the `DSP_BOARD` environment variable when
//! building; see `build.rs`.

/// A span of the physical address space.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Region {
    pub base: u32,
    pub size: u32,
}

impl Region {
    pub const fn end(&self) -> u32 {
        self.base + self.size
    }

    /// Number of samples that fit in the region.
    pub const fn sample_capacity(&self) -> usize {
        self.size as usize / core::mem::size_of::<abi::Sample>()
    }
}

/// A region that uploaded algorithm images may be loaded into.
#[derive(Copy, Clone, Debug)]
pub struct AlgorithmRegion {
    pub name: &'static str,
    pub region: Region,
    /// Whether the runner may execute from this region.
    pub execute: bool,
}

include!(concat!(env!("OUT_DIR"), "/board.rs"));
