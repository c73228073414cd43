// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Conversion kernel.
//!
//! This is the part of the firmware that moves samples: it owns the sample
//! exchanges, loads uploaded algorithms, runs them against each half buffer
//! as it's captured, and recovers when one of them crashes.
//!
//! Code outside of the `arch` module is portable, and is tested on the host
//! against a simulated architecture (`arch::fake`). Only ARMv7-M is
//! supported on real hardware.
//!
//! # Design principles
//!
//! 1. Static configuration. Memory layout, algorithm regions and clock
//!    dividers come from a board description at build time; nothing is
//!    allocated at runtime.
//! 2. A strong preference for safe code where reasonable. The unsafe parts
//!    are the calls into uploaded code and the raw views of the exchanges,
//!    and both are kept in one place each.
//! 3. Untrusted code runs unprivileged, and its failures are reported, not
//!    fatal.

#![cfg_attr(target_os = "none", no_std)]

pub mod arch;

pub mod config;
pub mod conversion;
pub mod elf;
pub mod err;
pub mod fail;
pub mod loader;
pub mod mailbox;
pub mod periph;
pub mod recovery;
pub mod sclock;
#[cfg(target_os = "none")]
pub mod startup;
pub mod time;
