// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here in
//! the `arch` module, magically tailored for the current target.
//!
//! For this to work, each architecture support module must define the same set
//! of names. The ones the portable code relies on are:
//!
//! - `algorithm_entry`, turning a loaded image's entry address into something
//!   callable,
//! - `sync_loaded_code`, run after copying code into memory,
//! - `cycle_count`, the free-running cycle counter,
//! - `wake_relay`, requesting a relay pass from interrupt context,
//! - `force_resume`, restarting the runner after a fault.

cfg_if::cfg_if! {
    // Note: cfg_if! is slightly touchy about ordering and expression
    // complexity; this chain seems to be the best compromise.

    if #[cfg(all(target_os = "none", target_arch = "arm"))] {
        pub mod arm_m;
        pub use arm_m::*;
    } else if #[cfg(target_os = "none")] {
        compile_error!("support for this architecture not implemented");
    } else {
        // Host builds simulate just enough to test the portable code.
        pub mod fake;
        pub use fake::*;
    }
}
