// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated architecture for host builds.
//!
//! There's no way to jump into an uploaded image on the host, so tests
//! register ordinary functions at the addresses their test images claim as
//! entry points. The cycle counter only moves when told to. All of this is
//! per-thread, so tests running in parallel don't see each other.

use std::cell::{Cell, RefCell};

use crate::loader::EntryFn;
use crate::recovery::ResumePoint;

thread_local! {
    static ALGORITHMS: RefCell<Vec<(u32, EntryFn)>> =
        const { RefCell::new(Vec::new()) };
    static CYCLES: Cell<u32> = const { Cell::new(0) };
    static RELAY_WAKEUPS: Cell<u32> = const { Cell::new(0) };
    static LAST_RESUME: Cell<Option<ResumePoint>> = const { Cell::new(None) };
}

/// Makes `f` the code that runs when an image's entry point is `addr`.
pub fn register_algorithm(addr: u32, f: EntryFn) {
    ALGORITHMS.with(|a| {
        let mut a = a.borrow_mut();
        a.retain(|&(x, _)| x != addr);
        a.push((addr, f));
    });
}

/// Looks up whatever was registered at `addr`.
pub fn algorithm_entry(addr: u32) -> Option<EntryFn> {
    ALGORITHMS.with(|a| {
        a.borrow()
            .iter()
            .find_map(|&(x, f)| (x == addr).then_some(f))
    })
}

pub fn sync_loaded_code() {}

pub fn cycle_count() -> u32 {
    CYCLES.with(Cell::get)
}

pub fn set_cycle_count(n: u32) {
    CYCLES.with(|c| c.set(n));
}

/// Moves the cycle counter forward, as if `n` cycles of work had been done.
pub fn advance_cycles(n: u32) {
    CYCLES.with(|c| c.set(c.get().wrapping_add(n)));
}

pub fn wake_relay() {
    RELAY_WAKEUPS.with(|w| w.set(w.get() + 1));
}

/// Number of times `wake_relay` has been called on this thread.
pub fn relay_wakeups() -> u32 {
    RELAY_WAKEUPS.with(Cell::get)
}

/// Records the request. There's no runner thread to restart.
///
/// # Safety
///
/// Always safe here; the real implementations aren't.
pub unsafe fn force_resume(point: &ResumePoint) {
    LAST_RESUME.with(|r| r.set(Some(*point)));
}

/// The last point passed to `force_resume` on this thread.
pub fn last_resume() -> Option<ResumePoint> {
    LAST_RESUME.with(Cell::get)
}
