// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Algorithm execution timing.
//!
//! Time is measured in CPU cycles, read from the architecture's cycle
//! counter immediately around the call into the algorithm.

use core::sync::atomic::{AtomicU32, Ordering};

/// Cycles spent measuring an algorithm that does nothing but return. This is
/// subtracted from every measurement so that the reported figure covers only
/// the algorithm's own code.
pub const MEASUREMENT_OVERHEAD: u32 = 196 - 1;

/// Holds the most recent execution-time measurement.
pub struct Stopwatch {
    last: AtomicU32,
}

impl Stopwatch {
    pub const fn new() -> Self {
        Self {
            last: AtomicU32::new(0),
        }
    }

    /// Records a measurement from two cycle-counter readings. The counter is
    /// allowed to wrap between them.
    pub fn record(&self, start: u32, end: u32) -> u32 {
        let elapsed = calibrate(end.wrapping_sub(start));
        self.last.store(elapsed, Ordering::Relaxed);
        elapsed
    }

    /// The most recent measurement, in cycles.
    pub fn last(&self) -> u32 {
        self.last.load(Ordering::Relaxed)
    }
}

impl Default for Stopwatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the measurement overhead from a raw cycle count. Counts that
/// don't exceed the overhead are left alone rather than clamped to zero.
pub fn calibrate(raw: u32) -> u32 {
    if raw > MEASUREMENT_OVERHEAD {
        raw - MEASUREMENT_OVERHEAD
    } else {
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overhead_is_subtracted() {
        let sw = Stopwatch::new();
        assert_eq!(sw.last(), 0);
        assert_eq!(sw.record(1000, 1000 + 195 + 500), 500);
        assert_eq!(sw.last(), 500);
    }

    #[test]
    fn small_counts_are_kept() {
        assert_eq!(calibrate(195), 195);
        assert_eq!(calibrate(10), 10);
        assert_eq!(calibrate(196), 1);
    }

    #[test]
    fn counter_wrap() {
        let sw = Stopwatch::new();
        assert_eq!(sw.record(u32::MAX - 99, 300), 400 - 195);
    }
}
