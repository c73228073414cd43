// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sample clock bookkeeping.
//!
//! One hardware timer paces both the capture path and the signal generator.
//! This tracks which rate preset is selected and what the timer has to be
//! programmed with to produce it. The capture driver, which lives outside the
//! kernel, does the programming.

use core::sync::atomic::{AtomicU8, Ordering};

use abi::Rate;

use crate::config;

pub struct SampleClock {
    dividers: [u32; Rate::COUNT],
    rate: AtomicU8,
}

impl SampleClock {
    pub const fn new(dividers: [u32; Rate::COUNT]) -> Self {
        Self {
            dividers,
            rate: AtomicU8::new(Rate::R32K as u8),
        }
    }

    /// A clock using this board's timer.
    pub const fn board() -> Self {
        Self::new(config::RATE_DIVIDERS)
    }

    pub fn rate(&self) -> Rate {
        Rate::from_index(self.rate.load(Ordering::Relaxed)).unwrap_or_default()
    }

    pub fn set_rate(&self, rate: Rate) {
        self.rate.store(rate.index(), Ordering::Relaxed);
    }

    /// Divider that gets `rate` out of the board's timer clock.
    pub fn divider(&self, rate: Rate) -> u32 {
        self.dividers[usize::from(rate.index())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIVIDERS: [u32; Rate::COUNT] = [4500, 2250, 1800, 1125, 750, 375];

    #[test]
    fn defaults_to_32k() {
        let c = SampleClock::new(DIVIDERS);
        assert_eq!(c.rate(), Rate::R32K);
        c.set_rate(Rate::R96K);
        assert_eq!(c.rate().index(), 5);
    }

    #[test]
    fn dividers_follow_rate_index() {
        let c = SampleClock::new(DIVIDERS);
        assert_eq!(c.divider(Rate::R8K), 4500);
        assert_eq!(c.divider(Rate::R32K), 1125);
        assert_eq!(c.divider(Rate::R96K), 375);
    }

    #[test]
    fn board_dividers_are_close() {
        for rate in Rate::ALL {
            let d = SampleClock::board().divider(rate);
            let err = (config::TIMER_FREQUENCY / d).abs_diff(rate.hz());
            assert!(err * 100 < rate.hz(), "{rate:?} is off by {err} Hz");
        }
    }
}
