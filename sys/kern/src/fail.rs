// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for recording firmware failures such that they can be found by
//! tooling.
//!
//! This module defines the following binary interface to debuggers:
//!
//! - `kern::fail::KERNEL_HAS_FAILED` is a `bool`. It is zero (false) while
//!   the firmware is healthy, and set to one (true) if it reaches the `die`
//!   function (either explicitly or as a result of a `panic!`).
//!
//! - `kern::fail::KERNEL_EPITAPH` is an array of `u8`. The `die` routine
//!   writes as much of the failure reason into this buffer (as UTF-8) as
//!   possible, truncating if the buffer fills. For printing, trim off any
//!   trailing NUL bytes.
//!
//! Host builds panic instead, so that tests can watch for it.

use core::fmt::Display;

cfg_if::cfg_if! {
    if #[cfg(target_os = "none")] {
        #[cfg(not(feature = "nano"))]
        use core::fmt::Write;
        use core::sync::atomic::Ordering;

        /// Flag that gets set to `true` by all failure reporting functions,
        /// giving tools a one-stop-shop for triage.
        #[used]
        static mut KERNEL_HAS_FAILED: bool = false;

        #[cfg(not(feature = "nano"))]
        const EPITAPH_LEN: usize = 128;

        /// The "epitaph" buffer records up to `EPITAPH_LEN` bytes of
        /// description of the event that caused the failure, padded with NULs.
        #[cfg(not(feature = "nano"))]
        #[used]
        static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

        /// Marks the firmware as failed. Returns false if it already was,
        /// which means we're failing while failing.
        fn mark_failed() -> bool {
            // Safety: interrupts are masked by our caller, so nothing else
            // touches the flag while we do.
            let previous = unsafe {
                core::ptr::replace(
                    core::ptr::addr_of_mut!(KERNEL_HAS_FAILED),
                    true,
                )
            };
            !previous
        }

        #[inline(always)]
        pub fn die(msg: impl Display) -> ! {
            die_impl(&msg)
        }

        #[inline(never)]
        fn die_impl(msg: &dyn Display) -> ! {
            cortex_m::interrupt::disable();
            if mark_failed() {
                #[cfg(not(feature = "nano"))]
                {
                    // Safety: only the first call gets here, so this is the
                    // only reference to the epitaph there will ever be.
                    let buf = unsafe {
                        &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH)
                    };
                    let mut writer = Eulogist { dest: buf };
                    write!(writer, "{msg}").ok();
                }
                #[cfg(feature = "nano")]
                let _ = msg;
            }

            loop {
                // Platform-independent NOP
                core::sync::atomic::fence(Ordering::SeqCst);
            }
        }

        #[panic_handler]
        fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
            die(info)
        }
    } else {
        /// Records `msg` and stops. On the host, that's a panic.
        pub fn die(msg: impl Display) -> ! {
            panic!("{msg}")
        }
    }
}

#[cfg_attr(
    not(all(target_os = "none", not(feature = "nano"))),
    allow(dead_code)
)]
struct Eulogist<'a> {
    dest: &'a mut [u8],
}

impl core::fmt::Write for Eulogist<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = {
            let taken = core::mem::take(&mut self.dest);
            taken.split_at_mut(n)
        };
        dest.copy_from_slice(&s[..n]);
        self.dest = leftovers;
        Ok(())
    }
}
