// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Recovering from faults in the algorithm.
//!
//! Uploaded algorithms are untrusted, so a memory fault while one is running
//! is an expected event. When the fault came from the runner, we throw the
//! algorithm away and restart the runner at the top of its loop on a fresh
//! stack; capture carries on and the host finds out through the error queue.
//! A fault anywhere else means the firmware itself is broken, and we stop.

use core::fmt;

use ringbuf::{ringbuf, ringbuf_entry};

use crate::arch;
use crate::conversion::Runtime;
use crate::fail;

/// What the architecture layer knows about a fault.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FaultContext {
    /// Stack pointer in use when the fault was taken.
    pub stack_pointer: u32,
    /// Whether the fault was taken from thread mode, as opposed to from
    /// another exception handler.
    pub from_thread_mode: bool,
    /// Whether the process stack was in use.
    pub from_process_stack: bool,
    /// Architecture-specific fault status, for the epitaph.
    pub status: u32,
    /// Faulting address, if the hardware recorded one.
    pub address: Option<u32>,
}

impl fmt::Display for FaultContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fault in {} mode on {} stack, sp={:#010x} status={:#010x}",
            if self.from_thread_mode {
                "thread"
            } else {
                "handler"
            },
            if self.from_process_stack {
                "process"
            } else {
                "main"
            },
            self.stack_pointer,
            self.status,
        )?;
        if let Some(a) = self.address {
            write!(f, " addr={a:#010x}")?;
        }
        Ok(())
    }
}

/// Where a recovered runner picks up again.
#[derive(Copy, Clone, Debug)]
pub struct ResumePoint {
    /// Top of the runner's blocking loop.
    pub entry: fn() -> !,
    /// Initial stack pointer; the runner's stack starts over from here.
    pub stack_top: u32,
}

#[derive(Copy, Clone, Debug)]
pub enum Disposition {
    Resume(ResumePoint),
    Halt,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Fault(FaultContext),
    Resumed { stack_top: u32 },
}

ringbuf!(Trace, 8, Trace::None);

/// Decides what to do about a fault. The algorithm is aborted either way.
pub fn on_fault(
    rt: &Runtime<'_>,
    ctx: &FaultContext,
    resume: ResumePoint,
) -> Disposition {
    ringbuf_entry!(Trace::Fault(*ctx));
    rt.abort();

    let in_runner = ctx.from_thread_mode
        && ctx.from_process_stack
        && rt.in_runner_stack(ctx.stack_pointer);
    if in_runner {
        ringbuf_entry!(Trace::Resumed {
            stack_top: resume.stack_top
        });
        Disposition::Resume(resume)
    } else {
        Disposition::Halt
    }
}

/// Handles a fault: either arranges for the runner to resume, or records why
/// we died and stops.
///
/// # Safety
///
/// Only the architecture's fault handler may call this, since resuming
/// rewrites the state the handler will return to.
pub unsafe fn recover(
    rt: &Runtime<'_>,
    ctx: &FaultContext,
    resume: ResumePoint,
) {
    match on_fault(rt, ctx, resume) {
        // Safety: passed on from our caller.
        Disposition::Resume(point) => unsafe { arch::force_resume(&point) },
        Disposition::Halt => fail::die(ctx),
    }
}
