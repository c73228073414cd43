// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Double-buffered sample exchange.
//!
//! A `SampleBuffer` sits on top of a fixed region of sample slots (usually a
//! DMA target at a board-defined address) and splits its active size into two
//! equal halves. While the hardware fills or drains one half, software works
//! on the other; a single-slot "modified" mark tells the reader which half
//! was most recently produced.
//!
//! Nothing in here allocates or takes a lock. Size and mark are atomics so
//! that the capture interrupt, the runner and the host link can all touch
//! the same buffer; the sample contents themselves follow a one-writer-per-
//! half convention that the conversion pipeline upholds.

#![cfg_attr(not(test), no_std)]

use core::marker::PhantomData;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use abi::{Sample, MAX_SAMPLE_BUFFER_SIZE, MID_SCALE};
use zerocopy::IntoBytes;

/// Granularity of half-buffer copies, in samples.
///
/// Copies are done in fixed blocks of this many samples; partial blocks at
/// the end of a source are dropped.
pub const COPY_ALIGN: usize = 16;

/// Names one half of a double buffer.
///
/// The numeric values are the ones used on the relay wire.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Half {
    First = 1,
    Second = 2,
}

impl Half {
    fn from_mark(m: u8) -> Option<Self> {
        match m {
            1 => Some(Half::First),
            2 => Some(Half::Second),
            _ => None,
        }
    }
}

const NO_MARK: u8 = 0;

pub struct SampleBuffer<'a> {
    base: NonNull<Sample>,
    capacity: usize,
    size: AtomicUsize,
    modified: AtomicU8,
    _region: PhantomData<&'a mut [Sample]>,
}

// Safety: all shared mutation goes through atomics or through raw pointers
// into a region that this buffer exclusively owns for 'a. Callers coordinate
// who writes which half.
unsafe impl Sync for SampleBuffer<'_> {}
unsafe impl Send for SampleBuffer<'_> {}

impl<'a> SampleBuffer<'a> {
    /// Creates an exchange over `region`. Only the first
    /// `MAX_SAMPLE_BUFFER_SIZE` slots are ever used. The initial size is the
    /// whole capacity, rounded down to even.
    pub fn new(region: &'a mut [Sample]) -> Self {
        let capacity = clamp_capacity(region.len());
        // Safety: a slice pointer is never null.
        let base = unsafe { NonNull::new_unchecked(region.as_mut_ptr()) };
        Self::with_base(base, capacity)
    }

    /// Creates an exchange over `capacity` samples starting at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be non-null, aligned for `Sample`, and valid for reads and
    /// writes of `capacity` samples for as long as the returned buffer
    /// lives. Nothing else may create references into that memory.
    pub const unsafe fn from_raw(base: *mut Sample, capacity: usize) -> Self {
        // Safety: non-null is part of our contract.
        let base = unsafe { NonNull::new_unchecked(base) };
        Self::with_base(base, clamp_capacity(capacity))
    }

    const fn with_base(base: NonNull<Sample>, capacity: usize) -> Self {
        Self {
            base,
            capacity,
            size: AtomicUsize::new(capacity & !1),
            modified: AtomicU8::new(NO_MARK),
            _region: PhantomData,
        }
    }

    /// Number of slots in the backing region.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Active size in samples, both halves included. Always even.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn half_len(&self) -> usize {
        self.size() / 2
    }

    /// Resizes the active area. `n` is clamped to the capacity and rounded
    /// down to even, so the halves always split evenly.
    pub fn set_size(&self, n: usize) {
        let n = n.min(self.capacity) & !1;
        self.size.store(n, Ordering::Release);
    }

    /// Fills the whole backing region with mid-scale.
    pub fn clear(&self) {
        for i in 0..self.capacity {
            // Safety: i is within the region we own.
            unsafe { self.base.as_ptr().add(i).write_volatile(MID_SCALE) };
        }
    }

    /// Base of the backing region, for handing to DMA.
    pub fn as_ptr(&self) -> *mut Sample {
        self.base.as_ptr()
    }

    /// Start of the named half at the current size.
    pub fn half_ptr(&self, half: Half) -> *mut Sample {
        let offset = match half {
            Half::First => 0,
            Half::Second => self.half_len(),
        };
        // Safety: half_len() <= capacity / 2, so the offset stays inside the
        // region.
        unsafe { self.base.as_ptr().add(offset) }
    }

    /// Copies `src` into `half` and marks it modified.
    ///
    /// At most `half_len()` samples are copied, and the count is rounded down
    /// to a multiple of [`COPY_ALIGN`]. `src` may overlap the buffer.
    pub fn modify(&self, half: Half, src: &[Sample]) {
        let len = src.len().min(self.half_len()) & !(COPY_ALIGN - 1);
        let dst = self.half_ptr(half);
        let mut off = 0;
        while off < len {
            // Safety: off + COPY_ALIGN <= len, which is bounded by both the
            // source length and the half length. The fixed count lets this
            // lower to straight-line loads and stores.
            unsafe {
                core::ptr::copy(src.as_ptr().add(off), dst.add(off), COPY_ALIGN)
            };
            off += COPY_ALIGN;
        }
        self.mark(half);
    }

    pub fn modify_first_half(&self, src: &[Sample]) {
        self.modify(Half::First, src);
    }

    pub fn modify_second_half(&self, src: &[Sample]) {
        self.modify(Half::Second, src);
    }

    /// Marks `half` as the most recently produced half without copying
    /// anything. Replaces any earlier mark.
    pub fn mark(&self, half: Half) {
        self.modified.store(half as u8, Ordering::Release);
    }

    /// Returns and clears the pending mark.
    pub fn take_modified(&self) -> Option<Half> {
        Half::from_mark(self.modified.swap(NO_MARK, Ordering::AcqRel))
    }

    /// The active area as samples.
    ///
    /// # Safety
    ///
    /// No one may write to the active area while the returned slice is
    /// alive. That includes DMA.
    pub unsafe fn samples(&self) -> &[Sample] {
        unsafe { core::slice::from_raw_parts(self.base.as_ptr(), self.size()) }
    }

    /// One half of the active area as samples.
    ///
    /// # Safety
    ///
    /// As for [`Self::samples`], restricted to the named half.
    pub unsafe fn half(&self, half: Half) -> &[Sample] {
        unsafe {
            core::slice::from_raw_parts(self.half_ptr(half), self.half_len())
        }
    }

    /// The active area as bytes, for sending to the host.
    ///
    /// # Safety
    ///
    /// As for [`Self::samples`].
    pub unsafe fn bytes(&self) -> &[u8] {
        unsafe { self.samples() }.as_bytes()
    }

    /// One half as bytes.
    ///
    /// # Safety
    ///
    /// As for [`Self::half`].
    pub unsafe fn half_bytes(&self, half: Half) -> &[u8] {
        unsafe { self.half(half) }.as_bytes()
    }

    /// The active area as writable bytes, for receiving from the host.
    ///
    /// # Safety
    ///
    /// The caller must be the only one reading or writing the active area
    /// while the returned slice is alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut(&self) -> &mut [u8] {
        let s = unsafe {
            core::slice::from_raw_parts_mut(self.base.as_ptr(), self.size())
        };
        s.as_mut_bytes()
    }

    /// One half as writable bytes.
    ///
    /// # Safety
    ///
    /// As for [`Self::bytes_mut`], restricted to the named half.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn half_bytes_mut(&self, half: Half) -> &mut [u8] {
        let s = unsafe {
            core::slice::from_raw_parts_mut(
                self.half_ptr(half),
                self.half_len(),
            )
        };
        s.as_mut_bytes()
    }
}

const fn clamp_capacity(len: usize) -> usize {
    if len > MAX_SAMPLE_BUFFER_SIZE {
        MAX_SAMPLE_BUFFER_SIZE
    } else {
        len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ramp(n: usize) -> Vec<Sample> {
        (0..n as u16).collect()
    }

    #[test]
    fn starts_full_and_unmarked() {
        let mut region = [0; 64];
        let buf = SampleBuffer::new(&mut region);
        assert_eq!(buf.capacity(), 64);
        assert_eq!(buf.size(), 64);
        assert_eq!(buf.half_len(), 32);
        assert_eq!(buf.take_modified(), None);
    }

    #[test]
    fn capacity_is_capped() {
        let mut region = vec![0; MAX_SAMPLE_BUFFER_SIZE + 100];
        let buf = SampleBuffer::new(&mut region);
        assert_eq!(buf.capacity(), MAX_SAMPLE_BUFFER_SIZE);
        buf.set_size(usize::MAX);
        assert_eq!(buf.size(), MAX_SAMPLE_BUFFER_SIZE);
    }

    #[test]
    fn clear_fills_region_with_mid_scale() {
        let mut region = [7; 40];
        {
            let buf = SampleBuffer::new(&mut region);
            buf.set_size(8);
            buf.clear();
        }
        assert!(region.iter().all(|&s| s == MID_SCALE));
    }

    #[test]
    fn modify_targets_the_named_half() {
        let mut region = [0; 64];
        let buf = SampleBuffer::new(&mut region);
        buf.set_size(64);
        buf.modify_second_half(&ramp(32));
        assert_eq!(buf.take_modified(), Some(Half::Second));
        let snapshot = unsafe { buf.samples() }.to_vec();
        drop(buf);
        assert!(snapshot[..32].iter().all(|&s| s == 0));
        assert_eq!(&snapshot[32..], &ramp(32)[..]);
        assert_eq!(region[32], 0);
        assert_eq!(region[63], 31);
    }

    #[test]
    fn modify_rounds_down_to_copy_blocks() {
        let mut region = [0; 128];
        let buf = SampleBuffer::new(&mut region);
        buf.set_size(128);
        // 40 samples is two whole blocks plus a partial one.
        buf.modify_first_half(&[9; 40]);
        drop(buf);
        assert!(region[..32].iter().all(|&s| s == 9));
        assert!(region[32..].iter().all(|&s| s == 0));
    }

    #[test]
    fn marks_replace_and_take_once() {
        let mut region = [0; 32];
        let buf = SampleBuffer::new(&mut region);
        buf.mark(Half::First);
        buf.mark(Half::Second);
        assert_eq!(buf.take_modified(), Some(Half::Second));
        assert_eq!(buf.take_modified(), None);
    }

    #[test]
    fn second_half_follows_size() {
        let mut region = [0; 64];
        let buf = SampleBuffer::new(&mut region);
        let base = buf.as_ptr();
        buf.set_size(16);
        assert_eq!(buf.half_ptr(Half::Second), base.wrapping_add(8));
        assert_eq!(unsafe { buf.half_bytes(Half::Second) }.len(), 16);
    }

    #[test]
    fn bytes_are_little_endian_samples() {
        let mut region = [0; 4];
        let buf = SampleBuffer::new(&mut region);
        let bytes = [1, 0, 0, 1, 0xff, 0x0f, 0, 8];
        unsafe { buf.bytes_mut() }.copy_from_slice(&bytes);
        assert_eq!(unsafe { buf.samples() }, &[1, 0x100, 0xfff, 0x800]);
    }

    proptest! {
        #[test]
        fn size_is_even_and_bounded(cap in 0usize..512, n in any::<usize>()) {
            let mut region = vec![0; cap];
            let buf = SampleBuffer::new(&mut region);
            buf.set_size(n);
            prop_assert_eq!(buf.size() % 2, 0);
            prop_assert!(buf.size() <= cap);
            prop_assert_eq!(buf.half_len() * 2, buf.size());
        }

        #[test]
        fn modify_never_leaves_its_half(
            size in 0usize..256,
            len in 0usize..300,
        ) {
            let mut region = vec![0; 256];
            let buf = SampleBuffer::new(&mut region);
            buf.set_size(size);
            buf.modify_first_half(&vec![1; len]);
            let half = buf.half_len();
            drop(buf);
            let copied = region.iter().filter(|&&s| s == 1).count();
            prop_assert!(copied <= half);
            prop_assert_eq!(copied % COPY_ALIGN, 0);
            prop_assert!(region[half..].iter().all(|&s| s == 0));
        }
    }
}
