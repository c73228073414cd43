// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Algorithm loader.
//!
//! Uploaded algorithms are position-dependent ELF32 executables linked to run
//! at fixed addresses inside the board's reserved algorithm regions. Loading
//! one is a matter of copying each `PT_LOAD` segment to its link address and
//! remembering the entry point. There is no relocation and no symbol
//! resolution.
//!
//! Every segment, and the entry point, is checked against the reserved regions
//! before anything is written. A malformed image can't scribble over the rest
//! of RAM, and a rejected one leaves the regions as they were.

use core::sync::atomic::{AtomicUsize, Ordering};

use abi::{Sample, MAX_ELF_FILE_SIZE};
use ringbuf::{ringbuf, ringbuf_entry};

use crate::arch;
use crate::config::AlgorithmRegion;
use crate::elf;
use crate::err::LoadError;

/// Signature of an algorithm entry point: it receives a half buffer of input
/// samples and its length, and returns a pointer to `len` processed samples
/// (or null to produce no output).
pub type EntryFn = unsafe extern "C" fn(*mut Sample, usize) -> *mut Sample;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Load { len: usize },
    Segment { vaddr: u32, filesz: u32, memsz: u32 },
    Loaded { entry: u32 },
    Failed(LoadError),
    Unloaded,
}

ringbuf!(Trace, 16, Trace::None);

/// Holds the entry point of the loaded algorithm, if any.
///
/// The runner reads this from unprivileged code where critical sections
/// aren't available, so it's a single atomic word: zero when unloaded.
pub struct AlgorithmSlot {
    entry: AtomicUsize,
}

impl AlgorithmSlot {
    pub const fn new() -> Self {
        Self {
            entry: AtomicUsize::new(0),
        }
    }

    pub fn install(&self, entry: EntryFn) {
        self.entry.store(entry as usize, Ordering::Release);
    }

    /// Forgets the loaded algorithm. The code itself stays where it was
    /// copied.
    pub fn unload(&self) {
        if self.entry.swap(0, Ordering::AcqRel) != 0 {
            ringbuf_entry!(Trace::Unloaded);
        }
    }

    pub fn get(&self) -> Option<EntryFn> {
        match self.entry.load(Ordering::Acquire) {
            0 => None,
            // Safety: the only nonzero values ever stored come from `install`,
            // which takes an `EntryFn`.
            addr => {
                Some(unsafe { core::mem::transmute::<usize, EntryFn>(addr) })
            }
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.entry.load(Ordering::Acquire) != 0
    }
}

impl Default for AlgorithmSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// One destination region, as seen by the loader: its link-time address and
/// the memory that backs it.
pub struct LoadRegion<'a> {
    base: u32,
    mem: &'a mut [u8],
    execute: bool,
}

impl<'a> LoadRegion<'a> {
    pub fn new(base: u32, mem: &'a mut [u8], execute: bool) -> Self {
        Self { base, mem, execute }
    }

    /// Builds a region over its real physical address.
    ///
    /// # Safety
    ///
    /// The memory described by `r` must exist, must not be used for anything
    /// else, and must stay valid for `'a`.
    pub unsafe fn from_board(r: &AlgorithmRegion) -> Self {
        let mem = unsafe {
            core::slice::from_raw_parts_mut(
                r.region.base as usize as *mut u8,
                r.region.size as usize,
            )
        };
        Self::new(r.region.base, mem, r.execute)
    }

    fn contains(&self, addr: u32, len: u32) -> bool {
        let start = u64::from(addr);
        let base = u64::from(self.base);
        start >= base
            && start + u64::from(len) <= base + self.mem.len() as u64
    }

    fn slice_mut(&mut self, addr: u32, len: u32) -> Option<&mut [u8]> {
        if !self.contains(addr, len) {
            return None;
        }
        let off = (addr - self.base) as usize;
        self.mem.get_mut(off..off + len as usize)
    }
}

pub struct Loader<'a> {
    staging: &'a mut [u8],
    regions: &'a mut [LoadRegion<'a>],
}

impl<'a> Loader<'a> {
    /// Creates a loader that stages uploads in `staging` (at most
    /// `MAX_ELF_FILE_SIZE` bytes of it are used) and places segments into
    /// `regions`.
    pub fn new(
        staging: &'a mut [u8],
        regions: &'a mut [LoadRegion<'a>],
    ) -> Self {
        let n = staging.len().min(MAX_ELF_FILE_SIZE);
        let (staging, _) = staging.split_at_mut(n);
        Self { staging, regions }
    }

    /// Size of the staging area; uploads must be strictly smaller.
    pub fn capacity(&self) -> usize {
        self.staging.len()
    }

    /// The staging area that uploads are received into.
    pub fn staging_mut(&mut self) -> &mut [u8] {
        &mut self.staging[..]
    }

    /// Loads the first `len` bytes of the staging area and installs the
    /// entry point in `slot`.
    ///
    /// Whatever was loaded before is unloaded first, so on failure the slot
    /// is always empty.
    pub fn load(
        &mut self,
        len: usize,
        slot: &AlgorithmSlot,
    ) -> Result<(), LoadError> {
        slot.unload();
        ringbuf_entry!(Trace::Load { len });

        let r = self.load_segments(len);
        match r {
            Ok(entry) => {
                arch::sync_loaded_code();
                slot.install(entry);
            }
            Err(e) => ringbuf_entry!(Trace::Failed(e)),
        }
        r.map(|_| ())
    }

    fn load_segments(&mut self, len: usize) -> Result<EntryFn, LoadError> {
        let image = self.staging.get(..len).ok_or(LoadError::TooLarge)?;
        let header = elf::file_header(image).ok_or(LoadError::Truncated)?;
        if !header.has_magic() {
            return Err(LoadError::BadMagic);
        }
        let count = header.phnum.get();

        // Check every segment and the entry point before copying anything.
        let mut loaded = false;
        for i in 0..count {
            let Some(seg) = placement(image, header, i)? else {
                continue;
            };
            ringbuf_entry!(Trace::Segment {
                vaddr: seg.vaddr,
                filesz: seg.src.len() as u32,
                memsz: seg.memsz
            });
            let fits =
                self.regions.iter().any(|r| r.contains(seg.vaddr, seg.memsz));
            if !fits {
                return Err(LoadError::OutOfRegion {
                    vaddr: seg.vaddr,
                    len: seg.memsz,
                });
            }
            loaded |= !seg.src.is_empty();
        }
        if !loaded {
            return Err(LoadError::NothingLoaded);
        }

        let entry = header.entry.get();
        // The entry must land in code we're about to load.
        let executable = self
            .regions
            .iter()
            .any(|r| r.execute && r.contains(entry & !1, 2));
        if !executable {
            return Err(LoadError::BadEntry { entry });
        }
        let f =
            arch::algorithm_entry(entry).ok_or(LoadError::BadEntry { entry })?;

        for i in 0..count {
            let Some(seg) = placement(image, header, i)? else {
                continue;
            };
            let dest = self
                .regions
                .iter_mut()
                .find_map(|r| r.slice_mut(seg.vaddr, seg.memsz))
                .ok_or(LoadError::OutOfRegion {
                    vaddr: seg.vaddr,
                    len: seg.memsz,
                })?;
            let (copied, tail) = dest.split_at_mut(seg.src.len());
            copied.copy_from_slice(seg.src);
            tail.fill(0);
        }

        ringbuf_entry!(Trace::Loaded { entry });
        Ok(f)
    }
}

/// Where one `PT_LOAD` segment goes, and the file bytes that go there.
struct Placement<'i> {
    vaddr: u32,
    src: &'i [u8],
    /// At least `src.len()`; the rest is zeroed.
    memsz: u32,
}

/// Reads program header `i`, returning `None` if it isn't `PT_LOAD`.
fn placement<'i>(
    image: &'i [u8],
    header: &elf::FileHeader,
    i: u16,
) -> Result<Option<Placement<'i>>, LoadError> {
    let ph = elf::program_header(image, header, i).ok_or(LoadError::Truncated)?;
    if !ph.is_load() {
        return Ok(None);
    }

    let filesz = ph.filesz.get();
    let src = if filesz == 0 {
        &[][..]
    } else {
        let start = ph.offset.get() as usize;
        let end = start
            .checked_add(filesz as usize)
            .ok_or(LoadError::Truncated)?;
        image.get(start..end).ok_or(LoadError::Truncated)?
    };
    Ok(Some(Placement {
        vaddr: ph.vaddr.get(),
        src,
        memsz: ph.memsz.get().max(filesz),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::build::{image, Segment};

    const TEXT: u32 = 0x1000_0000;
    const DATA: u32 = 0x1000_4000;

    unsafe extern "C" fn passthrough(p: *mut Sample, _: usize) -> *mut Sample {
        p
    }

    struct Fixture {
        staging: Vec<u8>,
        text: Vec<u8>,
        data: Vec<u8>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                staging: vec![0; MAX_ELF_FILE_SIZE],
                text: vec![0xAA; 256],
                data: vec![0xAA; 256],
            }
        }

        fn load(
            &mut self,
            img: &[u8],
            slot: &AlgorithmSlot,
        ) -> Result<(), LoadError> {
            self.staging[..img.len()].copy_from_slice(img);
            let mut regions = [
                LoadRegion::new(TEXT, &mut self.text, true),
                LoadRegion::new(DATA, &mut self.data, false),
            ];
            let mut loader = Loader::new(&mut self.staging, &mut regions);
            loader.load(img.len(), slot)
        }
    }

    #[test]
    fn copies_segments_and_installs_entry() {
        arch::register_algorithm(TEXT | 1, passthrough);
        let img = image(
            TEXT | 1,
            &[
                Segment {
                    vaddr: TEXT,
                    data: &[1, 2, 3, 4],
                    memsz: 8,
                },
                Segment {
                    vaddr: DATA + 16,
                    data: &[],
                    memsz: 4,
                },
            ],
        );
        let mut fx = Fixture::new();
        let slot = AlgorithmSlot::new();
        fx.load(&img, &slot).unwrap();

        assert!(slot.is_loaded());
        assert_eq!(&fx.text[..4], &[1, 2, 3, 4]);
        // memsz beyond filesz is zeroed.
        assert_eq!(&fx.text[4..8], &[0; 4]);
        assert_eq!(fx.text[8], 0xAA);
        assert_eq!(&fx.data[16..20], &[0; 4]);
        assert_eq!(fx.data[15], 0xAA);
        assert_eq!(fx.data[20], 0xAA);
    }

    #[test]
    fn bad_magic_leaves_slot_empty() {
        arch::register_algorithm(TEXT | 1, passthrough);
        let slot = AlgorithmSlot::new();
        slot.install(passthrough);

        let seg = Segment {
            vaddr: TEXT,
            data: &[1],
            memsz: 1,
        };
        let mut img = image(TEXT | 1, &[seg]);
        img[1] = b'X';
        let mut fx = Fixture::new();
        assert_eq!(fx.load(&img, &slot), Err(LoadError::BadMagic));
        assert!(!slot.is_loaded());
    }

    #[test]
    fn zero_file_segments_alone_load_nothing() {
        arch::register_algorithm(TEXT | 1, passthrough);
        let seg = Segment {
            vaddr: DATA,
            data: &[],
            memsz: 32,
        };
        let img = image(TEXT | 1, &[seg]);
        let mut fx = Fixture::new();
        let slot = AlgorithmSlot::new();
        assert_eq!(fx.load(&img, &slot), Err(LoadError::NothingLoaded));
        assert!(!slot.is_loaded());
        assert!(fx.data.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn late_bad_segment_writes_nothing() {
        arch::register_algorithm(TEXT | 1, passthrough);
        let img = image(
            TEXT | 1,
            &[
                Segment {
                    vaddr: TEXT,
                    data: &[1, 2, 3, 4],
                    memsz: 8,
                },
                Segment {
                    vaddr: DATA,
                    data: &[9; 4],
                    memsz: 4,
                },
                Segment {
                    vaddr: 0x2000_0000,
                    data: &[5; 4],
                    memsz: 4,
                },
            ],
        );
        let mut fx = Fixture::new();
        let slot = AlgorithmSlot::new();
        assert_eq!(
            fx.load(&img, &slot),
            Err(LoadError::OutOfRegion {
                vaddr: 0x2000_0000,
                len: 4
            })
        );
        assert!(!slot.is_loaded());
        assert!(fx.text.iter().all(|&b| b == 0xAA));
        assert!(fx.data.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn bad_entry_writes_nothing() {
        let seg = Segment {
            vaddr: TEXT,
            data: &[1, 2, 3, 4],
            memsz: 4,
        };
        // Inside the image, but in a region the runner can't execute.
        let img = image(DATA | 1, &[seg]);
        let mut fx = Fixture::new();
        let slot = AlgorithmSlot::new();
        assert_eq!(
            fx.load(&img, &slot),
            Err(LoadError::BadEntry { entry: DATA | 1 })
        );
        assert!(fx.text.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn segment_outside_regions_is_rejected() {
        arch::register_algorithm(TEXT | 1, passthrough);
        let img = image(
            TEXT | 1,
            &[Segment {
                vaddr: TEXT + 250,
                data: &[1; 16],
                memsz: 16,
            }],
        );
        let mut fx = Fixture::new();
        let slot = AlgorithmSlot::new();
        assert_eq!(
            fx.load(&img, &slot),
            Err(LoadError::OutOfRegion {
                vaddr: TEXT + 250,
                len: 16
            })
        );
        assert!(fx.text.iter().all(|&b| b == 0xAA));
        assert!(!slot.is_loaded());
    }

    #[test]
    fn truncated_segment_data_is_rejected() {
        arch::register_algorithm(TEXT | 1, passthrough);
        let seg = Segment {
            vaddr: TEXT,
            data: &[7; 64],
            memsz: 64,
        };
        let img = image(TEXT | 1, &[seg]);
        let mut fx = Fixture::new();
        let slot = AlgorithmSlot::new();
        // Pretend only part of the upload arrived.
        fx.staging[..img.len()].copy_from_slice(&img);
        let mut regions = [LoadRegion::new(TEXT, &mut fx.text, true)];
        let mut loader = Loader::new(&mut fx.staging, &mut regions);
        assert_eq!(
            loader.load(img.len() - 10, &slot),
            Err(LoadError::Truncated)
        );
    }

    #[test]
    fn entry_must_be_executable() {
        arch::register_algorithm(DATA | 1, passthrough);
        let seg = Segment {
            vaddr: DATA,
            data: &[1; 4],
            memsz: 4,
        };
        let img = image(DATA | 1, &[seg]);
        let mut fx = Fixture::new();
        let slot = AlgorithmSlot::new();
        assert_eq!(
            fx.load(&img, &slot),
            Err(LoadError::BadEntry { entry: DATA | 1 })
        );
        assert!(!slot.is_loaded());
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut fx = Fixture::new();
        let slot = AlgorithmSlot::new();
        let mut regions = [LoadRegion::new(TEXT, &mut fx.text, true)];
        let mut loader = Loader::new(&mut fx.staging, &mut regions);
        assert_eq!(loader.capacity(), MAX_ELF_FILE_SIZE);
        assert_eq!(
            loader.load(MAX_ELF_FILE_SIZE + 1, &slot),
            Err(LoadError::TooLarge)
        );
    }

    #[test]
    fn unload_keeps_code() {
        arch::register_algorithm(TEXT | 1, passthrough);
        let seg = Segment {
            vaddr: TEXT,
            data: &[5; 4],
            memsz: 4,
        };
        let img = image(TEXT | 1, &[seg]);
        let mut fx = Fixture::new();
        let slot = AlgorithmSlot::new();
        fx.load(&img, &slot).unwrap();
        slot.unload();
        assert!(slot.get().is_none());
        assert_eq!(&fx.text[..4], &[5; 4]);
    }
}
