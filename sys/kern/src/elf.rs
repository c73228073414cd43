// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The small slice of ELF32 that the loader understands.
//!
//! Only little-endian files are supported, and only program headers are
//! consulted; sections, symbols and relocations are ignored.

use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const MAGIC: [u8; 4] = *b"\x7fELF";

/// Program header type for a loadable segment.
pub const PT_LOAD: u32 = 1;

#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
#[repr(C)]
pub struct FileHeader {
    pub ident: [u8; 16],
    pub e_type: U16,
    pub machine: U16,
    pub version: U32,
    pub entry: U32,
    pub phoff: U32,
    pub shoff: U32,
    pub flags: U32,
    pub ehsize: U16,
    pub phentsize: U16,
    pub phnum: U16,
    pub shentsize: U16,
    pub shnum: U16,
    pub shstrndx: U16,
}

#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
#[repr(C)]
pub struct ProgramHeader {
    pub p_type: U32,
    pub offset: U32,
    pub vaddr: U32,
    pub paddr: U32,
    pub filesz: U32,
    pub memsz: U32,
    pub flags: U32,
    pub align: U32,
}

static_assertions::const_assert_eq!(core::mem::size_of::<FileHeader>(), 52);
static_assertions::const_assert_eq!(
    core::mem::size_of::<ProgramHeader>(),
    32
);

impl FileHeader {
    pub fn has_magic(&self) -> bool {
        self.ident[..4] == MAGIC
    }
}

impl ProgramHeader {
    pub fn is_load(&self) -> bool {
        self.p_type.get() == PT_LOAD
    }
}

/// Reads the file header from the start of `image`.
pub fn file_header(image: &[u8]) -> Option<&FileHeader> {
    FileHeader::ref_from_prefix(image).ok().map(|(h, _)| h)
}

/// Reads the program header at index `i`. Entries may be spaced further
/// apart than a `ProgramHeader` if the file says so.
pub fn program_header<'a>(
    image: &'a [u8],
    header: &FileHeader,
    i: u16,
) -> Option<&'a ProgramHeader> {
    let stride = usize::from(header.phentsize.get());
    let start = usize::try_from(header.phoff.get())
        .ok()?
        .checked_add(stride.checked_mul(usize::from(i))?)?;
    let bytes = image.get(start..)?;
    ProgramHeader::ref_from_prefix(bytes).ok().map(|(h, _)| h)
}

/// Assembles ELF images in memory, for host-side tests and tools.
#[cfg(not(target_os = "none"))]
pub mod build {
    use super::*;

    /// One loadable segment: destination, file contents, memory size.
    pub struct Segment<'a> {
        pub vaddr: u32,
        pub data: &'a [u8],
        pub memsz: u32,
    }

    pub fn image(entry: u32, segments: &[Segment<'_>]) -> Vec<u8> {
        let phoff = core::mem::size_of::<FileHeader>();
        let phentsize = core::mem::size_of::<ProgramHeader>();
        let mut ident = [0; 16];
        ident[..4].copy_from_slice(&MAGIC);
        ident[4] = 1; // 32-bit
        ident[5] = 1; // little-endian
        let header = FileHeader {
            ident,
            e_type: U16::new(2),
            machine: U16::new(40),
            version: U32::new(1),
            entry: U32::new(entry),
            phoff: U32::new(phoff as u32),
            shoff: U32::new(0),
            flags: U32::new(0),
            ehsize: U16::new(phoff as u16),
            phentsize: U16::new(phentsize as u16),
            phnum: U16::new(segments.len() as u16),
            shentsize: U16::new(0),
            shnum: U16::new(0),
            shstrndx: U16::new(0),
        };

        let mut out = header.as_bytes().to_vec();
        let mut data_off = phoff + phentsize * segments.len();
        for s in segments {
            let ph = ProgramHeader {
                p_type: U32::new(PT_LOAD),
                offset: U32::new(data_off as u32),
                vaddr: U32::new(s.vaddr),
                paddr: U32::new(s.vaddr),
                filesz: U32::new(s.data.len() as u32),
                memsz: U32::new(s.memsz),
                flags: U32::new(0),
                align: U32::new(4),
            };
            out.extend_from_slice(ph.as_bytes());
            data_off += s.data.len();
        }
        for s in segments {
            out.extend_from_slice(s.data);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::build::{image, Segment};
    use super::*;

    #[test]
    fn parses_what_we_build() {
        let img = image(
            0x1000_0001,
            &[
                Segment {
                    vaddr: 0x1000_0000,
                    data: &[1, 2, 3, 4],
                    memsz: 4,
                },
                Segment {
                    vaddr: 0x1000_4000,
                    data: &[],
                    memsz: 16,
                },
            ],
        );
        let h = file_header(&img).unwrap();
        assert!(h.has_magic());
        assert_eq!(h.entry.get(), 0x1000_0001);
        assert_eq!(h.phnum.get(), 2);

        let p0 = program_header(&img, h, 0).unwrap();
        assert!(p0.is_load());
        assert_eq!(p0.filesz.get(), 4);
        let off = p0.offset.get() as usize;
        assert_eq!(&img[off..off + 4], &[1, 2, 3, 4]);

        let p1 = program_header(&img, h, 1).unwrap();
        assert_eq!(p1.vaddr.get(), 0x1000_4000);
        assert_eq!(p1.memsz.get(), 16);
    }

    #[test]
    fn short_input_has_no_header() {
        assert!(file_header(&[0x7f, b'E', b'L', b'F']).is_none());
    }

    #[test]
    fn header_table_past_the_end() {
        let mut img = image(0, &[]);
        let h = *file_header(&img).unwrap();
        assert!(program_header(&img, &h, 0).is_none());
        img.truncate(40);
        assert!(file_header(&img).is_none());
    }
}
