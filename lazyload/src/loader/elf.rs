//! ELF descriptor provider.
//!
//! The Executable and Linkable Format (ELF) describes how a program stored on
//! disk is laid out in memory. Of an ELF file, the loader only cares about the
//! **program headers**: each `PT_LOAD` header is one segment, saying
//!
//! - where the segment goes (`p_vaddr`),
//! - how large it is in memory (`p_memsz`),
//! - how many of those bytes come from the file (`p_filesz`) and from where
//!   (`p_offset`), and
//! - which permissions it needs (`p_flags`).
//!
//! Bytes between `p_filesz` and `p_memsz` are the `.bss` and read as zero.
//!
//! Only 64-bit little-endian `ET_EXEC` files built for the running machine
//! are accepted. A file that asks for a program interpreter (`PT_INTERP`)
//! needs a dynamic linker and is refused.

use crate::{
    LoaderError, PageSize, ParseError, Permission, Va,
    loader::DescriptorProvider,
    segment::{ProgramHeaders, Segment, SegmentTable},
};
use num_enum::TryFromPrimitive;
use object::{
    Endianness,
    elf::{ELFDATA2LSB, ET_EXEC, FileHeader64, ProgramHeader64},
    read::elf::{FileHeader, ProgramHeader},
};
use std::path::Path;

/// The ELF machine this loader runs programs for.
#[cfg(target_arch = "x86_64")]
pub const HOST_MACHINE: u16 = object::elf::EM_X86_64;
/// The ELF machine this loader runs programs for.
#[cfg(target_arch = "aarch64")]
pub const HOST_MACHINE: u16 = object::elf::EM_AARCH64;

/// ELF program header type.
///
/// This enum represents the segment types the provider knows about. Other
/// types are ignored.
#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, TryFromPrimitive)]
pub enum PType {
    /// Unused segment.
    Null = 0x0,
    /// Loadable segment.
    Load = 0x1,
    /// Dynamic linking information.
    Dynamic = 0x2,
    /// Interpreter path (for dynamically linked executables).
    Interp = 0x3,
    /// Auxiliary information.
    Note = 0x4,
    /// Reserved.
    Shlib = 0x5,
    /// Program header table itself.
    Phdr = 0x6,
    /// Thread-Local Storage (TLS) template.
    Tls = 0x7,
    /// GNU-specific: Exception handling information.
    GnuEhFrame = 0x6474e550,
    /// GNU-specific: Stack segment flags.
    GnuStack = 0x6474e551,
    /// GNU-specific: Read-only after relocation.
    GnuRelro = 0x6474e552,
    /// GNU-specific.
    GnuProperty = 0x6474e553,
}

bitflags::bitflags! {
    /// Segment permission flags for ELF program headers.
    ///
    /// These flags specify whether a segment is readable, writable, or executable.
    pub struct PFlags: u32 {
        /// Segment is readable.
        const READ = 1 << 2;
        /// Segment is writable.
        const WRITE = 1 << 1;
        /// Segment is executable.
        const EXECUTABLE = 1 << 0;
    }
}

impl PFlags {
    /// Translates segment flags into page permissions.
    pub fn permission(self) -> Permission {
        let mut permission = Permission::empty();
        if self.contains(PFlags::READ) {
            permission |= Permission::READ;
        }
        if self.contains(PFlags::WRITE) {
            permission |= Permission::WRITE;
        }
        if self.contains(PFlags::EXECUTABLE) {
            permission |= Permission::EXECUTABLE;
        }
        permission
    }
}

/// [`DescriptorProvider`] for statically-linked ELF executables.
#[derive(Clone, Copy, Debug, Default)]
pub struct ElfProvider;

impl DescriptorProvider for ElfProvider {
    fn parse(&self, path: &Path) -> Result<SegmentTable, LoaderError> {
        let data = std::fs::read(path).map_err(|source| LoaderError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        parse_image(&data, PageSize::host()).map_err(|source| LoaderError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn to_usize(v: u64, index: usize) -> Result<usize, ParseError> {
    usize::try_from(v).map_err(|_| ParseError::Overflow { index })
}

/// Builds the segment table of the ELF image in `data`.
pub fn parse_image(data: &[u8], page_size: PageSize) -> Result<SegmentTable, ParseError> {
    let header = FileHeader64::<Endianness>::parse(data)
        .map_err(|e| ParseError::NotElf(e.to_string()))?;
    if header.e_ident.data != ELFDATA2LSB {
        return Err(ParseError::NotElf("big-endian".into()));
    }
    let endian = header
        .endian()
        .map_err(|e| ParseError::NotElf(e.to_string()))?;
    let machine = header.e_machine(endian);
    if machine != HOST_MACHINE {
        return Err(ParseError::WrongMachine(machine));
    }
    let e_type = header.e_type(endian);
    if e_type != ET_EXEC {
        return Err(ParseError::NotExecutable(e_type));
    }
    let phdrs: &[ProgramHeader64<Endianness>] = header
        .program_headers(endian, data)
        .map_err(|e| ParseError::NotElf(e.to_string()))?;

    let file_len = data.len() as u64;
    let mut segments = Vec::new();
    let mut phdr_address = None;
    for phdr in phdrs {
        match PType::try_from(phdr.p_type(endian)) {
            Ok(PType::Interp) => return Err(ParseError::DynamicallyLinked),
            Ok(PType::Phdr) => phdr_address = Some(phdr.p_vaddr(endian)),
            Ok(PType::Load) => {
                let index = segments.len();
                let (offset, size) = (phdr.p_offset(endian), phdr.p_filesz(endian));
                if offset.checked_add(size).is_none_or(|end| end > file_len) {
                    return Err(ParseError::FileRange {
                        index,
                        offset,
                        size,
                        file_len,
                    });
                }
                segments.push(Segment::new(
                    Va::new(to_usize(phdr.p_vaddr(endian), index)?),
                    to_usize(phdr.p_memsz(endian), index)?,
                    to_usize(size, index)?,
                    offset,
                    PFlags::from_bits_truncate(phdr.p_flags(endian)).permission(),
                ));
            }
            _ => (),
        }
    }
    if segments.is_empty() {
        return Err(ParseError::NoSegments);
    }

    // Without PT_PHDR, the table is visible only if a loaded segment covers
    // it in the file.
    let e_phoff = header.e_phoff(endian);
    let phdr_address = phdr_address.or_else(|| {
        segments.iter().find_map(|s| {
            (s.file_offset <= e_phoff && e_phoff < s.file_offset + s.file_size as u64)
                .then(|| s.virtual_address.into_usize() as u64 + (e_phoff - s.file_offset))
        })
    });
    let entry = Va::new(to_usize(header.e_entry(endian), 0)?);
    let table = SegmentTable::new(entry, segments, page_size)?;
    Ok(match phdr_address.and_then(|a| usize::try_from(a).ok()) {
        Some(address) => table.with_program_headers(ProgramHeaders {
            address: Va::new(address),
            entry_size: usize::from(header.e_phentsize(endian)),
            count: phdrs.len(),
        }),
        None => table,
    })
}
