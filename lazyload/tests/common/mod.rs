//! Builds small ELF executables for the integration tests.
#![allow(dead_code)]

use std::io::Write;
use tempfile::NamedTempFile;

pub const PT_LOAD: u32 = 1;
pub const PT_INTERP: u32 = 3;
pub const PT_PHDR: u32 = 6;

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;

const EHDR_SIZE: u64 = 64;
const PHDR_SIZE: u64 = 56;

/// One program header and the bytes it refers to.
#[derive(Clone, Debug)]
pub struct Phdr {
    pub p_type: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub data: Vec<u8>,
    pub memsz: u64,
}

impl Phdr {
    /// A `PT_LOAD` header whose file bytes are `data`.
    pub fn load(vaddr: u64, offset: u64, data: &[u8], memsz: u64, flags: u32) -> Self {
        Self {
            p_type: PT_LOAD,
            flags,
            offset,
            vaddr,
            data: data.to_vec(),
            memsz,
        }
    }
}

/// A 64-bit little-endian ELF image.
#[derive(Clone, Debug)]
pub struct ElfImage {
    pub e_type: u16,
    pub machine: u16,
    pub entry: u64,
    pub phdrs: Vec<Phdr>,
    /// Declared file size, to produce truncated images.
    pub truncate_to: Option<usize>,
}

impl ElfImage {
    pub fn new(entry: u64) -> Self {
        Self {
            e_type: ET_EXEC,
            machine: lazyload::loader::elf::HOST_MACHINE,
            entry,
            phdrs: Vec::new(),
            truncate_to: None,
        }
    }

    pub fn with(mut self, phdr: Phdr) -> Self {
        self.phdrs.push(phdr);
        self
    }

    /// Adds a `PT_INTERP` header naming a dynamic linker.
    pub fn with_interp(self) -> Self {
        let path = b"/lib64/ld-linux-x86-64.so.2\0";
        let offset = EHDR_SIZE + PHDR_SIZE * 8;
        self.with(Phdr {
            p_type: PT_INTERP,
            flags: PF_R,
            offset,
            vaddr: 0,
            data: path.to_vec(),
            memsz: path.len() as u64,
        })
    }

    pub fn bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        // e_ident
        out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        out.extend_from_slice(&[0; 8]);
        out.extend_from_slice(&self.e_type.to_le_bytes());
        out.extend_from_slice(&self.machine.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&self.entry.to_le_bytes());
        out.extend_from_slice(&EHDR_SIZE.to_le_bytes()); // e_phoff
        out.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
        out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        out.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        out.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        out.extend_from_slice(&(self.phdrs.len() as u16).to_le_bytes());
        out.extend_from_slice(&64u16.to_le_bytes()); // e_shentsize
        out.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
        out.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
        assert_eq!(out.len() as u64, EHDR_SIZE);

        for phdr in &self.phdrs {
            out.extend_from_slice(&phdr.p_type.to_le_bytes());
            out.extend_from_slice(&phdr.flags.to_le_bytes());
            out.extend_from_slice(&phdr.offset.to_le_bytes());
            out.extend_from_slice(&phdr.vaddr.to_le_bytes());
            out.extend_from_slice(&phdr.vaddr.to_le_bytes()); // p_paddr
            out.extend_from_slice(&(phdr.data.len() as u64).to_le_bytes());
            out.extend_from_slice(&phdr.memsz.to_le_bytes());
            out.extend_from_slice(&0x1000u64.to_le_bytes());
        }

        for phdr in &self.phdrs {
            let (start, end) = (phdr.offset as usize, phdr.offset as usize + phdr.data.len());
            if out.len() < end {
                out.resize(end, 0);
            }
            // Bytes placed by an earlier header (e.g. the headers themselves)
            // win over zero data.
            if phdr.data.iter().any(|&b| b != 0) {
                out[start..end].copy_from_slice(&phdr.data);
            }
        }
        if let Some(len) = self.truncate_to {
            out.truncate(len);
        }
        out
    }

    /// Writes the image to a fresh temporary file.
    pub fn write(&self) -> NamedTempFile {
        write_bytes(&self.bytes())
    }
}

pub fn write_bytes(bytes: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
    file
}

/// Address of the code segment of [`program`].
pub const CODE: u64 = 0x1000_0000;
/// Address of the data segment of [`program`].
pub const DATA: u64 = 0x1000_2000;

/// An executable with `code` at [`CODE`] (read/execute, entry point) and a
/// data segment at [`DATA`] holding the `u64` 40 followed by two pages and a
/// bit of BSS.
pub fn program(code: &[u8]) -> ElfImage {
    ElfImage::new(CODE)
        .with(Phdr::load(CODE, 0x1000, code, code.len() as u64, PF_R | PF_X))
        .with(Phdr::load(DATA, 0x2000, &40u64.to_le_bytes(), 0x3000, PF_R | PF_W))
}

/// x86_64 machine code.
pub mod x86 {
    /// `movabs rbx, imm`
    pub fn mov_rbx(imm: u64) -> Vec<u8> {
        let mut code = vec![0x48, 0xbb];
        code.extend_from_slice(&imm.to_le_bytes());
        code
    }

    /// `mov rdi, rax; mov eax, 60; syscall`: exit with the value of `rax`.
    pub const EXIT_RAX: &[u8] = &[0x48, 0x89, 0xc7, 0xb8, 0x3c, 0, 0, 0, 0x0f, 0x05];

    /// `xor edi, edi; mov eax, 60; syscall`: exit with status 0.
    pub const EXIT_0: &[u8] = &[0x31, 0xff, 0xb8, 0x3c, 0, 0, 0, 0x0f, 0x05];
}
