//! Minimal ELF32 parser for the muon ELF-to-LE converter.
//!
//! Parses ELF32 headers, program headers, sections, symbols, and `SHT_REL`
//! relocation entries from raw byte slices using safe field extraction
//! (`from_le_bytes`). No unsafe code, no allocations.
//!
//! Only the inputs the converter accepts are parsed: little-endian
//! `ET_EXEC` images for `EM_386`. Everything else is rejected up front by
//! [`ElfFile::parse`].
//!
//! # Usage
//!
//! ```
//! use muon_elf::{ElfFile, PT_LOAD};
//!
//! fn segments(data: &[u8]) {
//!     let elf = ElfFile::parse(data).expect("valid ELF");
//!     for phdr in elf.program_headers() {
//!         if phdr.seg_type == PT_LOAD {
//!             // Place phdr.filesz bytes at phdr.vaddr, zero up to phdr.memsz
//!         }
//!     }
//! }
//! ```

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]

pub mod header;
pub mod reloc;
pub mod section;

pub use header::{
    Elf32Header, Elf32ProgramHeader, ElfError, ElfFile, PF_R, PF_W, PF_X, PT_GNU_EH_FRAME,
    PT_LOAD, PT_NOTE, PT_NULL,
};
pub use reloc::{Elf32Rel, R_386_32, R_386_NONE, R_386_PC32, RelIter};
pub use section::{
    Elf32SectionHeader, Elf32Symbol, SHN_ABS, SHN_UNDEF, SHT_NULL, SHT_REL, SHT_RELA, SHT_STRTAB,
    SHT_SYMTAB, SectionIter, StringTable, SymbolIter,
};
