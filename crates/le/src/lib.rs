//! LE (linear executable) module support for the muon converter.
//!
//! The LE format is the 32-bit executable container used by OS/2 2.x and
//! by DOS extenders such as DOS/32 Advanced. This crate provides:
//!
//! - a pure data model for a module under construction ([`Program`],
//!   [`Object`], [`Fixup`], [`Ref`]),
//! - a byte-exact serializer ([`encode::encode`]) producing the header,
//!   object table, fixup pages, and data pages,
//! - a reader ([`decode::decode`]) that parses a serialized module back
//!   into header, object, and fixup structures,
//! - a text dump ([`dump::dump`]) for inspection.
//!
//! Fixups are indexed per 4 KiB page so the loader can patch a page as it
//! is brought in; the serializer handles the bucketing.

pub mod decode;
pub mod dump;
pub mod encode;
pub mod program;

pub use decode::{DecodeError, Header, Module, ModuleObject, ObjectRecord, Page, decode};
pub use encode::{EncodeError, encode};
pub use program::{Fixup, Object, ObjectFlags, Program, Ref, SrcType};

/// Log2 of the LE page size.
pub const PAGE_BITS: u32 = 12;

/// LE page size in bytes (4 KiB).
pub const PAGE_SIZE: u32 = 1 << PAGE_BITS;

/// Size of the LE module header in bytes.
pub const HEADER_SIZE: usize = 0xac;

/// Size of an object table record in bytes.
pub const OBJECT_RECORD_SIZE: usize = 24;

/// Returns the number of pages needed to hold `size` bytes.
#[must_use]
pub fn page_count(size: u32) -> u32 {
    (size + PAGE_SIZE - 1) >> PAGE_BITS
}
