//! Pure data model for an LE module under construction.
//!
//! The model is a tree rooted at [`Program`]: objects are stored in an
//! indexable sequence and refer to each other only through 1-based
//! indices carried by [`Ref`], matching the file format. Nothing here has
//! behavior beyond construction; serialization lives in
//! [`encode`](crate::encode).

use bitflags::bitflags;

bitflags! {
    /// Flags for an object in an LE executable.
    ///
    /// The bit values match the on-disk object table encoding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjectFlags: u32 {
        /// The object is readable.
        const READABLE   = 0x0001;
        /// The object is writable.
        const WRITABLE   = 0x0002;
        /// The object is executable.
        const EXECUTABLE = 0x0004;
        /// The object holds 32-bit code or data.
        const BIT32      = 0x2000;
    }
}

/// A fixup source type. The values match the LE fixup record encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SrcType {
    /// Absolute 32-bit offset.
    Offset32 = 0x07,
    /// Self-relative 32-bit offset.
    Relative32 = 0x08,
}

impl SrcType {
    /// Decodes a source type from its on-disk value.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x07 => Some(Self::Offset32),
            0x08 => Some(Self::Relative32),
            _ => None,
        }
    }
}

/// A reference to an address in the program.
///
/// `Object` carries a 1-based object index plus a byte offset within that
/// object. `Unresolved` marks a reference that never matched an object;
/// the serializer rejects any use of it. `Absolute` marks an address that
/// needs no fixup at load time (an `SHN_ABS` ELF symbol); the serializer
/// silently drops fixups targeting one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ref {
    /// Not resolved to any object.
    Unresolved,
    /// An offset within an object, by 1-based index.
    Object {
        /// 1-based index of the object containing the target.
        obj: u32,
        /// Offset within the target object.
        off: i32,
    },
    /// An absolute address; no load-time fixup needed.
    Absolute,
}

impl Ref {
    /// Returns `true` if this reference points into an object.
    #[must_use]
    pub fn is_object(&self) -> bool {
        matches!(self, Self::Object { .. })
    }
}

/// A single reference in an object to fix after loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fixup {
    /// Type of source reference to fix.
    pub src_type: SrcType,
    /// Source offset within the containing object.
    pub src: i32,
    /// Where the reference points.
    pub target: Ref,
    /// Value to add to the target offset. Carried for completeness but
    /// never emitted; additive fixups are not produced.
    pub add: i32,
}

/// A region of memory to be loaded when the program runs.
#[derive(Debug, Clone)]
pub struct Object {
    /// Object flags and permissions.
    pub flags: ObjectFlags,
    /// Size of the region in memory. May exceed `data.len()`; the tail is
    /// implicitly zero (BSS).
    pub virtual_size: u32,
    /// Address the data was linked at. The loader may place the object
    /// elsewhere; this is metadata.
    pub base_addr: u32,
    /// File-backed content, at most `virtual_size` bytes.
    pub data: Vec<u8>,
    /// Fixups to apply to the data after loading.
    pub fixups: Vec<Fixup>,
}

/// An LE format executable.
#[derive(Debug, Clone)]
pub struct Program {
    /// Initial value of EIP.
    pub entry: Ref,
    /// Initial value of ESP.
    pub stack: Ref,
    /// Objects to load. Position in this list defines the 1-based object
    /// index.
    pub objects: Vec<Object>,
}
