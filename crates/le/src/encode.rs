//! LE module serialization.
//!
//! One pass over the program's objects feeds three builders — the object
//! table, the fixup section, and the data pages — then the 0xAC-byte
//! header is filled in with the measured section offsets and everything
//! is concatenated. Output is byte-for-byte deterministic for a given
//! [`Program`].

use core::fmt;

use crate::program::{Fixup, Object, Program, Ref, SrcType};
use crate::{HEADER_SIZE, OBJECT_RECORD_SIZE, PAGE_BITS, PAGE_SIZE, page_count};

/// Errors from serializing a [`Program`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    /// EIP or ESP does not reference an object.
    BadRegister {
        /// Which register reference was invalid.
        register: &'static str,
    },
    /// A fixup target was never resolved to an object.
    UnresolvedFixup {
        /// 1-based index of the object containing the fixup.
        object: usize,
        /// Source offset of the fixup within its object.
        src: i32,
    },
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadRegister { register } => {
                write!(f, "{register} does not reference an object")
            }
            Self::UnresolvedFixup { object, src } => {
                write!(f, "object {object}: fixup at {src:#x} has an unresolved target")
            }
        }
    }
}

/// A fixup whose target has been checked to reference an object.
#[derive(Clone, Copy)]
struct RawFixup {
    src_type: SrcType,
    src: i32,
    obj: u32,
    off: i32,
}

// ---------------------------------------------------------------------------
// Object table builder
// ---------------------------------------------------------------------------

/// Builds the object table and the object page table.
#[derive(Default)]
struct ObjectTable {
    /// 24-byte object records.
    object: Vec<u8>,
    /// 4-byte object page table slots.
    page: Vec<u8>,
}

impl ObjectTable {
    /// Appends one object record, plus one page-table slot per entry in
    /// `fixup_pages` (the object's 1-based fixup page table indices).
    #[allow(clippy::cast_possible_truncation)]
    fn push(&mut self, obj: &Object, fixup_pages: &[u32]) {
        let mut rec = [0u8; OBJECT_RECORD_SIZE];
        rec[0..4].copy_from_slice(&obj.virtual_size.to_le_bytes());
        rec[4..8].copy_from_slice(&obj.base_addr.to_le_bytes());
        rec[8..12].copy_from_slice(&obj.flags.bits().to_le_bytes());
        if !fixup_pages.is_empty() {
            let index = (self.page.len() / 4 + 1) as u32;
            rec[12..16].copy_from_slice(&index.to_le_bytes());
            rec[16..20].copy_from_slice(&(fixup_pages.len() as u32).to_le_bytes());
            for &idx in fixup_pages {
                // The middle two bytes hold the fixup page index in
                // big-endian order; the outer two are reserved.
                self.page
                    .extend_from_slice(&[0, (idx >> 8) as u8, (idx & 0xff) as u8, 0]);
            }
        }
        // rec[20..24] reserved, zero.
        self.object.extend_from_slice(&rec);
    }
}

// ---------------------------------------------------------------------------
// Fixup section builder
// ---------------------------------------------------------------------------

/// Builds the fixup page offset table and the fixup record stream.
struct FixupTable {
    /// Fixup page table: 4-byte offsets into `records`.
    pages: Vec<u8>,
    /// Variable-width fixup records.
    records: Vec<u8>,
}

/// Returns the pages touched by the 4-byte span starting at `src`.
fn touched_pages(src: i32) -> impl Iterator<Item = i32> {
    let first = src >> PAGE_BITS;
    let last = (src + 3) >> PAGE_BITS;
    core::iter::once(first).chain((last != first).then_some(last))
}

/// Appends one variable-width fixup record.
///
/// Short form (7 bytes) holds a 16-bit target offset; targets above
/// 0x7FFF use the long form (9 bytes) with flag bit 0x10 and a 32-bit
/// offset.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn append_record(records: &mut Vec<u8>, f: RawFixup) {
    records.push(f.src_type as u8);
    let long = f.off > 0x7fff;
    records.push(if long { 0x10 } else { 0x00 });
    records.extend_from_slice(&(f.src as i16).to_le_bytes());
    records.push(f.obj as u8);
    if long {
        records.extend_from_slice(&(f.off as u32).to_le_bytes());
    } else {
        records.extend_from_slice(&(f.off as u16).to_le_bytes());
    }
}

impl FixupTable {
    fn new() -> Self {
        // Entry 0 of the page offset table: records start at offset 0.
        // Every page appended later contributes its end offset, so entries
        // i and i+1 bracket page i's records and the final entry doubles
        // as the sentinel.
        Self {
            pages: vec![0; 4],
            records: Vec::new(),
        }
    }

    /// Buckets an object's fixups into its 4 KiB pages and appends the
    /// per-page records.
    ///
    /// Returns the 1-based fixup page table indices covering the object,
    /// one per page, or an empty list when the object needs no fixup
    /// pages.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::UnresolvedFixup`] if any fixup target is
    /// [`Ref::Unresolved`]. Targets of [`Ref::Absolute`] are dropped.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn push(
        &mut self,
        object_index: usize,
        virtual_size: u32,
        fixups: &[Fixup],
    ) -> Result<Vec<u32>, EncodeError> {
        let mut raw = Vec::with_capacity(fixups.len());
        for f in fixups {
            match f.target {
                Ref::Object { obj, off } => raw.push(RawFixup {
                    src_type: f.src_type,
                    src: f.src,
                    obj,
                    off,
                }),
                // Absolute addresses need no load-time patch.
                Ref::Absolute => {}
                Ref::Unresolved => {
                    return Err(EncodeError::UnresolvedFixup {
                        object: object_index,
                        src: f.src,
                    });
                }
            }
        }
        if virtual_size == 0 {
            return Ok(Vec::new());
        }
        let Some(max_end) = raw.iter().map(|f| f.src + 3).max() else {
            return Ok(Vec::new());
        };
        // Cover every page of the object, extended if a fixup span ends
        // past the virtual size.
        let npage = (page_count(virtual_size) as i32).max((max_end >> PAGE_BITS) + 1) as usize;

        // Bucket fixups by page with a counting sort. A 4-byte fixup that
        // straddles a page boundary lands in both pages it touches, so
        // the loader patches both halves as each page comes in.
        let in_range = |pi: i32| pi >= 0 && (pi as usize) < npage;
        let mut counts = vec![0u32; npage];
        for f in &raw {
            for pi in touched_pages(f.src) {
                if in_range(pi) {
                    counts[pi as usize] += 1;
                }
            }
        }

        let mut starts = counts;
        let mut total = 0u32;
        for c in &mut starts {
            let n = *c;
            *c = total;
            total += n;
        }

        let placeholder = RawFixup {
            src_type: SrcType::Offset32,
            src: 0,
            obj: 0,
            off: 0,
        };
        let mut slots = vec![placeholder; total as usize];
        let mut next = starts.clone();
        for f in &raw {
            for pi in touched_pages(f.src) {
                if in_range(pi) {
                    let slot = &mut next[pi as usize];
                    slots[*slot as usize] = *f;
                    *slot += 1;
                }
            }
        }

        // Emit the per-page records; `next` now holds each bucket's end.
        let mut idxs = Vec::with_capacity(npage);
        for pi in 0..npage {
            idxs.push((self.pages.len() / 4) as u32);
            let base = (pi as i32) << PAGE_BITS;
            for f in &slots[starts[pi] as usize..next[pi] as usize] {
                let mut f = *f;
                f.src -= base;
                append_record(&mut self.records, f);
            }
            let end = self.records.len() as u32;
            self.pages.extend_from_slice(&end.to_le_bytes());
        }
        Ok(idxs)
    }
}

// ---------------------------------------------------------------------------
// Data page builder
// ---------------------------------------------------------------------------

/// Packs object data into the data page section.
#[derive(Default)]
struct DataPages {
    /// Total pages emitted so far.
    count: u32,
    /// Bytes used in the last started page (0 if page-aligned).
    offset: u32,
    /// Concatenated page data, including inter-object zero fill.
    data: Vec<u8>,
}

impl DataPages {
    /// Appends one object's data, starting it on a page boundary.
    ///
    /// Objects without file-backed data contribute nothing.
    #[allow(clippy::cast_possible_truncation)]
    fn push(&mut self, data: &[u8]) {
        let n = page_count(data.len() as u32);
        if n == 0 {
            return;
        }
        if self.offset != 0 {
            let fill = (PAGE_SIZE - self.offset) as usize;
            self.data.resize(self.data.len() + fill, 0);
        }
        self.data.extend_from_slice(data);
        self.offset = (data.len() as u32) & (PAGE_SIZE - 1);
        self.count += n;
    }
}

// ---------------------------------------------------------------------------
// encode
// ---------------------------------------------------------------------------

fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn register(r: &Ref, register: &'static str) -> Result<(u32, i32), EncodeError> {
    match *r {
        Ref::Object { obj, off } => Ok((obj, off)),
        Ref::Unresolved | Ref::Absolute => Err(EncodeError::BadRegister { register }),
    }
}

/// Serializes a program into LE module bytes.
///
/// # Errors
///
/// Returns [`EncodeError`] if EIP or ESP does not reference an object, or
/// if any fixup carries an unresolved target.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn encode(program: &Program) -> Result<Vec<u8>, EncodeError> {
    let (entry_obj, entry_off) = register(&program.entry, "EIP")?;
    let (stack_obj, stack_off) = register(&program.stack, "ESP")?;

    let mut objects = ObjectTable::default();
    let mut fixups = FixupTable::new();
    let mut pages = DataPages::default();
    for (i, obj) in program.objects.iter().enumerate() {
        pages.push(&obj.data);
        let idxs = fixups.push(i + 1, obj.virtual_size, &obj.fixups)?;
        objects.push(obj, &idxs);
    }

    let object_table_offset = HEADER_SIZE;
    let page_table_offset = object_table_offset + objects.object.len();
    let fixup_page_offset = page_table_offset + objects.page.len();
    let fixup_record_offset = fixup_page_offset + fixups.pages.len();
    let data_pages_offset = fixup_record_offset + fixups.records.len();

    // The loader requires 1 <= last page size <= PAGE_SIZE, so a final
    // page that is exactly full is reported as PAGE_SIZE, not 0.
    let last_page_size = if pages.count == 0 {
        0
    } else if pages.offset == 0 {
        PAGE_SIZE
    } else {
        pages.offset
    };

    let mut h = [0u8; HEADER_SIZE];
    h[0] = b'L';
    h[1] = b'E';
    // Byte order, word order, and format level (0x02..0x08) are zero:
    // little-endian, format level 0.
    put_u16(&mut h, 0x08, 2); // CPU type: 80386
    put_u32(&mut h, 0x14, pages.count);
    put_u32(&mut h, 0x18, entry_obj);
    put_u32(&mut h, 0x1c, entry_off as u32);
    put_u32(&mut h, 0x20, stack_obj);
    put_u32(&mut h, 0x24, stack_off as u32);
    put_u32(&mut h, 0x28, PAGE_SIZE);
    put_u32(&mut h, 0x2c, last_page_size);
    put_u32(&mut h, 0x30, (fixups.pages.len() + fixups.records.len()) as u32);
    put_u32(&mut h, 0x38, (objects.object.len() + objects.page.len()) as u32);
    put_u32(&mut h, 0x40, object_table_offset as u32);
    put_u32(&mut h, 0x44, program.objects.len() as u32);
    put_u32(&mut h, 0x48, page_table_offset as u32);
    put_u32(&mut h, 0x68, fixup_page_offset as u32);
    put_u32(&mut h, 0x6c, fixup_record_offset as u32);
    put_u32(&mut h, 0x80, data_pages_offset as u32);

    let mut out = Vec::with_capacity(data_pages_offset + pages.data.len());
    out.extend_from_slice(&h);
    out.extend_from_slice(&objects.object);
    out.extend_from_slice(&objects.page);
    out.extend_from_slice(&fixups.pages);
    out.extend_from_slice(&fixups.records);
    out.extend_from_slice(&pages.data);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
