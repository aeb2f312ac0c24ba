//! LE module reading.
//!
//! Parses a serialized LE (or LX) module back into its header, object
//! table, fixup pages, and data pages, with bounds checking throughout.
//! This is the inspection-side counterpart of [`encode`](crate::encode):
//! `muon --objdump` renders the result, and the test suite uses it to
//! verify that serialized modules read back as written.

use core::fmt;

use crate::program::{Fixup, Ref, SrcType};
use crate::{HEADER_SIZE, OBJECT_RECORD_SIZE, page_count};

/// Errors that can occur when reading an LE module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The input is too short for the module header.
    Truncated,
    /// The signature is neither `LE` nor `LX`.
    BadSignature([u8; 2]),
    /// The object count exceeds the supported maximum.
    TooManyObjects(u32),
    /// A table or page lies outside the input.
    OutOfBounds(&'static str),
    /// A fixup record carries an unsupported source type.
    UnsupportedFixupType(u8),
    /// A fixup record is cut short by its page's record range.
    TruncatedFixupRecord,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "input data truncated"),
            Self::BadSignature(sig) => write!(
                f,
                "unknown module signature {:02x} {:02x} (expected LE or LX)",
                sig[0], sig[1]
            ),
            Self::TooManyObjects(n) => write!(f, "too many objects: {n}"),
            Self::OutOfBounds(what) => write!(f, "{what} is out of bounds"),
            Self::UnsupportedFixupType(t) => {
                write!(f, "unsupported fixup source type {t:#04x}")
            }
            Self::TruncatedFixupRecord => write!(f, "fixup record truncated"),
        }
    }
}

fn le_u16(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(data[off..off + 2].try_into().unwrap())
}

fn le_u32(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(data[off..off + 4].try_into().unwrap())
}

/// The parsed 0xAC-byte LE module header, every field in file order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Module signature, `LE` or `LX`.
    pub signature: [u8; 2],
    /// Byte order: 0 little-endian, 1 big-endian.
    pub byte_order: u8,
    /// Word order: 0 little-endian, 1 big-endian.
    pub word_order: u8,
    /// Format level.
    pub format_level: u32,
    /// CPU type (2 = 80386).
    pub cpu_type: u16,
    /// Target operating system.
    pub os_type: u16,
    /// Module version.
    pub module_version: u32,
    /// Module flags.
    pub module_flags: u32,
    /// Number of data pages in the module.
    pub module_num_pages: u32,
    /// Initial EIP as an object reference.
    pub eip: Ref,
    /// Initial ESP as an object reference.
    pub esp: Ref,
    /// Page size in bytes.
    pub page_size: u32,
    /// Bytes of content on the last data page.
    pub last_page_size: u32,
    /// Size of the fixup section in bytes.
    pub fixup_section_size: u32,
    /// Fixup section checksum.
    pub fixup_section_checksum: u32,
    /// Size of the loader section in bytes.
    pub loader_section_size: u32,
    /// Loader section checksum.
    pub loader_section_checksum: u32,
    /// File offset of the object table.
    pub object_table_offset: u32,
    /// Number of objects in the module.
    pub num_objects: u32,
    /// File offset of the object page table.
    pub object_page_table_offset: u32,
    /// File offset of the object iterated page table.
    pub object_iter_page_table_offset: u32,
    /// File offset of the resource table.
    pub resource_table_offset: u32,
    /// Number of resource table entries.
    pub num_resource_entries: u32,
    /// File offset of the resident name table.
    pub resident_name_table_offset: u32,
    /// File offset of the entry table.
    pub entry_table_offset: u32,
    /// File offset of the module directives table.
    pub module_directives_offset: u32,
    /// Number of module directives.
    pub num_module_directives: u32,
    /// File offset of the fixup page table.
    pub fixup_page_table_offset: u32,
    /// File offset of the fixup record table.
    pub fixup_record_offset: u32,
    /// File offset of the import module table.
    pub import_module_table_offset: u32,
    /// Number of import module table entries.
    pub import_module_entries: u32,
    /// File offset of the import procedure table.
    pub import_proc_table_offset: u32,
    /// File offset of the per-page checksum table.
    pub per_page_checksum_offset: u32,
    /// File offset of the data pages.
    pub data_pages_offset: u32,
    /// Number of preload pages.
    pub num_preload_pages: u32,
    /// File offset of the non-resident name table.
    pub nonres_name_table_offset: u32,
    /// Length of the non-resident name table.
    pub nonres_name_table_length: u32,
    /// Checksum of the non-resident name table.
    pub nonres_name_table_checksum: u32,
    /// Automatic data segment object number.
    pub auto_ds_object: u32,
    /// File offset of the debug information.
    pub debug_info_offset: u32,
    /// Length of the debug information.
    pub debug_info_length: u32,
    /// Number of instance preload pages.
    pub num_instance_preload: u32,
    /// Number of instance demand pages.
    pub num_instance_demand: u32,
    /// Heap size (16-bit modules only).
    pub heap_size: u32,
}

impl Header {
    /// Returns `true` if the module signature is `LE`.
    #[must_use]
    pub fn is_le(&self) -> bool {
        self.signature == *b"LE"
    }

    /// Returns `true` if the module signature is `LX`.
    #[must_use]
    pub fn is_lx(&self) -> bool {
        self.signature == *b"LX"
    }

    /// Parse a module header from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if the data is too short or the signature
    /// is not `LE`/`LX`.
    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < HEADER_SIZE {
            return Err(DecodeError::Truncated);
        }
        let signature = [data[0], data[1]];
        if signature != *b"LE" && signature != *b"LX" {
            return Err(DecodeError::BadSignature(signature));
        }
        Ok(Self {
            signature,
            byte_order: data[2],
            word_order: data[3],
            format_level: le_u32(data, 0x04),
            cpu_type: le_u16(data, 0x08),
            os_type: le_u16(data, 0x0a),
            module_version: le_u32(data, 0x0c),
            module_flags: le_u32(data, 0x10),
            module_num_pages: le_u32(data, 0x14),
            eip: Ref::Object {
                obj: le_u32(data, 0x18),
                off: le_u32(data, 0x1c) as i32,
            },
            esp: Ref::Object {
                obj: le_u32(data, 0x20),
                off: le_u32(data, 0x24) as i32,
            },
            page_size: le_u32(data, 0x28),
            last_page_size: le_u32(data, 0x2c),
            fixup_section_size: le_u32(data, 0x30),
            fixup_section_checksum: le_u32(data, 0x34),
            loader_section_size: le_u32(data, 0x38),
            loader_section_checksum: le_u32(data, 0x3c),
            object_table_offset: le_u32(data, 0x40),
            num_objects: le_u32(data, 0x44),
            object_page_table_offset: le_u32(data, 0x48),
            object_iter_page_table_offset: le_u32(data, 0x4c),
            resource_table_offset: le_u32(data, 0x50),
            num_resource_entries: le_u32(data, 0x54),
            resident_name_table_offset: le_u32(data, 0x58),
            entry_table_offset: le_u32(data, 0x5c),
            module_directives_offset: le_u32(data, 0x60),
            num_module_directives: le_u32(data, 0x64),
            fixup_page_table_offset: le_u32(data, 0x68),
            fixup_record_offset: le_u32(data, 0x6c),
            import_module_table_offset: le_u32(data, 0x70),
            import_module_entries: le_u32(data, 0x74),
            import_proc_table_offset: le_u32(data, 0x78),
            per_page_checksum_offset: le_u32(data, 0x7c),
            data_pages_offset: le_u32(data, 0x80),
            num_preload_pages: le_u32(data, 0x84),
            nonres_name_table_offset: le_u32(data, 0x88),
            nonres_name_table_length: le_u32(data, 0x8c),
            nonres_name_table_checksum: le_u32(data, 0x90),
            auto_ds_object: le_u32(data, 0x94),
            debug_info_offset: le_u32(data, 0x98),
            debug_info_length: le_u32(data, 0x9c),
            num_instance_preload: le_u32(data, 0xa0),
            num_instance_demand: le_u32(data, 0xa4),
            heap_size: le_u32(data, 0xa8),
        })
    }
}

/// A 24-byte object table record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRecord {
    /// Memory footprint of the object in bytes.
    pub virtual_size: u32,
    /// Address the object was linked at.
    pub base_addr: u32,
    /// Object flag word.
    pub flags: u32,
    /// 1-based index of the object's first object page table slot, or 0
    /// when the object has no fixup pages.
    pub page_table_index: u32,
    /// Number of object page table slots belonging to the object.
    pub page_table_entries: u32,
    /// Reserved, zero.
    pub reserved: u32,
}

/// One fixup page of an object: the page's index into the fixup page
/// table plus its decoded fixup records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// 1-based index into the fixup page table.
    pub fixup_page_index: u32,
    /// Fixups applying to this page. Source offsets are page-relative.
    pub fixups: Vec<Fixup>,
}

/// An object read back from a module: its table record, fixup pages, and
/// reconstructed data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleObject {
    /// The 24-byte object table record.
    pub record: ObjectRecord,
    /// Fixup pages, in object page order.
    pub pages: Vec<Page>,
    /// Data page content attributed to this object.
    ///
    /// The container does not record per-object data lengths, so pages
    /// are attributed sequentially; recovery is exact modulo trailing
    /// zero fill within `virtual_size`.
    pub data: Vec<u8>,
}

/// A parsed LE module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    /// The module header.
    pub header: Header,
    /// The module's objects, in table order.
    pub objects: Vec<ModuleObject>,
}

/// Largest object count accepted by the reader.
const MAX_OBJECTS: u32 = 64;

fn slice_at<'a>(data: &'a [u8], off: usize, len: usize, what: &'static str) -> Result<&'a [u8], DecodeError> {
    let end = off.checked_add(len).ok_or(DecodeError::OutOfBounds(what))?;
    if end > data.len() {
        return Err(DecodeError::OutOfBounds(what));
    }
    Ok(&data[off..end])
}

/// Decodes one fixup record stream (a page's slice of the record table).
fn decode_records(mut rec: &[u8]) -> Result<Vec<Fixup>, DecodeError> {
    let mut fixups = Vec::new();
    while !rec.is_empty() {
        if rec.len() < 7 {
            return Err(DecodeError::TruncatedFixupRecord);
        }
        let src_type =
            SrcType::from_u8(rec[0]).ok_or(DecodeError::UnsupportedFixupType(rec[0]))?;
        let flags = rec[1];
        let src = i32::from(i16::from_le_bytes([rec[2], rec[3]]));
        let obj = u32::from(rec[4]);
        let (off, len) = if flags & 0x10 != 0 {
            if rec.len() < 9 {
                return Err(DecodeError::TruncatedFixupRecord);
            }
            (le_u32(rec, 5) as i32, 9)
        } else {
            (i32::from(le_u16(rec, 5)), 7)
        };
        fixups.push(Fixup {
            src_type,
            src,
            target: Ref::Object { obj, off },
            add: 0,
        });
        rec = &rec[len..];
    }
    Ok(fixups)
}

/// Reads an LE module from raw bytes.
///
/// # Errors
///
/// Returns [`DecodeError`] if the header, object table, fixup tables, or
/// data pages are malformed or out of bounds.
pub fn decode(data: &[u8]) -> Result<Module, DecodeError> {
    let header = Header::parse(data)?;
    if header.num_objects > MAX_OBJECTS {
        return Err(DecodeError::TooManyObjects(header.num_objects));
    }

    // Object table
    let table = slice_at(
        data,
        header.object_table_offset as usize,
        header.num_objects as usize * OBJECT_RECORD_SIZE,
        "object table",
    )?;
    let records: Vec<ObjectRecord> = (0..header.num_objects as usize)
        .map(|i| {
            let b = &table[i * OBJECT_RECORD_SIZE..];
            ObjectRecord {
                virtual_size: le_u32(b, 0),
                base_addr: le_u32(b, 4),
                flags: le_u32(b, 8),
                page_table_index: le_u32(b, 12),
                page_table_entries: le_u32(b, 16),
                reserved: le_u32(b, 20),
            }
        })
        .collect();

    let mut objects = Vec::with_capacity(records.len());
    let mut page_cursor = 0u32;
    for record in records {
        let pages = read_fixup_pages(data, &header, &record)?;
        let data_bytes = read_object_data(data, &header, &record, &mut page_cursor)?;
        objects.push(ModuleObject {
            record,
            pages,
            data: data_bytes,
        });
    }

    Ok(Module { header, objects })
}

/// Reads one object's fixup pages via the object page table.
fn read_fixup_pages(
    data: &[u8],
    header: &Header,
    record: &ObjectRecord,
) -> Result<Vec<Page>, DecodeError> {
    if record.page_table_index == 0 {
        return Ok(Vec::new());
    }
    let mut pages = Vec::with_capacity(record.page_table_entries as usize);
    for i in 0..record.page_table_entries {
        let slot_off = header.object_page_table_offset as usize
            + (record.page_table_index as usize - 1 + i as usize) * 4;
        let slot = slice_at(data, slot_off, 4, "object page table")?;
        // Big-endian middle bytes, reserved outer bytes.
        let fixup_page_index = (u32::from(slot[1]) << 8) | u32::from(slot[2]);
        if fixup_page_index == 0 {
            return Err(DecodeError::OutOfBounds("fixup page index"));
        }

        let entry_off =
            header.fixup_page_table_offset as usize + (fixup_page_index as usize - 1) * 4;
        let entries = slice_at(data, entry_off, 8, "fixup page table")?;
        let start = le_u32(entries, 0) as usize;
        let end = le_u32(entries, 4) as usize;
        if end < start {
            return Err(DecodeError::OutOfBounds("fixup record range"));
        }
        let rec = slice_at(
            data,
            header.fixup_record_offset as usize + start,
            end - start,
            "fixup records",
        )?;
        pages.push(Page {
            fixup_page_index,
            fixups: decode_records(rec)?,
        });
    }
    Ok(pages)
}

/// Attributes data pages to one object and advances the page cursor.
fn read_object_data(
    data: &[u8],
    header: &Header,
    record: &ObjectRecord,
    page_cursor: &mut u32,
) -> Result<Vec<u8>, DecodeError> {
    let remaining = header.module_num_pages.saturating_sub(*page_cursor);
    let take = page_count(record.virtual_size).min(remaining);
    if take == 0 {
        return Ok(Vec::new());
    }
    let start =
        header.data_pages_offset as usize + *page_cursor as usize * header.page_size as usize;
    // The final page of the module carries only `last_page_size` bytes.
    let full = take as usize * header.page_size as usize;
    let len = if *page_cursor + take == header.module_num_pages {
        full - header.page_size as usize + header.last_page_size as usize
    } else {
        full
    };
    let bytes = slice_at(data, start, len, "data pages")?;
    *page_cursor += take;
    Ok(bytes.to_vec())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::encode;
    use crate::program::{Object, ObjectFlags, Program};
    use crate::{PAGE_SIZE, encode::EncodeError};

    fn two_object_program() -> Program {
        Program {
            entry: Ref::Object { obj: 1, off: 0x10 },
            stack: Ref::Object { obj: 2, off: 0x80 },
            objects: vec![
                Object {
                    flags: ObjectFlags::READABLE | ObjectFlags::EXECUTABLE | ObjectFlags::BIT32,
                    virtual_size: 0x100,
                    base_addr: 0x1_0000,
                    data: (0..=0xff).collect(),
                    fixups: vec![
                        Fixup {
                            src_type: SrcType::Offset32,
                            src: 0x20,
                            target: Ref::Object { obj: 2, off: 0x40 },
                            add: 0,
                        },
                        Fixup {
                            src_type: SrcType::Relative32,
                            src: 0x30,
                            target: Ref::Object {
                                obj: 2,
                                off: 0x9000,
                            },
                            add: 0,
                        },
                    ],
                },
                Object {
                    flags: ObjectFlags::READABLE | ObjectFlags::WRITABLE | ObjectFlags::BIT32,
                    virtual_size: 0xa000,
                    base_addr: 0x2_0000,
                    data: vec![0x55; 0x80],
                    fixups: Vec::new(),
                },
            ],
        }
    }

    #[test]
    fn header_round_trip() {
        let out = encode(&two_object_program()).unwrap();
        let header = Header::parse(&out).unwrap();

        assert!(header.is_le());
        assert!(!header.is_lx());
        assert_eq!(header.byte_order, 0);
        assert_eq!(header.word_order, 0);
        assert_eq!(header.cpu_type, 2);
        assert_eq!(header.module_num_pages, 2);
        assert_eq!(header.eip, Ref::Object { obj: 1, off: 0x10 });
        assert_eq!(header.esp, Ref::Object { obj: 2, off: 0x80 });
        assert_eq!(header.page_size, PAGE_SIZE);
        assert_eq!(header.last_page_size, 0x80);
        assert_eq!(header.num_objects, 2);
    }

    #[test]
    fn object_table_round_trip() {
        let program = two_object_program();
        let out = encode(&program).unwrap();
        let module = decode(&out).unwrap();

        assert_eq!(module.objects.len(), 2);
        let o1 = &module.objects[0];
        assert_eq!(o1.record.virtual_size, 0x100);
        assert_eq!(o1.record.base_addr, 0x1_0000);
        assert_eq!(o1.record.flags, 0x2005);
        assert_eq!(o1.record.page_table_index, 1);
        assert_eq!(o1.record.page_table_entries, 1);
        assert_eq!(o1.record.reserved, 0);

        let o2 = &module.objects[1];
        assert_eq!(o2.record.virtual_size, 0xa000);
        assert_eq!(o2.record.flags, 0x2003);
        assert_eq!(o2.record.page_table_index, 0);
        assert_eq!(o2.record.page_table_entries, 0);
    }

    #[test]
    fn fixups_round_trip() {
        let program = two_object_program();
        let out = encode(&program).unwrap();
        let module = decode(&out).unwrap();

        let pages = &module.objects[0].pages;
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].fixup_page_index, 1);
        assert_eq!(
            pages[0].fixups,
            vec![
                Fixup {
                    src_type: SrcType::Offset32,
                    src: 0x20,
                    target: Ref::Object { obj: 2, off: 0x40 },
                    add: 0,
                },
                Fixup {
                    src_type: SrcType::Relative32,
                    src: 0x30,
                    target: Ref::Object {
                        obj: 2,
                        off: 0x9000,
                    },
                    add: 0,
                },
            ]
        );
        assert!(module.objects[1].pages.is_empty());
    }

    #[test]
    fn data_round_trip() {
        let program = two_object_program();
        let out = encode(&program).unwrap();
        let module = decode(&out).unwrap();

        // Object 1's page is padded to a full page with zeros
        let d1 = &module.objects[0].data;
        assert_eq!(d1.len(), PAGE_SIZE as usize);
        assert_eq!(&d1[..0x100], &program.objects[0].data[..]);
        assert!(d1[0x100..].iter().all(|&b| b == 0));

        // Object 2 claims the final, truncated page
        let d2 = &module.objects[1].data;
        assert_eq!(&d2[..], &program.objects[1].data[..]);
    }

    #[test]
    fn straddling_fixup_appears_once_per_page() {
        let mut program = two_object_program();
        program.objects[0].virtual_size = 0x2000;
        program.objects[0].data = vec![0; 0x2000];
        program.objects[0].fixups = vec![Fixup {
            src_type: SrcType::Offset32,
            src: 0xffe,
            target: Ref::Object { obj: 2, off: 0x10 },
            add: 0,
        }];
        let out = encode(&program).unwrap();
        let module = decode(&out).unwrap();

        let pages = &module.objects[0].pages;
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].fixups.len(), 1);
        assert_eq!(pages[1].fixups.len(), 1);
        assert_eq!(pages[0].fixups[0].src, 0xffe);
        assert_eq!(pages[1].fixups[0].src, -2);
        // Collapsing the page-straddling duplicate leaves one fixup
        assert_eq!(pages[0].fixups[0].target, pages[1].fixups[0].target);
    }

    #[test]
    fn reject_bad_signature() {
        let program = two_object_program();
        let mut out = encode(&program).unwrap();
        out[0] = b'N';
        out[1] = b'E';
        assert_eq!(decode(&out), Err(DecodeError::BadSignature([b'N', b'E'])));
    }

    #[test]
    fn accept_lx_signature() {
        let program = two_object_program();
        let mut out = encode(&program).unwrap();
        out[1] = b'X';
        let header = Header::parse(&out).unwrap();
        assert!(header.is_lx());
    }

    #[test]
    fn reject_truncated_header() {
        assert_eq!(Header::parse(&[0u8; 0x20]), Err(DecodeError::Truncated));
    }

    #[test]
    fn reject_too_many_objects() {
        let program = two_object_program();
        let mut out = encode(&program).unwrap();
        out[0x44..0x48].copy_from_slice(&1000u32.to_le_bytes());
        assert_eq!(decode(&out), Err(DecodeError::TooManyObjects(1000)));
    }

    #[test]
    fn reject_object_table_out_of_bounds() {
        let program = two_object_program();
        let mut out = encode(&program).unwrap();
        let len = out.len() as u32;
        out[0x40..0x44].copy_from_slice(&len.to_le_bytes());
        assert_eq!(
            decode(&out),
            Err(DecodeError::OutOfBounds("object table"))
        );
    }

    #[test]
    fn reject_truncated_fixup_records() {
        assert_eq!(decode_records(&[0x07]), Err(DecodeError::TruncatedFixupRecord));
        assert_eq!(
            decode_records(&[0x07, 0x10, 0, 0, 1, 0, 0, 0]),
            Err(DecodeError::TruncatedFixupRecord)
        );
    }

    #[test]
    fn reject_unknown_fixup_source_type() {
        assert_eq!(
            decode_records(&[0x02, 0, 0, 0, 1, 0, 0]),
            Err(DecodeError::UnsupportedFixupType(0x02))
        );
    }

    #[test]
    fn encode_error_display() {
        let msg = format!(
            "{}",
            EncodeError::UnresolvedFixup { object: 3, src: 0x10 }
        );
        assert!(msg.contains("object 3"));
        let msg = format!("{}", DecodeError::TooManyObjects(65));
        assert!(msg.contains("65"));
    }
}
