//! The ELF-to-LE conversion pipeline.
//!
//! Stages, in order: assign `PT_LOAD` segments to LE objects, resolve the
//! entry point, resolve symbols and locate `_stack_end`, translate
//! `SHT_REL` relocations into LE fixups. Each stage failure is wrapped
//! with its location (segment index, section index and name, relocation
//! offset) on the way out.

use anyhow::{Context, Result, anyhow, bail};

use muon_elf::{
    Elf32Rel, ElfFile, PF_R, PF_W, PF_X, PT_GNU_EH_FRAME, PT_LOAD, PT_NOTE, PT_NULL, R_386_32,
    R_386_PC32, SHN_ABS, SHT_REL, SHT_RELA, SHT_SYMTAB,
};
use muon_le::{Fixup, Object, ObjectFlags, Program, Ref, SrcType};

/// A range of virtual addresses in the ELF image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AddrRange {
    addr: u32,
    size: u32,
}

impl AddrRange {
    /// Returns `true` if the range contains the given address, or if the
    /// address is one past the end of the range.
    fn has_addr(&self, addr: u32) -> bool {
        self.addr <= addr && addr <= self.addr + self.size
    }

    /// Returns `true` if the ranges have any bytes in common.
    fn overlaps(&self, other: AddrRange) -> bool {
        self.addr + self.size > other.addr && other.addr + other.size > self.addr
    }

    /// Returns `true` if this range contains all of `other`.
    fn contains(&self, other: AddrRange) -> bool {
        self.addr <= other.addr && other.addr + other.size <= self.addr + self.size
    }
}

/// An ELF `PT_LOAD` segment assigned to an LE object under construction.
struct Segment {
    range: AddrRange,
    /// Index of the originating ELF program header.
    index: usize,
    object: Object,
}

/// Resolves an ELF virtual address to an object reference.
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn resolve_addr(segments: &[Segment], addr: u32) -> Ref {
    for (i, seg) in segments.iter().enumerate() {
        if seg.range.has_addr(addr) {
            return Ref::Object {
                obj: (i + 1) as u32,
                off: (addr - seg.range.addr) as i32,
            };
        }
    }
    Ref::Unresolved
}

/// An ELF symbol resolved to an object reference.
struct Symbol<'a> {
    /// The symbol's virtual address in the ELF image.
    value: u32,
    /// Where the symbol lives in the LE module.
    re: Ref,
    name: &'a str,
}

fn segment_type_name(seg_type: u32) -> String {
    match seg_type {
        2 => "PT_DYNAMIC".to_string(),
        3 => "PT_INTERP".to_string(),
        6 => "PT_PHDR".to_string(),
        7 => "PT_TLS".to_string(),
        other => format!("{other:#010x}"),
    }
}

fn reloc_type_name(r_type: u8) -> String {
    match r_type {
        0 => "R_386_NONE".to_string(),
        3 => "R_386_GOT32".to_string(),
        4 => "R_386_PLT32".to_string(),
        5 => "R_386_COPY".to_string(),
        6 => "R_386_GLOB_DAT".to_string(),
        7 => "R_386_JMP_SLOT".to_string(),
        8 => "R_386_RELATIVE".to_string(),
        other => format!("{other}"),
    }
}

/// Reads one `PT_LOAD` program header into a segment and its LE object.
fn read_load_segment(elf: &ElfFile<'_>, index: usize, phdr: &muon_elf::Elf32ProgramHeader) -> Result<Segment> {
    let mut flags = ObjectFlags::BIT32;
    if phdr.flags & PF_X != 0 {
        flags |= ObjectFlags::EXECUTABLE;
    }
    if phdr.flags & PF_W != 0 {
        flags |= ObjectFlags::WRITABLE;
    }
    if phdr.flags & PF_R != 0 {
        flags |= ObjectFlags::READABLE;
    } else {
        bail!("segment is loadable but not readable, which is unsupported");
    }
    let unknown = phdr.flags & !(PF_X | PF_W | PF_R);
    if unknown != 0 {
        bail!("segment has unknown flags {unknown:#010x}");
    }
    let data = elf
        .segment_data(phdr)
        .context("could not read segment: unexpected EOF")?;
    Ok(Segment {
        range: AddrRange {
            addr: phdr.vaddr,
            size: phdr.memsz,
        },
        index,
        object: Object {
            flags,
            virtual_size: phdr.memsz,
            base_addr: phdr.vaddr,
            data: data.to_vec(),
            fixups: Vec::new(),
        },
    })
}

/// Assigns each loadable ELF segment to an LE object, in program header
/// order. The 1-based LE object index is the position in the returned
/// list plus one.
fn assign_segments(elf: &ElfFile<'_>) -> Result<Vec<Segment>> {
    let mut segments: Vec<Segment> = Vec::new();
    for (i, phdr) in elf.program_headers().enumerate() {
        match phdr.seg_type {
            PT_NULL | PT_NOTE | PT_GNU_EH_FRAME => {
                // NULL means discard, comments are not kept, and exception
                // handling data is explicitly dropped.
            }
            PT_LOAD => {
                let seg = read_load_segment(elf, i, &phdr)
                    .with_context(|| format!("segment {i}"))?;
                if let Some(prev) = segments.iter().find(|s| s.range.overlaps(seg.range)) {
                    bail!("segment {i} overlaps segment {}", prev.index);
                }
                segments.push(seg);
            }
            other => {
                return Err(anyhow!(
                    "segment has type {}, which is unsupported",
                    segment_type_name(other)
                ))
                .with_context(|| format!("segment {i}"));
            }
        }
    }
    Ok(segments)
}

/// Resolves each ELF symbol to an object reference.
///
/// `SHN_ABS` symbols become [`Ref::Absolute`]; every other symbol is
/// resolved by its virtual address. A symbol landing in no segment stays
/// [`Ref::Unresolved`], which is tolerated here — translation rejects any
/// relocation that uses one.
fn resolve_symbols<'a>(elf: &ElfFile<'a>, segments: &[Segment]) -> Result<Vec<Symbol<'a>>> {
    let Some(symtab) = elf.find_section_by_type(SHT_SYMTAB) else {
        return Ok(Vec::new());
    };
    let strtab = elf
        .linked_strtab(&symtab)
        .context("symbol string table is out of bounds")?;
    let iter = elf
        .symbols(&symtab)
        .context("symbol table is out of bounds")?;

    let mut symbols = Vec::new();
    // Entry 0 is the reserved null symbol; relocation symbol numbers are
    // 1-based relative to the entries collected here.
    for sym in iter.skip(1) {
        let re = if sym.st_shndx == SHN_ABS {
            Ref::Absolute
        } else {
            resolve_addr(segments, sym.st_value)
        };
        symbols.push(Symbol {
            value: sym.st_value,
            re,
            name: strtab.get(sym.st_name).unwrap_or(""),
        });
    }
    Ok(symbols)
}

/// Locates the `_stack_end` symbol defining the initial ESP.
fn find_stack(symbols: &[Symbol<'_>]) -> Result<Ref> {
    let stack = symbols
        .iter()
        .filter(|s| s.name == "_stack_end")
        .map(|s| s.re)
        .next_back()
        .unwrap_or(Ref::Unresolved);
    if !stack.is_object() {
        bail!("could not find _stack_end");
    }
    Ok(stack)
}

/// Translates one ELF relocation into at most one LE fixup.
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn add_relocation(rel: &Elf32Rel, segments: &mut [Segment], symbols: &[Symbol<'_>]) -> Result<()> {
    // Find the segment containing the 4-byte fixup site. A site in no
    // segment belongs to discarded data (EH frame); no fixup is needed.
    let site = AddrRange {
        addr: rel.r_offset,
        size: 4,
    };
    let Some(idx) = segments.iter().position(|s| s.range.contains(site)) else {
        return Ok(());
    };
    let src_obj = (idx + 1) as u32;

    // The relocation target is a symbol.
    if rel.r_sym == 0 || rel.r_sym as usize > symbols.len() {
        bail!("symbol reference {} out of bounds", rel.r_sym);
    }
    let sym = &symbols[rel.r_sym as usize - 1];
    let (sym_obj, sym_off) = match sym.re {
        Ref::Unresolved => bail!("unresolved symbol {:?} (symbol {})", sym.name, rel.r_sym),
        // Absolute addresses survive relocation by the LE loader as-is.
        Ref::Absolute => return Ok(()),
        Ref::Object { obj, off } => (obj, off),
    };

    // Read the value the ELF linker left at the site; the addend is
    // reconstructed from it below.
    let seg = &mut segments[idx];
    let src = rel.r_offset - seg.range.addr;
    let val = seg
        .object
        .data
        .get(src as usize..)
        .and_then(|d| d.first_chunk::<4>())
        .copied()
        .map(u32::from_le_bytes)
        .context("relocation site is outside the segment's file-backed data")?;

    let (src_type, target_off) = match rel.r_type {
        R_386_32 => (
            SrcType::Offset32,
            sym_off.wrapping_add(val.wrapping_sub(sym.value) as i32),
        ),
        R_386_PC32 => {
            if sym_obj == src_obj {
                // src + val + 4 == target_off here: a self-relative
                // reference within one object needs no run-time fixup.
                return Ok(());
            }
            (
                SrcType::Relative32,
                sym_off.wrapping_add(
                    val.wrapping_add(rel.r_offset)
                        .wrapping_add(4)
                        .wrapping_sub(sym.value) as i32,
                ),
            )
        }
        other => bail!("unsupported relocation type {}", reloc_type_name(other)),
    };

    seg.object.fixups.push(Fixup {
        src_type,
        src: src as i32,
        target: Ref::Object {
            obj: sym_obj,
            off: target_off,
        },
        add: 0,
    });
    Ok(())
}

/// Reads one `SHT_REL` section and adds its fixups to the objects.
fn read_relocation_section(
    elf: &ElfFile<'_>,
    shdr: &muon_elf::Elf32SectionHeader,
    segments: &mut [Segment],
    symbols: &[Symbol<'_>],
) -> Result<()> {
    if shdr.sh_type != SHT_REL {
        bail!("unsupported relocation section type SHT_RELA");
    }
    let data = elf
        .section_data(shdr)
        .context("section data is out of bounds")?;
    if data.len() % 8 != 0 {
        bail!("REL section length is not a multiple of 8");
    }
    let entries = elf
        .rel_entries(shdr)
        .context("section data is out of bounds")?;
    for rel in entries {
        add_relocation(&rel, segments, symbols)
            .with_context(|| format!("relocation at {:#x}", rel.r_offset))?;
    }
    Ok(())
}

/// Walks the section table and translates every relocation section.
fn read_sections(elf: &ElfFile<'_>, segments: &mut [Segment], symbols: &[Symbol<'_>]) -> Result<()> {
    for (i, shdr) in elf.sections().enumerate() {
        if shdr.sh_type != SHT_REL && shdr.sh_type != SHT_RELA {
            continue;
        }
        let name = elf.section_name(&shdr).unwrap_or("");
        let in_section_bounds = (shdr.sh_info as usize) < elf.section_count();
        if !in_section_bounds {
            return Err(anyhow!("relocation section refers to invalid section"))
                .with_context(|| format!("section {i} {name:?}"));
        }
        read_relocation_section(elf, &shdr, segments, symbols)
            .with_context(|| format!("section {i} {name:?}"))?;
    }
    Ok(())
}

/// Converts a 32-bit x86 ELF executable into an LE program.
///
/// # Errors
///
/// Fails on ELF header mismatches, unsupported segment or relocation
/// constructs, structural errors in the symbol or relocation tables, an
/// unresolvable entry point, or a missing `_stack_end` symbol. Errors
/// carry the location (segment, section, relocation offset) they arose
/// from.
pub fn convert(data: &[u8]) -> Result<Program> {
    let elf = ElfFile::parse(data).map_err(|e| anyhow!("{e}"))?;

    let mut segments = assign_segments(&elf)?;
    let entry = resolve_addr(&segments, elf.entry_point());
    if !entry.is_object() {
        bail!("could not resolve entry point {:#x}", elf.entry_point());
    }
    let symbols = resolve_symbols(&elf, &segments)?;
    let stack = find_stack(&symbols)?;
    read_sections(&elf, &mut segments, &symbols)?;

    Ok(Program {
        entry,
        stack,
        objects: segments.into_iter().map(|s| s.object).collect(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
