//! Human-readable text dump of a parsed LE module.
//!
//! Renders every header field in file order, then each object's table
//! record and per-page fixup lists. Backs `muon --objdump`.

use std::io::{self, Write};

use crate::decode::{Module, ObjectRecord};
use crate::program::{Fixup, Ref, SrcType};

/// Column where field values start.
const VALUE_COLUMN: usize = 34;

fn field<W: Write>(w: &mut W, indent: &str, name: &str, value: &str, hint: &str) -> io::Result<()> {
    let pad = VALUE_COLUMN.saturating_sub(indent.len() + name.len() + 1);
    if hint.is_empty() {
        writeln!(w, "{indent}{name}:{:pad$}{value}", "")
    } else {
        writeln!(w, "{indent}{name}:{:pad$}{value}  {hint}", "")
    }
}

fn field_u32<W: Write>(w: &mut W, indent: &str, name: &str, value: u32) -> io::Result<()> {
    field(w, indent, name, &format!("{value:#010x}"), "")
}

fn endian(value: u8) -> &'static str {
    match value {
        0 => "little endian",
        1 => "big endian",
        _ => "unknown",
    }
}

fn cpu_type(value: u16) -> &'static str {
    match value {
        1 => "80286",
        2 => "80386",
        3 => "80486",
        _ => "unknown",
    }
}

fn os_type(value: u16) -> &'static str {
    match value {
        1 => "OS/2",
        2 => "Windows",
        3 => "DOS 4.x",
        4 => "Windows 386",
        _ => "unknown",
    }
}

fn ref_value(r: &Ref) -> String {
    match r {
        Ref::Object { obj, off } => format!("{obj:#010x}:{off:#010x}"),
        Ref::Unresolved => "unresolved".to_string(),
        Ref::Absolute => "absolute".to_string(),
    }
}

fn src_type_name(t: SrcType) -> &'static str {
    match t {
        SrcType::Offset32 => "offset32",
        SrcType::Relative32 => "relative32",
    }
}

fn dump_fixup<W: Write>(w: &mut W, indent: &str, f: &Fixup) -> io::Result<()> {
    let target = match f.target {
        Ref::Object { obj, off } => format!("{obj}:{off:#06x}"),
        Ref::Unresolved => "unresolved".to_string(),
        Ref::Absolute => "absolute".to_string(),
    };
    let src = if f.src >= 0 {
        format!("+{:#06x}", f.src)
    } else {
        format!("-{:#06x}", -f.src)
    };
    writeln!(
        w,
        "{indent}{:#04x} {:<10} src {src}  -> {target}",
        f.src_type as u8,
        src_type_name(f.src_type),
    )
}

fn dump_object<W: Write>(w: &mut W, index: usize, rec: &ObjectRecord) -> io::Result<()> {
    writeln!(w, "Object {index}:")?;
    field_u32(w, "  ", "Virtual Size", rec.virtual_size)?;
    field_u32(w, "  ", "Base Address", rec.base_addr)?;
    field_u32(w, "  ", "Flags", rec.flags)?;
    field_u32(w, "  ", "Page Table Index", rec.page_table_index)?;
    field_u32(w, "  ", "Page Table Entries", rec.page_table_entries)?;
    field_u32(w, "  ", "Reserved", rec.reserved)
}

/// Writes the module, in text format, to the writer.
///
/// # Errors
///
/// Returns any I/O error from the writer.
pub fn dump<W: Write>(w: &mut W, module: &Module) -> io::Result<()> {
    let h = &module.header;
    writeln!(w, "Header:")?;
    field(
        w,
        "  ",
        "Signature",
        &format!("{:?}", String::from_utf8_lossy(&h.signature)),
        "",
    )?;
    field(
        w,
        "  ",
        "Byte Order",
        &format!("{:#04x}", h.byte_order),
        endian(h.byte_order),
    )?;
    field(
        w,
        "  ",
        "Word Order",
        &format!("{:#04x}", h.word_order),
        endian(h.word_order),
    )?;
    field_u32(w, "  ", "Format Level", h.format_level)?;
    field(
        w,
        "  ",
        "CPU Type",
        &format!("{:#06x}", h.cpu_type),
        cpu_type(h.cpu_type),
    )?;
    field(
        w,
        "  ",
        "OS Type",
        &format!("{:#06x}", h.os_type),
        os_type(h.os_type),
    )?;
    field_u32(w, "  ", "Module Version", h.module_version)?;
    field_u32(w, "  ", "Module Flags", h.module_flags)?;
    field_u32(w, "  ", "Module Num Pages", h.module_num_pages)?;
    field(w, "  ", "EIP", &ref_value(&h.eip), "")?;
    field(w, "  ", "ESP", &ref_value(&h.esp), "")?;
    field_u32(w, "  ", "Page Size", h.page_size)?;
    field_u32(w, "  ", "Last Page Size", h.last_page_size)?;
    field_u32(w, "  ", "Fixup Section Size", h.fixup_section_size)?;
    field_u32(w, "  ", "Fixup Section Checksum", h.fixup_section_checksum)?;
    field_u32(w, "  ", "Loader Section Size", h.loader_section_size)?;
    field_u32(w, "  ", "Loader Section Checksum", h.loader_section_checksum)?;
    field_u32(w, "  ", "Object Table Offset", h.object_table_offset)?;
    field_u32(w, "  ", "Num Objects", h.num_objects)?;
    field_u32(w, "  ", "Object Page Table Offset", h.object_page_table_offset)?;
    field_u32(
        w,
        "  ",
        "Object Iter Page Table Offset",
        h.object_iter_page_table_offset,
    )?;
    field_u32(w, "  ", "Resource Table Offset", h.resource_table_offset)?;
    field_u32(w, "  ", "Num Resource Entries", h.num_resource_entries)?;
    field_u32(
        w,
        "  ",
        "Resident Name Table Offset",
        h.resident_name_table_offset,
    )?;
    field_u32(w, "  ", "Entry Table Offset", h.entry_table_offset)?;
    field_u32(
        w,
        "  ",
        "Module Directives Offset",
        h.module_directives_offset,
    )?;
    field_u32(w, "  ", "Num Module Directives", h.num_module_directives)?;
    field_u32(w, "  ", "Fixup Page Table Offset", h.fixup_page_table_offset)?;
    field_u32(w, "  ", "Fixup Record Offset", h.fixup_record_offset)?;
    field_u32(
        w,
        "  ",
        "Import Module Table Offset",
        h.import_module_table_offset,
    )?;
    field_u32(w, "  ", "Import Module Entries", h.import_module_entries)?;
    field_u32(
        w,
        "  ",
        "Import Proc Table Offset",
        h.import_proc_table_offset,
    )?;
    field_u32(
        w,
        "  ",
        "Per Page Checksum Offset",
        h.per_page_checksum_offset,
    )?;
    field_u32(w, "  ", "Data Pages Offset", h.data_pages_offset)?;
    field_u32(w, "  ", "Num Preload Pages", h.num_preload_pages)?;
    field_u32(
        w,
        "  ",
        "Non Res Name Table Offset",
        h.nonres_name_table_offset,
    )?;
    field_u32(
        w,
        "  ",
        "Non Res Name Table Length",
        h.nonres_name_table_length,
    )?;
    field_u32(
        w,
        "  ",
        "Non Res Name Table Checksum",
        h.nonres_name_table_checksum,
    )?;
    field_u32(w, "  ", "Auto DS Object", h.auto_ds_object)?;
    field_u32(w, "  ", "Debug Info Offset", h.debug_info_offset)?;
    field_u32(w, "  ", "Debug Info Length", h.debug_info_length)?;
    field_u32(w, "  ", "Num Instance Preload", h.num_instance_preload)?;
    field_u32(w, "  ", "Num Instance Demand", h.num_instance_demand)?;
    field_u32(w, "  ", "Heap Size", h.heap_size)?;

    for (i, obj) in module.objects.iter().enumerate() {
        writeln!(w)?;
        dump_object(w, i + 1, &obj.record)?;
        for (pi, page) in obj.pages.iter().enumerate() {
            writeln!(w, "  Page {} (fixup page {}):", pi + 1, page.fixup_page_index)?;
            for f in &page.fixups {
                dump_fixup(w, "    ", f)?;
            }
        }
    }
    Ok(())
}
