//! Embedded dex headers and the per-dex listing.
//!
//! The listing sits right after the key-value store;
//! `OatHeader::dex_file_count` says how many entries follow. V079/V088
//! entries carry the class-table and lookup-table offsets; V045/V064
//! entries instead inline one class-info offset per class def.

use std::io::Write;

use crate::error::malformed_error;
use crate::file::Parser;
use crate::oat::classes::{ClassInfo, OatClassType};
use crate::Result;

/// The `dex\n035\0`-style magic of an embedded dex file.
pub const DEX_MAGIC: u32 = 0x0A78_6564;

/// The fixed 112-byte header of an embedded dex file. Only the fields the
/// OAT codec needs are interpreted; the dex payload itself stays opaque.
#[derive(Debug, Clone, Default)]
pub struct DexFileHeader {
    /// `dex\n`.
    pub magic: u32,
    /// Format version digits.
    pub version: u32,
    /// Adler-32 of the dex contents.
    pub checksum: u32,
    /// SHA-1 of the dex contents.
    pub signature: [u8; 20],
    /// Total file size.
    pub file_size: u32,
    /// Header size (0x70).
    pub header_size: u32,
    /// Endianness tag.
    pub endian_tag: u32,
    /// Link section size.
    pub link_size: u32,
    /// Link section offset.
    pub link_off: u32,
    /// Map list offset.
    pub map_off: u32,
    /// Number of string ids.
    pub string_ids_size: u32,
    /// String-id array offset.
    pub string_ids_off: u32,
    /// Number of type ids.
    pub type_ids_size: u32,
    /// Type-id array offset.
    pub type_ids_off: u32,
    /// Number of proto ids.
    pub proto_ids_size: u32,
    /// Proto-id array offset.
    pub proto_ids_off: u32,
    /// Number of field ids.
    pub field_ids_size: u32,
    /// Field-id array offset.
    pub field_ids_off: u32,
    /// Number of method ids.
    pub method_ids_size: u32,
    /// Method-id array offset.
    pub method_ids_off: u32,
    /// Number of class defs.
    pub class_defs_size: u32,
    /// Class-def array offset.
    pub class_defs_off: u32,
    /// Data section size.
    pub data_size: u32,
    /// Data section offset.
    pub data_off: u32,
}

impl DexFileHeader {
    /// Encoded size.
    pub const SIZE: usize = 112;

    /// Reads the header from the start of a dex blob.
    ///
    /// # Errors
    /// `OutOfBounds` on truncated input; `Malformed` on a magic mismatch.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut parser = Parser::new(data);
        let magic = parser.read_u32()?;
        if magic != DEX_MAGIC {
            return Err(malformed_error!("bad dex magic 0x{magic:08x}"));
        }
        let version = parser.read_u32()?;
        let checksum = parser.read_u32()?;
        let mut signature = [0u8; 20];
        signature.copy_from_slice(parser.read_bytes(20)?);
        Ok(DexFileHeader {
            magic,
            version,
            checksum,
            signature,
            file_size: parser.read_u32()?,
            header_size: parser.read_u32()?,
            endian_tag: parser.read_u32()?,
            link_size: parser.read_u32()?,
            link_off: parser.read_u32()?,
            map_off: parser.read_u32()?,
            string_ids_size: parser.read_u32()?,
            string_ids_off: parser.read_u32()?,
            type_ids_size: parser.read_u32()?,
            type_ids_off: parser.read_u32()?,
            proto_ids_size: parser.read_u32()?,
            proto_ids_off: parser.read_u32()?,
            field_ids_size: parser.read_u32()?,
            field_ids_off: parser.read_u32()?,
            method_ids_size: parser.read_u32()?,
            method_ids_off: parser.read_u32()?,
            class_defs_size: parser.read_u32()?,
            class_defs_off: parser.read_u32()?,
            data_size: parser.read_u32()?,
            data_off: parser.read_u32()?,
        })
    }
}

/// Reads the descriptor string of every class def in an embedded dex:
/// class def → type id → string id → MUTF-8 data.
pub fn read_class_names(
    oat_buf: &[u8],
    dex_offset: usize,
    header: &DexFileHeader,
) -> Result<Vec<String>> {
    let dex_buf = oat_buf
        .get(dex_offset..)
        .ok_or(crate::Error::OutOfBounds)?;
    let mut names = Vec::with_capacity(header.class_defs_size as usize);
    for i in 0..header.class_defs_size {
        // class_def_item is 32 bytes; class_idx is its first u16.
        let mut p = Parser::new(dex_buf);
        p.seek(header.class_defs_off as usize + (i as usize) * 32)?;
        let class_idx = p.read_u16()?;
        if u32::from(class_idx) >= header.type_ids_size {
            return Err(malformed_error!("class_idx {class_idx} out of range"));
        }
        p.seek(header.type_ids_off as usize + usize::from(class_idx) * 4)?;
        let string_id = p.read_u32()?;
        if string_id >= header.string_ids_size {
            return Err(malformed_error!("type string id {string_id} out of range"));
        }
        p.seek(header.string_ids_off as usize + string_id as usize * 4)?;
        let string_offset = p.read_u32()?;
        p.seek(string_offset as usize)?;
        let utf16_len = p.read_uleb128()?;
        let _ = utf16_len;
        let bytes = p.read_cstr(4096)?;
        names.push(String::from_utf8_lossy(&bytes).into_owned());
    }
    Ok(names)
}

/// A V079/V088 listing entry.
#[derive(Debug, Clone)]
pub struct DexListing079Entry {
    /// Dex location string (not NUL-terminated on disk).
    pub location: String,
    /// Checksum copied from the dex header.
    pub location_checksum: u32,
    /// Offset of the raw dex blob, relative to the OAT payload.
    pub file_offset: u32,
    /// Number of class defs in the dex.
    pub num_classes: u32,
    /// Offset of this dex's class table.
    pub classes_offset: u32,
    /// Offset of this dex's type lookup table.
    pub lookup_table_offset: u32,
}

impl DexListing079Entry {
    /// Reads `count` entries.
    ///
    /// # Errors
    /// `OutOfBounds` on truncated input.
    pub fn parse(parser: &mut Parser<'_>, count: u32) -> Result<Vec<Self>> {
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let location_len = parser.read_u32()? as usize;
            let location = String::from_utf8_lossy(parser.read_bytes(location_len)?).into_owned();
            entries.push(DexListing079Entry {
                location,
                location_checksum: parser.read_u32()?,
                file_offset: parser.read_u32()?,
                num_classes: 0,
                classes_offset: parser.read_u32()?,
                lookup_table_offset: parser.read_u32()?,
            });
        }
        Ok(entries)
    }

    /// Encoded size of a listing over the given locations.
    #[must_use]
    pub fn compute_size(locations: &[&str]) -> u32 {
        locations
            .iter()
            .map(|loc| loc.len() as u32 + 5 * 4)
            .sum()
    }

    /// Writes the entries.
    ///
    /// # Errors
    /// I/O errors from the sink.
    pub fn write(entries: &[Self], sink: &mut impl Write) -> Result<()> {
        for entry in entries {
            sink.write_all(&(entry.location.len() as u32).to_le_bytes())?;
            // Locations are *not* NUL-terminated.
            sink.write_all(entry.location.as_bytes())?;
            sink.write_all(&entry.location_checksum.to_le_bytes())?;
            sink.write_all(&entry.file_offset.to_le_bytes())?;
            sink.write_all(&entry.classes_offset.to_le_bytes())?;
            sink.write_all(&entry.lookup_table_offset.to_le_bytes())?;
        }
        Ok(())
    }
}

/// A V045/V064 listing entry; the class-info offsets live inline.
#[derive(Debug, Clone)]
pub struct DexListing064Entry {
    /// Dex location string.
    pub location: String,
    /// Checksum copied from the dex header.
    pub location_checksum: u32,
    /// Offset of the raw dex blob, relative to the OAT payload.
    pub file_offset: u32,
    /// One offset per class def, each pointing at a `ClassInfo`.
    pub class_offsets: Vec<u32>,
    /// The class records, resolved through `class_offsets`.
    pub class_info: Vec<ClassInfo>,
    /// Class descriptor per class def.
    pub class_names: Vec<String>,
}

impl DexListing064Entry {
    /// Reads `count` entries. In `dex_files_only` mode the class-info
    /// offsets are consumed but not resolved.
    ///
    /// # Errors
    /// `OutOfBounds` on truncated input; `Malformed` on broken offsets.
    pub fn parse(
        parser: &mut Parser<'_>,
        count: u32,
        oat_buf: &[u8],
        dex_files_only: bool,
    ) -> Result<Vec<Self>> {
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let location_len = parser.read_u32()? as usize;
            let location = String::from_utf8_lossy(parser.read_bytes(location_len)?).into_owned();
            let location_checksum = parser.read_u32()?;
            let file_offset = parser.read_u32()?;

            let header = DexFileHeader::parse(
                oat_buf
                    .get(file_offset as usize..)
                    .ok_or(crate::Error::OutOfBounds)?,
            )?;
            let num_classes = header.class_defs_size;

            let mut class_offsets = Vec::with_capacity(num_classes as usize);
            let mut class_info = Vec::new();
            let mut class_names = Vec::new();
            if dex_files_only {
                for _ in 0..num_classes {
                    class_offsets.push(parser.read_u32()?);
                }
            } else {
                class_names = read_class_names(oat_buf, file_offset as usize, &header)?;
                for _ in 0..num_classes {
                    let class_info_offset = parser.read_u32()?;
                    class_offsets.push(class_info_offset);
                    let mut info_parser = Parser::new(oat_buf);
                    info_parser.seek(class_info_offset as usize)?;
                    let info = ClassInfo::parse(&mut info_parser)?;
                    if info.type_ == OatClassType::SomeCompiled as u16 {
                        // A bitmap sized in a leading word, then one method
                        // pointer per set bit; skipped, not modelled.
                        let bitmap_size = info_parser.read_u32()? as usize;
                        let bitmap = info_parser.read_bytes(bitmap_size)?;
                        let method_count: u32 =
                            bitmap.iter().map(|b| b.count_ones()).sum();
                        info_parser.advance_by(method_count as usize * 4)?;
                    }
                    class_info.push(info);
                }
            }

            entries.push(DexListing064Entry {
                location,
                location_checksum,
                file_offset,
                class_offsets,
                class_info,
                class_names,
            });
        }
        Ok(entries)
    }

    /// Encoded size of a listing over the given (location, class count)
    /// pairs.
    #[must_use]
    pub fn compute_size(inputs: &[(&str, u32)]) -> u32 {
        inputs
            .iter()
            .map(|(loc, num_classes)| loc.len() as u32 + 3 * 4 + num_classes * 4)
            .sum()
    }

    /// Writes the entries, including the inline class-offset arrays.
    ///
    /// # Errors
    /// I/O errors from the sink.
    pub fn write(entries: &[Self], sink: &mut impl Write) -> Result<()> {
        for entry in entries {
            sink.write_all(&(entry.location.len() as u32).to_le_bytes())?;
            // Locations are *not* NUL-terminated.
            sink.write_all(entry.location.as_bytes())?;
            sink.write_all(&entry.location_checksum.to_le_bytes())?;
            sink.write_all(&entry.file_offset.to_le_bytes())?;
            for offset in &entry.class_offsets {
                sink.write_all(&offset.to_le_bytes())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listing_079_round_trip() {
        let entries = vec![
            DexListing079Entry {
                location: "classes.dex".into(),
                location_checksum: 0x1234,
                file_offset: 0x100,
                num_classes: 2,
                classes_offset: 0x300,
                lookup_table_offset: 0x400,
            },
            DexListing079Entry {
                location: "classes2.dex".into(),
                location_checksum: 0x5678,
                file_offset: 0x200,
                num_classes: 3,
                classes_offset: 0x340,
                lookup_table_offset: 0x500,
            },
        ];
        let mut buf = Vec::new();
        DexListing079Entry::write(&entries, &mut buf).unwrap();
        assert_eq!(
            buf.len() as u32,
            DexListing079Entry::compute_size(&["classes.dex", "classes2.dex"])
        );
        let mut parser = Parser::new(&buf);
        let parsed = DexListing079Entry::parse(&mut parser, 2).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].location, "classes.dex");
        assert_eq!(parsed[1].file_offset, 0x200);
        assert_eq!(parsed[1].lookup_table_offset, 0x500);
    }
}
