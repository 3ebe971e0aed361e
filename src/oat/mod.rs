//! The OAT container codec.
//!
//! Version-aware parsing and building of the ahead-of-time container
//! format, with bit-exact layout. Each recognized version gets its own
//! parser (the versions differ at multiple offsets); the common header is
//! always inspectable, even for unknown versions. A reduced
//! "dex files only" mode reads the headers and listing and stops.
//!
//! Format essentials: magic `oat\n` at offset 0 of the payload, versions as
//! ASCII digits + NUL, little-endian throughout, dex blobs 4-byte aligned,
//! and an Adler-32 checksum over every byte after the common header written
//! by seeking back once the payload is complete. A checksum mismatch on
//! parse is only a warning: the original producer's checksum scheme cannot
//! be replicated and no consumer verifies it.

mod checksum;
mod classes;
pub mod elf;
mod header;
mod listing;
pub mod lookup;
mod writer;

pub use checksum::{adler32, Adler32};
pub use classes::{ClassInfo, ClassStatus, DexClasses, OatClassType, OatClasses079};
pub use header::{InstructionSet, KeyValueStore, OatHeader, OatHeaderCommon, OAT_MAGIC};
pub use listing::{DexFileHeader, DexListing064Entry, DexListing079Entry, DEX_MAGIC};
pub use lookup::{num_entries, LookupTable, LookupTableEntry};
pub use writer::{build, read_art_image_info, BuildConfig, DexInput, ImageInfo064};

use std::io::Write;

use strum::{Display, EnumIter, EnumString};

use crate::file::Parser;
use crate::{Error, Result};

/// The container format versions this codec understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter)]
pub enum OatVersion {
    /// Version 045: three extra portable-trampoline header words.
    #[strum(serialize = "045")]
    V045,
    /// Version 064: inline class-offset listing.
    #[strum(serialize = "064")]
    V064,
    /// Version 079: pointer-indirect class tables and lookup tables.
    #[strum(serialize = "079")]
    V079,
    /// Version 088: identical to 079 as far as verify-none output goes.
    #[strum(serialize = "088")]
    V088,
}

impl OatVersion {
    /// The on-disk version word: ASCII digits followed by NUL.
    #[must_use]
    pub fn version_word(self) -> u32 {
        let bytes = match self {
            OatVersion::V045 => *b"045\0",
            OatVersion::V064 => *b"064\0",
            OatVersion::V079 => *b"079\0",
            OatVersion::V088 => *b"088\0",
        };
        u32::from_le_bytes(bytes)
    }

    /// Decodes a version word.
    #[must_use]
    pub fn from_version_word(word: u32) -> Option<OatVersion> {
        [
            OatVersion::V045,
            OatVersion::V064,
            OatVersion::V079,
            OatVersion::V088,
        ]
        .into_iter()
        .find(|v| v.version_word() == word)
    }
}

/// Outcome of a parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// The container parsed.
    Success,
    /// The version word is not one this codec knows; the common header is
    /// still available.
    UnknownVersion,
    /// The payload does not start with the `oat\n` magic.
    BadMagicNumber,
}

/// Summary of one embedded dex file.
#[derive(Debug, Clone)]
pub struct OatDexFile {
    /// Location string from the listing.
    pub location: String,
    /// Checksum from the listing.
    pub location_checksum: u32,
    /// Offset of the raw blob within the payload.
    pub file_offset: u32,
    /// Size from the embedded dex header.
    pub file_size: u32,
}

/// A parsed V045/V064 container.
#[derive(Debug)]
pub struct OatFile064 {
    /// The header.
    pub header: OatHeader,
    /// The key-value store.
    pub key_value_store: KeyValueStore,
    /// The listing, including inline class data.
    pub dex_files: Vec<DexListing064Entry>,
    /// The embedded dex headers, in listing order.
    pub dex_headers: Vec<DexFileHeader>,
}

/// A parsed V079/V088 container.
#[derive(Debug)]
pub struct OatFile079 {
    /// The header.
    pub header: OatHeader,
    /// The key-value store.
    pub key_value_store: KeyValueStore,
    /// The listing.
    pub dex_files: Vec<DexListing079Entry>,
    /// The embedded dex headers, in listing order.
    pub dex_headers: Vec<DexFileHeader>,
    /// Type lookup tables; absent in dex-files-only mode.
    pub lookup_tables: Option<Vec<LookupTable>>,
    /// Class tables; absent in dex-files-only mode.
    pub classes: Option<OatClasses079>,
}

/// A parsed OAT container of any recognized shape.
#[derive(Debug)]
pub enum OatFile {
    /// Version 045 or 064.
    V064(OatFile064),
    /// Version 079 or 088.
    V079(OatFile079),
    /// Recognized magic, unrecognized version.
    Unknown(OatHeaderCommon),
    /// Wrong magic; nothing beyond the common header was read.
    BadMagic(OatHeaderCommon),
}

/// What [`OatFile::dump`] prints.
#[derive(Debug, Clone, Copy, Default)]
pub struct DumpOptions {
    /// Include per-class status tables.
    pub dump_classes: bool,
    /// Include type lookup tables.
    pub dump_tables: bool,
    /// List classes whose status is below verified.
    pub print_unverified_classes: bool,
}

impl OatFile {
    /// Parses a container, transparently unwrapping an ELF shell (the
    /// payload then sits at the `.rodata` offset, 0x1000 in every file in
    /// the wild, and all internal pointers are relative to it).
    ///
    /// # Errors
    /// [`Error::Empty`] on empty input, [`Error::OutOfBounds`] on
    /// truncation. A wrong magic or unknown version is a parse *outcome*,
    /// not an error: see [`OatFile::status`].
    pub fn parse(buf: &[u8]) -> Result<OatFile> {
        Self::parse_impl(buf, false)
    }

    /// Reduced mode: headers and listing only.
    ///
    /// # Errors
    /// As for [`OatFile::parse`].
    pub fn parse_dex_files_only(buf: &[u8]) -> Result<OatFile> {
        Self::parse_impl(buf, true)
    }

    fn parse_impl(buf: &[u8], dex_files_only: bool) -> Result<OatFile> {
        if buf.is_empty() {
            return Err(Error::Empty);
        }
        let payload = match elf::payload_offset(buf) {
            Some(offset) => buf.get(offset..).ok_or(Error::OutOfBounds)?,
            None => buf,
        };

        // The magic gate comes first; a bad magic means nothing further is
        // read.
        let mut parser = Parser::new(payload);
        let magic = parser.read_u32()?;
        if magic != OAT_MAGIC {
            return Ok(OatFile::BadMagic(OatHeaderCommon {
                magic,
                version: 0,
                adler32_checksum: 0,
            }));
        }
        let version_word = parser.read_u32()?;
        let declared_checksum = parser.read_u32()?;
        let common = OatHeaderCommon {
            magic,
            version: version_word,
            adler32_checksum: declared_checksum,
        };

        let Some(version) = OatVersion::from_version_word(version_word) else {
            return Ok(OatFile::Unknown(common));
        };

        let mut parser = Parser::new(payload);
        let header = OatHeader::parse(&mut parser)?;

        // The checksum scheme of the original producer is not reproducible,
        // and no consumer verifies it; mismatches are reported, not fatal.
        let end = (header.executable_offset as usize)
            .clamp(OatHeaderCommon::SIZE, payload.len());
        let computed = adler32(&payload[OatHeaderCommon::SIZE..end]);
        if computed != declared_checksum {
            log::warn!(
                "oat checksum mismatch: stored 0x{declared_checksum:08x}, computed 0x{computed:08x}"
            );
        }

        let key_value_store =
            KeyValueStore::parse(&mut parser, header.key_value_store_size as usize)?;

        match version {
            OatVersion::V079 | OatVersion::V088 => {
                let mut dex_files =
                    DexListing079Entry::parse(&mut parser, header.dex_file_count)?;
                let mut dex_headers = Vec::with_capacity(dex_files.len());
                for entry in &mut dex_files {
                    let dex_header = DexFileHeader::parse(
                        payload
                            .get(entry.file_offset as usize..)
                            .ok_or(Error::OutOfBounds)?,
                    )?;
                    entry.num_classes = dex_header.class_defs_size;
                    dex_headers.push(dex_header);
                }
                let (lookup_tables, classes) = if dex_files_only {
                    (None, None)
                } else {
                    let mut tables = Vec::with_capacity(dex_files.len());
                    for (entry, dex_header) in dex_files.iter().zip(&dex_headers) {
                        tables.push(LookupTable::parse(
                            payload,
                            entry.lookup_table_offset as usize,
                            num_entries(dex_header.class_defs_size),
                            entry.file_offset,
                            entry.location.clone(),
                        )?);
                    }
                    let classes = OatClasses079::parse(&dex_files, &dex_headers, payload)?;
                    (Some(tables), Some(classes))
                };
                Ok(OatFile::V079(OatFile079 {
                    header,
                    key_value_store,
                    dex_files,
                    dex_headers,
                    lookup_tables,
                    classes,
                }))
            }
            OatVersion::V045 | OatVersion::V064 => {
                let dex_files = DexListing064Entry::parse(
                    &mut parser,
                    header.dex_file_count,
                    payload,
                    dex_files_only,
                )?;
                let mut dex_headers = Vec::with_capacity(dex_files.len());
                for entry in &dex_files {
                    dex_headers.push(DexFileHeader::parse(
                        payload
                            .get(entry.file_offset as usize..)
                            .ok_or(Error::OutOfBounds)?,
                    )?);
                }
                Ok(OatFile::V064(OatFile064 {
                    header,
                    key_value_store,
                    dex_files,
                    dex_headers,
                }))
            }
        }
    }

    /// The parse outcome.
    #[must_use]
    pub fn status(&self) -> ParseStatus {
        match self {
            OatFile::V064(_) | OatFile::V079(_) => ParseStatus::Success,
            OatFile::Unknown(_) => ParseStatus::UnknownVersion,
            OatFile::BadMagic(_) => ParseStatus::BadMagicNumber,
        }
    }

    /// Converts a non-success status into the matching error.
    ///
    /// # Errors
    /// [`Error::BadMagic`] / [`Error::UnknownVersion`] for the failed
    /// shapes.
    pub fn expect_success(&self) -> Result<&Self> {
        match self {
            OatFile::BadMagic(_) => Err(Error::BadMagic),
            OatFile::Unknown(common) => Err(Error::UnknownVersion(common.version)),
            _ => Ok(self),
        }
    }

    /// The common header, available for every shape.
    #[must_use]
    pub fn common_header(&self) -> OatHeaderCommon {
        match self {
            OatFile::V064(f) => f.header.common,
            OatFile::V079(f) => f.header.common,
            OatFile::Unknown(common) | OatFile::BadMagic(common) => *common,
        }
    }

    /// Summaries of the embedded dex files.
    #[must_use]
    pub fn get_oat_dexfiles(&self) -> Vec<OatDexFile> {
        match self {
            OatFile::V064(f) => f
                .dex_files
                .iter()
                .zip(&f.dex_headers)
                .map(|(entry, header)| OatDexFile {
                    location: entry.location.clone(),
                    location_checksum: entry.location_checksum,
                    file_offset: entry.file_offset,
                    file_size: header.file_size,
                })
                .collect(),
            OatFile::V079(f) => f
                .dex_files
                .iter()
                .zip(&f.dex_headers)
                .map(|(entry, header)| OatDexFile {
                    location: entry.location.clone(),
                    location_checksum: entry.location_checksum,
                    file_offset: entry.file_offset,
                    file_size: header.file_size,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Prints a human-readable summary, like the dump mode of the OAT tool.
    ///
    /// # Errors
    /// I/O errors from the sink.
    pub fn dump(&self, w: &mut impl Write, opts: &DumpOptions) -> Result<()> {
        match self {
            OatFile::BadMagic(common) => {
                writeln!(w, "Bad magic number:")?;
                dump_common(w, common)?;
            }
            OatFile::Unknown(common) => {
                writeln!(w, "Unknown OAT file version!")?;
                dump_common(w, common)?;
            }
            OatFile::V064(f) => {
                writeln!(w, "Header:")?;
                dump_header(w, &f.header)?;
                writeln!(w, "Key/Value store:")?;
                write!(w, "{}", f.key_value_store)?;
                writeln!(w, "Dex File Listing:")?;
                for entry in &f.dex_files {
                    writeln!(w, "  {{")?;
                    writeln!(w, "    location: {}", entry.location)?;
                    writeln!(w, "    location_checksum: 0x{:08x}", entry.location_checksum)?;
                    writeln!(w, "    file_offset: 0x{:08x}", entry.file_offset)?;
                    writeln!(w, "  }}")?;
                }
                dump_dex_headers(w, &f.dex_headers)?;
                if opts.dump_classes {
                    writeln!(w, "Classes:")?;
                    for entry in &f.dex_files {
                        dump_class_codes(w, &entry.location, &entry.class_info)?;
                    }
                }
                if opts.print_unverified_classes {
                    writeln!(w, "unverified classes:")?;
                    for entry in &f.dex_files {
                        writeln!(w, "  {}", entry.location)?;
                        for (info, name) in entry.class_info.iter().zip(&entry.class_names) {
                            if info.status < ClassStatus::Verified as i16 {
                                writeln!(w, "    {name} unverified (status: {})", info.status)?;
                            }
                        }
                    }
                }
            }
            OatFile::V079(f) => {
                writeln!(w, "Header:")?;
                dump_header(w, &f.header)?;
                writeln!(w, "Key/Value store:")?;
                write!(w, "{}", f.key_value_store)?;
                writeln!(w, "Dex File Listing:")?;
                for entry in &f.dex_files {
                    writeln!(w, "  {{")?;
                    writeln!(w, "    location: {}", entry.location)?;
                    writeln!(w, "    location_checksum: 0x{:08x}", entry.location_checksum)?;
                    writeln!(w, "    file_offset: 0x{:08x}", entry.file_offset)?;
                    writeln!(w, "    classes_offset: 0x{:08x}", entry.classes_offset)?;
                    writeln!(
                        w,
                        "    lookup_table_offset: 0x{:08x}",
                        entry.lookup_table_offset
                    )?;
                    writeln!(w, "  }}")?;
                }
                dump_dex_headers(w, &f.dex_headers)?;
                if opts.dump_tables {
                    writeln!(w, "LookupTables:")?;
                    for table in f.lookup_tables.iter().flatten() {
                        writeln!(w, "  {{ Type lookup table {}", table.dex_file)?;
                        writeln!(w, "    num_entries: {}", table.entries.len())?;
                        writeln!(w, "  }}")?;
                    }
                }
                if opts.dump_classes {
                    if let Some(classes) = &f.classes {
                        writeln!(w, "Classes:")?;
                        for dex_classes in &classes.classes {
                            dump_class_codes(w, &dex_classes.dex_file, &dex_classes.class_info)?;
                        }
                    }
                }
                if opts.print_unverified_classes {
                    if let Some(classes) = &f.classes {
                        writeln!(w, "unverified classes:")?;
                        for dex_classes in &classes.classes {
                            writeln!(w, "  {}", dex_classes.dex_file)?;
                            for name in dex_classes.unverified_classes() {
                                writeln!(w, "    {name} unverified")?;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn dump_common(w: &mut impl Write, common: &OatHeaderCommon) -> Result<()> {
    writeln!(w, "  magic:   0x{:08x}", common.magic)?;
    writeln!(w, "  version: 0x{:08x}", common.version)?;
    writeln!(w, "  checksum: 0x{:08x}", common.adler32_checksum)?;
    Ok(())
}

fn dump_header(w: &mut impl Write, header: &OatHeader) -> Result<()> {
    dump_common(w, &header.common)?;
    writeln!(w, "  isa: {}", header.instruction_set)?;
    writeln!(
        w,
        "  isa features bitmap: 0x{:08x}",
        header.instruction_set_features_bitmap
    )?;
    writeln!(w, "  dex_file_count: 0x{:08x}", header.dex_file_count)?;
    writeln!(w, "  executable_offset: 0x{:08x}", header.executable_offset)?;
    writeln!(
        w,
        "  key_value_store_size: 0x{:08x}",
        header.key_value_store_size
    )?;
    Ok(())
}

fn dump_dex_headers(w: &mut impl Write, headers: &[DexFileHeader]) -> Result<()> {
    writeln!(w, "Dex Files:")?;
    for header in headers {
        writeln!(w, "  {{ DexFile")?;
        writeln!(w, "    file_size: 0x{:08x}", header.file_size)?;
        writeln!(w, "    num_classes: 0x{:08x}", header.class_defs_size)?;
        writeln!(w, "  }}")?;
    }
    Ok(())
}

fn dump_class_codes(w: &mut impl Write, location: &str, infos: &[ClassInfo]) -> Result<()> {
    writeln!(w, "  {{ Classes for dex {location}")?;
    let mut line = String::from("    ");
    for (count, info) in infos.iter().enumerate() {
        let status = ClassStatus::from_raw(info.status).map_or('?', ClassStatus::short_code);
        let type_ = OatClassType::from_raw(info.type_).map_or('?', OatClassType::short_code);
        line.push(status);
        line.push(type_);
        line.push(' ');
        if (count + 1) % 32 == 0 {
            writeln!(w, "{line}")?;
            line = String::from("    ");
        }
    }
    if line.trim().is_empty() {
        writeln!(w, "  }}")?;
    } else {
        writeln!(w, "{line}")?;
        writeln!(w, "  }}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_words() {
        assert_eq!(OatVersion::V079.version_word(), 0x0039_3730);
        assert_eq!(
            OatVersion::V079.version_word().to_le_bytes(),
            [0x30, 0x37, 0x39, 0x00]
        );
        assert_eq!(OatVersion::from_version_word(0x0039_3730), Some(OatVersion::V079));
        assert_eq!(OatVersion::from_version_word(0xdeadbeef), None);
        use std::str::FromStr;
        assert_eq!(OatVersion::from_str("045").unwrap(), OatVersion::V045);
        assert_eq!(OatVersion::from_str("088").unwrap(), OatVersion::V088);
        assert!(OatVersion::from_str("123").is_err());
    }

    #[test]
    fn test_magic_is_oat_newline() {
        assert_eq!(OAT_MAGIC.to_le_bytes(), *b"oat\n");
    }

    #[test]
    fn test_bad_magic_short_circuits() {
        let buf = [0xDE, 0xAD, 0xBE, 0xEF];
        let parsed = OatFile::parse(&buf).unwrap();
        assert_eq!(parsed.status(), ParseStatus::BadMagicNumber);
        assert!(matches!(
            parsed.expect_success(),
            Err(Error::BadMagic)
        ));
        assert_eq!(parsed.common_header().magic, 0xEFBE_ADDE);
        assert!(parsed.get_oat_dexfiles().is_empty());
    }

    #[test]
    fn test_unknown_version_keeps_common_header() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&OAT_MAGIC.to_le_bytes());
        buf.extend_from_slice(b"999\0");
        buf.extend_from_slice(&0x1234_5678u32.to_le_bytes());
        let parsed = OatFile::parse(&buf).unwrap();
        assert_eq!(parsed.status(), ParseStatus::UnknownVersion);
        let common = parsed.common_header();
        assert_eq!(common.adler32_checksum, 0x1234_5678);
        assert!(matches!(
            parsed.expect_success(),
            Err(Error::UnknownVersion(_))
        ));
    }

    #[test]
    fn test_empty_input() {
        assert!(matches!(OatFile::parse(&[]), Err(Error::Empty)));
    }
}
