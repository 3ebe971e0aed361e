//! OAT headers and the key-value store.

use std::fmt;
use std::io::Write;

use strum::{Display, EnumIter, EnumString};

use crate::error::malformed_error;
use crate::file::Parser;
use crate::oat::OatVersion;
use crate::Result;

/// The `oat\n` magic, little-endian.
pub const OAT_MAGIC: u32 = 0x0A74_616F;

/// Target instruction set recorded in the header.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter, Default,
)]
#[strum(serialize_all = "snake_case")]
pub enum InstructionSet {
    /// No architecture recorded.
    #[default]
    None = 0,
    /// 32-bit ARM.
    Arm = 1,
    /// 64-bit ARM.
    Arm64 = 2,
    /// Thumb-2.
    Thumb2 = 3,
    /// 32-bit x86.
    X86 = 4,
    /// 64-bit x86.
    #[strum(serialize = "x86_64")]
    X86_64 = 5,
    /// 32-bit MIPS.
    Mips = 6,
    /// 64-bit MIPS.
    Mips64 = 7,
}

impl InstructionSet {
    fn from_u32(value: u32) -> InstructionSet {
        match value {
            1 => InstructionSet::Arm,
            2 => InstructionSet::Arm64,
            3 => InstructionSet::Thumb2,
            4 => InstructionSet::X86,
            5 => InstructionSet::X86_64,
            6 => InstructionSet::Mips,
            7 => InstructionSet::Mips64,
            _ => InstructionSet::None,
        }
    }
}

/// The version-independent first three words of every OAT file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OatHeaderCommon {
    /// `oat\n`.
    pub magic: u32,
    /// ASCII digits + NUL, e.g. `"079\0"`.
    pub version: u32,
    /// Adler-32 of everything after this common header.
    pub adler32_checksum: u32,
}

impl OatHeaderCommon {
    /// Byte size of the common header.
    pub const SIZE: usize = 12;

    /// Reads the common header.
    ///
    /// # Errors
    /// [`Error::OutOfBounds`] on truncated input.
    pub fn parse(parser: &mut Parser<'_>) -> Result<Self> {
        Ok(OatHeaderCommon {
            magic: parser.read_u32()?,
            version: parser.read_u32()?,
            adler32_checksum: parser.read_u32()?,
        })
    }

    /// Writes the common header.
    ///
    /// # Errors
    /// I/O errors from the sink.
    pub fn write(&self, sink: &mut impl Write) -> Result<()> {
        sink.write_all(&self.magic.to_le_bytes())?;
        sink.write_all(&self.version.to_le_bytes())?;
        sink.write_all(&self.adler32_checksum.to_le_bytes())?;
        Ok(())
    }
}

/// The full version-specific OAT header.
///
/// V045 carries three portable-trampoline words dropped in every later
/// version; all other fields are shared.
#[derive(Debug, Clone, Default)]
pub struct OatHeader {
    /// The common prefix.
    pub common: OatHeaderCommon,
    /// Target architecture.
    pub instruction_set: InstructionSet,
    /// Architecture feature bitmap.
    pub instruction_set_features_bitmap: u32,
    /// Number of embedded dex files.
    pub dex_file_count: u32,
    /// Offset of the executable section (the total OAT size for
    /// verify-none output).
    pub executable_offset: u32,
    /// Trampoline offset.
    pub interpreter_to_interpreter_bridge_offset: u32,
    /// Trampoline offset.
    pub interpreter_to_compiled_code_bridge_offset: u32,
    /// Trampoline offset.
    pub jni_dlsym_lookup_offset: u32,
    /// V045 only.
    pub portable_imt_conflict_trampoline_offset: u32,
    /// V045 only.
    pub portable_resolution_trampoline_offset: u32,
    /// V045 only.
    pub portable_to_interpreter_bridge_offset: u32,
    /// Trampoline offset.
    pub quick_generic_jni_trampoline_offset: u32,
    /// Trampoline offset.
    pub quick_imt_conflict_trampoline_offset: u32,
    /// Trampoline offset.
    pub quick_resolution_trampoline_offset: u32,
    /// Trampoline offset.
    pub quick_to_interpreter_bridge_offset: u32,
    /// Boot-image patch delta.
    pub image_patch_delta: i32,
    /// Checksum of the boot image's OAT.
    pub image_file_location_oat_checksum: u32,
    /// Data-begin address of the boot image's OAT.
    pub image_file_location_oat_data_begin: u32,
    /// Byte size of the trailing key-value store.
    pub key_value_store_size: u32,
}

impl OatHeader {
    /// Byte size of the header for `version`.
    #[must_use]
    pub fn size(version: OatVersion) -> usize {
        if version == OatVersion::V045 {
            21 * 4
        } else {
            18 * 4
        }
    }

    /// Reads the version-specific header. The version is taken from the
    /// common prefix.
    ///
    /// # Errors
    /// [`Error::OutOfBounds`] on truncated input; `Malformed` on a magic
    /// mismatch.
    pub fn parse(parser: &mut Parser<'_>) -> Result<Self> {
        let common = OatHeaderCommon::parse(parser)?;
        if common.magic != OAT_MAGIC {
            return Err(malformed_error!(
                "bad magic 0x{:08x} in oat header",
                common.magic
            ));
        }
        let mut header = OatHeader {
            common,
            ..OatHeader::default()
        };
        header.instruction_set = InstructionSet::from_u32(parser.read_u32()?);
        header.instruction_set_features_bitmap = parser.read_u32()?;
        header.dex_file_count = parser.read_u32()?;
        header.executable_offset = parser.read_u32()?;
        header.interpreter_to_interpreter_bridge_offset = parser.read_u32()?;
        header.interpreter_to_compiled_code_bridge_offset = parser.read_u32()?;
        header.jni_dlsym_lookup_offset = parser.read_u32()?;

        // Not present in version 064 and up.
        if header.common.version == OatVersion::V045.version_word() {
            header.portable_imt_conflict_trampoline_offset = parser.read_u32()?;
            header.portable_resolution_trampoline_offset = parser.read_u32()?;
            header.portable_to_interpreter_bridge_offset = parser.read_u32()?;
        }

        header.quick_generic_jni_trampoline_offset = parser.read_u32()?;
        header.quick_imt_conflict_trampoline_offset = parser.read_u32()?;
        header.quick_resolution_trampoline_offset = parser.read_u32()?;
        header.quick_to_interpreter_bridge_offset = parser.read_u32()?;
        header.image_patch_delta = parser.read_i32()?;
        header.image_file_location_oat_checksum = parser.read_u32()?;
        header.image_file_location_oat_data_begin = parser.read_u32()?;
        header.key_value_store_size = parser.read_u32()?;
        Ok(header)
    }

    /// Writes the version-specific header.
    ///
    /// # Errors
    /// I/O errors from the sink.
    pub fn write(&self, sink: &mut impl Write) -> Result<()> {
        self.common.write(sink)?;
        let words = [
            self.instruction_set as u32,
            self.instruction_set_features_bitmap,
            self.dex_file_count,
            self.executable_offset,
            self.interpreter_to_interpreter_bridge_offset,
            self.interpreter_to_compiled_code_bridge_offset,
            self.jni_dlsym_lookup_offset,
        ];
        for w in words {
            sink.write_all(&w.to_le_bytes())?;
        }
        if self.common.version == OatVersion::V045.version_word() {
            for w in [
                self.portable_imt_conflict_trampoline_offset,
                self.portable_resolution_trampoline_offset,
                self.portable_to_interpreter_bridge_offset,
            ] {
                sink.write_all(&w.to_le_bytes())?;
            }
        }
        for w in [
            self.quick_generic_jni_trampoline_offset,
            self.quick_imt_conflict_trampoline_offset,
            self.quick_resolution_trampoline_offset,
            self.quick_to_interpreter_bridge_offset,
            self.image_patch_delta as u32,
            self.image_file_location_oat_checksum,
            self.image_file_location_oat_data_begin,
            self.key_value_store_size,
        ] {
            sink.write_all(&w.to_le_bytes())?;
        }
        Ok(())
    }
}

/// The key-value store: NUL-terminated string pairs written in the order
/// given, immediately after the header.
#[derive(Debug, Clone, Default)]
pub struct KeyValueStore {
    pairs: Vec<(Vec<u8>, Vec<u8>)>,
}

impl KeyValueStore {
    /// A store with the given pairs.
    #[must_use]
    pub fn new(pairs: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        KeyValueStore { pairs }
    }

    /// Parses `size` bytes of pairs; a trailing key with no value is
    /// dropped, matching how the C string walk sees it.
    ///
    /// # Errors
    /// [`Error::OutOfBounds`] on truncated input.
    pub fn parse(parser: &mut Parser<'_>, size: usize) -> Result<Self> {
        let end = parser.pos() + size;
        let mut pairs = Vec::new();
        while parser.pos() < end {
            let key = parser.read_cstr(end - parser.pos())?;
            if parser.pos() >= end {
                break;
            }
            let value = parser.read_cstr(end - parser.pos())?;
            pairs.push((key, value));
        }
        parser.seek(end)?;
        Ok(KeyValueStore { pairs })
    }

    /// The pairs, in file order.
    #[must_use]
    pub fn pairs(&self) -> &[(Vec<u8>, Vec<u8>)] {
        &self.pairs
    }

    /// The value for `key`, when present.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    /// Encoded byte size.
    #[must_use]
    pub fn compute_size(&self) -> u32 {
        self.pairs
            .iter()
            .map(|(k, v)| k.len() as u32 + v.len() as u32 + 2)
            .sum()
    }

    /// Writes the pairs in order.
    ///
    /// # Errors
    /// I/O errors from the sink.
    pub fn write(&self, sink: &mut impl Write) -> Result<()> {
        for (key, value) in &self.pairs {
            sink.write_all(key)?;
            sink.write_all(&[0])?;
            sink.write_all(value)?;
            sink.write_all(&[0])?;
        }
        Ok(())
    }
}

impl fmt::Display for KeyValueStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.pairs {
            writeln!(
                f,
                "  {}: {}",
                String::from_utf8_lossy(key),
                String::from_utf8_lossy(value)
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let mut header = OatHeader {
            instruction_set: InstructionSet::X86,
            instruction_set_features_bitmap: 1,
            dex_file_count: 2,
            executable_offset: 0x2000,
            key_value_store_size: 64,
            ..OatHeader::default()
        };
        header.common = OatHeaderCommon {
            magic: OAT_MAGIC,
            version: OatVersion::V079.version_word(),
            adler32_checksum: 0xdead_beef,
        };
        let mut buf = Vec::new();
        header.write(&mut buf).unwrap();
        assert_eq!(buf.len(), OatHeader::size(OatVersion::V079));

        let mut parser = Parser::new(&buf);
        let parsed = OatHeader::parse(&mut parser).unwrap();
        assert_eq!(parsed.common, header.common);
        assert_eq!(parsed.instruction_set, InstructionSet::X86);
        assert_eq!(parsed.dex_file_count, 2);
        assert_eq!(parsed.key_value_store_size, 64);
    }

    #[test]
    fn test_v045_has_portable_trampolines() {
        assert_eq!(
            OatHeader::size(OatVersion::V045) - OatHeader::size(OatVersion::V064),
            12
        );
        let mut header = OatHeader::default();
        header.common.magic = OAT_MAGIC;
        header.common.version = OatVersion::V045.version_word();
        header.portable_resolution_trampoline_offset = 0x42;
        let mut buf = Vec::new();
        header.write(&mut buf).unwrap();
        assert_eq!(buf.len(), OatHeader::size(OatVersion::V045));
        let mut parser = Parser::new(&buf);
        let parsed = OatHeader::parse(&mut parser).unwrap();
        assert_eq!(parsed.portable_resolution_trampoline_offset, 0x42);
    }

    #[test]
    fn test_key_value_store_round_trip() {
        let store = KeyValueStore::new(vec![
            (b"compiler-filter".to_vec(), b"verify-none".to_vec()),
            (b"pic".to_vec(), b"false".to_vec()),
        ]);
        let mut buf = Vec::new();
        store.write(&mut buf).unwrap();
        assert_eq!(buf.len() as u32, store.compute_size());

        let mut parser = Parser::new(&buf);
        let parsed = KeyValueStore::parse(&mut parser, buf.len()).unwrap();
        assert_eq!(parsed.pairs(), store.pairs());
        assert_eq!(parsed.get(b"pic"), Some(b"false".as_slice()));
    }

    #[test]
    fn test_instruction_set_names() {
        use std::str::FromStr;
        assert_eq!(InstructionSet::from_str("arm").unwrap(), InstructionSet::Arm);
        assert_eq!(
            InstructionSet::from_str("x86_64").unwrap(),
            InstructionSet::X86_64
        );
        assert_eq!(InstructionSet::from_str("none").unwrap(), InstructionSet::None);
        assert!(InstructionSet::from_str("sparc").is_err());
    }
}
