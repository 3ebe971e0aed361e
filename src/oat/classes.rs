//! Per-class metadata tables.
//!
//! Every class in every embedded dex gets a `ClassInfo`: a verification
//! status plus a compilation type. Verify-none output writes every class as
//! `Verified` / `NoneCompiled`. The V079 layout is doubly indirect (an array
//! of offsets, each pointing at a `ClassInfo`); V045/V064 store the offsets
//! inline in the dex-file listing.

use std::fmt;
use std::io::Write;

use crate::error::malformed_error;
use crate::file::Parser;
use crate::oat::listing::{read_class_names, DexFileHeader, DexListing079Entry};
use crate::Result;

/// The ART class verification status ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClassStatus {
    /// Retired.
    Retired = -2,
    /// Erroneous.
    Error = -1,
    /// Not ready.
    NotReady = 0,
    /// Idx.
    Idx = 1,
    /// Loaded.
    Loaded = 2,
    /// Resolving.
    Resolving = 3,
    /// Resolved.
    Resolved = 4,
    /// Verifying.
    Verifying = 5,
    /// Verification deferred to runtime.
    RetryVerificationAtRuntime = 6,
    /// Verifying at runtime.
    VerifyingAtRuntime = 7,
    /// Verified.
    Verified = 8,
    /// Initializing.
    Initializing = 9,
    /// Initialized.
    Initialized = 10,
    /// Sentinel.
    Max = 11,
}

impl ClassStatus {
    /// Short single-letter code used by compact dumps.
    #[must_use]
    pub fn short_code(self) -> char {
        match self {
            ClassStatus::Retired => 'O',
            ClassStatus::Error => 'E',
            ClassStatus::NotReady => 'N',
            ClassStatus::Idx | ClassStatus::Initialized => 'I',
            ClassStatus::Loaded => 'L',
            ClassStatus::Resolving => 'r',
            ClassStatus::Resolved => 'R',
            ClassStatus::Verifying
            | ClassStatus::RetryVerificationAtRuntime
            | ClassStatus::VerifyingAtRuntime => 'v',
            ClassStatus::Verified => 'V',
            ClassStatus::Initializing => 'i',
            ClassStatus::Max => 'M',
        }
    }

    /// Decodes a raw status; unknown values come back as `None`.
    #[must_use]
    pub fn from_raw(raw: i16) -> Option<ClassStatus> {
        Some(match raw {
            -2 => ClassStatus::Retired,
            -1 => ClassStatus::Error,
            0 => ClassStatus::NotReady,
            1 => ClassStatus::Idx,
            2 => ClassStatus::Loaded,
            3 => ClassStatus::Resolving,
            4 => ClassStatus::Resolved,
            5 => ClassStatus::Verifying,
            6 => ClassStatus::RetryVerificationAtRuntime,
            7 => ClassStatus::VerifyingAtRuntime,
            8 => ClassStatus::Verified,
            9 => ClassStatus::Initializing,
            10 => ClassStatus::Initialized,
            11 => ClassStatus::Max,
            _ => return None,
        })
    }
}

impl fmt::Display for ClassStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// How much of a class was ahead-of-time compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OatClassType {
    /// Every method compiled.
    AllCompiled = 0,
    /// Some methods compiled (followed by a method bitmap on disk).
    SomeCompiled = 1,
    /// Nothing compiled.
    NoneCompiled = 2,
    /// Sentinel.
    Max = 3,
}

impl OatClassType {
    /// Short single-letter code used by compact dumps.
    #[must_use]
    pub fn short_code(self) -> char {
        match self {
            OatClassType::AllCompiled => 'C',
            OatClassType::SomeCompiled => 'c',
            OatClassType::NoneCompiled => 'n',
            OatClassType::Max => 'M',
        }
    }

    /// Decodes a raw type; unknown values come back as `None`.
    #[must_use]
    pub fn from_raw(raw: u16) -> Option<OatClassType> {
        Some(match raw {
            0 => OatClassType::AllCompiled,
            1 => OatClassType::SomeCompiled,
            2 => OatClassType::NoneCompiled,
            3 => OatClassType::Max,
            _ => return None,
        })
    }
}

/// The on-disk per-class record: 2 bytes of status, 2 bytes of type.
///
/// Compiled classes are followed by method data this codec does not emit;
/// verify-none output is always `Verified` / `NoneCompiled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassInfo {
    /// Raw [`ClassStatus`] value.
    pub status: i16,
    /// Raw [`OatClassType`] value.
    pub type_: u16,
}

impl ClassInfo {
    /// Encoded size.
    pub const SIZE: usize = 4;

    /// The record verify-none builds write for every class.
    #[must_use]
    pub fn verified_none_compiled() -> Self {
        ClassInfo {
            status: ClassStatus::Verified as i16,
            type_: OatClassType::NoneCompiled as u16,
        }
    }

    /// Reads one record.
    ///
    /// # Errors
    /// `OutOfBounds` on truncated input.
    pub fn parse(parser: &mut Parser<'_>) -> Result<Self> {
        Ok(ClassInfo {
            status: parser.read_i16()?,
            type_: parser.read_u16()?,
        })
    }

    /// Writes one record.
    ///
    /// # Errors
    /// I/O errors from the sink.
    pub fn write(&self, sink: &mut impl Write) -> Result<()> {
        sink.write_all(&self.status.to_le_bytes())?;
        sink.write_all(&self.type_.to_le_bytes())?;
        Ok(())
    }
}

/// The class metadata of one embedded dex.
#[derive(Debug, Clone)]
pub struct DexClasses {
    /// The dex location string.
    pub dex_file: String,
    /// One record per class def.
    pub class_info: Vec<ClassInfo>,
    /// Class descriptor per class def, read from the embedded dex.
    pub class_names: Vec<String>,
}

impl DexClasses {
    /// Class names whose status is below `Verified`.
    #[must_use]
    pub fn unverified_classes(&self) -> Vec<&str> {
        self.class_info
            .iter()
            .zip(&self.class_names)
            .filter(|(info, _)| info.status < ClassStatus::Verified as i16)
            .map(|(_, name)| name.as_str())
            .collect()
    }
}

/// The V079 pointer-indirect class tables of a whole OAT file.
#[derive(Debug, Clone, Default)]
pub struct OatClasses079 {
    /// Per embedded dex, in listing order.
    pub classes: Vec<DexClasses>,
}

impl OatClasses079 {
    /// Reads the tables for every dex in the listing. `oat_buf` is the OAT
    /// payload (offsets in the listing are relative to it).
    ///
    /// # Errors
    /// `Malformed` on compiled classes (not modelled) or broken offsets.
    pub fn parse(
        listing: &[DexListing079Entry],
        headers: &[DexFileHeader],
        oat_buf: &[u8],
    ) -> Result<Self> {
        let mut classes = Vec::with_capacity(listing.len());
        for (entry, header) in listing.iter().zip(headers) {
            let names = read_class_names(oat_buf, entry.file_offset as usize, header)?;
            let mut infos = Vec::with_capacity(header.class_defs_size as usize);
            // classes_offset points at an array of offsets, one per class
            // def, each pointing at a ClassInfo.
            let mut offsets = Parser::new(oat_buf);
            offsets.seek(entry.classes_offset as usize)?;
            for _ in 0..header.class_defs_size {
                let info_offset = offsets.read_u32()? as usize;
                let mut info_parser = Parser::new(oat_buf);
                info_parser.seek(info_offset)?;
                let info = ClassInfo::parse(&mut info_parser)?;
                if info.type_ != OatClassType::NoneCompiled as u16 {
                    return Err(malformed_error!(
                        "compiled class tables are not supported (type {})",
                        info.type_
                    ));
                }
                infos.push(info);
            }
            classes.push(DexClasses {
                dex_file: entry.location.clone(),
                class_info: infos,
                class_names: names,
            });
        }
        Ok(OatClasses079 { classes })
    }

    /// Writes the V079 tables: per dex, the offset array then the
    /// `ClassInfo` records, matching the offsets recorded in the listing.
    ///
    /// # Errors
    /// I/O errors from the sink.
    pub fn write(
        listing: &[DexListing079Entry],
        sink: &mut impl Write,
        position: &mut u32,
    ) -> Result<()> {
        for entry in listing {
            assert_eq!(entry.classes_offset, *position, "class table misplaced");
            let num_classes = entry.num_classes;
            let mut record_offset = entry.classes_offset + num_classes * 4;
            for _ in 0..num_classes {
                sink.write_all(&record_offset.to_le_bytes())?;
                *position += 4;
                record_offset += ClassInfo::SIZE as u32;
            }
            let info = ClassInfo::verified_none_compiled();
            for _ in 0..num_classes {
                info.write(sink)?;
                *position += ClassInfo::SIZE as u32;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_info_round_trip() {
        let info = ClassInfo::verified_none_compiled();
        let mut buf = Vec::new();
        info.write(&mut buf).unwrap();
        assert_eq!(buf.len(), ClassInfo::SIZE);
        assert_eq!(buf, vec![8, 0, 2, 0]);
        let mut parser = Parser::new(&buf);
        assert_eq!(ClassInfo::parse(&mut parser).unwrap(), info);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(ClassStatus::from_raw(8), Some(ClassStatus::Verified));
        assert_eq!(ClassStatus::from_raw(-2), Some(ClassStatus::Retired));
        assert_eq!(ClassStatus::from_raw(99), None);
        assert_eq!(ClassStatus::Verified.short_code(), 'V');
        assert_eq!(OatClassType::NoneCompiled.short_code(), 'n');
    }

    #[test]
    fn test_unverified_listing() {
        let classes = DexClasses {
            dex_file: "classes.dex".into(),
            class_info: vec![
                ClassInfo {
                    status: ClassStatus::Verified as i16,
                    type_: OatClassType::NoneCompiled as u16,
                },
                ClassInfo {
                    status: ClassStatus::Resolved as i16,
                    type_: OatClassType::NoneCompiled as u16,
                },
            ],
            class_names: vec!["La;".into(), "Lb;".into()],
        };
        assert_eq!(classes.unverified_classes(), vec!["Lb;"]);
    }
}
