//! Building OAT containers.
//!
//! The writer composes the whole payload in memory: sizes and offsets are
//! computed first, sections are emitted in order with positions asserted
//! against the plan, and the common header (magic, version, Adler-32 over
//! everything after it) is patched in last. Emitted files are bit-stable:
//! the key-value store keeps its given order and all padding is zero.

use std::io::Write;

use rayon::prelude::*;

use crate::oat::checksum::adler32;
use crate::oat::classes::{ClassInfo, OatClasses079};
use crate::oat::elf;
use crate::oat::header::{InstructionSet, KeyValueStore, OatHeader, OatHeaderCommon, OAT_MAGIC};
use crate::oat::listing::{DexFileHeader, DexListing064Entry, DexListing079Entry};
use crate::oat::lookup::{self, LookupTableEntry};
use crate::oat::OatVersion;
use crate::file::Parser;
use crate::Result;

/// One dex file to embed: its raw bytes and its location string.
#[derive(Debug, Clone)]
pub struct DexInput {
    /// The raw dex blob.
    pub data: Vec<u8>,
    /// The location string recorded in the listing.
    pub location: String,
}

/// Boot-image facts V064 headers carry.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageInfo064 {
    /// Image patch delta.
    pub patch_delta: i32,
    /// Checksum of the image's OAT.
    pub oat_checksum: u32,
    /// Data-begin address of the image's OAT.
    pub data_begin: u32,
}

/// Extracts [`ImageInfo064`] from the header of a boot `.art` image.
#[must_use]
pub fn read_art_image_info(art_bytes: &[u8]) -> Option<ImageInfo064> {
    let mut parser = Parser::new(art_bytes);
    // ArtImageHeader: magic, version, image_begin, image_size, oat_checksum,
    // oat_file_begin, oat_data_begin, oat_data_end, oat_file_end,
    // patch_delta, ...
    parser.advance_by(8).ok()?;
    parser.advance_by(8).ok()?; // image_begin, image_size
    let oat_checksum = parser.read_u32().ok()?;
    parser.advance_by(4).ok()?; // oat_file_begin
    let data_begin = parser.read_u32().ok()?;
    parser.advance_by(8).ok()?; // oat_data_end, oat_file_end
    let patch_delta = parser.read_i32().ok()?;
    Some(ImageInfo064 {
        patch_delta,
        oat_checksum,
        data_begin,
    })
}

/// How to build a container.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Target format version.
    pub version: OatVersion,
    /// Target architecture.
    pub isa: InstructionSet,
    /// Wrap the payload in an ELF container.
    pub write_elf: bool,
    /// Recorded image location.
    pub art_image_location: String,
    /// Boot-image facts (V064).
    pub image_info: Option<ImageInfo064>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            version: OatVersion::V079,
            isa: InstructionSet::None,
            write_elf: false,
            art_image_location: String::new(),
            image_info: None,
        }
    }
}

fn default_key_value(art_image_location: &str) -> KeyValueStore {
    KeyValueStore::new(vec![
        (b"classpath".to_vec(), b"".to_vec()),
        (b"compiler-filter".to_vec(), b"verify-none".to_vec()),
        (b"debuggable".to_vec(), b"false".to_vec()),
        (
            b"dex2oat-cmdline".to_vec(),
            b"--oat-file=/dev/null --dex-file=/dev/null".to_vec(),
        ),
        (b"dex2oat-host".to_vec(), b"X86".to_vec()),
        (b"has-patch-info".to_vec(), b"false".to_vec()),
        (b"native-debuggable".to_vec(), b"false".to_vec()),
        (b"image-location".to_vec(), art_image_location.as_bytes().to_vec()),
        (b"pic".to_vec(), b"false".to_vec()),
    ])
}

fn build_header(
    version: OatVersion,
    isa: InstructionSet,
    dex_count: u32,
    keyvalue_size: u32,
    oat_size: u32,
    image_info: Option<&ImageInfo064>,
) -> OatHeader {
    let mut header = OatHeader {
        instruction_set: isa,
        // Set to 1 on every target we have seen.
        instruction_set_features_bitmap: 1,
        dex_file_count: dex_count,
        executable_offset: oat_size,
        key_value_store_size: keyvalue_size,
        ..OatHeader::default()
    };
    header.common = OatHeaderCommon {
        magic: OAT_MAGIC,
        version: version.version_word(),
        // Patched after the payload is complete.
        adler32_checksum: 0,
    };
    if let Some(info) = image_info {
        header.image_patch_delta = info.patch_delta;
        header.image_file_location_oat_checksum = info.oat_checksum;
        header.image_file_location_oat_data_begin = info.data_begin;
    }
    header
}

fn pad_to(payload: &mut Vec<u8>, target: usize) {
    assert!(payload.len() <= target, "section overran its planned offset");
    payload.resize(target, 0);
}

/// Builds a container over `dex_input` and writes it to `sink`.
///
/// # Errors
/// `Malformed` when a dex blob's header is broken, plus I/O errors from the
/// sink.
pub fn build(sink: &mut impl Write, dex_input: &[DexInput], config: &BuildConfig) -> Result<()> {
    let headers: Vec<DexFileHeader> = dex_input
        .iter()
        .map(|d| DexFileHeader::parse(&d.data))
        .collect::<Result<_>>()?;

    let payload = match config.version {
        OatVersion::V079 | OatVersion::V088 => build_payload_079(dex_input, &headers, config)?,
        OatVersion::V045 | OatVersion::V064 => build_payload_064(dex_input, &headers, config)?,
    };

    if config.write_elf {
        elf::write_wrapped(sink, &payload, config.isa, elf::compute_bss_size(&headers))?;
    } else {
        sink.write_all(&payload)?;
    }
    Ok(())
}

fn finish_payload(mut payload: Vec<u8>, version: OatVersion, oat_size: usize) -> Vec<u8> {
    pad_to(&mut payload, oat_size);
    // Seek back over the common header: magic, version, then the Adler-32
    // over every byte after it.
    payload[0..4].copy_from_slice(&OAT_MAGIC.to_le_bytes());
    payload[4..8].copy_from_slice(&version.version_word().to_le_bytes());
    let checksum = adler32(&payload[OatHeaderCommon::SIZE..]);
    payload[8..12].copy_from_slice(&checksum.to_le_bytes());
    payload
}

fn build_payload_079(
    dex_input: &[DexInput],
    headers: &[DexFileHeader],
    config: &BuildConfig,
) -> Result<Vec<u8>> {
    let key_value = default_key_value(&config.art_image_location);
    let keyvalue_size = key_value.compute_size();
    let header_size = OatHeader::size(config.version) as u32;
    let locations: Vec<&str> = dex_input.iter().map(|d| d.location.as_str()).collect();
    let listing_size = DexListing079Entry::compute_size(&locations);

    // Neither the key-value store nor the listing requires alignment, but
    // the first dex blob does.
    let mut next_offset =
        elf::align_up((header_size + keyvalue_size + listing_size) as usize, 4) as u32;
    let dex_start = next_offset;

    let mut entries: Vec<DexListing079Entry> = Vec::with_capacity(dex_input.len());
    let mut total_dex_size = 0u32;
    for (dex, header) in dex_input.iter().zip(headers) {
        let dex_offset = next_offset + total_dex_size;
        total_dex_size += elf::align_up(dex.data.len(), 4) as u32;
        let num_classes = header.class_defs_size;
        entries.push(DexListing079Entry {
            location: dex.location.clone(),
            location_checksum: header.checksum,
            file_offset: dex_offset,
            num_classes,
            // Temporarily the sizes; rewritten into offsets below.
            classes_offset: num_classes * 4 + num_classes * ClassInfo::SIZE as u32,
            lookup_table_offset: lookup::num_entries(num_classes)
                * LookupTableEntry::SIZE as u32,
        });
    }
    next_offset += total_dex_size;
    assert_eq!(next_offset % 4, 0);
    for entry in &mut entries {
        let size = entry.classes_offset;
        entry.classes_offset = next_offset;
        next_offset += size;
    }
    for entry in &mut entries {
        let size = entry.lookup_table_offset;
        entry.lookup_table_offset = next_offset;
        next_offset += size;
    }
    let oat_size = elf::align_up(next_offset as usize, 0x1000);

    // Per-dex lookup tables are independent; build them in parallel.
    let lookup_tables: Vec<Vec<LookupTableEntry>> = dex_input
        .par_iter()
        .map(|d| lookup::build_lookup_table(&d.data))
        .collect::<Result<_>>()?;

    let header = build_header(
        config.version,
        config.isa,
        dex_input.len() as u32,
        keyvalue_size,
        oat_size as u32,
        config.image_info.as_ref(),
    );

    let mut payload: Vec<u8> = Vec::with_capacity(oat_size);
    header.write(&mut payload)?;
    key_value.write(&mut payload)?;
    DexListing079Entry::write(&entries, &mut payload)?;
    pad_to(&mut payload, dex_start as usize);

    for (dex, entry) in dex_input.iter().zip(&entries) {
        assert_eq!(payload.len() as u32, entry.file_offset);
        payload.extend_from_slice(&dex.data);
        let target_len = elf::align_up(payload.len(), 4);
        pad_to(&mut payload, target_len);
    }

    let mut position = payload.len() as u32;
    OatClasses079::write(&entries, &mut payload, &mut position)?;
    assert_eq!(position as usize, payload.len());

    for (table, entry) in lookup_tables.iter().zip(&entries) {
        assert_eq!(payload.len() as u32, entry.lookup_table_offset);
        lookup::write_table(table, &mut payload)?;
    }

    Ok(finish_payload(payload, config.version, oat_size))
}

fn build_payload_064(
    dex_input: &[DexInput],
    headers: &[DexFileHeader],
    config: &BuildConfig,
) -> Result<Vec<u8>> {
    let key_value = default_key_value(&config.art_image_location);
    let keyvalue_size = key_value.compute_size();
    let header_size = OatHeader::size(config.version) as u32;
    let listing_inputs: Vec<(&str, u32)> = dex_input
        .iter()
        .zip(headers)
        .map(|(d, h)| (d.location.as_str(), h.class_defs_size))
        .collect();
    let listing_size = DexListing064Entry::compute_size(&listing_inputs);

    let mut next_offset =
        elf::align_up((header_size + keyvalue_size + listing_size) as usize, 4) as u32;
    let dex_start = next_offset;

    let mut entries: Vec<DexListing064Entry> = Vec::with_capacity(dex_input.len());
    let mut total_dex_size = 0u32;
    let mut total_class_info = 0u32;
    for (dex, header) in dex_input.iter().zip(headers) {
        let dex_offset = next_offset + total_dex_size;
        total_dex_size += elf::align_up(dex.data.len(), 4) as u32;
        let num_classes = header.class_defs_size;
        total_class_info += num_classes * ClassInfo::SIZE as u32;
        entries.push(DexListing064Entry {
            location: dex.location.clone(),
            location_checksum: header.checksum,
            file_offset: dex_offset,
            class_offsets: vec![0; num_classes as usize],
            class_info: vec![ClassInfo::verified_none_compiled(); num_classes as usize],
            class_names: Vec::new(),
        });
    }
    next_offset += total_dex_size;
    let mut class_info_offset = next_offset;
    next_offset += total_class_info;
    let oat_size = elf::align_up(next_offset as usize, 0x1000);

    // Now that the dex sizes are settled, hand each class its record slot.
    for entry in &mut entries {
        for offset in &mut entry.class_offsets {
            *offset = class_info_offset;
            class_info_offset += ClassInfo::SIZE as u32;
        }
    }

    let header = build_header(
        config.version,
        config.isa,
        dex_input.len() as u32,
        keyvalue_size,
        oat_size as u32,
        config.image_info.as_ref(),
    );

    let mut payload: Vec<u8> = Vec::with_capacity(oat_size);
    header.write(&mut payload)?;
    key_value.write(&mut payload)?;
    DexListing064Entry::write(&entries, &mut payload)?;
    pad_to(&mut payload, dex_start as usize);

    for (dex, entry) in dex_input.iter().zip(&entries) {
        assert_eq!(payload.len() as u32, entry.file_offset);
        payload.extend_from_slice(&dex.data);
        let target_len = elf::align_up(payload.len(), 4);
        pad_to(&mut payload, target_len);
    }

    for entry in &entries {
        if let Some(&first) = entry.class_offsets.first() {
            assert_eq!(first, payload.len() as u32);
        }
        for info in &entry.class_info {
            info.write(&mut payload)?;
        }
    }

    Ok(finish_payload(payload, config.version, oat_size))
}
