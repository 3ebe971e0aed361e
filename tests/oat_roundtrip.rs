//! Container round-trips: build, parse back, and check the bit-level
//! invariants of the format.

mod common;

use dexopt::oat::{
    adler32, build, num_entries, BuildConfig, ClassStatus, DexInput, InstructionSet, OatClassType,
    OatFile, OatHeaderCommon, OatVersion, ParseStatus,
};

use common::synthetic_dex;

fn build_bytes(inputs: &[DexInput], config: &BuildConfig) -> Vec<u8> {
    let mut out = Vec::new();
    build(&mut out, inputs, config).expect("build succeeds");
    out
}

fn two_dex_inputs() -> Vec<DexInput> {
    vec![
        DexInput {
            data: synthetic_dex(&["La/A;", "La/B;"]),
            location: "classes.dex".into(),
        },
        DexInput {
            data: synthetic_dex(&["Lb/C;", "Lb/D;", "Lb/E;"]),
            location: "classes2.dex".into(),
        },
    ]
}

#[test]
fn v079_round_trip() {
    let inputs = two_dex_inputs();
    let config = BuildConfig {
        version: OatVersion::V079,
        isa: InstructionSet::X86,
        ..BuildConfig::default()
    };
    let payload = build_bytes(&inputs, &config);

    // The total size is page-aligned and zero-padded.
    assert_eq!(payload.len() % 0x1000, 0);

    let parsed = OatFile::parse(&payload).expect("parse succeeds");
    assert_eq!(parsed.status(), ParseStatus::Success);
    let OatFile::V079(oat) = parsed else {
        panic!("expected a V079 container");
    };

    // Magic and version are bit-exact.
    assert_eq!(oat.header.common.magic, 0x0A74_616F);
    assert_eq!(&payload[..4], b"oat\n");
    assert_eq!(&payload[4..8], b"079\0");
    assert_eq!(oat.header.dex_file_count, 2);
    assert_eq!(oat.dex_files.len(), 2);

    // Each listed file_offset points at the first byte of its blob.
    for (entry, input) in oat.dex_files.iter().zip(&inputs) {
        let start = entry.file_offset as usize;
        assert_eq!(
            &payload[start..start + input.data.len()],
            input.data.as_slice()
        );
        assert_eq!(start % 4, 0);
    }

    // Class tables: one Verified/NoneCompiled record per class, reached
    // through the pointer table.
    let classes = oat.classes.as_ref().expect("classes parsed");
    assert_eq!(classes.classes.len(), 2);
    assert_eq!(classes.classes[0].class_info.len(), 2);
    assert_eq!(classes.classes[1].class_info.len(), 3);
    for dex_classes in &classes.classes {
        for info in &dex_classes.class_info {
            assert_eq!(info.status, ClassStatus::Verified as i16);
            assert_eq!(info.type_, OatClassType::NoneCompiled as u16);
        }
    }
    assert_eq!(classes.classes[0].class_names, vec!["La/A;", "La/B;"]);

    // Lookup tables sized to the next power of two over the class count.
    let tables = oat.lookup_tables.as_ref().expect("tables parsed");
    assert_eq!(tables[0].entries.len() as u32, num_entries(2));
    assert_eq!(tables[1].entries.len() as u32, num_entries(3));
    assert_eq!(tables[1].entries.len(), 4);
    // And every descriptor resolves through its table.
    assert!(tables[0].lookup(&payload, b"La/A;").is_some());
    assert!(tables[1].lookup(&payload, b"Lb/E;").is_some());
    assert!(tables[0].lookup(&payload, b"Lmissing;").is_none());

    // The stored checksum is the Adler-32 of everything after the common
    // header.
    assert_eq!(
        oat.header.common.adler32_checksum,
        adler32(&payload[OatHeaderCommon::SIZE..])
    );
}

#[test]
fn v064_round_trip() {
    let inputs = two_dex_inputs();
    let config = BuildConfig {
        version: OatVersion::V064,
        isa: InstructionSet::Arm,
        ..BuildConfig::default()
    };
    let payload = build_bytes(&inputs, &config);
    let parsed = OatFile::parse(&payload).expect("parse succeeds");
    let OatFile::V064(oat) = parsed else {
        panic!("expected a V064 container");
    };
    assert_eq!(oat.dex_files.len(), 2);
    assert_eq!(oat.dex_files[0].class_info.len(), 2);
    assert_eq!(oat.dex_files[1].class_info.len(), 3);
    for entry in &oat.dex_files {
        for info in &entry.class_info {
            assert_eq!(info.status, ClassStatus::Verified as i16);
            assert_eq!(info.type_, OatClassType::NoneCompiled as u16);
        }
    }
    assert_eq!(
        oat.dex_files[1].class_names,
        vec!["Lb/C;", "Lb/D;", "Lb/E;"]
    );
    assert_eq!(
        oat.header.common.adler32_checksum,
        adler32(&payload[OatHeaderCommon::SIZE..])
    );
}

#[test]
fn v045_header_is_longer() {
    let inputs = vec![DexInput {
        data: synthetic_dex(&["La;"]),
        location: "classes.dex".into(),
    }];
    let v045 = build_bytes(
        &inputs,
        &BuildConfig {
            version: OatVersion::V045,
            ..BuildConfig::default()
        },
    );
    let v064 = build_bytes(
        &inputs,
        &BuildConfig {
            version: OatVersion::V064,
            ..BuildConfig::default()
        },
    );
    assert_eq!(&v045[4..8], b"045\0");
    assert_eq!(&v064[4..8], b"064\0");
    // Both parse back.
    assert_eq!(
        OatFile::parse(&v045).unwrap().status(),
        ParseStatus::Success
    );
    assert_eq!(
        OatFile::parse(&v064).unwrap().status(),
        ParseStatus::Success
    );
}

#[test]
fn bad_magic_short_circuits() {
    let mut buf = vec![0xDE, 0xAD, 0xBE, 0xEF];
    buf.extend_from_slice(&[0u8; 64]);
    let parsed = OatFile::parse(&buf).expect("parse returns a shape");
    assert_eq!(parsed.status(), ParseStatus::BadMagicNumber);
    assert!(parsed.expect_success().is_err());
    assert!(parsed.get_oat_dexfiles().is_empty());
}

#[test]
fn elf_wrapped_round_trip() {
    let inputs = two_dex_inputs();
    let config = BuildConfig {
        version: OatVersion::V079,
        isa: InstructionSet::X86,
        write_elf: true,
        ..BuildConfig::default()
    };
    let file = build_bytes(&inputs, &config);
    assert_eq!(&file[..4], b"\x7fELF");
    // The payload sits at 0x1000 and the parser unwraps it transparently.
    assert_eq!(&file[0x1000..0x1004], b"oat\n");
    let parsed = OatFile::parse(&file).expect("parse succeeds");
    assert_eq!(parsed.status(), ParseStatus::Success);
    assert_eq!(parsed.get_oat_dexfiles().len(), 2);
}

#[test]
fn dex_files_only_mode_stops_after_listing() {
    let inputs = two_dex_inputs();
    let payload = build_bytes(
        &inputs,
        &BuildConfig {
            version: OatVersion::V079,
            ..BuildConfig::default()
        },
    );
    let parsed = OatFile::parse_dex_files_only(&payload).expect("parse succeeds");
    let OatFile::V079(oat) = parsed else {
        panic!("expected a V079 container");
    };
    assert!(oat.lookup_tables.is_none());
    assert!(oat.classes.is_none());
    assert_eq!(oat.dex_files.len(), 2);
}

#[test]
fn key_value_store_preserves_order() {
    let inputs = vec![DexInput {
        data: synthetic_dex(&["La;"]),
        location: "classes.dex".into(),
    }];
    let payload = build_bytes(
        &inputs,
        &BuildConfig {
            version: OatVersion::V079,
            art_image_location: "/system/boot.art".into(),
            ..BuildConfig::default()
        },
    );
    let OatFile::V079(oat) = OatFile::parse(&payload).unwrap() else {
        panic!("expected V079");
    };
    let pairs = oat.key_value_store.pairs();
    assert_eq!(pairs[0].0, b"classpath");
    assert_eq!(pairs[1].0, b"compiler-filter");
    assert_eq!(pairs[1].1, b"verify-none");
    assert_eq!(
        oat.key_value_store.get(b"image-location"),
        Some(b"/system/boot.art".as_slice())
    );

    // Byte-stability: the same input builds the same bytes.
    let again = build_bytes(
        &inputs,
        &BuildConfig {
            version: OatVersion::V079,
            art_image_location: "/system/boot.art".into(),
            ..BuildConfig::default()
        },
    );
    assert_eq!(payload, again);
}
