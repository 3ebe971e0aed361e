//! Shared helpers: synthetic dex blobs for container tests.

use dexopt::oat::adler32;

/// Builds a minimal but structurally valid dex blob declaring one class per
/// descriptor: real header, string-id / type-id / class-def tables, and
/// MUTF-8 string data, with the header checksum filled in.
pub fn synthetic_dex(class_names: &[&str]) -> Vec<u8> {
    let n = class_names.len() as u32;
    const HEADER_SIZE: u32 = 112;
    let string_ids_off = HEADER_SIZE;
    let type_ids_off = string_ids_off + 4 * n;
    let class_defs_off = type_ids_off + 4 * n;
    let data_off = class_defs_off + 32 * n;

    // String data: uleb128 utf16 length, bytes, NUL.
    let mut string_data = Vec::new();
    let mut string_offsets = Vec::new();
    for name in class_names {
        string_offsets.push(data_off + string_data.len() as u32);
        let bytes = name.as_bytes();
        push_uleb128(&mut string_data, bytes.len() as u32);
        string_data.extend_from_slice(bytes);
        string_data.push(0);
    }
    let file_size = data_off + string_data.len() as u32;

    let mut dex = Vec::with_capacity(file_size as usize);
    dex.extend_from_slice(b"dex\n035\0");
    dex.extend_from_slice(&0u32.to_le_bytes()); // checksum, patched below
    dex.extend_from_slice(&[0u8; 20]); // signature
    dex.extend_from_slice(&file_size.to_le_bytes());
    dex.extend_from_slice(&HEADER_SIZE.to_le_bytes());
    dex.extend_from_slice(&0x1234_5678u32.to_le_bytes()); // endian tag
    dex.extend_from_slice(&0u32.to_le_bytes()); // link_size
    dex.extend_from_slice(&0u32.to_le_bytes()); // link_off
    dex.extend_from_slice(&0u32.to_le_bytes()); // map_off
    dex.extend_from_slice(&n.to_le_bytes());
    dex.extend_from_slice(&string_ids_off.to_le_bytes());
    dex.extend_from_slice(&n.to_le_bytes());
    dex.extend_from_slice(&type_ids_off.to_le_bytes());
    dex.extend_from_slice(&0u32.to_le_bytes()); // proto_ids_size
    dex.extend_from_slice(&0u32.to_le_bytes()); // proto_ids_off
    dex.extend_from_slice(&0u32.to_le_bytes()); // field_ids_size
    dex.extend_from_slice(&0u32.to_le_bytes()); // field_ids_off
    dex.extend_from_slice(&0u32.to_le_bytes()); // method_ids_size
    dex.extend_from_slice(&0u32.to_le_bytes()); // method_ids_off
    dex.extend_from_slice(&n.to_le_bytes());
    dex.extend_from_slice(&class_defs_off.to_le_bytes());
    dex.extend_from_slice(&(string_data.len() as u32).to_le_bytes());
    dex.extend_from_slice(&data_off.to_le_bytes());
    assert_eq!(dex.len() as u32, HEADER_SIZE);

    for offset in &string_offsets {
        dex.extend_from_slice(&offset.to_le_bytes());
    }
    for i in 0..n {
        // type_id: index into string_ids.
        dex.extend_from_slice(&i.to_le_bytes());
    }
    for i in 0..n {
        // class_def_item: class_idx, pad, access_flags, superclass_idx, pad,
        // interfaces_off, source_file_idx, annotations_off, class_data_off,
        // static_values_off.
        dex.extend_from_slice(&(i as u16).to_le_bytes());
        dex.extend_from_slice(&0u16.to_le_bytes());
        dex.extend_from_slice(&1u32.to_le_bytes());
        dex.extend_from_slice(&0xFFFFu16.to_le_bytes());
        dex.extend_from_slice(&0u16.to_le_bytes());
        dex.extend_from_slice(&0u32.to_le_bytes());
        dex.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        dex.extend_from_slice(&0u32.to_le_bytes());
        dex.extend_from_slice(&0u32.to_le_bytes());
        dex.extend_from_slice(&0u32.to_le_bytes());
    }
    dex.extend_from_slice(&string_data);
    assert_eq!(dex.len() as u32, file_size);

    let checksum = adler32(&dex[12..]);
    dex[8..12].copy_from_slice(&checksum.to_le_bytes());
    dex
}

fn push_uleb128(out: &mut Vec<u8>, mut value: u32) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}
