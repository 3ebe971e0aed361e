//! The optional ELF wrapper around an OAT payload.
//!
//! Wrapped files place the payload in a `.rodata` section at file offset
//! 0x1000; every internal OAT pointer is relative to that offset. Writing
//! emits a minimal 32-bit little-endian ELF with null / `.rodata` / `.bss` /
//! `.shstrtab` sections; reading uses the section table when one parses and
//! falls back to the fixed 0x1000 offset otherwise.

use std::io::Write;

use crate::oat::header::InstructionSet;
use crate::oat::listing::DexFileHeader;
use crate::Result;

/// File offset of the OAT payload inside a wrapped file.
pub const RODATA_OFFSET: usize = 0x1000;

/// Rounds `value` up to a multiple of `alignment` (a power of two).
#[must_use]
pub fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// When `buf` is ELF-wrapped, the offset its OAT payload starts at.
///
/// A parseable section table wins; a bare ELF magic falls back to the fixed
/// offset every known producer uses.
#[must_use]
pub fn payload_offset(buf: &[u8]) -> Option<usize> {
    if buf.len() < 4 || &buf[..4] != b"\x7fELF" {
        return None;
    }
    if let Ok(elf) = goblin::elf::Elf::parse(buf) {
        for section in &elf.section_headers {
            if elf.shdr_strtab.get_at(section.sh_name) == Some(".rodata") {
                return Some(section.sh_offset as usize);
            }
        }
    }
    Some(RODATA_OFFSET)
}

fn machine_for(isa: InstructionSet) -> u16 {
    match isa {
        InstructionSet::None => 0,
        InstructionSet::Arm | InstructionSet::Thumb2 => 40,
        InstructionSet::Arm64 => 183,
        InstructionSet::X86 => 3,
        InstructionSet::X86_64 => 62,
        InstructionSet::Mips | InstructionSet::Mips64 => 8,
    }
}

// One Elf32_Shdr.
struct SectionHeader {
    name: u32,
    sh_type: u32,
    flags: u32,
    addr: u32,
    offset: u32,
    size: u32,
    addralign: u32,
}

fn write_shdr(sink: &mut impl Write, s: &SectionHeader) -> Result<()> {
    for word in [
        s.name, s.sh_type, s.flags, s.addr, s.offset, s.size, 0, 0, s.addralign, 0,
    ] {
        sink.write_all(&word.to_le_bytes())?;
    }
    Ok(())
}

/// Estimated `.bss` the runtime will want for the embedded dex files'
/// type/method/string/field pointer tables (4-byte target pointers).
#[must_use]
pub fn compute_bss_size(headers: &[DexFileHeader]) -> u32 {
    const POINTER_SIZE: usize = 4;
    let mut total = 0usize;
    for header in headers {
        let types = (header.type_ids_size as usize * POINTER_SIZE).max(POINTER_SIZE);
        let methods_off = align_up(types, POINTER_SIZE);
        let methods = (header.method_ids_size as usize * POINTER_SIZE).max(POINTER_SIZE);
        let strings_off = align_up(methods_off + methods, POINTER_SIZE);
        let strings = header.string_ids_size as usize * POINTER_SIZE;
        let fields_off = align_up(strings_off + strings, POINTER_SIZE);
        let fields = header.field_ids_size as usize * POINTER_SIZE;
        total += align_up(fields_off + fields, POINTER_SIZE);
    }
    total as u32
}

/// Writes `payload` wrapped in a minimal ELF container with the payload at
/// [`RODATA_OFFSET`].
///
/// # Errors
/// I/O errors from the sink.
pub fn write_wrapped(
    sink: &mut impl Write,
    payload: &[u8],
    isa: InstructionSet,
    bss_size: u32,
) -> Result<()> {
    const SHSTRTAB: &[u8] = b"\0.rodata\0.bss\0.shstrtab\0";
    const EHDR_SIZE: usize = 52;
    const SHDR_SIZE: usize = 40;

    let strtab_offset = align_up(RODATA_OFFSET + payload.len(), 4);
    let shoff = align_up(strtab_offset + SHSTRTAB.len(), 4);

    // Elf32_Ehdr.
    let mut ehdr = Vec::with_capacity(EHDR_SIZE);
    ehdr.extend_from_slice(b"\x7fELF");
    ehdr.extend_from_slice(&[1, 1, 1, 0]); // 32-bit, little-endian, current
    ehdr.extend_from_slice(&[0; 8]);
    ehdr.extend_from_slice(&3u16.to_le_bytes()); // ET_DYN
    ehdr.extend_from_slice(&machine_for(isa).to_le_bytes());
    ehdr.extend_from_slice(&1u32.to_le_bytes()); // EV_CURRENT
    ehdr.extend_from_slice(&0u32.to_le_bytes()); // e_entry
    ehdr.extend_from_slice(&0u32.to_le_bytes()); // e_phoff
    ehdr.extend_from_slice(&(shoff as u32).to_le_bytes());
    ehdr.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    ehdr.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
    ehdr.extend_from_slice(&0u16.to_le_bytes()); // e_phentsize
    ehdr.extend_from_slice(&0u16.to_le_bytes()); // e_phnum
    ehdr.extend_from_slice(&(SHDR_SIZE as u16).to_le_bytes());
    ehdr.extend_from_slice(&4u16.to_le_bytes()); // e_shnum
    ehdr.extend_from_slice(&3u16.to_le_bytes()); // e_shstrndx
    sink.write_all(&ehdr)?;

    sink.write_all(&vec![0u8; RODATA_OFFSET - EHDR_SIZE])?;
    sink.write_all(payload)?;
    sink.write_all(&vec![0u8; strtab_offset - (RODATA_OFFSET + payload.len())])?;
    sink.write_all(SHSTRTAB)?;
    sink.write_all(&vec![0u8; shoff - (strtab_offset + SHSTRTAB.len())])?;

    // Null section.
    write_shdr(
        sink,
        &SectionHeader {
            name: 0,
            sh_type: 0,
            flags: 0,
            addr: 0,
            offset: 0,
            size: 0,
            addralign: 0,
        },
    )?;
    // .rodata holding the OAT payload.
    write_shdr(
        sink,
        &SectionHeader {
            name: 1,
            sh_type: 1, // PROGBITS
            flags: 2,   // ALLOC
            addr: RODATA_OFFSET as u32,
            offset: RODATA_OFFSET as u32,
            size: payload.len() as u32,
            addralign: 0x1000,
        },
    )?;
    // .bss for the runtime's pointer tables.
    write_shdr(
        sink,
        &SectionHeader {
            name: 9,
            sh_type: 8, // NOBITS
            flags: 3,   // ALLOC | WRITE
            addr: align_up(RODATA_OFFSET + payload.len(), 0x1000) as u32,
            offset: 0,
            size: bss_size,
            addralign: 4,
        },
    )?;
    // .shstrtab.
    write_shdr(
        sink,
        &SectionHeader {
            name: 14,
            sh_type: 3, // STRTAB
            flags: 0,
            addr: 0,
            offset: strtab_offset as u32,
            size: SHSTRTAB.len() as u32,
            addralign: 1,
        },
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 4), 0);
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(4, 4), 4);
        assert_eq!(align_up(0x1001, 0x1000), 0x2000);
    }

    #[test]
    fn test_wrapped_payload_is_at_rodata_offset() {
        let payload = b"oat-payload-bytes".to_vec();
        let mut out = Vec::new();
        write_wrapped(&mut out, &payload, InstructionSet::X86, 0).unwrap();
        assert_eq!(&out[..4], b"\x7fELF");
        assert_eq!(
            &out[RODATA_OFFSET..RODATA_OFFSET + payload.len()],
            payload.as_slice()
        );
        assert_eq!(payload_offset(&out), Some(RODATA_OFFSET));
    }

    #[test]
    fn test_plain_buffer_is_not_wrapped() {
        assert_eq!(payload_offset(b"oat\n079\0"), None);
        assert_eq!(payload_offset(&[]), None);
    }
}
