use std::io::Write;

use similar_asserts::assert_eq;
use tempfile::NamedTempFile;

use vambrace_common::{CpuType, MachoFileType};
use vambrace_macho::{HeaderFlag, MachoArchive, MachoError};
use vambrace_testutils::{fat, ImageBuilder, VIRTUAL_BASE};

const MH_NOUNDEFS: u32 = 0x1;
const MH_DYLDLINK: u32 = 0x4;
const MH_TWOLEVEL: u32 = 0x80;
const MH_PIE: u32 = 0x20_0000;

fn sample_builder() -> ImageBuilder {
    let mut builder = ImageBuilder::new();
    builder
        .header_flags(MH_NOUNDEFS | MH_DYLDLINK | MH_TWOLEVEL | MH_PIE)
        .section("__TEXT", "__text", VIRTUAL_BASE + 0x4000, 0x100)
        .section("__TEXT", "__cstring", VIRTUAL_BASE + 0x4100, 0x40)
        .section("__TEXT", "__cfstring", VIRTUAL_BASE + 0x4140, 0x40)
        .section("__DATA", "__objc_selrefs", VIRTUAL_BASE + 0x5000, 0x40);

    let foundation = builder.add_dylib(
        "/System/Library/Frameworks/Foundation.framework/Foundation",
        0x4cc_fe80,
    );
    builder.add_dylib("/usr/lib/libobjc.A.dylib", 0xe4b_0700);

    builder.add_exported_symbol("_main", VIRTUAL_BASE + 0x4000);
    builder.add_undefined_symbol("_NSLog", foundation);

    builder.write_str_at(VIRTUAL_BASE + 0x4100, "the quick brown fox");
    // a CFString record whose literal points back into __cstring
    builder
        .write_u64_at(VIRTUAL_BASE + 0x4140, 0)
        .write_u64_at(VIRTUAL_BASE + 0x4148, 0x7c8)
        .write_u64_at(VIRTUAL_BASE + 0x4150, VIRTUAL_BASE + 0x4100)
        .write_u64_at(VIRTUAL_BASE + 0x4158, 19);
    builder
}

fn open_archive(image: &[u8]) -> (NamedTempFile, MachoArchive) {
    let mut tmp = NamedTempFile::new().unwrap();
    tmp.write_all(image).unwrap();
    tmp.flush().unwrap();
    let archive = MachoArchive::open(tmp.path()).unwrap();
    (tmp, archive)
}

#[test]
fn test_thin_file_yields_single_descriptor() {
    let image = sample_builder().build();
    let (_tmp, archive) = open_archive(&image);

    assert_eq!(archive.slice_count(), 1);
    let descriptor = archive.descriptors()[0];
    assert_eq!(descriptor.cpu_type, CpuType::Unknown);
    assert_eq!(descriptor.offset, 0);
    assert_eq!(descriptor.size, image.len() as u64);
}

#[test]
fn test_parse_header_and_tables() {
    let image = sample_builder().build();
    let (_tmp, archive) = open_archive(&image);
    let binary = archive.slice(0).unwrap().unwrap();

    assert!(binary.is_64bit);
    assert!(!binary.is_swapped);
    assert_eq!(binary.cpu_type, CpuType::Arm64);
    assert_eq!(binary.file_type, MachoFileType::Execute);
    assert_eq!(binary.virtual_base(), VIRTUAL_BASE);

    for flag in [
        HeaderFlag::NoUndefs,
        HeaderFlag::DyldLink,
        HeaderFlag::TwoLevel,
        HeaderFlag::Pie,
    ] {
        assert!(binary.header_flags.contains(&flag), "missing {flag:?}");
    }

    // declaration order is preserved
    let segments: Vec<&[u8]> = binary.segment_commands().map(|(name, _)| name).collect();
    assert_eq!(segments, vec![&b"__TEXT"[..], b"__DATA", b"__LINKEDIT"]);
    let sections: Vec<String> = binary.sections().map(|s| s.name_lossy().into_owned()).collect();
    assert_eq!(
        sections,
        vec!["__text", "__cstring", "__cfstring", "__objc_selrefs"]
    );
}

#[test]
fn test_section_invariants_and_round_trip() {
    let image = sample_builder().build();
    let (_tmp, archive) = open_archive(&image);
    let binary = archive.slice(0).unwrap().unwrap();

    for section in binary.sections() {
        assert!(section.size > 0);
        assert_eq!(section.end_address, section.address + section.size);
        assert_eq!(
            binary.file_offset_for_virtual_address(section.address).unwrap(),
            section.offset
        );
    }
}

#[test]
fn test_load_commands_region_translates_directly() {
    let image = sample_builder().build();
    let (_tmp, archive) = open_archive(&image);
    let binary = archive.slice(0).unwrap().unwrap();

    // an address within the initial load-commands region maps 1:1
    assert_eq!(
        binary.file_offset_for_virtual_address(VIRTUAL_BASE + 0x20).unwrap(),
        0x20
    );
}

#[test]
fn test_section_fallback_uses_highest_section() {
    let image = sample_builder().build();
    let (_tmp, archive) = open_archive(&image);
    let binary = archive.slice(0).unwrap().unwrap();

    let past_everything = VIRTUAL_BASE + 0x6000;
    let section = binary.section_for_address(past_everything).unwrap();
    assert_eq!(section.name_lossy(), "__objc_selrefs");
}

#[test]
fn test_embedded_string_reader() {
    let image = sample_builder().build();
    let (_tmp, archive) = open_archive(&image);
    let binary = archive.slice(0).unwrap().unwrap();

    assert_eq!(
        binary.read_embedded_string(VIRTUAL_BASE + 0x4100).unwrap(),
        "the quick brown fox"
    );
    // reading through the CFString record lands on the same literal
    assert_eq!(
        binary.read_embedded_string(VIRTUAL_BASE + 0x4140).unwrap(),
        "the quick brown fox"
    );
}

#[test]
fn test_invalid_utf8_string_is_malformed() {
    let mut builder = sample_builder();
    builder.write_at(VIRTUAL_BASE + 0x4120, &[0xff, 0xfe, 0x00]);
    let image = builder.build();
    let (_tmp, archive) = open_archive(&image);
    let binary = archive.slice(0).unwrap().unwrap();

    assert!(matches!(
        binary.read_string_at_address(VIRTUAL_BASE + 0x4120),
        Err(MachoError::MalformedString(_))
    ));
}

#[test]
fn test_byte_read_guards() {
    let image = sample_builder().build();
    let len = image.len() as u64;
    let (_tmp, archive) = open_archive(&image);
    let binary = archive.slice(0).unwrap().unwrap();

    assert!(matches!(
        binary.bytes(1 << 32, 4),
        Err(MachoError::LooksLikeVirtualAddress(_))
    ));
    assert!(matches!(
        binary.bytes(len - 2, 8),
        Err(MachoError::OutOfBounds { .. })
    ));
}

#[test]
fn test_unsupported_magic_reports_file_and_offset() {
    let mut tmp = NamedTempFile::new().unwrap();
    tmp.write_all(&[0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 0]).unwrap();
    tmp.flush().unwrap();

    let archive = MachoArchive::open(tmp.path()).unwrap();
    assert_eq!(archive.slice_count(), 1);
    match archive.slice(0).unwrap() {
        Err(MachoError::UnsupportedFormat { path, offset, .. }) => {
            assert_eq!(path, tmp.path());
            assert_eq!(offset, 0);
        }
        other => panic!("expected UnsupportedFormat, got {other:?}"),
    }
}

#[test]
fn test_corrupt_sizeofcmds_is_malformed_header() {
    let mut image = sample_builder().build();
    // grow the declared command area without growing the commands
    let declared = u32::from_le_bytes(image[20..24].try_into().unwrap());
    image[20..24].copy_from_slice(&(declared + 8).to_le_bytes());

    let (_tmp, archive) = open_archive(&image);
    assert!(matches!(
        archive.slice(0).unwrap(),
        Err(MachoError::MalformedHeader { .. })
    ));
}

#[test]
fn test_fat_demultiplexing_and_slice_preference() {
    // an armv7 "slice" that is just a 32-bit magic: recognized as a
    // descriptor, rejected by the 64-bit parser
    let mut armv7 = 0xfeed_faceu32.to_le_bytes().to_vec();
    armv7.resize(64, 0);
    let arm64 = sample_builder().build();

    let container = fat(&[(12, armv7), (0x0100_000c, arm64)]);
    let (_tmp, archive) = open_archive(&container);

    assert_eq!(archive.slice_count(), 2);
    assert_eq!(archive.descriptors()[0].cpu_type, CpuType::Armv7);
    assert_eq!(archive.descriptors()[1].cpu_type, CpuType::Arm64);

    assert!(matches!(
        archive.slice(0).unwrap(),
        Err(MachoError::UnsupportedFormat { .. })
    ));

    let best = archive.best_slice().unwrap();
    assert_eq!(best.cpu_type, CpuType::Arm64);
    assert_eq!(best.fat_offset(), archive.descriptors()[1].offset);
    assert!(archive.get_arm64_slice().is_some());
}

#[test]
fn test_dylib_names_and_versions() {
    let image = sample_builder().build();
    let (_tmp, archive) = open_archive(&image);
    let binary = archive.slice(0).unwrap().unwrap();

    assert_eq!(
        binary.dylib_install_paths(),
        vec![
            "/System/Library/Frameworks/Foundation.framework/Foundation".to_owned(),
            "/usr/lib/libobjc.A.dylib".to_owned(),
        ]
    );
    assert_eq!(binary.load_dylib_commands[0].cmd.current_version, 0x4cc_fe80);
}

#[test]
fn test_symbol_table_contents() {
    let image = sample_builder().build();
    let (_tmp, archive) = open_archive(&image);
    let binary = archive.slice(0).unwrap().unwrap();

    let names: Vec<String> = binary
        .symtab_contents()
        .iter()
        .map(|nlist| binary.symbol_name(nlist).unwrap())
        .collect();
    assert_eq!(names, vec!["_main", "_NSLog"]);
    assert_eq!(binary.symtab_contents()[0].n_value, VIRTUAL_BASE + 0x4000);
}

#[test]
fn test_encryption_query() {
    let mut builder = sample_builder();
    builder.encryption(1);
    let encrypted = builder.build();
    let (_tmp, archive) = open_archive(&encrypted);
    assert!(archive.slice(0).unwrap().unwrap().is_encrypted());

    let mut builder = sample_builder();
    builder.encryption(0);
    let decrypted = builder.build();
    let (_tmp, archive) = open_archive(&decrypted);
    let binary = archive.slice(0).unwrap().unwrap();
    assert!(binary.encryption_info.is_some());
    assert!(!binary.is_encrypted());
}
