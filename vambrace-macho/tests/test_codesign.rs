use std::io::Write;

use similar_asserts::assert_eq;
use tempfile::NamedTempFile;

use vambrace_macho::codesign::parse_code_signature;
use vambrace_macho::{MachoArchive, MachoBinary, MachoError};
use vambrace_testutils::{
    build_code_directory, build_entitlements_blob, build_superblob, ImageBuilder, VIRTUAL_BASE,
};

const CSSLOT_CODEDIRECTORY: u32 = 0;
const CSSLOT_ENTITLEMENTS: u32 = 5;
const CSSLOT_REQUIREMENTS: u32 = 2;

const ENTITLEMENTS_XML: &[u8] =
    b"<?xml version=\"1.0\"?><plist><dict><key>get-task-allow</key><true/></dict></plist>";

fn signed_binary(blob: Vec<u8>) -> (NamedTempFile, MachoBinary) {
    let mut builder = ImageBuilder::new();
    builder
        .section("__TEXT", "__text", VIRTUAL_BASE + 0x4000, 0x40)
        .codesign_blob(blob);
    let image = builder.build();

    let mut tmp = NamedTempFile::new().unwrap();
    tmp.write_all(&image).unwrap();
    tmp.flush().unwrap();
    let binary = MachoArchive::open(tmp.path())
        .unwrap()
        .slice(0)
        .unwrap()
        .unwrap();
    (tmp, binary)
}

#[test]
fn test_superblob_with_team_id_and_entitlements() {
    let directory = build_code_directory("com.example.scanner", Some("59GAB85EFG"), 0x20200);
    let entitlements = build_entitlements_blob(ENTITLEMENTS_XML);
    let superblob = build_superblob(&[
        (CSSLOT_CODEDIRECTORY, directory),
        (CSSLOT_ENTITLEMENTS, entitlements),
    ]);

    let (_tmp, binary) = signed_binary(superblob);
    let signature = parse_code_signature(&binary).unwrap().unwrap();

    assert_eq!(signature.identifier.as_deref(), Some("com.example.scanner"));
    assert_eq!(signature.team_id.as_deref(), Some("59GAB85EFG"));
    assert_eq!(signature.entitlements.as_deref(), Some(ENTITLEMENTS_XML));
}

#[test]
fn test_old_code_directory_has_no_team_id() {
    // version 0x20100 predates the team-id field
    let directory = build_code_directory("com.example.scanner", None, 0x20100);
    let superblob = build_superblob(&[(CSSLOT_CODEDIRECTORY, directory)]);

    let (_tmp, binary) = signed_binary(superblob);
    let signature = parse_code_signature(&binary).unwrap().unwrap();

    assert_eq!(signature.identifier.as_deref(), Some("com.example.scanner"));
    assert_eq!(signature.team_id, None);
    assert_eq!(signature.entitlements, None);
}

#[test]
fn test_tolerated_blob_kinds_parse_to_nothing() {
    // a bare requirement-set blob is recognized but not descended into
    let mut requirement_set = 0xfade_0c01u32.to_be_bytes().to_vec();
    requirement_set.extend_from_slice(&12u32.to_be_bytes());
    requirement_set.extend_from_slice(&0u32.to_be_bytes());
    let superblob = build_superblob(&[(CSSLOT_REQUIREMENTS, requirement_set)]);

    let (_tmp, binary) = signed_binary(superblob);
    let signature = parse_code_signature(&binary).unwrap().unwrap();

    assert_eq!(signature.identifier, None);
    assert_eq!(signature.team_id, None);
    assert_eq!(signature.entitlements, None);
}

#[test]
fn test_unknown_blob_magic_is_an_error() {
    let mut bogus = 0xfade_ffffu32.to_be_bytes().to_vec();
    bogus.extend_from_slice(&8u32.to_be_bytes());

    let (_tmp, binary) = signed_binary(bogus);
    assert!(matches!(
        parse_code_signature(&binary),
        Err(MachoError::UnknownCodesignBlob(0xfade_ffff))
    ));
}

#[test]
fn test_unsigned_binary_has_no_signature() {
    let mut builder = ImageBuilder::new();
    builder.section("__TEXT", "__text", VIRTUAL_BASE + 0x4000, 0x40);
    let image = builder.build();

    let mut tmp = NamedTempFile::new().unwrap();
    tmp.write_all(&image).unwrap();
    tmp.flush().unwrap();
    let binary = MachoArchive::open(tmp.path())
        .unwrap()
        .slice(0)
        .unwrap()
        .unwrap();

    assert!(parse_code_signature(&binary).unwrap().is_none());
}
