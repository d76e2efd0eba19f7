//! Parsing of the embedded code-signing superblob.
//!
//! Code-signing structures are big-endian regardless of the slice's
//! endianness; every read in this module carries an explicit
//! [`scroll::Endian::Big`] context.

use scroll::{Endian, Pread};
use tracing::debug;

use crate::binary::MachoBinary;
use crate::error::MachoError;

/// Single requirement blob.
pub const CSMAGIC_REQUIREMENT: u32 = 0xfade_0c00;
/// Requirements vector (internal requirements).
pub const CSMAGIC_REQUIREMENT_SET: u32 = 0xfade_0c01;
/// CodeDirectory blob.
pub const CSMAGIC_CODE_DIRECTORY: u32 = 0xfade_0c02;
/// Embedded signature superblob.
pub const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade_0cc0;
/// Multi-arch collection of embedded signatures.
pub const CSMAGIC_DETACHED_SIGNATURE: u32 = 0xfade_0cc1;
/// Embedded entitlements plist.
pub const CSMAGIC_EMBEDDED_ENTITLEMENTS: u32 = 0xfade_7171;
/// CMS signature wrapper.
pub const CSMAGIC_BLOBWRAPPER: u32 = 0xfade_0b01;

/// Code directories at or above this version carry a team identifier.
const CODE_DIRECTORY_SUPPORTS_TEAM_ID: u32 = 0x20200;

/// Common header of every code-signing blob.
#[derive(Clone, Copy, Debug, Pread)]
pub struct CsBlob {
    /// Blob magic.
    pub magic: u32,
    /// Total blob length, header included.
    pub length: u32,
}

/// Superblob header; index records follow.
#[derive(Clone, Copy, Debug, Pread)]
pub struct CsSuperblob {
    /// [`CSMAGIC_EMBEDDED_SIGNATURE`].
    pub magic: u32,
    /// Total superblob length.
    pub length: u32,
    /// Number of [`CsBlobIndex`] records that follow.
    pub index_entry_count: u32,
}

/// One index record of a superblob, pointing at a child blob.
#[derive(Clone, Copy, Debug, Pread)]
pub struct CsBlobIndex {
    /// Slot type of the child blob.
    pub slot_type: u32,
    /// Offset of the child blob, relative to the signature entry.
    pub offset: u32,
}

/// The interesting prefix of a CodeDirectory blob.
///
/// Fields past `code_limit` only exist from particular versions on; the
/// parser consults `version` before trusting them.
#[derive(Clone, Copy, Debug, Pread)]
pub struct CsCodeDirectory {
    /// [`CSMAGIC_CODE_DIRECTORY`].
    pub magic: u32,
    /// Total blob length.
    pub length: u32,
    /// Layout version of the directory.
    pub version: u32,
    /// Setup and mode flags.
    pub flags: u32,
    /// Offset of the hash slot array.
    pub hash_offset: u32,
    /// Offset of the NUL-terminated signing identifier.
    pub identifier_offset: u32,
    /// Number of special hash slots.
    pub special_slots_count: u32,
    /// Number of ordinary code hash slots.
    pub code_slots_count: u32,
    /// Limit to the main image signature range.
    pub code_limit: u32,
    /// Size of each hash in bytes.
    pub hash_size: u8,
    /// Hash algorithm identifier.
    pub hash_type: u8,
    /// Platform identifier, or 0.
    pub platform: u8,
    /// `log2(page size)`.
    pub page_size: u8,
    /// Unused, 0.
    pub unused: u32,
    /// Offset of the scatter vector; version `0x20100` and later.
    pub scatter_offset: u32,
    /// Offset of the NUL-terminated team identifier; version `0x20200` and
    /// later.
    pub team_offset: u32,
}

/// The signing information recovered from the embedded superblob.
#[derive(Clone, Debug, Default)]
pub struct CodeSignature {
    /// The signing identifier from the code directory.
    pub identifier: Option<String>,
    /// The team identifier; present only for code directories of version
    /// `0x20200` and later.
    pub team_id: Option<String>,
    /// The embedded entitlements payload, verbatim. Callers decode the plist
    /// themselves.
    pub entitlements: Option<Vec<u8>>,
}

/// Parses the code-signing superblob referenced by `LC_CODE_SIGNATURE`.
///
/// Returns `Ok(None)` when the binary carries no code signature. Unknown
/// blob magics fail with [`MachoError::UnknownCodesignBlob`].
pub fn parse_code_signature(binary: &MachoBinary) -> Result<Option<CodeSignature>, MachoError> {
    let cmd = match binary.code_signature {
        Some(cmd) => cmd,
        None => return Ok(None),
    };

    let entry = cmd.dataoff as u64;
    let mut signature = CodeSignature::default();
    parse_blob(binary, entry, entry, &mut signature)?;
    Ok(Some(signature))
}

fn parse_blob(
    binary: &MachoBinary,
    entry: u64,
    offset: u64,
    out: &mut CodeSignature,
) -> Result<(), MachoError> {
    let magic: u32 = binary.bytes(offset, 4)?.pread_with(0, Endian::Big)?;

    match magic {
        CSMAGIC_EMBEDDED_SIGNATURE => parse_superblob(binary, entry, offset, out),
        CSMAGIC_CODE_DIRECTORY => parse_code_directory(binary, offset, out),
        CSMAGIC_EMBEDDED_ENTITLEMENTS => parse_entitlements(binary, offset, out),
        CSMAGIC_REQUIREMENT
        | CSMAGIC_REQUIREMENT_SET
        | CSMAGIC_DETACHED_SIGNATURE
        | CSMAGIC_BLOBWRAPPER => {
            debug!(magic, offset, "tolerated code-signing blob");
            Ok(())
        }
        other => Err(MachoError::UnknownCodesignBlob(other)),
    }
}

fn parse_superblob(
    binary: &MachoBinary,
    entry: u64,
    offset: u64,
    out: &mut CodeSignature,
) -> Result<(), MachoError> {
    let superblob: CsSuperblob = binary.bytes(offset, 12)?.pread_with(0, Endian::Big)?;

    // index records follow the superblob header; each child blob offset is
    // relative to the signature entry
    let mut index_offset = offset + 12;
    for _ in 0..superblob.index_entry_count {
        let index: CsBlobIndex = binary.bytes(index_offset, 8)?.pread_with(0, Endian::Big)?;
        parse_blob(binary, entry, entry + index.offset as u64, out)?;
        index_offset += 8;
    }
    Ok(())
}

fn parse_code_directory(
    binary: &MachoBinary,
    offset: u64,
    out: &mut CodeSignature,
) -> Result<(), MachoError> {
    let directory: CsCodeDirectory = binary.bytes(offset, 52)?.pread_with(0, Endian::Big)?;

    out.identifier =
        Some(binary.read_string_at_offset(offset + directory.identifier_offset as u64)?);

    // the team-id field only exists from version 0x20200 on; older directories
    // end before it and must not be read past their declared length
    if directory.version >= CODE_DIRECTORY_SUPPORTS_TEAM_ID
        && directory.team_offset != 0
        && (directory.team_offset as u64) < directory.length as u64
    {
        out.team_id = Some(binary.read_string_at_offset(offset + directory.team_offset as u64)?);
    }
    Ok(())
}

fn parse_entitlements(
    binary: &MachoBinary,
    offset: u64,
    out: &mut CodeSignature,
) -> Result<(), MachoError> {
    let blob: CsBlob = binary.bytes(offset, 8)?.pread_with(0, Endian::Big)?;
    let payload_len = (blob.length as u64).saturating_sub(8);
    let payload = binary.bytes(offset + 8, payload_len)?;
    out.entitlements = Some(payload.to_vec());
    Ok(())
}
