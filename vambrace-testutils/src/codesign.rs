//! Big-endian code-signing blob construction.

const CSMAGIC_CODE_DIRECTORY: u32 = 0xfade_0c02;
const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade_0cc0;
const CSMAGIC_EMBEDDED_ENTITLEMENTS: u32 = 0xfade_7171;

/// Builds a CodeDirectory blob with the given identifier and, for versions
/// `0x20200` and later, an optional team identifier.
pub fn build_code_directory(identifier: &str, team_id: Option<&str>, version: u32) -> Vec<u8> {
    const HEADER_LEN: usize = 52;

    let identifier_offset = HEADER_LEN;
    let mut strings = identifier.as_bytes().to_vec();
    strings.push(0);

    let team_offset = if let Some(team) = team_id {
        let offset = HEADER_LEN + strings.len();
        strings.extend_from_slice(team.as_bytes());
        strings.push(0);
        offset as u32
    } else {
        0
    };

    let length = (HEADER_LEN + strings.len()) as u32;
    let mut blob = Vec::with_capacity(length as usize);
    blob.extend_from_slice(&CSMAGIC_CODE_DIRECTORY.to_be_bytes());
    blob.extend_from_slice(&length.to_be_bytes());
    blob.extend_from_slice(&version.to_be_bytes());
    blob.extend_from_slice(&0u32.to_be_bytes()); // flags
    blob.extend_from_slice(&0u32.to_be_bytes()); // hash offset
    blob.extend_from_slice(&(identifier_offset as u32).to_be_bytes());
    blob.extend_from_slice(&0u32.to_be_bytes()); // special slots
    blob.extend_from_slice(&0u32.to_be_bytes()); // code slots
    blob.extend_from_slice(&0u32.to_be_bytes()); // code limit
    blob.push(32); // hash size
    blob.push(2); // hash type
    blob.push(0); // platform
    blob.push(12); // page size
    blob.extend_from_slice(&0u32.to_be_bytes()); // unused
    blob.extend_from_slice(&0u32.to_be_bytes()); // scatter offset
    blob.extend_from_slice(&team_offset.to_be_bytes());
    blob.extend_from_slice(&strings);
    blob
}

/// Builds an embedded-entitlements blob around a verbatim payload.
pub fn build_entitlements_blob(payload: &[u8]) -> Vec<u8> {
    let length = (8 + payload.len()) as u32;
    let mut blob = Vec::with_capacity(length as usize);
    blob.extend_from_slice(&CSMAGIC_EMBEDDED_ENTITLEMENTS.to_be_bytes());
    blob.extend_from_slice(&length.to_be_bytes());
    blob.extend_from_slice(payload);
    blob
}

/// Wraps child blobs into an embedded-signature superblob. Each entry is a
/// `(slot type, blob)` pair.
pub fn build_superblob(children: &[(u32, Vec<u8>)]) -> Vec<u8> {
    let header_len = 12 + children.len() * 8;
    let mut offsets = Vec::new();
    let mut cursor = header_len;
    for (_, child) in children {
        offsets.push(cursor as u32);
        cursor += child.len();
    }

    let mut blob = Vec::with_capacity(cursor);
    blob.extend_from_slice(&CSMAGIC_EMBEDDED_SIGNATURE.to_be_bytes());
    blob.extend_from_slice(&(cursor as u32).to_be_bytes());
    blob.extend_from_slice(&(children.len() as u32).to_be_bytes());
    for ((slot, _), offset) in children.iter().zip(&offsets) {
        blob.extend_from_slice(&slot.to_be_bytes());
        blob.extend_from_slice(&offset.to_be_bytes());
    }
    for (_, child) in children {
        blob.extend_from_slice(child);
    }
    blob
}
