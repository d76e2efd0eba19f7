//! Interpretation of the compressed dyld rebase/bind opcode streams.
//!
//! Raw pointer fields in `__objc_*` sections are typically zero on disk and
//! only filled in by dyld at load time. The streams referenced by
//! `LC_DYLD_INFO` describe those fix-ups; interpreting them yields a map from
//! the virtual address of each pointer field to either its local target (for
//! rebases) or the `(library ordinal, symbol name)` pair it binds to.

use std::collections::HashMap;

use tracing::debug;

use vambrace_macho::MachoBinary;

const REBASE_OPCODE_MASK: u8 = 0xf0;
const REBASE_IMMEDIATE_MASK: u8 = 0x0f;
const REBASE_OPCODE_DONE: u8 = 0x00;
const REBASE_OPCODE_SET_TYPE_IMM: u8 = 0x10;
const REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x20;
const REBASE_OPCODE_ADD_ADDR_ULEB: u8 = 0x30;
const REBASE_OPCODE_ADD_ADDR_IMM_SCALED: u8 = 0x40;
const REBASE_OPCODE_DO_REBASE_IMM_TIMES: u8 = 0x50;
const REBASE_OPCODE_DO_REBASE_ULEB_TIMES: u8 = 0x60;
const REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB: u8 = 0x70;
const REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB: u8 = 0x80;

const BIND_OPCODE_MASK: u8 = 0xf0;
const BIND_IMMEDIATE_MASK: u8 = 0x0f;
const BIND_OPCODE_DONE: u8 = 0x00;
const BIND_OPCODE_SET_DYLIB_ORDINAL_IMM: u8 = 0x10;
const BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB: u8 = 0x20;
const BIND_OPCODE_SET_DYLIB_SPECIAL_IMM: u8 = 0x30;
const BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM: u8 = 0x40;
const BIND_OPCODE_SET_TYPE_IMM: u8 = 0x50;
const BIND_OPCODE_SET_ADDEND_SLEB: u8 = 0x60;
const BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x70;
const BIND_OPCODE_ADD_ADDR_ULEB: u8 = 0x80;
const BIND_OPCODE_DO_BIND: u8 = 0x90;
const BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB: u8 = 0xa0;
const BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED: u8 = 0xb0;
const BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB: u8 = 0xc0;

const POINTER_SIZE: u64 = 8;

/// One dyld fix-up of a pointer field.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DyldFixup {
    /// The field is slid in place; `target` is the unslid pointer value
    /// stored in the file.
    Rebase {
        /// The pointer value stored at the fixed-up address.
        target: u64,
    },
    /// The field is bound to an imported symbol.
    Bind {
        /// Two-level-namespace library ordinal, 1-based. Special ordinals
        /// (self, main executable, flat lookup) are ≤ 0.
        library_ordinal: i64,
        /// Name of the imported symbol.
        symbol_name: String,
    },
}

/// The fix-up map produced by walking the dyld info streams.
#[derive(Debug, Default)]
pub struct DyldInfo {
    fixups: HashMap<u64, DyldFixup>,
}

impl DyldInfo {
    /// Interprets the rebase and bind streams of the given slice.
    ///
    /// Parsing is best-effort: a binary without `LC_DYLD_INFO`, or with a
    /// malformed stream, yields the fix-ups recovered so far.
    pub fn parse(binary: &MachoBinary) -> Self {
        let mut info = DyldInfo::default();

        let cmd = match binary.dyld_info {
            Some(cmd) => cmd,
            None => return info,
        };

        let segments: Vec<u64> = binary
            .segment_commands()
            .map(|(_, segment)| segment.vmaddr)
            .collect();

        info.walk_rebases(binary, &segments, cmd.rebase_off as u64, cmd.rebase_size as u64);
        for (off, size, lazy) in [
            (cmd.bind_off, cmd.bind_size, false),
            (cmd.weak_bind_off, cmd.weak_bind_size, false),
            (cmd.lazy_bind_off, cmd.lazy_bind_size, true),
        ] {
            info.walk_binds(binary, &segments, off as u64, size as u64, lazy);
        }
        info
    }

    /// The fix-up recorded for a pointer field, if any.
    pub fn fixup_at(&self, address: u64) -> Option<&DyldFixup> {
        self.fixups.get(&address)
    }

    /// The symbol name a pointer field is bound to, if it is a bind.
    pub fn bound_symbol_at(&self, address: u64) -> Option<&str> {
        match self.fixups.get(&address) {
            Some(DyldFixup::Bind { symbol_name, .. }) => Some(symbol_name),
            _ => None,
        }
    }

    /// The stored local target of a rebased pointer field, if it is a rebase.
    pub fn rebase_target_at(&self, address: u64) -> Option<u64> {
        match self.fixups.get(&address) {
            Some(DyldFixup::Rebase { target }) => Some(*target),
            _ => None,
        }
    }

    /// Number of recorded fix-ups.
    pub fn len(&self) -> usize {
        self.fixups.len()
    }

    /// Whether no fix-ups were recovered.
    pub fn is_empty(&self) -> bool {
        self.fixups.is_empty()
    }

    /// Iterates over all recorded fix-ups.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &DyldFixup)> + '_ {
        self.fixups.iter().map(|(addr, fixup)| (*addr, fixup))
    }

    fn record_rebase(&mut self, binary: &MachoBinary, address: u64) {
        match binary.read_pointer_at_address(address) {
            Ok(target) => {
                self.fixups.insert(address, DyldFixup::Rebase { target });
            }
            Err(err) => {
                debug!(address, error = %err, "skipping unreadable rebase target");
            }
        }
    }

    fn walk_rebases(&mut self, binary: &MachoBinary, segments: &[u64], off: u64, size: u64) {
        if size == 0 {
            return;
        }
        let stream = match binary.bytes(off, size) {
            Ok(stream) => stream,
            Err(err) => {
                debug!(error = %err, "rebase stream is unreadable");
                return;
            }
        };

        let mut pos = 0usize;
        let mut address = 0u64;

        while pos < stream.len() {
            let byte = stream[pos];
            pos += 1;
            let opcode = byte & REBASE_OPCODE_MASK;
            let immediate = byte & REBASE_IMMEDIATE_MASK;

            let result = (|| -> Option<()> {
                match opcode {
                    REBASE_OPCODE_DONE => return None,
                    REBASE_OPCODE_SET_TYPE_IMM => {}
                    REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                        let offset = read_uleb128(stream, &mut pos)?;
                        address = segments.get(immediate as usize).copied()?.wrapping_add(offset);
                    }
                    REBASE_OPCODE_ADD_ADDR_ULEB => {
                        address = address.wrapping_add(read_uleb128(stream, &mut pos)?);
                    }
                    REBASE_OPCODE_ADD_ADDR_IMM_SCALED => {
                        address = address.wrapping_add(immediate as u64 * POINTER_SIZE);
                    }
                    REBASE_OPCODE_DO_REBASE_IMM_TIMES => {
                        for _ in 0..immediate {
                            self.record_rebase(binary, address);
                            address = address.wrapping_add(POINTER_SIZE);
                        }
                    }
                    REBASE_OPCODE_DO_REBASE_ULEB_TIMES => {
                        let count = read_uleb128(stream, &mut pos)?;
                        for _ in 0..count {
                            self.record_rebase(binary, address);
                            address = address.wrapping_add(POINTER_SIZE);
                        }
                    }
                    REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB => {
                        self.record_rebase(binary, address);
                        let extra = read_uleb128(stream, &mut pos)?;
                        address = address.wrapping_add(POINTER_SIZE.wrapping_add(extra));
                    }
                    REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB => {
                        let count = read_uleb128(stream, &mut pos)?;
                        let skip = read_uleb128(stream, &mut pos)?;
                        for _ in 0..count {
                            self.record_rebase(binary, address);
                            address = address.wrapping_add(POINTER_SIZE.wrapping_add(skip));
                        }
                    }
                    unknown => {
                        debug!(opcode = unknown, "unknown rebase opcode, aborting stream");
                        return None;
                    }
                }
                Some(())
            })();

            if result.is_none() {
                return;
            }
        }
    }

    fn walk_binds(
        &mut self,
        binary: &MachoBinary,
        segments: &[u64],
        off: u64,
        size: u64,
        lazy: bool,
    ) {
        if size == 0 {
            return;
        }
        let stream = match binary.bytes(off, size) {
            Ok(stream) => stream,
            Err(err) => {
                debug!(error = %err, "bind stream is unreadable");
                return;
            }
        };

        let mut pos = 0usize;
        let mut address = 0u64;
        let mut ordinal: i64 = 0;
        let mut symbol_name = String::new();

        while pos < stream.len() {
            let byte = stream[pos];
            pos += 1;
            let opcode = byte & BIND_OPCODE_MASK;
            let immediate = byte & BIND_IMMEDIATE_MASK;

            let result = (|| -> Option<()> {
                match opcode {
                    // in the lazy stream DONE merely delimits entries
                    BIND_OPCODE_DONE => {
                        if !lazy {
                            return None;
                        }
                    }
                    BIND_OPCODE_SET_DYLIB_ORDINAL_IMM => ordinal = immediate as i64,
                    BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => {
                        ordinal = read_uleb128(stream, &mut pos)? as i64;
                    }
                    BIND_OPCODE_SET_DYLIB_SPECIAL_IMM => {
                        // sign-extend the 4-bit special ordinal
                        ordinal = if immediate == 0 {
                            0
                        } else {
                            (immediate as i64) | !(BIND_IMMEDIATE_MASK as i64)
                        };
                    }
                    BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => {
                        let start = pos;
                        let end = stream[pos..].iter().position(|&b| b == 0)? + pos;
                        symbol_name = String::from_utf8_lossy(&stream[start..end]).into_owned();
                        pos = end + 1;
                    }
                    BIND_OPCODE_SET_TYPE_IMM => {}
                    BIND_OPCODE_SET_ADDEND_SLEB => {
                        read_sleb128(stream, &mut pos)?;
                    }
                    BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                        let offset = read_uleb128(stream, &mut pos)?;
                        address = segments.get(immediate as usize).copied()?.wrapping_add(offset);
                    }
                    BIND_OPCODE_ADD_ADDR_ULEB => {
                        address = address.wrapping_add(read_uleb128(stream, &mut pos)?);
                    }
                    BIND_OPCODE_DO_BIND => {
                        self.record_bind(address, ordinal, &symbol_name);
                        address = address.wrapping_add(POINTER_SIZE);
                    }
                    BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB => {
                        self.record_bind(address, ordinal, &symbol_name);
                        let extra = read_uleb128(stream, &mut pos)?;
                        address = address.wrapping_add(POINTER_SIZE.wrapping_add(extra));
                    }
                    BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED => {
                        self.record_bind(address, ordinal, &symbol_name);
                        address = address
                            .wrapping_add(POINTER_SIZE + immediate as u64 * POINTER_SIZE);
                    }
                    BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB => {
                        let count = read_uleb128(stream, &mut pos)?;
                        let skip = read_uleb128(stream, &mut pos)?;
                        for _ in 0..count {
                            self.record_bind(address, ordinal, &symbol_name);
                            address = address.wrapping_add(POINTER_SIZE.wrapping_add(skip));
                        }
                    }
                    unknown => {
                        debug!(opcode = unknown, "unknown bind opcode, aborting stream");
                        return None;
                    }
                }
                Some(())
            })();

            if result.is_none() {
                return;
            }
        }
    }

    fn record_bind(&mut self, address: u64, ordinal: i64, symbol_name: &str) {
        if symbol_name.is_empty() {
            debug!(address, "bind with empty symbol name");
            return;
        }
        self.fixups.insert(
            address,
            DyldFixup::Bind {
                library_ordinal: ordinal,
                symbol_name: symbol_name.to_owned(),
            },
        );
    }
}

/// Reads a ULEB128-encoded number, advancing `pos`.
fn read_uleb128(bytes: &[u8], pos: &mut usize) -> Option<u64> {
    const CONTINUATION_BIT: u8 = 1 << 7;

    let mut result: u64 = 0;
    let mut shift = 0u32;

    loop {
        let byte = *bytes.get(*pos)?;
        *pos += 1;
        if shift == 63 && byte != 0x00 && byte != 0x01 {
            return None;
        }

        result |= u64::from(byte & !CONTINUATION_BIT) << shift;
        if byte & CONTINUATION_BIT == 0 {
            return Some(result);
        }
        shift += 7;
    }
}

/// Reads an SLEB128-encoded number, advancing `pos`.
fn read_sleb128(bytes: &[u8], pos: &mut usize) -> Option<i64> {
    const CONTINUATION_BIT: u8 = 1 << 7;
    const SIGN_BIT: u8 = 1 << 6;

    let mut result: i64 = 0;
    let mut shift = 0u32;
    let mut byte;

    loop {
        byte = *bytes.get(*pos)?;
        *pos += 1;
        result |= i64::from(byte & !CONTINUATION_BIT) << shift;
        shift += 7;
        if byte & CONTINUATION_BIT == 0 {
            break;
        }
    }

    if shift < 64 && byte & SIGN_BIT != 0 {
        result |= -1i64 << shift;
    }
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_uleb128() {
        let mut pos = 0;
        assert_eq!(read_uleb128(&[0x00], &mut pos), Some(0));
        let mut pos = 0;
        assert_eq!(read_uleb128(&[0xe5, 0x8e, 0x26], &mut pos), Some(624485));
        assert_eq!(pos, 3);
        let mut pos = 0;
        assert_eq!(read_uleb128(&[0x80], &mut pos), None);
    }

    #[test]
    fn test_read_sleb128() {
        let mut pos = 0;
        assert_eq!(read_sleb128(&[0x7f], &mut pos), Some(-1));
        let mut pos = 0;
        assert_eq!(read_sleb128(&[0xc0, 0xbb, 0x78], &mut pos), Some(-123456));
    }
}
