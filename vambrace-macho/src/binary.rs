use std::borrow::Cow;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use scroll::{Endian, Pread};
use tracing::debug;

use vambrace_common::{ByteView, CpuType, MachoFileType};

use crate::error::MachoError;
use crate::raw;
use crate::raw::{
    DyldInfoCommand, DysymtabCommand, EncryptionInfoCommand64, LinkeditDataCommand, MachHeader64,
    Nlist64, Section64, SegmentCommand64, SymtabCommand,
};

/// Reads at or above this offset are rejected as virtual addresses.
const VIRTUAL_ADDRESS_FLOOR: u64 = 1 << 32;

/// Initial window of the NUL-terminator scan; doubles on each miss.
const STRING_WINDOW: u64 = 16;

/// Upper bound on the NUL-terminator scan.
const STRING_WINDOW_MAX: u64 = 8192;

/// A decoded Mach-O header flag.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum HeaderFlag {
    /// `MH_NOUNDEFS`
    NoUndefs,
    /// `MH_INCRLINK`
    IncrLink,
    /// `MH_DYLDLINK`
    DyldLink,
    /// `MH_BINDATLOAD`
    BindAtLoad,
    /// `MH_PREBOUND`
    Prebound,
    /// `MH_SPLIT_SEGS`
    SplitSegs,
    /// `MH_TWOLEVEL`
    TwoLevel,
    /// `MH_FORCE_FLAT`
    ForceFlat,
    /// `MH_WEAK_DEFINES`
    WeakDefines,
    /// `MH_BINDS_TO_WEAK`
    BindsToWeak,
    /// `MH_ALLOW_STACK_EXECUTION`
    AllowStackExecution,
    /// `MH_ROOT_SAFE`
    RootSafe,
    /// `MH_SETUID_SAFE`
    SetuidSafe,
    /// `MH_NO_REEXPORTED_DYLIBS`
    NoReexportedDylibs,
    /// `MH_PIE`
    Pie,
    /// `MH_HAS_TLV_DESCRIPTORS`
    HasTlvDescriptors,
    /// `MH_NO_HEAP_EXECUTION`
    NoHeapExecution,
}

const KNOWN_HEADER_FLAGS: &[(u32, HeaderFlag)] = &[
    (0x1, HeaderFlag::NoUndefs),
    (0x2, HeaderFlag::IncrLink),
    (0x4, HeaderFlag::DyldLink),
    (0x8, HeaderFlag::BindAtLoad),
    (0x10, HeaderFlag::Prebound),
    (0x20, HeaderFlag::SplitSegs),
    (0x80, HeaderFlag::TwoLevel),
    (0x100, HeaderFlag::ForceFlat),
    (0x8000, HeaderFlag::WeakDefines),
    (0x10000, HeaderFlag::BindsToWeak),
    (0x20000, HeaderFlag::AllowStackExecution),
    (0x40000, HeaderFlag::RootSafe),
    (0x80000, HeaderFlag::SetuidSafe),
    (0x100000, HeaderFlag::NoReexportedDylibs),
    (0x200000, HeaderFlag::Pie),
    (0x800000, HeaderFlag::HasTlvDescriptors),
    (0x1000000, HeaderFlag::NoHeapExecution),
];

/// A parsed section record together with its resolved bounds.
#[derive(Clone, Debug)]
pub struct MachoSection {
    /// The raw section record.
    pub cmd: Section64,
    /// Section name, trimmed at the first NUL. Kept as raw bytes; decode with
    /// [`MachoSection::name`] or [`MachoSection::name_lossy`].
    pub name: Vec<u8>,
    /// Owning segment name, trimmed at the first NUL.
    pub segment: Vec<u8>,
    /// Virtual address of the section.
    pub address: u64,
    /// File offset of the section content.
    pub offset: u64,
    /// Size of the section in bytes.
    pub size: u64,
    /// One past the last virtual address of the section.
    pub end_address: u64,
}

impl MachoSection {
    /// The section name as UTF-8.
    pub fn name(&self) -> Result<&str, MachoError> {
        std::str::from_utf8(&self.name).map_err(|_| MachoError::MalformedString(self.address))
    }

    /// The section name, replacing invalid UTF-8.
    pub fn name_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.name)
    }

    /// Whether the given virtual address falls within this section.
    pub fn contains(&self, address: u64) -> bool {
        self.address <= address && address < self.end_address
    }
}

/// A dylib load command with the file offset it was parsed from.
///
/// The offset is retained so the install-path string can be resolved from
/// `fileoff + cmd.name_offset`.
#[derive(Clone, Copy, Debug)]
pub struct MachoDylib {
    /// The raw dylib command.
    pub cmd: raw::DylibCommand,
    /// File offset of the command within the slice.
    pub fileoff: u64,
}

/// A parsed view of one 64-bit Mach-O slice.
///
/// Constructed through [`crate::MachoArchive`]; parsing succeeds only for
/// supported 64-bit magic values. All tables preserve load-command
/// declaration order.
pub struct MachoBinary {
    path: PathBuf,
    view: ByteView,
    fat_offset: u64,
    size: u64,

    /// Whether the slice magic is 64-bit. Always true for parseable slices.
    pub is_64bit: bool,
    /// Whether the slice is stored in the opposite byte order to the magic's
    /// canonical little-endian form.
    pub is_swapped: bool,
    endian: Endian,
    /// CPU target decoded from the header.
    pub cpu_type: CpuType,
    /// File type decoded from the header.
    pub file_type: MachoFileType,
    /// The raw Mach-O header.
    pub header: MachHeader64,
    /// Header flags decoded bitwise from the known flag set.
    pub header_flags: Vec<HeaderFlag>,

    segments: IndexMap<Vec<u8>, SegmentCommand64>,
    sections: IndexMap<Vec<u8>, MachoSection>,

    /// `LC_SYMTAB`, when present.
    pub symtab: Option<SymtabCommand>,
    /// `LC_DYSYMTAB`, when present.
    pub dysymtab: Option<DysymtabCommand>,
    /// `LC_ENCRYPTION_INFO_64`, when present.
    pub encryption_info: Option<EncryptionInfoCommand64>,
    /// `LC_CODE_SIGNATURE`, when present.
    pub code_signature: Option<LinkeditDataCommand>,
    /// `LC_DYLD_INFO` / `LC_DYLD_INFO_ONLY`, when present.
    pub dyld_info: Option<DyldInfoCommand>,
    /// Dylib load commands in declaration order.
    pub load_dylib_commands: Vec<MachoDylib>,

    load_commands_end: u64,
    symbols: Vec<Nlist64>,
}

impl MachoBinary {
    /// Parses the slice of `view` starting at `fat_offset`.
    ///
    /// Succeeds iff the slice magic is a supported 64-bit Mach-O magic.
    pub fn parse(
        path: &Path,
        view: ByteView,
        fat_offset: u64,
        slice_size: u64,
    ) -> Result<Self, MachoError> {
        let available = (view.len() as u64).saturating_sub(fat_offset);
        let size = slice_size.min(available);

        let magic = read_u32(&view, fat_offset, size)?;
        if magic != raw::MH_MAGIC_64 && magic != raw::MH_CIGAM_64 {
            return Err(MachoError::UnsupportedFormat {
                path: path.to_owned(),
                offset: fat_offset,
                magic,
            });
        }
        let is_swapped = magic == raw::MH_CIGAM_64;
        // the probe read is little-endian, so a swapped magic means the slice
        // is stored big-endian
        let endian = if is_swapped {
            Endian::Big
        } else {
            Endian::Little
        };

        let header_bytes = slice_bytes(&view, fat_offset, size, 0, raw::MACH_HEADER_64_SIZE as u64)?;
        let header: MachHeader64 = header_bytes.pread_with(0, endian)?;

        debug!(
            path = %path.display(),
            offset = fat_offset,
            swapped = is_swapped,
            "parsing Mach-O slice"
        );

        let mut binary = MachoBinary {
            path: path.to_owned(),
            view,
            fat_offset,
            size,
            is_64bit: true,
            is_swapped,
            endian,
            cpu_type: CpuType::from_mach(header.cputype),
            file_type: MachoFileType::from_mach(header.filetype),
            header_flags: decode_header_flags(header.flags),
            header,
            segments: IndexMap::new(),
            sections: IndexMap::new(),
            symtab: None,
            dysymtab: None,
            encryption_info: None,
            code_signature: None,
            dyld_info: None,
            load_dylib_commands: Vec::new(),
            load_commands_end: raw::MACH_HEADER_64_SIZE as u64 + header.sizeofcmds as u64,
            symbols: Vec::new(),
        };

        binary.parse_load_commands()?;
        binary.symbols = binary.parse_symtab_contents()?;
        Ok(binary)
    }

    fn parse_load_commands(&mut self) -> Result<(), MachoError> {
        let mut offset = raw::MACH_HEADER_64_SIZE as u64;
        let end = self.load_commands_end;

        for _ in 0..self.header.ncmds {
            let lc: raw::LoadCommand = self.bytes(offset, 8)?.pread_with(0, self.endian)?;
            if lc.cmdsize < 8 || offset + lc.cmdsize as u64 > end {
                return Err(self.malformed(offset, "load command exceeds declared size"));
            }

            match lc.cmd {
                // 32-bit segments are recognized but not parsed
                raw::LC_SEGMENT => {
                    debug!(offset, "skipping 32-bit LC_SEGMENT");
                }
                raw::LC_SEGMENT_64 => self.parse_segment(offset)?,
                raw::LC_SYMTAB => {
                    self.symtab = Some(self.bytes(offset, 24)?.pread_with(0, self.endian)?);
                }
                raw::LC_DYSYMTAB => {
                    self.dysymtab = Some(self.bytes(offset, 80)?.pread_with(0, self.endian)?);
                }
                raw::LC_ENCRYPTION_INFO_64 => {
                    self.encryption_info =
                        Some(self.bytes(offset, 24)?.pread_with(0, self.endian)?);
                }
                raw::LC_CODE_SIGNATURE => {
                    self.code_signature = Some(self.bytes(offset, 16)?.pread_with(0, self.endian)?);
                }
                raw::LC_DYLD_INFO | raw::LC_DYLD_INFO_ONLY => {
                    self.dyld_info = Some(self.bytes(offset, 48)?.pread_with(0, self.endian)?);
                }
                raw::LC_LOAD_DYLIB | raw::LC_LOAD_WEAK_DYLIB => {
                    let cmd: raw::DylibCommand = self.bytes(offset, 24)?.pread_with(0, self.endian)?;
                    self.load_dylib_commands.push(MachoDylib {
                        cmd,
                        fileoff: offset,
                    });
                }
                other => {
                    debug!(cmd = other, offset, "skipping load command");
                }
            }

            offset += lc.cmdsize as u64;
        }

        if offset != end {
            return Err(self.malformed(offset, "load commands do not span sizeofcmds"));
        }
        Ok(())
    }

    fn parse_segment(&mut self, offset: u64) -> Result<(), MachoError> {
        let segment: SegmentCommand64 = self
            .bytes(offset, raw::SEGMENT_COMMAND_64_SIZE as u64)?
            .pread_with(0, self.endian)?;
        let segname = trim_name(&segment.segname);

        // the segment's section records follow the command contiguously
        let mut section_offset = offset + raw::SEGMENT_COMMAND_64_SIZE as u64;
        for _ in 0..segment.nsects {
            let cmd: Section64 = self
                .bytes(section_offset, raw::SECTION_64_SIZE as u64)?
                .pread_with(0, self.endian)?;
            let section = MachoSection {
                name: trim_name(&cmd.sectname),
                segment: trim_name(&cmd.segname),
                address: cmd.addr,
                offset: cmd.offset as u64,
                size: cmd.size,
                end_address: cmd.addr + cmd.size,
                cmd,
            };
            self.sections.insert(section.name.clone(), section);
            section_offset += raw::SECTION_64_SIZE as u64;
        }

        self.segments.insert(segname, segment);
        Ok(())
    }

    fn parse_symtab_contents(&self) -> Result<Vec<Nlist64>, MachoError> {
        let symtab = match self.symtab {
            Some(symtab) => symtab,
            None => return Ok(Vec::new()),
        };

        let mut symbols = Vec::with_capacity(symtab.nsyms as usize);
        let mut offset = symtab.symoff as u64;
        for _ in 0..symtab.nsyms {
            let nlist: Nlist64 = self
                .bytes(offset, raw::NLIST_64_SIZE as u64)?
                .pread_with(0, self.endian)?;
            symbols.push(nlist);
            offset += raw::NLIST_64_SIZE as u64;
        }
        Ok(symbols)
    }

    fn malformed(&self, offset: u64, reason: &'static str) -> MachoError {
        MachoError::MalformedHeader {
            path: self.path.clone(),
            offset,
            reason,
        }
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset of this slice within a FAT container, 0 for thin files.
    pub fn fat_offset(&self) -> u64 {
        self.fat_offset
    }

    /// The endianness Mach-O structures of this slice decode with.
    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// Reads `size` bytes at `offset` from the start of the slice.
    ///
    /// Fails with [`MachoError::OutOfBounds`] past the end of the slice, and
    /// with [`MachoError::LooksLikeVirtualAddress`] for offsets at or above
    /// 2³² (the caller should have translated through
    /// [`MachoBinary::file_offset_for_virtual_address`] first).
    pub fn bytes(&self, offset: u64, size: u64) -> Result<&[u8], MachoError> {
        if offset >= VIRTUAL_ADDRESS_FLOOR {
            return Err(MachoError::LooksLikeVirtualAddress(offset));
        }
        slice_bytes(&self.view, self.fat_offset, self.size, offset, size)
    }

    /// The virtual address this image requests to be loaded at: the `vmaddr`
    /// of the `__TEXT` segment.
    pub fn virtual_base(&self) -> u64 {
        self.segments
            .get(b"__TEXT".as_slice())
            .map(|segment| segment.vmaddr)
            .unwrap_or(0)
    }

    /// Segment commands in declaration order, keyed by trimmed name bytes.
    pub fn segment_commands(&self) -> impl Iterator<Item = (&[u8], &SegmentCommand64)> + '_ {
        self.segments.iter().map(|(name, cmd)| (name.as_slice(), cmd))
    }

    /// Looks up a segment command by name.
    pub fn segment_named(&self, name: &str) -> Option<&SegmentCommand64> {
        self.segments.get(name.as_bytes())
    }

    /// Parsed sections in declaration order.
    pub fn sections(&self) -> impl Iterator<Item = &MachoSection> + '_ {
        self.sections.values()
    }

    /// Looks up a section by name.
    pub fn section_named(&self, name: &str) -> Option<&MachoSection> {
        self.sections.get(name.as_bytes())
    }

    /// Finds the section containing the given virtual address.
    ///
    /// When the address is past every declared section, the highest-addressed
    /// section is returned as a best-effort fallback; addresses below the
    /// virtual base yield `None`.
    pub fn section_for_address(&self, address: u64) -> Option<&MachoSection> {
        if address < self.virtual_base() {
            return None;
        }

        let mut highest: Option<&MachoSection> = None;
        for section in self.sections.values() {
            if section.contains(address) {
                return Some(section);
            }
            if highest.map(|s| section.address > s.address).unwrap_or(true) {
                highest = Some(section);
            }
        }
        highest
    }

    /// The name of the section containing the given virtual address.
    pub fn section_name_for_address(&self, address: u64) -> Option<Cow<'_, str>> {
        self.section_for_address(address).map(|s| s.name_lossy())
    }

    /// Translates a virtual address to a file offset within the slice.
    ///
    /// Addresses within the initial load-commands region translate directly;
    /// all others translate through the containing section. Fails with
    /// [`MachoError::UnmappedVirtualAddress`] when no section can be used.
    pub fn file_offset_for_virtual_address(&self, address: u64) -> Result<u64, MachoError> {
        let unslid = address.wrapping_sub(self.virtual_base());
        if unslid < self.load_commands_end {
            return Ok(unslid);
        }

        let section = self
            .section_for_address(address)
            .ok_or(MachoError::UnmappedVirtualAddress(address))?;
        Ok(address - section.address + section.offset)
    }

    /// Reads `size` bytes starting at a virtual address.
    pub fn bytes_at_address(&self, address: u64, size: u64) -> Result<&[u8], MachoError> {
        let offset = self.file_offset_for_virtual_address(address)?;
        self.bytes(offset, size)
    }

    /// Reads a little-endian-or-native pointer-sized word at a virtual
    /// address.
    pub fn read_pointer_at_address(&self, address: u64) -> Result<u64, MachoError> {
        Ok(self.bytes_at_address(address, 8)?.pread_with(0, self.endian)?)
    }

    /// Reads a 32-bit word at a virtual address.
    pub fn read_u32_at_address(&self, address: u64) -> Result<u32, MachoError> {
        Ok(self.bytes_at_address(address, 4)?.pread_with(0, self.endian)?)
    }

    /// Reads the NUL-terminated UTF-8 string starting at a file offset.
    ///
    /// Scans in exponentially growing chunks to avoid many short reads; fails
    /// with [`MachoError::MalformedString`] when no terminator appears within
    /// the bounded search window.
    pub fn read_string_at_offset(&self, offset: u64) -> Result<String, MachoError> {
        let mut collected = Vec::new();
        let mut cursor = offset;
        let mut window = STRING_WINDOW;

        loop {
            let remaining = self.size.saturating_sub(cursor);
            let chunk_len = window.min(remaining);
            if chunk_len == 0 {
                return Err(MachoError::MalformedString(offset));
            }

            let chunk = self.bytes(cursor, chunk_len)?;
            if let Some(pos) = chunk.iter().position(|&b| b == 0) {
                collected.extend_from_slice(&chunk[..pos]);
                return String::from_utf8(collected)
                    .map_err(|_| MachoError::MalformedString(offset));
            }

            collected.extend_from_slice(chunk);
            if collected.len() as u64 >= STRING_WINDOW_MAX {
                return Err(MachoError::MalformedString(offset));
            }
            cursor += chunk_len;
            window *= 2;
        }
    }

    /// Reads the NUL-terminated UTF-8 string starting at a virtual address.
    pub fn read_string_at_address(&self, address: u64) -> Result<String, MachoError> {
        let offset = self.file_offset_for_virtual_address(address)?;
        self.read_string_at_offset(offset)
    }

    /// Reads a string embedded in the binary at a virtual address.
    ///
    /// When the address lies in `__cfstring`, the CFString record is parsed
    /// first and the string is read from its `literal` pointer.
    pub fn read_embedded_string(&self, address: u64) -> Result<String, MachoError> {
        let in_cfstring = self
            .section_for_address(address)
            .map(|section| section.name == b"__cfstring")
            .unwrap_or(false);

        if in_cfstring {
            let bytes = self.bytes_at_address(address, raw::CFSTRING_64_SIZE as u64)?;
            let cfstring: raw::CFString64 = bytes.pread_with(0, self.endian)?;
            return self.read_string_at_address(cfstring.literal);
        }
        self.read_string_at_address(address)
    }

    /// The parsed symbol table, empty when no `LC_SYMTAB` is present.
    pub fn symtab_contents(&self) -> &[Nlist64] {
        &self.symbols
    }

    /// The raw string table described by `LC_SYMTAB`.
    pub fn string_table(&self) -> Result<&[u8], MachoError> {
        let symtab = self.symtab.ok_or(MachoError::MalformedString(0))?;
        self.bytes(symtab.stroff as u64, symtab.strsize as u64)
    }

    /// Resolves the name of a symbol-table entry from the string table.
    pub fn symbol_name(&self, nlist: &Nlist64) -> Result<String, MachoError> {
        let strtab = self.string_table()?;
        let start = nlist.n_strx as usize;
        let tail = strtab
            .get(start..)
            .ok_or(MachoError::MalformedString(start as u64))?;
        let end = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or(MachoError::MalformedString(start as u64))?;
        String::from_utf8(tail[..end].to_vec())
            .map_err(|_| MachoError::MalformedString(start as u64))
    }

    /// The indirect symbol table described by `LC_DYSYMTAB`: an array of
    /// symbol-table indices, one per stub or lazy/non-lazy pointer slot.
    pub fn indirect_symbol_table(&self) -> Result<Vec<u32>, MachoError> {
        let dysymtab = match self.dysymtab {
            Some(dysymtab) => dysymtab,
            None => return Ok(Vec::new()),
        };

        let mut entries = Vec::with_capacity(dysymtab.nindirectsyms as usize);
        let mut offset = dysymtab.indirectsymoff as u64;
        for _ in 0..dysymtab.nindirectsyms {
            entries.push(self.bytes(offset, 4)?.pread_with(0, self.endian)?);
            offset += 4;
        }
        Ok(entries)
    }

    /// Resolves the install path of a dylib load command.
    pub fn dylib_path(&self, dylib: &MachoDylib) -> Result<String, MachoError> {
        self.read_string_at_offset(dylib.fileoff + dylib.cmd.name_offset as u64)
    }

    /// Install paths of all dylib dependencies, in declaration order.
    /// Unresolvable names are skipped.
    pub fn dylib_install_paths(&self) -> Vec<String> {
        self.load_dylib_commands
            .iter()
            .filter_map(|dylib| match self.dylib_path(dylib) {
                Ok(path) => Some(path),
                Err(err) => {
                    debug!(error = %err, "skipping unresolvable dylib name");
                    None
                }
            })
            .collect()
    }

    /// Whether the image carries a nonzero FairPlay encryption identifier.
    pub fn is_encrypted(&self) -> bool {
        self.encryption_info
            .map(|info| info.cryptid != 0)
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for MachoBinary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachoBinary")
            .field("path", &self.path)
            .field("fat_offset", &self.fat_offset)
            .field("cpu_type", &self.cpu_type)
            .field("file_type", &self.file_type)
            .field("segments", &self.segments.len())
            .field("sections", &self.sections.len())
            .field("symbols", &self.symbols.len())
            .finish()
    }
}

fn decode_header_flags(bitset: u32) -> Vec<HeaderFlag> {
    KNOWN_HEADER_FLAGS
        .iter()
        .filter(|(mask, _)| bitset & mask == *mask)
        .map(|&(_, flag)| flag)
        .collect()
}

fn trim_name(name: &[u8; 16]) -> Vec<u8> {
    let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
    name[..end].to_vec()
}

fn read_u32(view: &ByteView, base: u64, len: u64) -> Result<u32, MachoError> {
    Ok(slice_bytes(view, base, len, 0, 4)?.pread_with(0, Endian::Little)?)
}

fn slice_bytes(
    view: &ByteView,
    base: u64,
    len: u64,
    offset: u64,
    size: u64,
) -> Result<&[u8], MachoError> {
    let end = offset.checked_add(size).ok_or(MachoError::OutOfBounds {
        offset,
        size,
        len,
    })?;
    if end > len {
        return Err(MachoError::OutOfBounds { offset, size, len });
    }
    let start = (base + offset) as usize;
    Ok(&view[start..start + size as usize])
}
