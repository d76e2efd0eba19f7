//! Raw on-disk Mach-O structures.
//!
//! Every struct here is decoded with an explicit [`scroll::Endian`] context at
//! the read boundary; nothing is cast out of a byte buffer directly. Mach-O
//! structures use the slice's native endianness, FAT headers and code-signing
//! structures are big-endian (see [`crate::codesign`]).

use scroll::Pread;

/// 64-bit little-endian Mach-O magic.
pub const MH_MAGIC_64: u32 = 0xfeed_facf;
/// 64-bit byte-swapped Mach-O magic.
pub const MH_CIGAM_64: u32 = 0xcffa_edfe;
/// 32-bit little-endian Mach-O magic.
pub const MH_MAGIC: u32 = 0xfeed_face;
/// 32-bit byte-swapped Mach-O magic.
pub const MH_CIGAM: u32 = 0xcefa_edfe;
/// FAT container magic, as read big-endian.
pub const FAT_MAGIC: u32 = 0xcafe_babe;
/// FAT container magic of a byte-swapped container.
pub const FAT_CIGAM: u32 = 0xbeba_feca;

/// `LC_SEGMENT` — 32-bit segment, skipped by this parser.
pub const LC_SEGMENT: u32 = 0x1;
/// `LC_SYMTAB` — symbol-table location.
pub const LC_SYMTAB: u32 = 0x2;
/// `LC_DYSYMTAB` — dynamic symbol-table location.
pub const LC_DYSYMTAB: u32 = 0xb;
/// `LC_LOAD_DYLIB` — dylib dependency.
pub const LC_LOAD_DYLIB: u32 = 0xc;
/// `LC_LOAD_WEAK_DYLIB` — weakly linked dylib dependency.
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x8000_0018;
/// `LC_SEGMENT_64` — 64-bit segment with trailing section records.
pub const LC_SEGMENT_64: u32 = 0x19;
/// `LC_CODE_SIGNATURE` — location of the embedded signature superblob.
pub const LC_CODE_SIGNATURE: u32 = 0x1d;
/// `LC_DYLD_INFO` — compressed dyld rebase/bind/export streams.
pub const LC_DYLD_INFO: u32 = 0x22;
/// `LC_DYLD_INFO_ONLY` — same as [`LC_DYLD_INFO`], required by dyld.
pub const LC_DYLD_INFO_ONLY: u32 = 0x8000_0022;
/// `LC_ENCRYPTION_INFO_64` — FairPlay encryption extent.
pub const LC_ENCRYPTION_INFO_64: u32 = 0x2c;

/// `N_STAB` mask of `nlist_64::n_type`.
pub const N_STAB: u8 = 0xe0;
/// `N_TYPE` mask of `nlist_64::n_type`.
pub const N_TYPE: u8 = 0x0e;
/// `N_UNDF` value of the `N_TYPE` field: undefined (imported) symbol.
pub const N_UNDF: u8 = 0x0;
/// `N_SECT` value of the `N_TYPE` field: defined in a section.
pub const N_SECT: u8 = 0xe;
/// `N_EXT` bit of `nlist_64::n_type`: externally visible.
pub const N_EXT: u8 = 0x01;

/// Slot value in the indirect symbol table for a local symbol.
pub const INDIRECT_SYMBOL_LOCAL: u32 = 0x8000_0000;
/// Slot value in the indirect symbol table for an absolute symbol.
pub const INDIRECT_SYMBOL_ABS: u32 = 0x4000_0000;

/// Extracts the two-level-namespace library ordinal from `nlist_64::n_desc`.
pub fn library_ordinal(n_desc: u16) -> u8 {
    (n_desc >> 8) as u8
}

/// FAT container header. Always stored big-endian.
#[derive(Clone, Copy, Debug, Pread)]
pub struct FatHeader {
    /// [`FAT_MAGIC`].
    pub magic: u32,
    /// Number of [`FatArch`] records that follow.
    pub nfat_arch: u32,
}

/// One per-architecture record of a FAT container.
#[derive(Clone, Copy, Debug, Pread)]
pub struct FatArch {
    /// Raw CPU type of the slice.
    pub cputype: u32,
    /// Raw CPU subtype of the slice.
    pub cpusubtype: u32,
    /// File offset of the slice.
    pub offset: u32,
    /// Size of the slice in bytes.
    pub size: u32,
    /// Alignment of the slice as a power of two.
    pub align: u32,
}

/// The 64-bit Mach-O header.
#[derive(Clone, Copy, Debug, Pread)]
pub struct MachHeader64 {
    /// [`MH_MAGIC_64`] or [`MH_CIGAM_64`].
    pub magic: u32,
    /// Raw CPU type.
    pub cputype: u32,
    /// Raw CPU subtype.
    pub cpusubtype: u32,
    /// Raw file type word.
    pub filetype: u32,
    /// Number of load commands.
    pub ncmds: u32,
    /// Total size of the load-commands region in bytes.
    pub sizeofcmds: u32,
    /// Header flag bitset.
    pub flags: u32,
    /// Reserved, 0.
    pub reserved: u32,
}

/// Size of [`MachHeader64`] on disk.
pub const MACH_HEADER_64_SIZE: usize = 32;

/// The common prefix of every load command.
#[derive(Clone, Copy, Debug, Pread)]
pub struct LoadCommand {
    /// Command tag (`LC_*`).
    pub cmd: u32,
    /// Declared size of the whole command, including variable payload.
    pub cmdsize: u32,
}

/// `segment_command_64`.
#[derive(Clone, Copy, Debug, Pread)]
pub struct SegmentCommand64 {
    /// [`LC_SEGMENT_64`].
    pub cmd: u32,
    /// Declared command size, including trailing section records.
    pub cmdsize: u32,
    /// Segment name, NUL-padded.
    pub segname: [u8; 16],
    /// Virtual address the segment maps at.
    pub vmaddr: u64,
    /// Virtual size of the mapping.
    pub vmsize: u64,
    /// File offset of the segment content.
    pub fileoff: u64,
    /// File size of the segment content.
    pub filesize: u64,
    /// Maximum VM protection.
    pub maxprot: u32,
    /// Initial VM protection.
    pub initprot: u32,
    /// Number of trailing [`Section64`] records.
    pub nsects: u32,
    /// Segment flags.
    pub flags: u32,
}

/// Size of [`SegmentCommand64`] on disk.
pub const SEGMENT_COMMAND_64_SIZE: usize = 72;

/// `section_64`, stored contiguously after its segment command.
#[derive(Clone, Copy, Debug, Pread)]
pub struct Section64 {
    /// Section name, NUL-padded.
    pub sectname: [u8; 16],
    /// Owning segment name, NUL-padded.
    pub segname: [u8; 16],
    /// Virtual address of the section.
    pub addr: u64,
    /// Size of the section in bytes.
    pub size: u64,
    /// File offset of the section content.
    pub offset: u32,
    /// Alignment as a power of two.
    pub align: u32,
    /// File offset of relocation entries.
    pub reloff: u32,
    /// Number of relocation entries.
    pub nreloc: u32,
    /// Section type and attributes.
    pub flags: u32,
    /// Meaning depends on section type; first indirect-symbol index for
    /// symbol-stub and lazy-pointer sections.
    pub reserved1: u32,
    /// Meaning depends on section type; stub size for symbol-stub sections.
    pub reserved2: u32,
    /// Reserved.
    pub reserved3: u32,
}

/// Size of [`Section64`] on disk.
pub const SECTION_64_SIZE: usize = 80;

/// `symtab_command`.
#[derive(Clone, Copy, Debug, Pread)]
pub struct SymtabCommand {
    /// [`LC_SYMTAB`].
    pub cmd: u32,
    /// Declared command size.
    pub cmdsize: u32,
    /// File offset of the `nlist_64` array.
    pub symoff: u32,
    /// Number of symbol-table entries.
    pub nsyms: u32,
    /// File offset of the string table.
    pub stroff: u32,
    /// Size of the string table in bytes.
    pub strsize: u32,
}

/// `dysymtab_command`.
#[derive(Clone, Copy, Debug, Pread)]
pub struct DysymtabCommand {
    /// [`LC_DYSYMTAB`].
    pub cmd: u32,
    /// Declared command size.
    pub cmdsize: u32,
    /// Index of the first local symbol.
    pub ilocalsym: u32,
    /// Number of local symbols.
    pub nlocalsym: u32,
    /// Index of the first externally defined symbol.
    pub iextdefsym: u32,
    /// Number of externally defined symbols.
    pub nextdefsym: u32,
    /// Index of the first undefined symbol.
    pub iundefsym: u32,
    /// Number of undefined symbols.
    pub nundefsym: u32,
    /// File offset of the table of contents.
    pub tocoff: u32,
    /// Number of table-of-contents entries.
    pub ntoc: u32,
    /// File offset of the module table.
    pub modtaboff: u32,
    /// Number of module-table entries.
    pub nmodtab: u32,
    /// File offset of the referenced-symbol table.
    pub extrefsymoff: u32,
    /// Number of referenced-symbol entries.
    pub nextrefsyms: u32,
    /// File offset of the indirect symbol table.
    pub indirectsymoff: u32,
    /// Number of indirect-symbol entries.
    pub nindirectsyms: u32,
    /// File offset of external relocations.
    pub extreloff: u32,
    /// Number of external relocations.
    pub nextrel: u32,
    /// File offset of local relocations.
    pub locreloff: u32,
    /// Number of local relocations.
    pub nlocrel: u32,
}

/// `encryption_info_command_64`.
#[derive(Clone, Copy, Debug, Pread)]
pub struct EncryptionInfoCommand64 {
    /// [`LC_ENCRYPTION_INFO_64`].
    pub cmd: u32,
    /// Declared command size.
    pub cmdsize: u32,
    /// File offset of the encrypted range.
    pub cryptoff: u32,
    /// Size of the encrypted range.
    pub cryptsize: u32,
    /// Encryption system in use; 0 means not encrypted.
    pub cryptid: u32,
    /// Padding.
    pub pad: u32,
}

/// `linkedit_data_command`, used by `LC_CODE_SIGNATURE`.
#[derive(Clone, Copy, Debug, Pread)]
pub struct LinkeditDataCommand {
    /// Command tag.
    pub cmd: u32,
    /// Declared command size.
    pub cmdsize: u32,
    /// File offset of the payload in `__LINKEDIT`.
    pub dataoff: u32,
    /// Payload size in bytes.
    pub datasize: u32,
}

/// `dylib_command` for `LC_LOAD_DYLIB` / `LC_LOAD_WEAK_DYLIB`.
///
/// The install-path string lives inside the command's variable payload at
/// `name_offset` bytes from the start of the command.
#[derive(Clone, Copy, Debug, Pread)]
pub struct DylibCommand {
    /// Command tag.
    pub cmd: u32,
    /// Declared command size, including the trailing path string.
    pub cmdsize: u32,
    /// Offset of the install-path string from the start of the command.
    pub name_offset: u32,
    /// Build timestamp.
    pub timestamp: u32,
    /// Dylib current version word.
    pub current_version: u32,
    /// Dylib compatibility version word.
    pub compatibility_version: u32,
}

/// `dyld_info_command` for `LC_DYLD_INFO` / `LC_DYLD_INFO_ONLY`.
#[derive(Clone, Copy, Debug, Pread)]
pub struct DyldInfoCommand {
    /// Command tag.
    pub cmd: u32,
    /// Declared command size.
    pub cmdsize: u32,
    /// File offset of the rebase opcode stream.
    pub rebase_off: u32,
    /// Size of the rebase opcode stream.
    pub rebase_size: u32,
    /// File offset of the non-lazy bind opcode stream.
    pub bind_off: u32,
    /// Size of the non-lazy bind opcode stream.
    pub bind_size: u32,
    /// File offset of the weak bind opcode stream.
    pub weak_bind_off: u32,
    /// Size of the weak bind opcode stream.
    pub weak_bind_size: u32,
    /// File offset of the lazy bind opcode stream.
    pub lazy_bind_off: u32,
    /// Size of the lazy bind opcode stream.
    pub lazy_bind_size: u32,
    /// File offset of the export trie.
    pub export_off: u32,
    /// Size of the export trie.
    pub export_size: u32,
}

/// `nlist_64`, one symbol-table entry.
#[derive(Clone, Copy, Debug, Pread)]
pub struct Nlist64 {
    /// Byte offset of the symbol name within the string table.
    pub n_strx: u32,
    /// Type bitset (`N_STAB` / `N_TYPE` / `N_EXT`).
    pub n_type: u8,
    /// Section ordinal, or `NO_SECT`.
    pub n_sect: u8,
    /// Description word; carries the library ordinal for two-level imports.
    pub n_desc: u16,
    /// Symbol value; a virtual address for defined symbols.
    pub n_value: u64,
}

/// Size of [`Nlist64`] on disk.
pub const NLIST_64_SIZE: usize = 16;

/// A constant Foundation string record in `__cfstring`.
#[derive(Clone, Copy, Debug, Pread)]
pub struct CFString64 {
    /// Pointer to `___CFConstantStringClassReference`.
    pub isa: u64,
    /// CFString flag word.
    pub flags: u64,
    /// Virtual address of the backing C-string literal.
    pub literal: u64,
    /// Length of the literal in bytes.
    pub length: u64,
}

/// Size of [`CFString64`] on disk.
pub const CFSTRING_64_SIZE: usize = 32;
