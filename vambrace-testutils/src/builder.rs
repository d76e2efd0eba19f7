//! Byte-level construction of thin 64-bit Mach-O images.
//!
//! The builder mirrors the on-disk layout one-to-one with the virtual
//! layout: a byte at file offset `f` lives at virtual address
//! `VIRTUAL_BASE + f`. Tests declare sections at fixed virtual addresses,
//! write content through those addresses, and let `build` assemble the
//! header, load commands and linkedit payloads around them.

/// Virtual address the synthetic `__TEXT` segment loads at.
pub const VIRTUAL_BASE: u64 = 0x1_0000_0000;

const MH_MAGIC_64: u32 = 0xfeed_facf;
const MH_EXECUTE: u32 = 2;
const CPU_TYPE_ARM64: u32 = 0x0100_000c;

const LC_SYMTAB: u32 = 0x2;
const LC_DYSYMTAB: u32 = 0xb;
const LC_LOAD_DYLIB: u32 = 0xc;
const LC_SEGMENT_64: u32 = 0x19;
const LC_CODE_SIGNATURE: u32 = 0x1d;
const LC_DYLD_INFO_ONLY: u32 = 0x8000_0022;
const LC_ENCRYPTION_INFO_64: u32 = 0x2c;

const BIND_OPCODE_SET_DYLIB_ORDINAL_IMM: u8 = 0x10;
const BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM: u8 = 0x40;
const BIND_OPCODE_SET_TYPE_IMM: u8 = 0x50;
const BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x70;
const BIND_OPCODE_DO_BIND: u8 = 0x90;

const REBASE_OPCODE_SET_TYPE_IMM: u8 = 0x10;
const REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x20;
const REBASE_OPCODE_DO_REBASE_IMM_TIMES: u8 = 0x50;
const REBASE_OPCODE_DO_REBASE_ULEB_TIMES: u8 = 0x60;

struct SectionSpec {
    segment: String,
    name: String,
    address: u64,
    data: Vec<u8>,
    flags: u32,
    reserved1: u32,
    reserved2: u32,
}

struct SymbolSpec {
    name: String,
    n_type: u8,
    n_sect: u8,
    n_desc: u16,
    n_value: u64,
}

/// Assembles a thin little-endian 64-bit Mach-O image.
#[derive(Default)]
pub struct ImageBuilder {
    cputype: Option<u32>,
    filetype: Option<u32>,
    header_flags: u32,
    sections: Vec<SectionSpec>,
    segment_order: Vec<String>,
    dylibs: Vec<(String, u32)>,
    symbols: Vec<SymbolSpec>,
    indirect_symbols: Vec<u32>,
    rebase_stream: Vec<u8>,
    bind_stream: Vec<u8>,
    lazy_bind_stream: Vec<u8>,
    codesign_blob: Option<Vec<u8>>,
    encryption_cryptid: Option<u32>,
}

impl ImageBuilder {
    /// A fresh builder for an ARM64 executable image.
    pub fn new() -> Self {
        ImageBuilder::default()
    }

    /// Overrides the header `cputype` word.
    pub fn cputype(&mut self, cputype: u32) -> &mut Self {
        self.cputype = Some(cputype);
        self
    }

    /// Overrides the header `filetype` word.
    pub fn filetype(&mut self, filetype: u32) -> &mut Self {
        self.filetype = Some(filetype);
        self
    }

    /// Sets the header flag bitset.
    pub fn header_flags(&mut self, flags: u32) -> &mut Self {
        self.header_flags = flags;
        self
    }

    /// Declares a section of `size` zeroed bytes at the given virtual
    /// address. The file offset is `address - VIRTUAL_BASE`.
    pub fn section(&mut self, segment: &str, name: &str, address: u64, size: u64) -> &mut Self {
        self.section_with(segment, name, address, size, 0, 0, 0)
    }

    /// Declares a section with explicit flags and reserved words
    /// (`reserved1` = first indirect-symbol slot, `reserved2` = stub size).
    #[allow(clippy::too_many_arguments)]
    pub fn section_with(
        &mut self,
        segment: &str,
        name: &str,
        address: u64,
        size: u64,
        flags: u32,
        reserved1: u32,
        reserved2: u32,
    ) -> &mut Self {
        assert!(address >= VIRTUAL_BASE, "section below virtual base");
        if !self.segment_order.iter().any(|s| s == segment) {
            self.segment_order.push(segment.to_owned());
        }
        self.sections.push(SectionSpec {
            segment: segment.to_owned(),
            name: name.to_owned(),
            address,
            data: vec![0; size as usize],
            flags,
            reserved1,
            reserved2,
        });
        self
    }

    /// The bind-stream segment index of a declared segment.
    pub fn segment_index(&self, segment: &str) -> u8 {
        self.segment_order
            .iter()
            .position(|s| s == segment)
            .expect("segment not declared") as u8
    }

    /// Writes bytes at a virtual address inside a declared section.
    pub fn write_at(&mut self, address: u64, bytes: &[u8]) -> &mut Self {
        let section = self
            .sections
            .iter_mut()
            .find(|section| {
                section.address <= address
                    && address + bytes.len() as u64 <= section.address + section.data.len() as u64
            })
            .expect("write outside any declared section");
        let start = (address - section.address) as usize;
        section.data[start..start + bytes.len()].copy_from_slice(bytes);
        self
    }

    /// Writes a little-endian u64 at a virtual address.
    pub fn write_u64_at(&mut self, address: u64, value: u64) -> &mut Self {
        self.write_at(address, &value.to_le_bytes())
    }

    /// Writes a little-endian u32 at a virtual address.
    pub fn write_u32_at(&mut self, address: u64, value: u32) -> &mut Self {
        self.write_at(address, &value.to_le_bytes())
    }

    /// Writes a NUL-terminated string at a virtual address.
    pub fn write_str_at(&mut self, address: u64, value: &str) -> &mut Self {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        self.write_at(address, &bytes)
    }

    /// Adds an `LC_LOAD_DYLIB` command; returns its 1-based library ordinal.
    pub fn add_dylib(&mut self, install_path: &str, current_version: u32) -> u8 {
        self.dylibs.push((install_path.to_owned(), current_version));
        self.dylibs.len() as u8
    }

    /// Adds a raw symbol-table entry; returns its index.
    pub fn add_symbol(
        &mut self,
        name: &str,
        n_type: u8,
        n_sect: u8,
        n_desc: u16,
        n_value: u64,
    ) -> u32 {
        self.symbols.push(SymbolSpec {
            name: name.to_owned(),
            n_type,
            n_sect,
            n_desc,
            n_value,
        });
        self.symbols.len() as u32 - 1
    }

    /// Adds an undefined (imported) external symbol with a library ordinal.
    pub fn add_undefined_symbol(&mut self, name: &str, library_ordinal: u8) -> u32 {
        self.add_symbol(name, 0x01, 0, (library_ordinal as u16) << 8, 0)
    }

    /// Adds a non-external symbol defined in section 1 (`__text`).
    pub fn add_local_text_symbol(&mut self, name: &str, address: u64) -> u32 {
        self.add_symbol(name, 0x0e, 1, 0, address)
    }

    /// Adds an external symbol defined in section 1 (`__text`).
    pub fn add_exported_symbol(&mut self, name: &str, address: u64) -> u32 {
        self.add_symbol(name, 0x0f, 1, 0, address)
    }

    /// Sets the indirect symbol table verbatim.
    pub fn indirect_symbols(&mut self, slots: Vec<u32>) -> &mut Self {
        self.indirect_symbols = slots;
        self
    }

    /// Sets the compressed rebase opcode stream.
    pub fn rebase_stream(&mut self, stream: Vec<u8>) -> &mut Self {
        self.rebase_stream = stream;
        self
    }

    /// Sets the compressed non-lazy bind opcode stream.
    pub fn bind_stream(&mut self, stream: Vec<u8>) -> &mut Self {
        self.bind_stream = stream;
        self
    }

    /// Sets the compressed lazy bind opcode stream.
    pub fn lazy_bind_stream(&mut self, stream: Vec<u8>) -> &mut Self {
        self.lazy_bind_stream = stream;
        self
    }

    /// Attaches a code-signing blob, emitted behind `LC_CODE_SIGNATURE`.
    pub fn codesign_blob(&mut self, blob: Vec<u8>) -> &mut Self {
        self.codesign_blob = Some(blob);
        self
    }

    /// Attaches an `LC_ENCRYPTION_INFO_64` command with the given cryptid.
    pub fn encryption(&mut self, cryptid: u32) -> &mut Self {
        self.encryption_cryptid = Some(cryptid);
        self
    }

    /// Assembles the image.
    pub fn build(&self) -> Vec<u8> {
        let has_dyld_info = !self.rebase_stream.is_empty()
            || !self.bind_stream.is_empty()
            || !self.lazy_bind_stream.is_empty();

        // load-commands sizing: declared segments plus __LINKEDIT
        let mut sizeofcmds = 0usize;
        let mut ncmds = 0u32;
        for segment in &self.segment_order {
            let nsects = self.sections.iter().filter(|s| &s.segment == segment).count();
            sizeofcmds += 72 + 80 * nsects;
            ncmds += 1;
        }
        sizeofcmds += 72; // __LINKEDIT
        ncmds += 1;
        sizeofcmds += 24 + 80; // LC_SYMTAB + LC_DYSYMTAB
        ncmds += 2;
        for (path, _) in &self.dylibs {
            sizeofcmds += 24 + pad8(path.len() + 1);
            ncmds += 1;
        }
        if has_dyld_info {
            sizeofcmds += 48;
            ncmds += 1;
        }
        if self.encryption_cryptid.is_some() {
            sizeofcmds += 24;
            ncmds += 1;
        }
        if self.codesign_blob.is_some() {
            sizeofcmds += 16;
            ncmds += 1;
        }

        let first_section_off = self
            .sections
            .iter()
            .map(|s| s.address - VIRTUAL_BASE)
            .min()
            .expect("no sections declared");
        assert!(
            32 + sizeofcmds as u64 <= first_section_off,
            "load commands overlap section content"
        );

        // linkedit layout
        let sections_end = self
            .sections
            .iter()
            .map(|s| s.address - VIRTUAL_BASE + s.data.len() as u64)
            .max()
            .unwrap();
        let mut cursor = align8(sections_end);
        let linkedit_start = cursor;

        let symoff = cursor;
        cursor += self.symbols.len() as u64 * 16;

        let stroff = cursor;
        let mut strtab = vec![0u8];
        let mut strx = Vec::with_capacity(self.symbols.len());
        for symbol in &self.symbols {
            strx.push(strtab.len() as u32);
            strtab.extend_from_slice(symbol.name.as_bytes());
            strtab.push(0);
        }
        cursor += strtab.len() as u64;

        let indirectsymoff = align8(cursor);
        cursor = indirectsymoff + self.indirect_symbols.len() as u64 * 4;

        let rebase_off = align8(cursor);
        cursor = rebase_off + self.rebase_stream.len() as u64;
        let bind_off = align8(cursor);
        cursor = bind_off + self.bind_stream.len() as u64;
        let lazy_bind_off = align8(cursor);
        cursor = lazy_bind_off + self.lazy_bind_stream.len() as u64;

        let codesign_off = align16(cursor);
        let codesign_len = self.codesign_blob.as_ref().map(|b| b.len()).unwrap_or(0) as u64;
        let file_size = codesign_off + codesign_len;

        let mut image = vec![0u8; file_size as usize];

        // header
        let cputype = self.cputype.unwrap_or(CPU_TYPE_ARM64);
        let filetype = self.filetype.unwrap_or(MH_EXECUTE);
        put_u32(&mut image, 0, MH_MAGIC_64);
        put_u32(&mut image, 4, cputype);
        put_u32(&mut image, 8, 0);
        put_u32(&mut image, 12, filetype);
        put_u32(&mut image, 16, ncmds);
        put_u32(&mut image, 20, sizeofcmds as u32);
        put_u32(&mut image, 24, self.header_flags);

        // load commands
        let mut off = 32usize;
        for segment in &self.segment_order {
            let sections: Vec<&SectionSpec> = self
                .sections
                .iter()
                .filter(|s| &s.segment == segment)
                .collect();
            let vmaddr = if segment == "__TEXT" {
                VIRTUAL_BASE
            } else {
                sections.iter().map(|s| s.address).min().unwrap()
            };
            let fileoff = if segment == "__TEXT" {
                0
            } else {
                vmaddr - VIRTUAL_BASE
            };
            let end = sections
                .iter()
                .map(|s| s.address + s.data.len() as u64)
                .max()
                .unwrap();

            off = put_segment_command(
                &mut image,
                off,
                segment,
                vmaddr,
                end - vmaddr,
                fileoff,
                end - vmaddr,
                &sections,
            );
        }
        // __LINKEDIT, no sections
        off = put_segment_command(
            &mut image,
            off,
            "__LINKEDIT",
            VIRTUAL_BASE + linkedit_start,
            file_size - linkedit_start,
            linkedit_start,
            file_size - linkedit_start,
            &[],
        );

        // LC_SYMTAB
        put_u32(&mut image, off, LC_SYMTAB);
        put_u32(&mut image, off + 4, 24);
        put_u32(&mut image, off + 8, symoff as u32);
        put_u32(&mut image, off + 12, self.symbols.len() as u32);
        put_u32(&mut image, off + 16, stroff as u32);
        put_u32(&mut image, off + 20, strtab.len() as u32);
        off += 24;

        // LC_DYSYMTAB; only the indirect-table fields matter here
        put_u32(&mut image, off, LC_DYSYMTAB);
        put_u32(&mut image, off + 4, 80);
        put_u32(&mut image, off + 56, indirectsymoff as u32);
        put_u32(&mut image, off + 60, self.indirect_symbols.len() as u32);
        off += 80;

        for (path, version) in &self.dylibs {
            let cmdsize = 24 + pad8(path.len() + 1);
            put_u32(&mut image, off, LC_LOAD_DYLIB);
            put_u32(&mut image, off + 4, cmdsize as u32);
            put_u32(&mut image, off + 8, 24); // name offset
            put_u32(&mut image, off + 12, 2); // timestamp
            put_u32(&mut image, off + 16, *version);
            put_u32(&mut image, off + 20, 0x0001_0000); // compatibility version
            image[off + 24..off + 24 + path.len()].copy_from_slice(path.as_bytes());
            off += cmdsize;
        }

        if has_dyld_info {
            put_u32(&mut image, off, LC_DYLD_INFO_ONLY);
            put_u32(&mut image, off + 4, 48);
            put_u32(&mut image, off + 8, rebase_off as u32);
            put_u32(&mut image, off + 12, self.rebase_stream.len() as u32);
            put_u32(&mut image, off + 16, bind_off as u32);
            put_u32(&mut image, off + 20, self.bind_stream.len() as u32);
            // no weak binds
            put_u32(&mut image, off + 32, lazy_bind_off as u32);
            put_u32(&mut image, off + 36, self.lazy_bind_stream.len() as u32);
            off += 48;
        }

        if let Some(cryptid) = self.encryption_cryptid {
            put_u32(&mut image, off, LC_ENCRYPTION_INFO_64);
            put_u32(&mut image, off + 4, 24);
            put_u32(&mut image, off + 8, 0x4000);
            put_u32(&mut image, off + 12, 0x4000);
            put_u32(&mut image, off + 16, cryptid);
            off += 24;
        }

        if let Some(blob) = &self.codesign_blob {
            put_u32(&mut image, off, LC_CODE_SIGNATURE);
            put_u32(&mut image, off + 4, 16);
            put_u32(&mut image, off + 8, codesign_off as u32);
            put_u32(&mut image, off + 12, blob.len() as u32);
        }

        // section contents
        for section in &self.sections {
            let start = (section.address - VIRTUAL_BASE) as usize;
            image[start..start + section.data.len()].copy_from_slice(&section.data);
        }

        // linkedit payloads
        let mut sym_off = symoff as usize;
        for (symbol, strx) in self.symbols.iter().zip(&strx) {
            put_u32(&mut image, sym_off, *strx);
            image[sym_off + 4] = symbol.n_type;
            image[sym_off + 5] = symbol.n_sect;
            image[sym_off + 6..sym_off + 8].copy_from_slice(&symbol.n_desc.to_le_bytes());
            image[sym_off + 8..sym_off + 16].copy_from_slice(&symbol.n_value.to_le_bytes());
            sym_off += 16;
        }
        image[stroff as usize..stroff as usize + strtab.len()].copy_from_slice(&strtab);
        for (index, slot) in self.indirect_symbols.iter().enumerate() {
            put_u32(&mut image, indirectsymoff as usize + index * 4, *slot);
        }
        image[rebase_off as usize..rebase_off as usize + self.rebase_stream.len()]
            .copy_from_slice(&self.rebase_stream);
        image[bind_off as usize..bind_off as usize + self.bind_stream.len()]
            .copy_from_slice(&self.bind_stream);
        image[lazy_bind_off as usize..lazy_bind_off as usize + self.lazy_bind_stream.len()]
            .copy_from_slice(&self.lazy_bind_stream);
        if let Some(blob) = &self.codesign_blob {
            image[codesign_off as usize..codesign_off as usize + blob.len()]
                .copy_from_slice(blob);
        }

        image
    }
}

/// Wraps slices into a FAT container with big-endian headers.
pub fn fat(slices: &[(u32, Vec<u8>)]) -> Vec<u8> {
    let mut offsets = Vec::new();
    let mut cursor = 4096u64;
    for (_, slice) in slices {
        offsets.push(cursor);
        cursor += align_to(slice.len() as u64, 4096);
    }

    let mut image = vec![0u8; cursor as usize];
    image[0..4].copy_from_slice(&0xcafe_babeu32.to_be_bytes());
    image[4..8].copy_from_slice(&(slices.len() as u32).to_be_bytes());

    let mut off = 8usize;
    for ((cputype, slice), slice_off) in slices.iter().zip(&offsets) {
        image[off..off + 4].copy_from_slice(&cputype.to_be_bytes());
        image[off + 4..off + 8].copy_from_slice(&0u32.to_be_bytes());
        image[off + 8..off + 12].copy_from_slice(&(*slice_off as u32).to_be_bytes());
        image[off + 12..off + 16].copy_from_slice(&(slice.len() as u32).to_be_bytes());
        image[off + 16..off + 20].copy_from_slice(&12u32.to_be_bytes());
        off += 20;

        image[*slice_off as usize..*slice_off as usize + slice.len()].copy_from_slice(slice);
    }
    image
}

/// Builds bind opcode streams for [`ImageBuilder`].
#[derive(Default)]
pub struct BindStreamBuilder {
    bytes: Vec<u8>,
}

impl BindStreamBuilder {
    /// A fresh, empty stream.
    pub fn new() -> Self {
        BindStreamBuilder::default()
    }

    /// `BIND_OPCODE_SET_DYLIB_ORDINAL_IMM`
    pub fn set_dylib_ordinal(mut self, ordinal: u8) -> Self {
        assert!(ordinal <= 0xf);
        self.bytes.push(BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | ordinal);
        self
    }

    /// `BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM`
    pub fn set_symbol(mut self, name: &str) -> Self {
        self.bytes.push(BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM);
        self.bytes.extend_from_slice(name.as_bytes());
        self.bytes.push(0);
        self
    }

    /// `BIND_OPCODE_SET_TYPE_IMM` with the pointer bind type.
    pub fn set_type_pointer(mut self) -> Self {
        self.bytes.push(BIND_OPCODE_SET_TYPE_IMM | 1);
        self
    }

    /// `BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB`
    pub fn set_segment_offset(mut self, segment_index: u8, offset: u64) -> Self {
        assert!(segment_index <= 0xf);
        self.bytes
            .push(BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | segment_index);
        push_uleb128(&mut self.bytes, offset);
        self
    }

    /// `BIND_OPCODE_DO_BIND`
    pub fn do_bind(mut self) -> Self {
        self.bytes.push(BIND_OPCODE_DO_BIND);
        self
    }

    /// Terminates the stream with `BIND_OPCODE_DONE`.
    pub fn done(mut self) -> Vec<u8> {
        self.bytes.push(0);
        self.bytes
    }
}

/// Builds rebase opcode streams for [`ImageBuilder`].
#[derive(Default)]
pub struct RebaseStreamBuilder {
    bytes: Vec<u8>,
}

impl RebaseStreamBuilder {
    /// A fresh, empty stream.
    pub fn new() -> Self {
        RebaseStreamBuilder::default()
    }

    /// `REBASE_OPCODE_SET_TYPE_IMM` with the pointer rebase type.
    pub fn set_type_pointer(mut self) -> Self {
        self.bytes.push(REBASE_OPCODE_SET_TYPE_IMM | 1);
        self
    }

    /// `REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB`
    pub fn set_segment_offset(mut self, segment_index: u8, offset: u64) -> Self {
        assert!(segment_index <= 0xf);
        self.bytes
            .push(REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | segment_index);
        push_uleb128(&mut self.bytes, offset);
        self
    }

    /// Rebases `count` consecutive pointers.
    pub fn do_rebase(mut self, count: u64) -> Self {
        if count <= 0xf {
            self.bytes
                .push(REBASE_OPCODE_DO_REBASE_IMM_TIMES | count as u8);
        } else {
            self.bytes.push(REBASE_OPCODE_DO_REBASE_ULEB_TIMES);
            push_uleb128(&mut self.bytes, count);
        }
        self
    }

    /// Terminates the stream with `REBASE_OPCODE_DONE`.
    pub fn done(mut self) -> Vec<u8> {
        self.bytes.push(0);
        self.bytes
    }
}

fn put_u32(image: &mut [u8], offset: usize, value: u32) {
    image[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(image: &mut [u8], offset: usize, value: u64) {
    image[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn put_name(image: &mut [u8], offset: usize, name: &str) {
    assert!(name.len() <= 16);
    image[offset..offset + name.len()].copy_from_slice(name.as_bytes());
}

#[allow(clippy::too_many_arguments)]
fn put_segment_command(
    image: &mut [u8],
    mut off: usize,
    name: &str,
    vmaddr: u64,
    vmsize: u64,
    fileoff: u64,
    filesize: u64,
    sections: &[&SectionSpec],
) -> usize {
    let cmdsize = 72 + 80 * sections.len();
    put_u32(image, off, LC_SEGMENT_64);
    put_u32(image, off + 4, cmdsize as u32);
    put_name(image, off + 8, name);
    put_u64(image, off + 24, vmaddr);
    put_u64(image, off + 32, vmsize);
    put_u64(image, off + 40, fileoff);
    put_u64(image, off + 48, filesize);
    put_u32(image, off + 56, 7); // maxprot
    put_u32(image, off + 60, 3); // initprot
    put_u32(image, off + 64, sections.len() as u32);
    off += 72;

    for section in sections {
        put_name(image, off, &section.name);
        put_name(image, off + 16, &section.segment);
        put_u64(image, off + 32, section.address);
        put_u64(image, off + 40, section.data.len() as u64);
        put_u32(image, off + 48, (section.address - VIRTUAL_BASE) as u32);
        put_u32(image, off + 52, 3); // align
        put_u32(image, off + 64, section.flags);
        put_u32(image, off + 68, section.reserved1);
        put_u32(image, off + 72, section.reserved2);
        off += 80;
    }
    off
}

fn push_uleb128(bytes: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        bytes.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn pad8(len: usize) -> usize {
    (len + 7) & !7
}

fn align8(value: u64) -> u64 {
    (value + 7) & !7
}

fn align16(value: u64) -> u64 {
    (value + 15) & !15
}

fn align_to(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}
