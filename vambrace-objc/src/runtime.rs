use std::collections::{HashMap, HashSet};

use scroll::Pread;
use tracing::debug;

use vambrace_macho::raw::{library_ordinal, N_STAB, N_TYPE, N_UNDF};
use vambrace_macho::raw::{INDIRECT_SYMBOL_ABS, INDIRECT_SYMBOL_LOCAL};
use vambrace_macho::{MachoBinary, MachoError};

use crate::dyld_info::{DyldFixup, DyldInfo};
use crate::raw;

/// Sanity cap on runtime list lengths; anything larger is treated as garbage.
const MAX_LIST_COUNT: u64 = 0x4000;

/// Default ARM64 stub size when `__stubs` carries no `reserved2`.
const DEFAULT_STUB_SIZE: u64 = 12;

/// An Objective-C selector.
///
/// The number of colons in `name` equals the number of Objective-C arguments
/// beyond `self` and `_cmd`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObjcSelector {
    /// Selector name, colon-delimited by argument.
    pub name: String,
    /// Implementation address; `None` in protocol declarations.
    pub implementation: Option<u64>,
}

/// An instance variable and its layout.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObjcIvar {
    /// Ivar name.
    pub name: String,
    /// Apple runtime type-encoding string.
    pub type_encoding: String,
    /// Byte offset of the field within an instance.
    pub field_offset: u64,
}

/// An Objective-C protocol with its declared methods.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObjcProtocol {
    /// Protocol name.
    pub name: String,
    /// Declared selectors, required and optional.
    pub selectors: Vec<ObjcSelector>,
}

/// A class reconstructed from `__objc_classlist`.
#[derive(Clone, Debug)]
pub struct ObjcClass {
    /// Class name.
    pub name: String,
    /// Name of the superclass, local or imported; `None` for root classes.
    pub superclass_name: Option<String>,
    /// Whether the `class_ro_t` flags mark this as a metaclass.
    pub is_metaclass: bool,
    /// Declared instance variables.
    pub ivars: Vec<ObjcIvar>,
    /// Protocols the class conforms to.
    pub protocols: Vec<ObjcProtocol>,
    /// Instance methods.
    pub selectors: Vec<ObjcSelector>,
}

/// A category reconstructed from `__objc_catlist`.
///
/// `selectors` holds only the methods the category adds.
#[derive(Clone, Debug)]
pub struct ObjcCategory {
    /// Name of the class the category extends.
    pub base_class: String,
    /// Category name.
    pub name: String,
    /// Protocols the category adopts.
    pub protocols: Vec<ObjcProtocol>,
    /// Methods the category adds.
    pub selectors: Vec<ObjcSelector>,
}

/// Either a class or a category; the two share most of their surface.
#[derive(Clone, Debug)]
pub enum ObjcClassLike {
    /// A class definition.
    Class(ObjcClass),
    /// A category extending some base class.
    Category(ObjcCategory),
}

impl ObjcClassLike {
    /// The class or category name.
    pub fn name(&self) -> &str {
        match self {
            ObjcClassLike::Class(class) => &class.name,
            ObjcClassLike::Category(category) => &category.name,
        }
    }

    /// The selectors defined by this class or added by this category.
    pub fn selectors(&self) -> &[ObjcSelector] {
        match self {
            ObjcClassLike::Class(class) => &class.selectors,
            ObjcClassLike::Category(category) => &category.selectors,
        }
    }

    /// The protocols this class or category conforms to.
    pub fn protocols(&self) -> &[ObjcProtocol] {
        match self {
            ObjcClassLike::Class(class) => &class.protocols,
            ObjcClassLike::Category(category) => &category.protocols,
        }
    }

    /// A display name; categories render as `Base (Category)`.
    pub fn display_name(&self) -> String {
        match self {
            ObjcClassLike::Class(class) => class.name.clone(),
            ObjcClassLike::Category(category) => {
                format!("{} ({})", category.base_class, category.name)
            }
        }
    }
}

/// One method of a class or category, flattened for enumeration.
#[derive(Clone, Debug)]
pub struct ObjcMethodInfo {
    /// Owning class name; for categories, the category name.
    pub class_name: String,
    /// For category methods, the extended base class.
    pub category_base_class: Option<String>,
    /// The selector, with its implementation address.
    pub selector: ObjcSelector,
}

enum PointerTarget {
    Local(u64),
    Imported(String),
}

/// The reconstructed Objective-C metadata of one slice.
///
/// Built eagerly by [`ObjcRuntimeData::parse`]; individual malformed records
/// are skipped with a debug log so partial metadata remains available.
#[derive(Debug, Default)]
pub struct ObjcRuntimeData {
    classes: Vec<ObjcClassLike>,
    protocols: Vec<ObjcProtocol>,
    selrefs: HashMap<u64, String>,
    classrefs: HashMap<u64, String>,
    imps_by_selector: HashMap<String, Vec<u64>>,
    stubs_by_symbol: HashMap<String, u64>,
    symbols_by_stub: HashMap<u64, String>,
    import_paths: HashMap<String, String>,
    dyld_info: DyldInfo,
}

impl ObjcRuntimeData {
    /// Walks the `__objc_*` sections of the given slice.
    pub fn parse(binary: &MachoBinary) -> Self {
        let dyld_info = DyldInfo::parse(binary);
        let mut resolver = Resolver {
            binary,
            dyld_info: &dyld_info,
            protocols: Vec::new(),
            protocol_names_by_addr: HashMap::new(),
            known_protocol_names: HashSet::new(),
        };

        let classes = resolver.parse_class_list();
        let selrefs = resolver.parse_selrefs();
        let classrefs = resolver.parse_classrefs();

        let mut imps_by_selector: HashMap<String, Vec<u64>> = HashMap::new();
        for class in &classes {
            for selector in class.selectors() {
                if let Some(imp) = selector.implementation {
                    imps_by_selector
                        .entry(selector.name.clone())
                        .or_default()
                        .push(imp);
                }
            }
        }

        let (stubs_by_symbol, symbols_by_stub) = build_stub_map(binary);
        let import_paths = build_import_paths(binary);

        ObjcRuntimeData {
            classes,
            protocols: resolver.protocols,
            selrefs,
            classrefs,
            imps_by_selector,
            stubs_by_symbol,
            symbols_by_stub,
            import_paths,
            dyld_info,
        }
    }

    /// The classes and categories of the image, in `__objc_classlist` then
    /// `__objc_catlist` order.
    pub fn classes(&self) -> &[ObjcClassLike] {
        &self.classes
    }

    /// Every protocol referenced by the image, deduplicated by name.
    pub fn protocols(&self) -> &[ObjcProtocol] {
        &self.protocols
    }

    /// The dyld fix-up map the resolver worked from.
    pub fn dyld_info(&self) -> &DyldInfo {
        &self.dyld_info
    }

    /// Resolves a `__objc_selrefs` entry address to its selector.
    ///
    /// The implementation address is filled in when a local class or
    /// category implements the selector.
    pub fn selector_for_selref(&self, selref_address: u64) -> Option<ObjcSelector> {
        let name = self.selrefs.get(&selref_address)?;
        let implementation = self
            .imps_by_selector
            .get(name)
            .and_then(|imps| imps.first())
            .copied();
        Some(ObjcSelector {
            name: name.clone(),
            implementation,
        })
    }

    /// Finds the `__objc_selrefs` entry for a selector name.
    pub fn selref_for_selector_name(&self, name: &str) -> Option<u64> {
        self.selrefs
            .iter()
            .find(|(_, sel)| sel.as_str() == name)
            .map(|(addr, _)| *addr)
    }

    /// Resolves a `__objc_classrefs` entry address to a class name.
    pub fn class_name_for_classref(&self, classref_address: u64) -> Option<&str> {
        self.classrefs.get(&classref_address).map(String::as_str)
    }

    /// Implementation addresses of every local method with this selector name.
    pub fn imps_for_selector(&self, name: &str) -> Vec<u64> {
        self.imps_by_selector.get(name).cloned().unwrap_or_default()
    }

    /// Map of imported symbol name to its `__stubs` trampoline address.
    pub fn imported_symbol_names_to_pointers(&self) -> &HashMap<String, u64> {
        &self.stubs_by_symbol
    }

    /// Map of `__stubs` trampoline address to imported symbol name.
    pub fn branch_destinations_to_symbol_names(&self) -> &HashMap<u64, String> {
        &self.symbols_by_stub
    }

    /// The `__stubs` trampoline address of an imported symbol.
    pub fn stub_for_symbol(&self, name: &str) -> Option<u64> {
        self.stubs_by_symbol.get(name).copied()
    }

    /// The imported symbol a `__stubs` trampoline resolves to.
    pub fn symbol_for_stub(&self, address: u64) -> Option<&str> {
        self.symbols_by_stub.get(&address).map(String::as_str)
    }

    /// The install path of the dylib that supplies an imported symbol, via
    /// the symbol table's library ordinal.
    pub fn path_for_external_symbol(&self, name: &str) -> Option<&str> {
        self.import_paths.get(name).map(String::as_str)
    }

    /// Flattens every class and category method into
    /// [`ObjcMethodInfo`] records.
    pub fn methods(&self) -> Vec<ObjcMethodInfo> {
        let mut methods = Vec::new();
        for class in &self.classes {
            let (class_name, category_base_class) = match class {
                ObjcClassLike::Class(class) => (class.name.clone(), None),
                ObjcClassLike::Category(category) => {
                    (category.name.clone(), Some(category.base_class.clone()))
                }
            };
            for selector in class.selectors() {
                methods.push(ObjcMethodInfo {
                    class_name: class_name.clone(),
                    category_base_class: category_base_class.clone(),
                    selector: selector.clone(),
                });
            }
        }
        methods
    }
}

struct Resolver<'a> {
    binary: &'a MachoBinary,
    dyld_info: &'a DyldInfo,
    protocols: Vec<ObjcProtocol>,
    protocol_names_by_addr: HashMap<u64, String>,
    known_protocol_names: HashSet<String>,
}

impl<'a> Resolver<'a> {
    /// Resolves a pointer field at `address`: a nonzero stored value wins,
    /// otherwise the dyld fix-up map decides between a local rebase target
    /// and an imported symbol.
    fn resolve_pointer(&self, address: u64) -> Option<PointerTarget> {
        match self.binary.read_pointer_at_address(address) {
            Ok(raw) if raw != 0 => return Some(PointerTarget::Local(raw)),
            Ok(_) => {}
            Err(err) => {
                debug!(address, error = %err, "unreadable pointer field");
                return None;
            }
        }

        match self.dyld_info.fixup_at(address) {
            Some(DyldFixup::Rebase { target }) => Some(PointerTarget::Local(*target)),
            Some(DyldFixup::Bind { symbol_name, .. }) => {
                Some(PointerTarget::Imported(symbol_name.clone()))
            }
            None => None,
        }
    }

    fn pointer_section_entries(&self, section_name: &str) -> Vec<u64> {
        let section = match self.binary.section_named(section_name) {
            Some(section) => section,
            None => return Vec::new(),
        };
        (0..section.size / 8)
            .map(|index| section.address + index * 8)
            .collect()
    }

    fn parse_class_list(&mut self) -> Vec<ObjcClassLike> {
        let mut classes = Vec::new();

        for entry in self.pointer_section_entries("__objc_classlist") {
            match self.resolve_pointer(entry) {
                Some(PointerTarget::Local(class_addr)) => match self.parse_class(class_addr) {
                    Ok(class) => classes.push(ObjcClassLike::Class(class)),
                    Err(err) => {
                        debug!(entry, class_addr, error = %err, "skipping malformed class");
                    }
                },
                _ => debug!(entry, "unresolvable __objc_classlist entry"),
            }
        }

        for entry in self.pointer_section_entries("__objc_catlist") {
            match self.resolve_pointer(entry) {
                Some(PointerTarget::Local(cat_addr)) => match self.parse_category(cat_addr) {
                    Ok(category) => classes.push(ObjcClassLike::Category(category)),
                    Err(err) => {
                        debug!(entry, cat_addr, error = %err, "skipping malformed category");
                    }
                },
                _ => debug!(entry, "unresolvable __objc_catlist entry"),
            }
        }

        for entry in self.pointer_section_entries("__objc_protolist") {
            if let Some(PointerTarget::Local(proto_addr)) = self.resolve_pointer(entry) {
                if let Err(err) = self.parse_protocol(proto_addr) {
                    debug!(entry, proto_addr, error = %err, "skipping malformed protocol");
                }
            }
        }

        classes
    }

    fn parse_class(&mut self, class_addr: u64) -> Result<ObjcClass, MachoError> {
        let endian = self.binary.endian();
        let class: raw::ObjcClass64 = self
            .binary
            .bytes_at_address(class_addr, raw::OBJC_CLASS_64_SIZE as u64)?
            .pread_with(0, endian)?;

        let data_ptr = match self.field_pointer(class_addr, 32, class.data) {
            Some(PointerTarget::Local(ptr)) => ptr & raw::OBJC_CLASS_DATA_MASK,
            _ => return Err(MachoError::UnmappedVirtualAddress(class_addr)),
        };
        let ro: raw::ObjcClassRo64 = self
            .binary
            .bytes_at_address(data_ptr, raw::OBJC_CLASS_RO_64_SIZE as u64)?
            .pread_with(0, endian)?;

        let name = self.read_referenced_string(data_ptr + 24, ro.name)?;

        let superclass_name = match self.field_pointer(class_addr, 8, class.superclass) {
            Some(PointerTarget::Local(super_addr)) => self.class_name_at(super_addr).ok(),
            Some(PointerTarget::Imported(symbol)) => {
                Some(strip_class_symbol_prefix(&symbol).to_owned())
            }
            None => None,
        };

        let ivars = match self.field_pointer(data_ptr, 48, ro.ivars) {
            Some(PointerTarget::Local(addr)) => self.parse_ivar_list(addr),
            _ => Vec::new(),
        };
        let selectors = match self.field_pointer(data_ptr, 32, ro.base_methods) {
            Some(PointerTarget::Local(addr)) => self.parse_method_list(addr),
            _ => Vec::new(),
        };
        let protocols = match self.field_pointer(data_ptr, 40, ro.base_protocols) {
            Some(PointerTarget::Local(addr)) => self.parse_protocol_list(addr),
            _ => Vec::new(),
        };

        Ok(ObjcClass {
            name,
            superclass_name,
            is_metaclass: ro.flags & raw::RO_META != 0,
            ivars,
            protocols,
            selectors,
        })
    }

    fn parse_category(&mut self, cat_addr: u64) -> Result<ObjcCategory, MachoError> {
        let endian = self.binary.endian();
        let category: raw::ObjcCategory64 = self
            .binary
            .bytes_at_address(cat_addr, raw::OBJC_CATEGORY_64_SIZE as u64)?
            .pread_with(0, endian)?;

        let name = self.read_referenced_string(cat_addr, category.name)?;

        // the base-class field of a category extending an imported class is
        // zero on disk and only filled in through the bind table
        let base_class = match self.field_pointer(cat_addr, 8, category.base_class) {
            Some(PointerTarget::Local(class_addr)) => self
                .class_name_at(class_addr)
                .unwrap_or_else(|_| String::from("?")),
            Some(PointerTarget::Imported(symbol)) => {
                strip_class_symbol_prefix(&symbol).to_owned()
            }
            None => String::from("?"),
        };

        let selectors = match self.field_pointer(cat_addr, 16, category.instance_methods) {
            Some(PointerTarget::Local(addr)) => self.parse_method_list(addr),
            _ => Vec::new(),
        };
        let protocols = match self.field_pointer(cat_addr, 32, category.protocols) {
            Some(PointerTarget::Local(addr)) => self.parse_protocol_list(addr),
            _ => Vec::new(),
        };

        Ok(ObjcCategory {
            base_class,
            name,
            protocols,
            selectors,
        })
    }

    fn parse_protocol(&mut self, proto_addr: u64) -> Result<ObjcProtocol, MachoError> {
        if let Some(name) = self.protocol_names_by_addr.get(&proto_addr) {
            let name = name.clone();
            return Ok(self
                .protocols
                .iter()
                .find(|proto| proto.name == name)
                .cloned()
                .unwrap_or(ObjcProtocol {
                    name,
                    selectors: Vec::new(),
                }));
        }

        let endian = self.binary.endian();
        let protocol: raw::ObjcProtocol64 = self
            .binary
            .bytes_at_address(proto_addr, raw::OBJC_PROTOCOL_64_SIZE as u64)?
            .pread_with(0, endian)?;

        let name = self.read_referenced_string(proto_addr + 8, protocol.name)?;
        self.protocol_names_by_addr.insert(proto_addr, name.clone());

        let mut selectors = Vec::new();
        for (field_offset, list_ptr) in [
            (24u64, protocol.required_instance_methods),
            (40u64, protocol.optional_instance_methods),
        ] {
            if let Some(PointerTarget::Local(addr)) =
                self.field_pointer(proto_addr, field_offset, list_ptr)
            {
                selectors.extend(self.parse_method_list(addr));
            }
        }

        // inherited protocols are enumerated transitively
        if let Some(PointerTarget::Local(addr)) =
            self.field_pointer(proto_addr, 16, protocol.protocols)
        {
            self.parse_protocol_list(addr);
        }

        let parsed = ObjcProtocol { name, selectors };
        if self.known_protocol_names.insert(parsed.name.clone()) {
            self.protocols.push(parsed.clone());
        }
        Ok(parsed)
    }

    fn parse_protocol_list(&mut self, list_addr: u64) -> Vec<ObjcProtocol> {
        let count = match self.binary.read_pointer_at_address(list_addr) {
            Ok(count) if count <= MAX_LIST_COUNT => count,
            Ok(count) => {
                debug!(list_addr, count, "implausible protocol list count");
                return Vec::new();
            }
            Err(err) => {
                debug!(list_addr, error = %err, "unreadable protocol list");
                return Vec::new();
            }
        };

        let mut protocols = Vec::new();
        for index in 0..count {
            let entry = list_addr + 8 + index * 8;
            match self.resolve_pointer(entry) {
                Some(PointerTarget::Local(proto_addr)) => {
                    match self.parse_protocol(proto_addr) {
                        Ok(protocol) => protocols.push(protocol),
                        Err(err) => {
                            debug!(proto_addr, error = %err, "skipping malformed protocol");
                        }
                    }
                }
                Some(PointerTarget::Imported(symbol)) => {
                    // an adopted protocol defined elsewhere: record its name
                    let name = strip_protocol_symbol_prefix(&symbol).to_owned();
                    protocols.push(ObjcProtocol {
                        name,
                        selectors: Vec::new(),
                    });
                }
                None => debug!(entry, "unresolvable protocol list entry"),
            }
        }
        protocols
    }

    fn parse_method_list(&mut self, list_addr: u64) -> Vec<ObjcSelector> {
        let endian = self.binary.endian();
        let header: raw::ObjcListHeader = match self
            .binary
            .bytes_at_address(list_addr, raw::OBJC_LIST_HEADER_SIZE as u64)
            .and_then(|bytes| Ok(bytes.pread_with(0, endian)?))
        {
            Ok(header) => header,
            Err(err) => {
                debug!(list_addr, error = %err, "unreadable method list");
                return Vec::new();
            }
        };

        let entsize = (header.entsize & raw::OBJC_LIST_ENTSIZE_MASK) as u64;
        if entsize != raw::OBJC_METHOD_64_SIZE as u64 || header.count as u64 > MAX_LIST_COUNT {
            debug!(
                list_addr,
                entsize,
                count = header.count,
                "unsupported method list layout"
            );
            return Vec::new();
        }

        let mut selectors = Vec::new();
        for index in 0..header.count as u64 {
            let entry = list_addr + raw::OBJC_LIST_HEADER_SIZE as u64 + index * entsize;
            let method: raw::ObjcMethod64 = match self
                .binary
                .bytes_at_address(entry, entsize)
                .and_then(|bytes| Ok(bytes.pread_with(0, endian)?))
            {
                Ok(method) => method,
                Err(err) => {
                    debug!(entry, error = %err, "skipping unreadable method");
                    continue;
                }
            };

            let name = match self.read_referenced_string(entry, method.name) {
                Ok(name) => name,
                Err(err) => {
                    debug!(entry, error = %err, "skipping method with unreadable name");
                    continue;
                }
            };
            selectors.push(ObjcSelector {
                name,
                implementation: (method.implementation != 0).then_some(method.implementation),
            });
        }
        selectors
    }

    fn parse_ivar_list(&mut self, list_addr: u64) -> Vec<ObjcIvar> {
        let endian = self.binary.endian();
        let header: raw::ObjcListHeader = match self
            .binary
            .bytes_at_address(list_addr, raw::OBJC_LIST_HEADER_SIZE as u64)
            .and_then(|bytes| Ok(bytes.pread_with(0, endian)?))
        {
            Ok(header) => header,
            Err(err) => {
                debug!(list_addr, error = %err, "unreadable ivar list");
                return Vec::new();
            }
        };

        let entsize = (header.entsize & raw::OBJC_LIST_ENTSIZE_MASK) as u64;
        if entsize != raw::OBJC_IVAR_64_SIZE as u64 || header.count as u64 > MAX_LIST_COUNT {
            debug!(
                list_addr,
                entsize,
                count = header.count,
                "unsupported ivar list layout"
            );
            return Vec::new();
        }

        let mut ivars = Vec::new();
        for index in 0..header.count as u64 {
            let entry = list_addr + raw::OBJC_LIST_HEADER_SIZE as u64 + index * entsize;
            let parsed = (|| -> Result<ObjcIvar, MachoError> {
                let ivar: raw::ObjcIvar64 = self
                    .binary
                    .bytes_at_address(entry, entsize)?
                    .pread_with(0, endian)?;

                // the offset field points at the runtime's ivar offset
                // variable, which holds the actual field offset
                let field_offset = match self.field_pointer(entry, 0, ivar.offset_ptr) {
                    Some(PointerTarget::Local(slot)) => {
                        self.binary.read_u32_at_address(slot)? as u64
                    }
                    _ => 0,
                };
                let name = self.read_referenced_string(entry + 8, ivar.name)?;
                let type_encoding = self.read_referenced_string(entry + 16, ivar.type_encoding)?;

                Ok(ObjcIvar {
                    name,
                    type_encoding,
                    field_offset,
                })
            })();

            match parsed {
                Ok(ivar) => ivars.push(ivar),
                Err(err) => debug!(entry, error = %err, "skipping malformed ivar"),
            }
        }
        ivars
    }

    /// Resolves a pointer field and reads the C-string it targets.
    fn read_referenced_string(
        &self,
        field_addr: u64,
        raw_value: u64,
    ) -> Result<String, MachoError> {
        match self.field_pointer(field_addr, 0, raw_value) {
            Some(PointerTarget::Local(addr)) => self.binary.read_string_at_address(addr),
            _ => Err(MachoError::UnmappedVirtualAddress(field_addr)),
        }
    }

    /// Like [`Resolver::resolve_pointer`] for a field at `struct_addr +
    /// field_offset` whose stored value is already known.
    fn field_pointer(
        &self,
        struct_addr: u64,
        field_offset: u64,
        raw_value: u64,
    ) -> Option<PointerTarget> {
        if raw_value != 0 {
            return Some(PointerTarget::Local(raw_value));
        }
        match self.dyld_info.fixup_at(struct_addr + field_offset) {
            Some(DyldFixup::Rebase { target }) => Some(PointerTarget::Local(*target)),
            Some(DyldFixup::Bind { symbol_name, .. }) => {
                Some(PointerTarget::Imported(symbol_name.clone()))
            }
            None => None,
        }
    }

    /// Reads the name of the class structure at `class_addr`.
    fn class_name_at(&self, class_addr: u64) -> Result<String, MachoError> {
        let endian = self.binary.endian();
        let class: raw::ObjcClass64 = self
            .binary
            .bytes_at_address(class_addr, raw::OBJC_CLASS_64_SIZE as u64)?
            .pread_with(0, endian)?;

        let data_ptr = match self.field_pointer(class_addr, 32, class.data) {
            Some(PointerTarget::Local(ptr)) => ptr & raw::OBJC_CLASS_DATA_MASK,
            _ => return Err(MachoError::UnmappedVirtualAddress(class_addr)),
        };
        let ro: raw::ObjcClassRo64 = self
            .binary
            .bytes_at_address(data_ptr, raw::OBJC_CLASS_RO_64_SIZE as u64)?
            .pread_with(0, endian)?;
        self.read_referenced_string(data_ptr + 24, ro.name)
    }

    fn parse_selrefs(&mut self) -> HashMap<u64, String> {
        let mut selrefs = HashMap::new();
        for entry in self.pointer_section_entries("__objc_selrefs") {
            match self.resolve_pointer(entry) {
                Some(PointerTarget::Local(name_addr)) => {
                    match self.binary.read_string_at_address(name_addr) {
                        Ok(name) => {
                            selrefs.insert(entry, name);
                        }
                        Err(err) => debug!(entry, error = %err, "unreadable selref target"),
                    }
                }
                _ => debug!(entry, "unresolvable selref"),
            }
        }
        selrefs
    }

    fn parse_classrefs(&mut self) -> HashMap<u64, String> {
        let mut classrefs = HashMap::new();
        for entry in self.pointer_section_entries("__objc_classrefs") {
            match self.resolve_pointer(entry) {
                Some(PointerTarget::Local(class_addr)) => {
                    if let Ok(name) = self.class_name_at(class_addr) {
                        classrefs.insert(entry, name);
                    }
                }
                Some(PointerTarget::Imported(symbol)) => {
                    classrefs.insert(entry, strip_class_symbol_prefix(&symbol).to_owned());
                }
                None => debug!(entry, "unresolvable classref"),
            }
        }
        classrefs
    }
}

fn strip_class_symbol_prefix(symbol: &str) -> &str {
    symbol
        .strip_prefix("_OBJC_CLASS_$_")
        .or_else(|| symbol.strip_prefix("_OBJC_METACLASS_$_"))
        .unwrap_or(symbol)
}

fn strip_protocol_symbol_prefix(symbol: &str) -> &str {
    symbol
        .strip_prefix("__OBJC_PROTOCOL_$_")
        .or_else(|| symbol.strip_prefix("_OBJC_PROTOCOL_$_"))
        .unwrap_or(symbol)
}

/// Maps imported symbols to their `__stubs` trampolines by cross-referencing
/// the indirect symbol table.
fn build_stub_map(binary: &MachoBinary) -> (HashMap<String, u64>, HashMap<u64, String>) {
    let mut by_symbol = HashMap::new();
    let mut by_stub = HashMap::new();

    let stubs = match binary.section_named("__stubs") {
        Some(section) => section,
        None => return (by_symbol, by_stub),
    };
    let indirect = match binary.indirect_symbol_table() {
        Ok(indirect) => indirect,
        Err(err) => {
            debug!(error = %err, "indirect symbol table is unreadable");
            return (by_symbol, by_stub);
        }
    };

    let stub_size = match stubs.cmd.reserved2 as u64 {
        0 => DEFAULT_STUB_SIZE,
        size => size,
    };
    let first_slot = stubs.cmd.reserved1 as usize;
    let symbols = binary.symtab_contents();

    for index in 0..(stubs.size / stub_size) as usize {
        let slot = match indirect.get(first_slot + index) {
            Some(slot) => *slot,
            None => break,
        };
        if slot & (INDIRECT_SYMBOL_LOCAL | INDIRECT_SYMBOL_ABS) != 0 {
            continue;
        }
        let nlist = match symbols.get(slot as usize) {
            Some(nlist) => nlist,
            None => continue,
        };
        let name = match binary.symbol_name(nlist) {
            Ok(name) => name,
            Err(err) => {
                debug!(slot, error = %err, "skipping stub with unreadable name");
                continue;
            }
        };

        let stub_address = stubs.address + index as u64 * stub_size;
        by_symbol.insert(name.clone(), stub_address);
        by_stub.insert(stub_address, name);
    }

    (by_symbol, by_stub)
}

/// Maps each undefined symbol to the install path of the dylib supplying it,
/// via the two-level-namespace library ordinal in `n_desc`.
fn build_import_paths(binary: &MachoBinary) -> HashMap<String, String> {
    let dylib_paths: Vec<Option<String>> = binary
        .load_dylib_commands
        .iter()
        .map(|dylib| binary.dylib_path(dylib).ok())
        .collect();

    let mut paths = HashMap::new();
    for nlist in binary.symtab_contents() {
        if nlist.n_type & N_STAB != 0 || nlist.n_type & N_TYPE != N_UNDF {
            continue;
        }
        let ordinal = library_ordinal(nlist.n_desc) as usize;
        let path = match ordinal {
            0 => continue,
            n => match dylib_paths.get(n - 1) {
                Some(Some(path)) => path.clone(),
                _ => continue,
            },
        };
        match binary.symbol_name(nlist) {
            Ok(name) => {
                paths.insert(name, path);
            }
            Err(err) => debug!(error = %err, "skipping import with unreadable name"),
        }
    }
    paths
}
