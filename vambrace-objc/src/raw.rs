//! Raw Objective-C 2 runtime structures as laid out in 64-bit images.
//!
//! Like the container structures, these decode with an explicit
//! [`scroll::Endian`] context taken from the owning slice.

use scroll::Pread;

/// `class_t`: an entry of `__objc_classlist` points at one of these.
#[derive(Clone, Copy, Debug, Pread)]
pub struct ObjcClass64 {
    /// Pointer to the metaclass.
    pub metaclass: u64,
    /// Pointer to the superclass, or 0 when bound at load time.
    pub superclass: u64,
    /// Method cache, uninitialized on disk.
    pub cache: u64,
    /// Vtable, uninitialized on disk.
    pub vtable: u64,
    /// Pointer to the `class_ro_t`, with flag bits in the low bits.
    pub data: u64,
}

/// Size of [`ObjcClass64`] on disk.
pub const OBJC_CLASS_64_SIZE: usize = 40;

/// Mask clearing the flag bits of [`ObjcClass64::data`].
pub const OBJC_CLASS_DATA_MASK: u64 = !3;

/// `class_ro_t` flag bit marking a metaclass.
pub const RO_META: u32 = 1 << 0;

/// `class_ro_t`: the read-only class description.
#[derive(Clone, Copy, Debug, Pread)]
pub struct ObjcClassRo64 {
    /// Class flags (`RO_*`).
    pub flags: u32,
    /// Offset of the first ivar.
    pub instance_start: u32,
    /// Total instance size.
    pub instance_size: u32,
    /// Reserved.
    pub reserved: u32,
    /// Pointer to the strong ivar layout.
    pub ivar_layout: u64,
    /// Pointer to the class name C-string.
    pub name: u64,
    /// Pointer to the instance-method list.
    pub base_methods: u64,
    /// Pointer to the protocol list.
    pub base_protocols: u64,
    /// Pointer to the ivar list.
    pub ivars: u64,
    /// Pointer to the weak ivar layout.
    pub weak_ivar_layout: u64,
    /// Pointer to the property list.
    pub base_properties: u64,
}

/// Size of [`ObjcClassRo64`] on disk.
pub const OBJC_CLASS_RO_64_SIZE: usize = 72;

/// Header shared by method and ivar lists.
#[derive(Clone, Copy, Debug, Pread)]
pub struct ObjcListHeader {
    /// Entry size, with flag bits in the high half.
    pub entsize: u32,
    /// Number of entries.
    pub count: u32,
}

/// Size of [`ObjcListHeader`] on disk.
pub const OBJC_LIST_HEADER_SIZE: usize = 8;

/// Mask clearing the flag bits of [`ObjcListHeader::entsize`].
pub const OBJC_LIST_ENTSIZE_MASK: u32 = 0xffff;

/// `method_t`: one method-list entry.
#[derive(Clone, Copy, Debug, Pread)]
pub struct ObjcMethod64 {
    /// Pointer to the selector name C-string.
    pub name: u64,
    /// Pointer to the type-encoding C-string.
    pub signature: u64,
    /// Implementation address; 0 in protocol method lists.
    pub implementation: u64,
}

/// Size of [`ObjcMethod64`] on disk.
pub const OBJC_METHOD_64_SIZE: usize = 24;

/// `ivar_t`: one ivar-list entry.
#[derive(Clone, Copy, Debug, Pread)]
pub struct ObjcIvar64 {
    /// Pointer to the 32-bit ivar offset variable.
    pub offset_ptr: u64,
    /// Pointer to the ivar name C-string.
    pub name: u64,
    /// Pointer to the type-encoding C-string.
    pub type_encoding: u64,
    /// Alignment as a power of two.
    pub alignment: u32,
    /// Size of the ivar in bytes.
    pub size: u32,
}

/// Size of [`ObjcIvar64`] on disk.
pub const OBJC_IVAR_64_SIZE: usize = 32;

/// `protocol_list_t` header: a count followed by that many pointers.
#[derive(Clone, Copy, Debug, Pread)]
pub struct ObjcProtocolList64 {
    /// Number of protocol pointers that follow.
    pub count: u64,
}

/// `protocol_t`: the runtime protocol description.
#[derive(Clone, Copy, Debug, Pread)]
pub struct ObjcProtocol64 {
    /// Pointer to the protocol's isa.
    pub isa: u64,
    /// Pointer to the protocol name C-string.
    pub name: u64,
    /// Pointer to the inherited-protocol list.
    pub protocols: u64,
    /// Pointer to the required instance-method list.
    pub required_instance_methods: u64,
    /// Pointer to the required class-method list.
    pub required_class_methods: u64,
    /// Pointer to the optional instance-method list.
    pub optional_instance_methods: u64,
    /// Pointer to the optional class-method list.
    pub optional_class_methods: u64,
    /// Pointer to the property list.
    pub instance_properties: u64,
}

/// Size of [`ObjcProtocol64`] on disk.
pub const OBJC_PROTOCOL_64_SIZE: usize = 64;

/// `category_t`: an entry of `__objc_catlist` points at one of these.
#[derive(Clone, Copy, Debug, Pread)]
pub struct ObjcCategory64 {
    /// Pointer to the category name C-string.
    pub name: u64,
    /// Pointer to the base class, or 0 when bound at load time.
    pub base_class: u64,
    /// Pointer to the added instance-method list.
    pub instance_methods: u64,
    /// Pointer to the added class-method list.
    pub class_methods: u64,
    /// Pointer to the adopted-protocol list.
    pub protocols: u64,
    /// Pointer to the property list.
    pub instance_properties: u64,
}

/// Size of [`ObjcCategory64`] on disk.
pub const OBJC_CATEGORY_64_SIZE: usize = 48;
