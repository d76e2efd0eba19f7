//! Objective-C runtime metadata reconstruction for Mach-O slices.
//!
//! The entry point is [`ObjcRuntimeData::parse`], which walks the
//! `__objc_classlist`, `__objc_catlist` and `__objc_protolist` sections of a
//! parsed [`vambrace_macho::MachoBinary`] and emits the class, category,
//! protocol, selector and ivar graph. Raw pointer fields in those sections
//! are frequently zero until dynamic-loader fix-up, so resolution runs
//! through the dyld rebase/bind streams interpreted by [`DyldInfo`], and
//! imported references resolve through the indirect symbol table.
//!
//! Individual malformed records are skipped with a debug log rather than
//! failing the whole parse; partial metadata remains useful.

#![warn(missing_docs)]

mod dyld_info;
mod runtime;

pub mod raw;

pub use dyld_info::{DyldFixup, DyldInfo};
pub use runtime::{
    ObjcCategory, ObjcClass, ObjcClassLike, ObjcIvar, ObjcMethodInfo, ObjcProtocol,
    ObjcRuntimeData, ObjcSelector,
};
