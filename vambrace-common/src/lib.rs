//! Shared primitives for the vambrace Mach-O analysis crates.
//!
//! This crate provides the [`ByteView`] memory-mapped file view used for
//! random access over input binaries, and the small closed enums describing
//! a Mach-O slice's CPU target and file type.

#![warn(missing_docs)]

mod byteview;
mod types;

pub use byteview::ByteView;
pub use types::{CpuType, MachoFileType};
