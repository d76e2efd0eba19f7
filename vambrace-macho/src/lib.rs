//! Parsing for Mach-O containers produced by Apple toolchains.
//!
//! The entry point is [`MachoArchive`], which demultiplexes FAT files into
//! per-architecture slices. Each slice parses into a [`MachoBinary`] exposing
//! the structures later analysis stages consume: segment and section tables
//! (in declaration order), symbol and dynamic-symbol tables, dylib load
//! commands, dyld fix-up stream locations, and the embedded code signature.
//!
//! All Mach-O structures are decoded in the slice's native endianness as
//! derived from the magic; the code-signing blobs parsed by [`codesign`] are
//! big-endian regardless of host or slice endianness.
//!
//! ```no_run
//! use vambrace_macho::MachoArchive;
//!
//! let archive = MachoArchive::open("/path/to/binary")?;
//! let binary = archive.best_slice().expect("no parseable slice");
//! for section in binary.sections() {
//!     println!("{} at {:#x}", section.name_lossy(), section.address);
//! }
//! # Ok::<_, vambrace_macho::MachoError>(())
//! ```

#![warn(missing_docs)]

mod archive;
mod binary;
mod error;

pub mod codesign;
pub mod raw;

pub use archive::{MachoArchive, SliceDescriptor};
pub use binary::{HeaderFlag, MachoBinary, MachoDylib, MachoSection};
pub use codesign::{parse_code_signature, CodeSignature};
pub use error::MachoError;
