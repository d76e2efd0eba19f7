//! Test support for the vambrace crates.
//!
//! Real Mach-O fixtures cannot accompany the repository, so the test suites
//! construct images programmatically: [`ImageBuilder`] assembles a thin
//! 64-bit Mach-O byte-for-byte (segments, sections, symbol tables, dyld
//! opcode streams, code-signing blobs), and [`FixtureDecoder`] stands in for
//! the external ARM64 instruction decoder with canned instruction lists.

mod builder;
mod codesign;
mod decoder;

pub use builder::{fat, BindStreamBuilder, ImageBuilder, RebaseStreamBuilder, VIRTUAL_BASE};
pub use codesign::{build_code_directory, build_entitlements_blob, build_superblob};
pub use decoder::{imm, ins, mem, reg, FixtureDecoder};
