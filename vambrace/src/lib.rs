//! Vambrace is a static-analysis core for Mach-O binaries produced by Apple
//! toolchains, targeting ARM64 executables. It answers three questions about
//! a binary without executing it:
//!
//! - what is its structural layout (segments, sections, load commands,
//!   symbol tables, code-signing blobs) — [`macho`];
//! - what Objective-C runtime metadata does it embed (classes, categories,
//!   protocols, selectors, instance variables) — [`objc`];
//! - for any function within it, what is its control-flow decomposition into
//!   basic blocks, and which calls and argument values can be reconstructed
//!   from its instruction stream — [`analyze`].
//!
//! The crates are largely independent; this umbrella bundles them for
//! convenience.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use vambrace::analyze::MachoAnalyzer;
//! use vambrace::macho::MachoArchive;
//! # fn decoder() -> Arc<dyn vambrace::analyze::InstructionDecoder> { unimplemented!() }
//!
//! let archive = MachoArchive::open("/path/to/binary")?;
//! let binary = Arc::new(archive.best_slice().expect("no parseable slice"));
//! let analyzer = MachoAnalyzer::get_analyzer(binary, decoder());
//!
//! for class in analyzer.objc_classes() {
//!     println!("{}: {} selectors", class.display_name(), class.selectors().len());
//! }
//! # Ok::<_, vambrace::macho::MachoError>(())
//! ```

#![warn(missing_docs)]

#[doc(inline)]
pub use vambrace_analyze as analyze;
#[doc(inline)]
pub use vambrace_common as common;
#[doc(inline)]
pub use vambrace_macho as macho;
#[doc(inline)]
pub use vambrace_objc as objc;
