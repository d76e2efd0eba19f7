use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// An error produced while parsing a Mach-O container.
///
/// Container-level failures surface through this enum; the downstream
/// resolvers treat per-record failures as best-effort skips instead.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MachoError {
    /// The slice magic is not a supported 64-bit Mach-O magic.
    #[error("unsupported Mach-O magic {magic:#010x} in {path} at slice offset {offset:#x}")]
    UnsupportedFormat {
        /// Path of the input file.
        path: PathBuf,
        /// Offset of the slice within the file.
        offset: u64,
        /// The magic that was read.
        magic: u32,
    },

    /// A load command or structure extends past its declared bounds.
    #[error("malformed Mach-O header in {path}: {reason} at offset {offset:#x}")]
    MalformedHeader {
        /// Path of the input file.
        path: PathBuf,
        /// Offset of the offending structure within the slice.
        offset: u64,
        /// What went wrong.
        reason: &'static str,
    },

    /// A byte read fell outside the underlying file.
    #[error("read of {size:#x} bytes at offset {offset:#x} exceeds the slice length {len:#x}")]
    OutOfBounds {
        /// Requested offset within the slice.
        offset: u64,
        /// Requested read length.
        size: u64,
        /// Length of the slice.
        len: u64,
    },

    /// A file-offset read was invoked with what is clearly a virtual address.
    #[error("offset {0:#x} looks like a virtual address; translate it to a file offset first")]
    LooksLikeVirtualAddress(u64),

    /// No section exists that can translate the given virtual address.
    #[error("virtual address {0:#x} is not mapped by any section")]
    UnmappedVirtualAddress(u64),

    /// A code-signing blob carried a magic outside the recognized set.
    #[error("unknown code-signing blob magic {0:#010x}")]
    UnknownCodesignBlob(u32),

    /// No NUL terminator was found within the bounded search window, or the
    /// bytes were not valid UTF-8.
    #[error("no valid NUL-terminated string at {0:#x}")]
    MalformedString(u64),

    /// The input file could not be read.
    #[error("failed to read input file")]
    Io(#[from] io::Error),

    /// A fixed-size structure could not be decoded.
    #[error("malformed structure")]
    Decode(#[from] scroll::Error),
}
