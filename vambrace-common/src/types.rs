//! Architecture and file-type enums shared by the analysis crates.

use std::fmt;

const CPU_ARCH_ABI64: u32 = 0x0100_0000;
const CPU_TYPE_ARM: u32 = 12;
const CPU_TYPE_ARM64: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64;

/// The CPU target of a Mach-O slice.
///
/// Only the Apple ARM targets are distinguished; everything else maps to
/// [`CpuType::Unknown`].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum CpuType {
    /// 32-bit ARM (structural parsing only).
    Armv7,
    /// 64-bit ARM.
    Arm64,
    /// Any other CPU type.
    Unknown,
}

impl CpuType {
    /// Maps a raw `cputype` header word to a [`CpuType`].
    pub fn from_mach(cputype: u32) -> Self {
        match cputype {
            CPU_TYPE_ARM => CpuType::Armv7,
            CPU_TYPE_ARM64 => CpuType::Arm64,
            _ => CpuType::Unknown,
        }
    }

    /// The name of this CPU type, as used by Apple toolchains.
    pub fn name(self) -> &'static str {
        match self {
            CpuType::Armv7 => "armv7",
            CpuType::Arm64 => "arm64",
            CpuType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for CpuType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The `filetype` field of a Mach-O header.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MachoFileType {
    /// Relocatable object file (`MH_OBJECT`).
    Object,
    /// Demand-paged executable (`MH_EXECUTE`).
    Execute,
    /// Dynamic library (`MH_DYLIB`).
    Dylib,
    /// Dynamic link editor (`MH_DYLINKER`).
    Dylinker,
    /// Loadable bundle (`MH_BUNDLE`).
    Bundle,
    /// Companion debug-symbol file (`MH_DSYM`).
    Dsym,
    /// Kernel extension bundle (`MH_KEXT_BUNDLE`).
    KextBundle,
    /// Any file type not listed above, with the raw header word.
    Unknown(u32),
}

impl MachoFileType {
    /// Maps a raw `filetype` header word to a [`MachoFileType`].
    pub fn from_mach(filetype: u32) -> Self {
        match filetype {
            1 => MachoFileType::Object,
            2 => MachoFileType::Execute,
            6 => MachoFileType::Dylib,
            7 => MachoFileType::Dylinker,
            8 => MachoFileType::Bundle,
            0xa => MachoFileType::Dsym,
            0xb => MachoFileType::KextBundle,
            other => MachoFileType::Unknown(other),
        }
    }
}

impl fmt::Display for MachoFileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachoFileType::Object => f.write_str("object"),
            MachoFileType::Execute => f.write_str("execute"),
            MachoFileType::Dylib => f.write_str("dylib"),
            MachoFileType::Dylinker => f.write_str("dylinker"),
            MachoFileType::Bundle => f.write_str("bundle"),
            MachoFileType::Dsym => f.write_str("dsym"),
            MachoFileType::KextBundle => f.write_str("kext bundle"),
            MachoFileType::Unknown(raw) => write!(f, "unknown ({raw:#x})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_type_mapping() {
        assert_eq!(CpuType::from_mach(12), CpuType::Armv7);
        assert_eq!(CpuType::from_mach(0x0100_000c), CpuType::Arm64);
        assert_eq!(CpuType::from_mach(7), CpuType::Unknown);
    }

    #[test]
    fn test_file_type_mapping() {
        assert_eq!(MachoFileType::from_mach(2), MachoFileType::Execute);
        assert_eq!(MachoFileType::from_mach(0x99), MachoFileType::Unknown(0x99));
    }
}
