use std::path::{Path, PathBuf};

use scroll::{Endian, Pread};
use tracing::debug;

use vambrace_common::{ByteView, CpuType};

use crate::binary::MachoBinary;
use crate::error::MachoError;
use crate::raw;

/// Location of one CPU-specific slice within an input file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SliceDescriptor {
    /// CPU target of the slice, [`CpuType::Unknown`] for thin files until the
    /// slice itself is parsed.
    pub cpu_type: CpuType,
    /// File offset of the slice.
    pub offset: u64,
    /// Size of the slice in bytes.
    pub size: u64,
}

/// An opened input file, demultiplexed into Mach-O slice descriptors.
///
/// FAT containers (`0xcafebabe` / `0xbebafeca`) yield one descriptor per arch
/// entry; anything else yields a single whole-file descriptor whose CPU type
/// is discovered when the slice is parsed.
#[derive(Debug)]
pub struct MachoArchive {
    path: PathBuf,
    view: ByteView,
    descriptors: Vec<SliceDescriptor>,
}

impl MachoArchive {
    /// Opens and demultiplexes the file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, MachoError> {
        let path = path.as_ref().to_owned();
        let view = ByteView::open(&path)?;
        let descriptors = demultiplex(&view)?;
        Ok(MachoArchive {
            path,
            view,
            descriptors,
        })
    }

    /// Tests whether the buffer starts with a FAT magic.
    pub fn is_fat(data: &[u8]) -> bool {
        match data.pread_with::<u32>(0, Endian::Big) {
            Ok(magic) => magic == raw::FAT_MAGIC || magic == raw::FAT_CIGAM,
            Err(_) => false,
        }
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The slice descriptors of this file, in container order.
    pub fn descriptors(&self) -> &[SliceDescriptor] {
        &self.descriptors
    }

    /// Number of slices in this file.
    pub fn slice_count(&self) -> usize {
        self.descriptors.len()
    }

    /// Parses the slice at the given descriptor index.
    pub fn slice(&self, index: usize) -> Option<Result<MachoBinary, MachoError>> {
        let descriptor = self.descriptors.get(index)?;
        Some(MachoBinary::parse(
            &self.path,
            self.view.clone(),
            descriptor.offset,
            descriptor.size,
        ))
    }

    /// Parses every slice, skipping the ones that fail (32-bit slices,
    /// foreign architectures).
    pub fn slices(&self) -> Vec<MachoBinary> {
        (0..self.descriptors.len())
            .filter_map(|index| match self.slice(index) {
                Some(Ok(binary)) => Some(binary),
                Some(Err(err)) => {
                    debug!(index, error = %err, "skipping unparseable slice");
                    None
                }
                None => None,
            })
            .collect()
    }

    /// The parsed ARM64 slice, when the file contains one.
    pub fn get_arm64_slice(&self) -> Option<MachoBinary> {
        self.slices()
            .into_iter()
            .find(|binary| binary.cpu_type == CpuType::Arm64)
    }

    /// The preferred slice for analysis: ARM64 when present, otherwise the
    /// first slice that parses.
    pub fn best_slice(&self) -> Option<MachoBinary> {
        let mut slices = self.slices();
        if let Some(index) = slices
            .iter()
            .position(|binary| binary.cpu_type == CpuType::Arm64)
        {
            return Some(slices.swap_remove(index));
        }
        slices.into_iter().next()
    }
}

fn demultiplex(view: &ByteView) -> Result<Vec<SliceDescriptor>, MachoError> {
    let whole_file = || {
        vec![SliceDescriptor {
            cpu_type: CpuType::Unknown,
            offset: 0,
            size: view.len() as u64,
        }]
    };

    // FAT headers are big-endian on disk; a byte-swapped container reads back
    // as FAT_CIGAM and flips the record endianness
    let endian = match view.pread_with::<u32>(0, Endian::Big) {
        Ok(raw::FAT_MAGIC) => Endian::Big,
        Ok(raw::FAT_CIGAM) => Endian::Little,
        _ => return Ok(whole_file()),
    };

    let header: raw::FatHeader = view.pread_with(0, endian)?;
    let mut descriptors = Vec::with_capacity(header.nfat_arch as usize);
    let mut offset = 8usize;
    for _ in 0..header.nfat_arch {
        let arch: raw::FatArch = view.pread_with(offset, endian)?;
        descriptors.push(SliceDescriptor {
            cpu_type: CpuType::from_mach(arch.cputype),
            offset: arch.offset as u64,
            size: arch.size as u64,
        });
        offset += 20;
    }
    Ok(descriptors)
}
