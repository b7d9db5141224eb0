//! Just enough PE parsing to identify and resolve modules mapped in guest
//! memory: headers, the debug data directory (CodeView), and the export
//! directory.

use icebox_core::{Channel, Reader, Va, VmError};
use icebox_symbols::{find_codeview, CodeView};
use object::{
    endian::LittleEndian as LE,
    pe::{
        ImageDataDirectory, ImageDebugDirectory, ImageDosHeader, ImageExportDirectory,
        ImageNtHeaders64, IMAGE_DEBUG_TYPE_CODEVIEW, IMAGE_DIRECTORY_ENTRY_DEBUG,
        IMAGE_DIRECTORY_ENTRY_EXPORT, IMAGE_DOS_SIGNATURE, IMAGE_NT_SIGNATURE,
    },
    pod::{from_bytes, slice_from_all_bytes},
};

use crate::WindowsError;

/// Offset of the data directory array inside a PE32+ optional header.
const DATA_DIRECTORY_OFFSET: u64 = 112;

/// Upper bound on debug/export directory blobs read from the guest.
const MAX_DIRECTORY_SIZE: u32 = 0x1_0000;

/// Upper bound on exported names walked per image.
const MAX_EXPORTS: u32 = 0x1_0000;

/// A PE image mapped in guest memory.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PeImage {
    base: Va,
    size_of_image: u32,
    debug: Option<(u32, u32)>,
    export: Option<(u32, u32)>,
}

impl PeImage {
    /// Parses the headers of the image mapped at `base`.
    pub fn parse<C>(reader: &Reader<'_, C>, base: Va) -> Result<Self, VmError>
    where
        C: Channel,
    {
        let mut header = [0u8; 0x400];
        reader.read(base, &mut header)?;

        let (dos, _) = from_bytes::<ImageDosHeader>(&header)
            .map_err(|_| VmError::from(WindowsError::KernelNotFound))?;

        if dos.e_magic.get(LE) != IMAGE_DOS_SIGNATURE {
            return Err(WindowsError::KernelNotFound.into());
        }

        let nt_offset = dos.e_lfanew.get(LE) as usize;
        if nt_offset + size_of::<ImageNtHeaders64>() > header.len() {
            return Err(WindowsError::KernelNotFound.into());
        }

        let (nt, _) = from_bytes::<ImageNtHeaders64>(&header[nt_offset..])
            .map_err(|_| VmError::from(WindowsError::KernelNotFound))?;

        if nt.signature.get(LE) != IMAGE_NT_SIGNATURE {
            return Err(WindowsError::KernelNotFound.into());
        }

        let optional = &nt.optional_header;
        let directory_count = optional.number_of_rva_and_sizes.get(LE);

        let directories_va = base
            + nt_offset as u64
            + 4
            + size_of::<object::pe::ImageFileHeader>() as u64
            + DATA_DIRECTORY_OFFSET;

        let directory = |index: u32| -> Result<Option<(u32, u32)>, VmError> {
            if index >= directory_count {
                return Ok(None);
            }

            let mut bytes = [0u8; size_of::<ImageDataDirectory>()];
            reader.read(directories_va + index as u64 * 8, &mut bytes)?;

            let (dir, _) = from_bytes::<ImageDataDirectory>(&bytes)
                .map_err(|_| VmError::from(WindowsError::KernelNotFound))?;

            let va = dir.virtual_address.get(LE);
            let size = dir.size.get(LE);

            Ok((va != 0 && size != 0 && size <= MAX_DIRECTORY_SIZE).then_some((va, size)))
        };

        Ok(Self {
            base,
            size_of_image: optional.size_of_image.get(LE),
            debug: directory(IMAGE_DIRECTORY_ENTRY_DEBUG as u32)?,
            export: directory(IMAGE_DIRECTORY_ENTRY_EXPORT as u32)?,
        })
    }

    /// Returns the image base.
    pub fn base(&self) -> Va {
        self.base
    }

    /// Returns `SizeOfImage` from the optional header.
    pub fn size_of_image(&self) -> u32 {
        self.size_of_image
    }

    /// Extracts the CodeView PDB reference from the debug data directory.
    pub fn codeview<C>(&self, reader: &Reader<'_, C>) -> Result<Option<CodeView>, VmError>
    where
        C: Channel,
    {
        let (dir_va, dir_size) = match self.debug {
            Some(debug) => debug,
            None => return Ok(None),
        };

        let mut data = vec![0u8; dir_size as usize];
        reader.read(self.base + dir_va as u64, &mut data)?;

        let entries: &[ImageDebugDirectory] = match slice_from_all_bytes(&data) {
            Ok(entries) => entries,
            Err(_) => {
                tracing::warn!("debug directory size is not a whole number of entries");
                return Ok(None);
            }
        };

        for entry in entries {
            if entry.typ.get(LE) != IMAGE_DEBUG_TYPE_CODEVIEW {
                continue;
            }

            let rva = entry.address_of_raw_data.get(LE);
            let size = entry.size_of_data.get(LE);

            if rva == 0 || size == 0 || size > MAX_DIRECTORY_SIZE {
                tracing::warn!(rva, size, "implausible CodeView entry");
                continue;
            }

            let mut info = vec![0u8; size as usize];
            reader.read(self.base + rva as u64, &mut info)?;

            if let Some(codeview) = find_codeview(&info) {
                return Ok(Some(codeview));
            }
        }

        Ok(None)
    }

    /// Walks the export directory, yielding `(name, address)` pairs.
    pub fn exports<C>(&self, reader: &Reader<'_, C>) -> Result<Vec<(String, Va)>, VmError>
    where
        C: Channel,
    {
        let (dir_va, _) = match self.export {
            Some(export) => export,
            None => return Ok(Vec::new()),
        };

        let mut bytes = [0u8; size_of::<ImageExportDirectory>()];
        reader.read(self.base + dir_va as u64, &mut bytes)?;

        let (export, _) = from_bytes::<ImageExportDirectory>(&bytes)
            .map_err(|_| VmError::from(WindowsError::KernelNotFound))?;

        let count = std::cmp::min(export.number_of_names.get(LE), MAX_EXPORTS);
        let names = self.base + export.address_of_names.get(LE) as u64;
        let ordinals = self.base + export.address_of_name_ordinals.get(LE) as u64;
        let functions = self.base + export.address_of_functions.get(LE) as u64;

        let mut result = Vec::with_capacity(count as usize);

        for index in 0..count as u64 {
            let name_rva = reader.read_u32(names + index * 4)?;
            let name = reader.read_cstring(self.base + name_rva as u64, 256)?;

            let ordinal = reader.read_u16(ordinals + index * 2)? as u64;
            let function_rva = reader.read_u32(functions + ordinal * 4)?;

            result.push((name, self.base + function_rva as u64));
        }

        Ok(result)
    }
}
