//! PE image accessor.
//!
//! Opens a linked image from disk, maps load-relative addresses to file offsets and applies
//! base relocations so the image can be loaded at a chosen address.

use anyhow::{anyhow, bail, Context, Result};
use object::pe;
use object::read::pe::{ImageNtHeaders, ImageOptionalHeader, PeFile64};
use std::fs;
use std::mem::size_of;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Offset of `ImageBase` within the 64-bit optional header.
const IMAGE_BASE_OFFSET: usize = 24;

pub struct Image {
    path: PathBuf,
    data: Vec<u8>,
}

impl Image {
    pub fn open(path: &Path) -> Result<Self> {
        let data = fs::read(path).with_context(|| format!("failed to read image {}", path.display()))?;
        Self::from_bytes(path, data)
    }

    pub fn from_bytes(path: &Path, data: Vec<u8>) -> Result<Self> {
        PeFile64::parse(&*data).with_context(|| format!("{} is not a 64-bit PE image", path.display()))?;
        Ok(Self { path: path.to_path_buf(), data })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    fn pe(&self) -> Result<PeFile64<'_>> {
        Ok(PeFile64::parse(&*self.data)?)
    }

    pub fn entry_point_rva(&self) -> Result<u32> {
        Ok(self.pe()?.nt_headers().optional_header().address_of_entry_point())
    }

    pub fn size_of_image(&self) -> Result<u32> {
        Ok(self.pe()?.nt_headers().optional_header().size_of_image())
    }

    pub fn image_base(&self) -> Result<u64> {
        Ok(self.pe()?.nt_headers().optional_header().image_base())
    }

    /// File offset of `len` bytes at `rva`. The range must not cross a section boundary.
    pub fn file_offset(&self, rva: u32, len: usize) -> Result<usize> {
        let pe = self.pe()?;
        let headers = pe.nt_headers().optional_header().size_of_headers();
        if rva < headers {
            if rva as usize + len > headers as usize {
                bail!("range at RVA 0x{:x} crosses the end of the headers", rva);
            }
            return Ok(rva as usize);
        }
        let (offset, available) = pe
            .section_table()
            .pe_file_range_at(rva)
            .ok_or_else(|| anyhow!("RVA 0x{:x} is not backed by file data in {}", rva, self.path.display()))?;
        if len > available as usize {
            bail!("range of {} bytes at RVA 0x{:x} crosses a section boundary", len, rva);
        }
        Ok(offset as usize)
    }

    pub fn read(&self, rva: u32, len: usize) -> Result<&[u8]> {
        let offset = self.file_offset(rva, len)?;
        self.data.get(offset..offset + len).context("read past the end of the image")
    }

    pub fn write(&mut self, rva: u32, bytes: &[u8]) -> Result<()> {
        let offset = self.file_offset(rva, bytes.len())?;
        self.data
            .get_mut(offset..offset + bytes.len())
            .context("write past the end of the image")?
            .copy_from_slice(bytes);
        Ok(())
    }

    /// Applies base relocations so that the image expects to be loaded at `new_base`.
    pub fn rebase(&mut self, new_base: u64) -> Result<()> {
        let old_base = self.image_base()?;
        if old_base == new_base {
            return Ok(());
        }
        let delta = new_base.wrapping_sub(old_base);

        let mut fixups = Vec::new();
        let nt_headers_offset;
        {
            let pe = self.pe()?;
            nt_headers_offset = pe.dos_header().nt_headers_offset() as usize;
            let sections = pe.section_table();
            if let Some(mut blocks) = pe.data_directories().relocation_blocks(&*self.data, &sections)? {
                while let Some(block) = blocks.next()? {
                    for reloc in block {
                        match reloc.typ {
                            pe::IMAGE_REL_BASED_ABSOLUTE => {}
                            pe::IMAGE_REL_BASED_DIR64 => fixups.push((reloc.virtual_address, 8)),
                            pe::IMAGE_REL_BASED_HIGHLOW => fixups.push((reloc.virtual_address, 4)),
                            other => bail!("unsupported base relocation type {} at RVA 0x{:x}", other, reloc.virtual_address),
                        }
                    }
                }
            }
        }

        for &(rva, size) in &fixups {
            let offset = self.file_offset(rva, size)?;
            let field = &mut self.data[offset..offset + size];
            if size == 8 {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(field);
                field.copy_from_slice(&u64::from_le_bytes(raw).wrapping_add(delta).to_le_bytes());
            } else {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(field);
                field.copy_from_slice(&u32::from_le_bytes(raw).wrapping_add(delta as u32).to_le_bytes());
            }
        }

        let offset = nt_headers_offset + 4 + size_of::<pe::ImageFileHeader>() + IMAGE_BASE_OFFSET;
        self.data[offset..offset + 8].copy_from_slice(&new_base.to_le_bytes());
        debug!("Rebased {} from 0x{:x} to 0x{:x} ({} fixups)", self.path.display(), old_base, new_base, fixups.len());
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, &self.data).with_context(|| format!("failed to write image {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::PeBuilder;

    fn sample() -> Vec<u8> {
        let pointer = (0x1_8000_0000u64 + 0x1010).to_le_bytes();
        PeBuilder::new(0x1_8000_0000)
            .text(0x1000, &[0xc3; 0x20])
            .data(0x2000, &[pointer.as_slice(), &[0u8; 8]].concat())
            .entry(0x1000)
            .dir64(0x2000)
            .build()
    }

    #[test]
    fn reads_headers() {
        let image = Image::from_bytes(Path::new("a.dll"), sample()).unwrap();
        assert_eq!(image.entry_point_rva().unwrap(), 0x1000);
        assert_eq!(image.image_base().unwrap(), 0x1_8000_0000);
        assert!(image.size_of_image().unwrap() >= 0x3000);
        assert_eq!(image.read(0x1000, 2).unwrap(), &[0xc3, 0xc3]);
        assert!(image.read(0x9000, 1).is_err());
    }

    #[test]
    fn rebases_pointers_and_header() {
        let mut image = Image::from_bytes(Path::new("a.dll"), sample()).unwrap();
        image.rebase(0x1_4001_0000).unwrap();
        assert_eq!(image.image_base().unwrap(), 0x1_4001_0000);
        let pointer = u64::from_le_bytes(image.read(0x2000, 8).unwrap().try_into().unwrap());
        assert_eq!(pointer, 0x1_4001_0000 + 0x1010);
        let untouched = u64::from_le_bytes(image.read(0x2008, 8).unwrap().try_into().unwrap());
        assert_eq!(untouched, 0);
    }

    #[test]
    fn writes_through_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.dll");
        fs::write(&path, sample()).unwrap();
        let mut image = Image::open(&path).unwrap();
        image.write(0x1000, &[0x90, 0x90]).unwrap();
        image.save(&path).unwrap();
        assert_eq!(Image::open(&path).unwrap().read(0x1000, 3).unwrap(), &[0x90, 0x90, 0xc3]);
    }
}
