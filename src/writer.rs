//! COFF object rewriter.
//!
//! Edits object files in place before they are handed to the linker. The file layout never
//! changes; only header fields, symbol records, relocation types and directive bytes do:
//! - a removed symbol is renamed to `&` and moved to a pseudo-section the linker ignores,
//! - a removed section loses its data, relocations and line numbers and is marked for removal,
//! - directives are blanked out with spaces.
//!
//! Every rewritten file is backed up first and restored after linking.

use anyhow::{anyhow, bail, Context, Result};
use object::pe;
use object::pod::{from_bytes, from_bytes_mut, slice_from_bytes, slice_from_bytes_mut};
use object::LittleEndian as LE;
use std::collections::HashMap;
use std::fs;
use std::mem::size_of;
use std::path::{Path, PathBuf};
use tracing::trace;

use crate::config::SymbolRemovalStrategy;
use crate::utils::{append_to_file_name, split_command_line};

const SYMBOL_SIZE: usize = size_of::<pe::ImageSymbol>();
const SECTION_HEADER_SIZE: usize = size_of::<pe::ImageSectionHeader>();
const REMOVED_SYMBOL_NAME: [u8; 8] = *b"&\0\0\0\0\0\0\0";
const REMOVED_SECTION_NAME: [u8; 8] = *b".remove\0";
const BACKUP_SUFFIX: &str = ".bak";

/// A record of the symbol table, aux records skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSymbol {
    pub index: usize,
    pub name: String,
    pub value: u32,
    pub section_number: i16,
    pub storage_class: u8,
    pub aux_count: u8,
}

impl RawSymbol {
    /// The static symbol carrying a section's definition record.
    pub fn is_section_definition(&self) -> bool {
        self.storage_class == pe::IMAGE_SYM_CLASS_STATIC && self.aux_count > 0 && self.value == 0 && self.name.starts_with('.')
    }

    pub fn is_removed(&self) -> bool {
        self.name == "&" && self.storage_class == pe::IMAGE_SYM_CLASS_NULL
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Comdat {
    pub selection: u8,
    /// Section this one is associated with, for `IMAGE_COMDAT_SELECT_ASSOCIATIVE`.
    pub associated: usize,
}

#[derive(Debug, Clone)]
pub struct RawSection {
    /// One-based section number.
    pub number: usize,
    pub name: String,
    pub characteristics: u32,
    pub comdat: Option<Comdat>,
}

impl RawSection {
    pub fn is_discardable(&self) -> bool {
        self.characteristics & pe::IMAGE_SCN_MEM_DISCARDABLE != 0
    }

    /// Sections with `LNK_INFO` or `LNK_REMOVE` never reach the image.
    pub fn is_part_of_image(&self) -> bool {
        self.characteristics & (pe::IMAGE_SCN_LNK_INFO | pe::IMAGE_SCN_LNK_REMOVE) == 0
    }

    pub fn is_select_any(&self) -> bool {
        self.comdat.map_or(false, |c| c.selection == pe::IMAGE_COMDAT_SELECT_ANY)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRelocation {
    pub symbol_index: usize,
    pub typ: u16,
}

pub struct CoffRewriter {
    data: Vec<u8>,
    strategy: SymbolRemovalStrategy,
    sections_offset: usize,
    section_count: usize,
    symbols_offset: usize,
    symbol_count: usize,
    strings_offset: usize,
}

impl CoffRewriter {
    pub fn open(path: &Path, strategy: SymbolRemovalStrategy) -> Result<Self> {
        let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(data, strategy).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn parse(data: Vec<u8>, strategy: SymbolRemovalStrategy) -> Result<Self> {
        let (header, _) =
            from_bytes::<pe::ImageFileHeader>(&data).map_err(|()| anyhow!("file too small for a COFF header"))?;
        if header.machine.get(LE) != pe::IMAGE_FILE_MACHINE_AMD64 {
            bail!("unsupported machine 0x{:x}, only x86_64 objects are supported", header.machine.get(LE));
        }
        let sections_offset = size_of::<pe::ImageFileHeader>() + header.size_of_optional_header.get(LE) as usize;
        let section_count = header.number_of_sections.get(LE) as usize;
        let symbols_offset = header.pointer_to_symbol_table.get(LE) as usize;
        let symbol_count = header.number_of_symbols.get(LE) as usize;
        let strings_offset = symbols_offset + symbol_count * SYMBOL_SIZE;
        if sections_offset + section_count * SECTION_HEADER_SIZE > data.len() || strings_offset > data.len() {
            bail!("COFF tables extend past the end of the file");
        }
        Ok(Self { data, strategy, sections_offset, section_count, symbols_offset, symbol_count, strings_offset })
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, &self.data).with_context(|| format!("failed to write {}", path.display()))
    }

    fn section_header(&self, number: usize) -> Result<&pe::ImageSectionHeader> {
        if number == 0 || number > self.section_count {
            bail!("section number {} out of range", number);
        }
        let offset = self.sections_offset + (number - 1) * SECTION_HEADER_SIZE;
        from_bytes(&self.data[offset..]).map(|(h, _)| h).map_err(|()| anyhow!("truncated section header"))
    }

    fn section_header_mut(&mut self, number: usize) -> Result<&mut pe::ImageSectionHeader> {
        if number == 0 || number > self.section_count {
            bail!("section number {} out of range", number);
        }
        let offset = self.sections_offset + (number - 1) * SECTION_HEADER_SIZE;
        from_bytes_mut(&mut self.data[offset..]).map(|(h, _)| h).map_err(|()| anyhow!("truncated section header"))
    }

    fn symbol_record(&self, index: usize) -> Result<&pe::ImageSymbol> {
        if index >= self.symbol_count {
            bail!("symbol index {} out of range", index);
        }
        let offset = self.symbols_offset + index * SYMBOL_SIZE;
        from_bytes(&self.data[offset..]).map(|(s, _)| s).map_err(|()| anyhow!("truncated symbol table"))
    }

    fn symbol_record_mut(&mut self, index: usize) -> Result<&mut pe::ImageSymbol> {
        if index >= self.symbol_count {
            bail!("symbol index {} out of range", index);
        }
        let offset = self.symbols_offset + index * SYMBOL_SIZE;
        from_bytes_mut(&mut self.data[offset..]).map(|(s, _)| s).map_err(|()| anyhow!("truncated symbol table"))
    }

    fn aux_section_mut(&mut self, index: usize) -> Result<&mut pe::ImageAuxSymbolSection> {
        if index >= self.symbol_count {
            bail!("aux record {} out of range", index);
        }
        let offset = self.symbols_offset + index * SYMBOL_SIZE;
        from_bytes_mut(&mut self.data[offset..]).map(|(s, _)| s).map_err(|()| anyhow!("truncated symbol table"))
    }

    fn string_at(&self, offset: usize) -> String {
        let start = self.strings_offset + offset;
        let bytes = self.data.get(start..).unwrap_or_default();
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        String::from_utf8_lossy(&bytes[..end]).into_owned()
    }

    fn short_name(raw: &[u8; 8]) -> String {
        let end = raw.iter().position(|&b| b == 0).unwrap_or(8);
        String::from_utf8_lossy(&raw[..end]).into_owned()
    }

    fn symbol_name(&self, symbol: &pe::ImageSymbol) -> String {
        if symbol.name[..4] == [0; 4] {
            let offset = u32::from_le_bytes([symbol.name[4], symbol.name[5], symbol.name[6], symbol.name[7]]);
            self.string_at(offset as usize)
        } else {
            Self::short_name(&symbol.name)
        }
    }

    fn section_name(&self, header: &pe::ImageSectionHeader) -> String {
        let name = Self::short_name(&header.name);
        match name.strip_prefix('/').and_then(|digits| digits.parse::<usize>().ok()) {
            Some(offset) => self.string_at(offset),
            None => name,
        }
    }

    pub fn symbols(&self) -> Result<Vec<RawSymbol>> {
        let mut symbols = Vec::new();
        let mut index = 0;
        while index < self.symbol_count {
            let record = self.symbol_record(index)?;
            symbols.push(RawSymbol {
                index,
                name: self.symbol_name(record),
                value: record.value.get(LE),
                section_number: record.section_number.get(LE) as i16,
                storage_class: record.storage_class,
                aux_count: record.number_of_aux_symbols,
            });
            index += 1 + record.number_of_aux_symbols as usize;
        }
        Ok(symbols)
    }

    pub fn sections(&self) -> Result<Vec<RawSection>> {
        let mut comdats = HashMap::new();
        for symbol in self.symbols()? {
            if !symbol.is_section_definition() || symbol.section_number <= 0 {
                continue;
            }
            let offset = self.symbols_offset + (symbol.index + 1) * SYMBOL_SIZE;
            let (aux, _) = from_bytes::<pe::ImageAuxSymbolSection>(&self.data[offset..])
                .map_err(|()| anyhow!("truncated section definition"))?;
            comdats.insert(
                symbol.section_number as usize,
                Comdat { selection: aux.selection, associated: aux.number.get(LE) as usize },
            );
        }

        let mut sections = Vec::with_capacity(self.section_count);
        for number in 1..=self.section_count {
            let header = self.section_header(number)?;
            let characteristics = header.characteristics.get(LE);
            sections.push(RawSection {
                number,
                name: self.section_name(header),
                characteristics,
                comdat: if characteristics & pe::IMAGE_SCN_LNK_COMDAT != 0 {
                    comdats.get(&number).copied()
                } else {
                    None
                },
            });
        }
        Ok(sections)
    }

    fn relocation_table(&self, number: usize) -> Result<(usize, usize)> {
        let header = self.section_header(number)?;
        let offset = header.pointer_to_relocations.get(LE) as usize;
        let mut count = header.number_of_relocations.get(LE) as usize;
        if header.characteristics.get(LE) & pe::IMAGE_SCN_LNK_NRELOC_OVFL != 0 {
            // The real count is stored in the first record, which counts itself.
            let (first, _) = from_bytes::<pe::ImageRelocation>(self.data.get(offset..).unwrap_or_default())
                .map_err(|()| anyhow!("truncated relocation table"))?;
            count = first.virtual_address.get(LE) as usize;
            return Ok((offset + size_of::<pe::ImageRelocation>(), count.saturating_sub(1)));
        }
        Ok((offset, count))
    }

    pub fn relocations(&self, number: usize) -> Result<Vec<RawRelocation>> {
        let (offset, count) = self.relocation_table(number)?;
        if count == 0 {
            return Ok(Vec::new());
        }
        let (records, _) = slice_from_bytes::<pe::ImageRelocation>(self.data.get(offset..).unwrap_or_default(), count)
            .map_err(|()| anyhow!("truncated relocation table in section {}", number))?;
        Ok(records
            .iter()
            .map(|r| RawRelocation { symbol_index: r.symbol_table_index.get(LE) as usize, typ: r.typ.get(LE) })
            .collect())
    }

    pub fn set_relocation_type(&mut self, number: usize, relocation: usize, typ: u16) -> Result<()> {
        let (offset, count) = self.relocation_table(number)?;
        let (records, _) = slice_from_bytes_mut::<pe::ImageRelocation>(&mut self.data[offset..], count)
            .map_err(|()| anyhow!("truncated relocation table in section {}", number))?;
        let record = records.get_mut(relocation).context("relocation index out of range")?;
        record.typ.set(LE, typ);
        Ok(())
    }

    /// Neutralises a symbol: the linker neither resolves nor defines it anymore.
    pub fn remove_symbol(&mut self, index: usize) -> Result<()> {
        let section_number = self.strategy.section_number();
        let record = self.symbol_record_mut(index)?;
        record.name = REMOVED_SYMBOL_NAME;
        record.value.set(LE, 0);
        record.section_number.set(LE, section_number as u16);
        record.typ.set(LE, pe::IMAGE_SYM_TYPE_NULL);
        record.storage_class = pe::IMAGE_SYM_CLASS_NULL;
        trace!("Removed symbol #{}", index);
        Ok(())
    }

    /// Drops a section from the link.
    pub fn remove_section(&mut self, number: usize) -> Result<()> {
        let header = self.section_header_mut(number)?;
        header.name = REMOVED_SECTION_NAME;
        header.size_of_raw_data.set(LE, 0);
        header.pointer_to_raw_data.set(LE, 0);
        header.pointer_to_relocations.set(LE, 0);
        header.pointer_to_linenumbers.set(LE, 0);
        header.number_of_relocations.set(LE, 0);
        header.number_of_linenumbers.set(LE, 0);
        header.characteristics.set(LE, pe::IMAGE_SCN_LNK_REMOVE | pe::IMAGE_SCN_MEM_DISCARDABLE);

        let definitions: Vec<usize> = self
            .symbols()?
            .into_iter()
            .filter(|s| s.is_section_definition() && s.section_number as usize == number)
            .map(|s| s.index + 1)
            .collect();
        for aux in definitions {
            let aux = self.aux_section_mut(aux)?;
            aux.length.set(LE, 0);
            aux.number_of_relocations.set(LE, 0);
            aux.number_of_linenumbers.set(LE, 0);
        }
        trace!("Removed section #{}", number);
        Ok(())
    }

    /// Blanks out every directive `keep` rejects. Returns the number of directives removed.
    pub fn rewrite_directives(&mut self, mut keep: impl FnMut(&str) -> bool) -> Result<usize> {
        let Some(section) = self.sections()?.into_iter().find(|s| s.name == ".drectve") else {
            return Ok(0);
        };
        let header = self.section_header(section.number)?;
        let offset = header.pointer_to_raw_data.get(LE) as usize;
        let size = header.size_of_raw_data.get(LE) as usize;
        let raw = self.data.get(offset..offset + size).context("directive section out of bounds")?;
        let Ok(text) = std::str::from_utf8(raw) else {
            trace!("Directive section is not valid UTF-8, leaving it alone");
            return Ok(0);
        };
        let body = text.trim_start_matches('\u{feff}');
        let prefix_len = text.len() - body.len();

        let tokens = split_command_line(body);
        let kept: Vec<&str> = tokens.iter().map(String::as_str).filter(|t| keep(t)).collect();
        let removed = tokens.len() - kept.len();
        if removed == 0 {
            return Ok(0);
        }
        let mut rewritten = kept.join(" ").into_bytes();
        rewritten.resize(size - prefix_len, b' ');
        self.data[offset + prefix_len..offset + size].copy_from_slice(&rewritten);
        Ok(removed)
    }
}

pub fn backup_path(object: &Path) -> PathBuf {
    append_to_file_name(object, BACKUP_SUFFIX)
}

/// Copies an object file next to itself before it is rewritten.
pub fn backup(object: &Path) -> Result<PathBuf> {
    let backup = backup_path(object);
    fs::copy(object, &backup).with_context(|| format!("failed to back up {}", object.display()))?;
    Ok(backup)
}

/// Moves the backup of an object file back into place.
pub fn restore(object: &Path) -> Result<()> {
    let backup = backup_path(object);
    fs::rename(&backup, object).with_context(|| format!("failed to restore {}", object.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_file::ObjectDb;
    use crate::testing::{ObjectBuilder, SymbolSpec};

    fn sample() -> Vec<u8> {
        let mut builder = ObjectBuilder::new();
        let g_x = builder.undefined("g_x", false);
        let text = builder.text(&[0x8b, 0x05, 0, 0, 0, 0, 0xc3]);
        builder.function(text, "GetX", 0, 7);
        builder.relocate(text, 2, g_x, pe::IMAGE_REL_AMD64_REL32);
        let data = builder.data(&7u32.to_le_bytes());
        builder.add(SymbolSpec::data(data, "g_y", 0));
        builder.directives("/EXPORT:GetX /EDITANDCONTINUE /INCLUDE:g_y /DEFAULTLIB:\"LIBCMT\"");
        builder.build()
    }

    #[test]
    fn removes_symbols() {
        for strategy in [SymbolRemovalStrategy::DebugSection, SymbolRemovalStrategy::Absolute] {
            let mut rewriter = CoffRewriter::parse(sample(), strategy).unwrap();
            let g_x = rewriter.symbols().unwrap().into_iter().find(|s| s.name == "g_x").unwrap();
            rewriter.remove_symbol(g_x.index).unwrap();

            let symbols = rewriter.symbols().unwrap();
            let removed = symbols.iter().find(|s| s.index == g_x.index).unwrap();
            assert!(removed.is_removed());
            assert_eq!(removed.section_number, strategy.section_number());

            let db = ObjectDb::parse(Path::new("b.obj"), &rewriter.into_bytes()).unwrap();
            assert!(db.symbol("g_x").is_none());
            assert!(db.symbol("GetX").is_some());
        }
    }

    #[test]
    fn removes_sections() {
        let mut rewriter = CoffRewriter::parse(sample(), SymbolRemovalStrategy::DebugSection).unwrap();
        let data = rewriter.sections().unwrap().into_iter().find(|s| s.name == ".data").unwrap();
        rewriter.remove_section(data.number).unwrap();

        let removed = &rewriter.sections().unwrap()[data.number - 1];
        assert_eq!(removed.name, ".remove");
        assert!(!removed.is_part_of_image());
        assert!(removed.is_discardable());
        assert!(rewriter.relocations(data.number).unwrap().is_empty());

        let text = rewriter.sections().unwrap().into_iter().find(|s| s.name == ".text").unwrap();
        assert_eq!(rewriter.relocations(text.number).unwrap().len(), 1);
    }

    #[test]
    fn rewrites_relocation_types() {
        let mut rewriter = CoffRewriter::parse(sample(), SymbolRemovalStrategy::Absolute).unwrap();
        let text = rewriter.sections().unwrap().into_iter().find(|s| s.name == ".text").unwrap();
        rewriter.set_relocation_type(text.number, 0, pe::IMAGE_REL_AMD64_ADDR32NB).unwrap();
        assert_eq!(rewriter.relocations(text.number).unwrap()[0].typ, pe::IMAGE_REL_AMD64_ADDR32NB);
    }

    #[test]
    fn rewrites_directives_in_place() {
        let original = sample();
        let mut rewriter = CoffRewriter::parse(original.clone(), SymbolRemovalStrategy::DebugSection).unwrap();
        let removed = rewriter
            .rewrite_directives(|d| !d.starts_with("/EXPORT:") && !d.starts_with("/EDITANDCONTINUE"))
            .unwrap();
        assert_eq!(removed, 2);
        let bytes = rewriter.into_bytes();
        assert_eq!(bytes.len(), original.len());

        let db = ObjectDb::parse(Path::new("b.obj"), &bytes).unwrap();
        assert_eq!(db.directives, vec!["/INCLUDE:g_y", "/DEFAULTLIB:\"LIBCMT\""]);
    }

    #[test]
    fn backup_and_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.obj");
        let original = sample();
        fs::write(&path, &original).unwrap();

        backup(&path).unwrap();
        let mut rewriter = CoffRewriter::open(&path, SymbolRemovalStrategy::DebugSection).unwrap();
        let g_y = rewriter.symbols().unwrap().into_iter().find(|s| s.name == "g_y").unwrap();
        rewriter.remove_symbol(g_y.index).unwrap();
        rewriter.rewrite_directives(|_| false).unwrap();
        rewriter.save(&path).unwrap();
        assert_ne!(fs::read(&path).unwrap(), original);

        restore(&path).unwrap();
        assert_eq!(fs::read(&path).unwrap(), original);
        assert!(!backup_path(&path).exists());
    }
}
