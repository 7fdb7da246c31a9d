//! Object file tables.
//!
//! Parses a COFF object file into the view the patch pipeline needs:
//! 1. Symbols: defined and undefined, with their section, offset and function-ness.
//! 2. Relocations: attributed to the defined symbol whose bytes they patch, and resolved to a
//!    destination symbol name (section-relative references are resolved to the symbol at the
//!    referenced offset).
//! 3. Linker directives from the `.drectve` section.
//!
//! Relocations that can never be fixed up in a running process (debug info aside) are
//! remembered per destination so that those destinations are never stripped.

use anyhow::{Context, Result};
use memmap2::Mmap;
use object::pe;
use object::read::archive::ArchiveFile;
use object::read::coff::CoffFile;
use object::{
    LittleEndian as LE, Object, ObjectSection, ObjectSymbol as _, RelocationFlags, RelocationTarget,
    SectionFlags, SectionIndex, SymbolKind, SymbolSection,
};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

use crate::symbol::disambiguate_local;
use crate::utils::{split_command_line, unique_id};

const DIRECTIVE_SECTION: &str = ".drectve";

/// How a relocation computes the value it writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocationType {
    /// 32-bit offset relative to the start of the destination's section.
    SectionRelative,
    /// 32-bit displacement relative to the end of the field plus `extra` bytes.
    Relative { extra: u8 },
    /// 32-bit absolute address.
    NarrowVa,
    /// 32-bit address relative to the image base.
    NarrowRva,
    /// 64-bit absolute address.
    WideVa,
    Unknown(u16),
}

impl RelocationType {
    pub fn from_coff(typ: u16) -> Option<Self> {
        Some(match typ {
            pe::IMAGE_REL_AMD64_ABSOLUTE => return None,
            pe::IMAGE_REL_AMD64_ADDR64 => RelocationType::WideVa,
            pe::IMAGE_REL_AMD64_ADDR32 => RelocationType::NarrowVa,
            pe::IMAGE_REL_AMD64_ADDR32NB => RelocationType::NarrowRva,
            pe::IMAGE_REL_AMD64_REL32..=pe::IMAGE_REL_AMD64_REL32_5 => {
                RelocationType::Relative { extra: (typ - pe::IMAGE_REL_AMD64_REL32) as u8 }
            }
            pe::IMAGE_REL_AMD64_SECREL => RelocationType::SectionRelative,
            other => RelocationType::Unknown(other),
        })
    }

    /// Size of the relocated field in bytes.
    pub fn size(self) -> usize {
        match self {
            RelocationType::WideVa => 8,
            _ => 4,
        }
    }

    /// Whether the field can be recomputed in a running process.
    pub fn is_patchable(self) -> bool {
        !matches!(self, RelocationType::SectionRelative | RelocationType::Unknown(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    /// Offset of the relocated field from the start of the source symbol.
    pub offset: u32,
    /// Destination symbol.
    pub target: String,
    /// Displacement from the destination symbol (the implicit addend).
    pub addend: i64,
    pub kind: RelocationType,
}

#[derive(Debug, Clone)]
pub struct ObjectSymbol {
    /// Index into the COFF symbol table.
    pub index: usize,
    pub name: String,
    pub section: Option<SectionIndex>,
    /// Offset within the section.
    pub offset: u32,
    pub is_function: bool,
    pub is_external: bool,
    pub is_undefined: bool,
    pub is_weak: bool,
    pub relocations: Vec<Relocation>,
}

/// Parsed tables of one object file.
#[derive(Debug, Clone)]
pub struct ObjectDb {
    pub path: PathBuf,
    pub unique_id: u32,
    pub symbols: Vec<ObjectSymbol>,
    by_name: HashMap<String, usize>,
    pub directives: Vec<String>,
    /// Destinations referenced by at least one relocation that cannot be patched.
    pub unpatchable_references: HashSet<String>,
}

impl ObjectDb {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let mmap = unsafe { Mmap::map(&file)? };
        Self::parse(path, &mmap).with_context(|| format!("failed to parse object file {}", path.display()))
    }

    pub fn parse(path: &Path, data: &[u8]) -> Result<Self> {
        let coff = CoffFile::<&[u8]>::parse(data)?;
        let id = unique_id(path);

        let mut symbols = Vec::new();
        let mut slot_by_index = HashMap::new();
        let mut section_symbols = HashMap::new();
        for symbol in coff.symbols() {
            let raw_name = symbol.name()?;
            let section = match symbol.section() {
                SymbolSection::Section(index) => Some(index),
                SymbolSection::Undefined | SymbolSection::Common => None,
                _ => continue,
            };
            match symbol.kind() {
                SymbolKind::Section => {
                    if let Some(index) = section {
                        section_symbols.insert(symbol.index().0, index);
                    }
                    continue;
                }
                SymbolKind::File | SymbolKind::Label => continue,
                _ => {}
            }
            let is_undefined = symbol.is_undefined() || section.is_none();
            let is_external = symbol.is_global() || is_undefined;
            let name = if is_external { raw_name.to_string() } else { disambiguate_local(raw_name, id) };
            let offset = match section {
                Some(index) => symbol.address() - coff.section_by_index(index)?.address(),
                None => 0,
            };
            slot_by_index.insert(symbol.index().0, symbols.len());
            symbols.push(ObjectSymbol {
                index: symbol.index().0,
                name,
                section,
                offset: offset as u32,
                is_function: symbol.kind() == SymbolKind::Text,
                is_external,
                is_undefined,
                is_weak: symbol.is_weak(),
                relocations: Vec::new(),
            });
        }

        // Defined symbols of every section, sorted by offset, to attribute relocations.
        let mut by_section: HashMap<SectionIndex, Vec<(u32, usize)>> = HashMap::new();
        for (slot, symbol) in symbols.iter().enumerate() {
            if let Some(section) = symbol.section {
                by_section.entry(section).or_default().push((symbol.offset, slot));
            }
        }
        for list in by_section.values_mut() {
            list.sort_unstable();
        }
        let symbol_at = |section: SectionIndex, offset: u32| -> Option<usize> {
            let list = by_section.get(&section)?;
            let position = list.partition_point(|&(o, _)| o <= offset);
            list.get(position.checked_sub(1)?).map(|&(_, slot)| slot)
        };

        let mut directives = Vec::new();
        let mut unpatchable_references = HashSet::new();
        let mut attributed = Vec::new();
        for section in coff.sections() {
            let name = section.name().unwrap_or_default();
            if name == DIRECTIVE_SECTION {
                let text = String::from_utf8_lossy(section.data()?);
                directives.extend(split_command_line(text.trim_start_matches('\u{feff}')));
                continue;
            }
            if is_debug_section(section.flags()) {
                continue;
            }
            let data = section.data()?;
            for (offset, reloc) in section.relocations() {
                let RelocationFlags::Coff { typ } = reloc.flags() else { continue };
                let Some(kind) = RelocationType::from_coff(typ) else { continue };
                let RelocationTarget::Symbol(target_index) = reloc.target() else { continue };
                let offset = offset as u32;
                let implicit = read_implicit_addend(data, offset as usize, kind.size());

                let (target, addend) = if let Some(&target_section) = section_symbols.get(&target_index.0) {
                    let clamped = implicit.clamp(0, u32::MAX as i64) as u32;
                    match symbol_at(target_section, clamped) {
                        Some(slot) => (symbols[slot].name.clone(), implicit - symbols[slot].offset as i64),
                        None => {
                            trace!("No symbol behind section reference at 0x{:x} in {}", offset, name);
                            continue;
                        }
                    }
                } else if let Some(&slot) = slot_by_index.get(&target_index.0) {
                    (symbols[slot].name.clone(), implicit)
                } else {
                    continue;
                };

                match symbol_at(section.index(), offset) {
                    Some(source) if kind.is_patchable() => {
                        let relocation = Relocation { offset: offset - symbols[source].offset, target, addend, kind };
                        attributed.push((source, relocation));
                    }
                    _ => {
                        unpatchable_references.insert(target);
                    }
                }
            }
        }
        for (source, relocation) in attributed {
            symbols[source].relocations.push(relocation);
        }

        let by_name = symbols.iter().enumerate().map(|(slot, s)| (s.name.clone(), slot)).collect();
        debug!(
            "Parsed {}: {} symbols, {} directives",
            path.display(),
            symbols.len(),
            directives.len()
        );
        Ok(Self {
            path: path.to_path_buf(),
            unique_id: id,
            symbols,
            by_name,
            directives,
            unpatchable_references,
        })
    }

    pub fn symbol(&self, name: &str) -> Option<&ObjectSymbol> {
        self.by_name.get(name).map(|&slot| &self.symbols[slot])
    }

    pub fn defined(&self) -> impl Iterator<Item = &ObjectSymbol> {
        self.symbols.iter().filter(|s| !s.is_undefined)
    }

    pub fn undefined(&self) -> impl Iterator<Item = &ObjectSymbol> {
        self.symbols.iter().filter(|s| s.is_undefined)
    }

    /// Names of the external symbols this file defines.
    pub fn external_definitions(&self) -> impl Iterator<Item = &str> {
        self.defined().filter(|s| s.is_external).map(|s| s.name.as_str())
    }

    pub fn external_functions(&self) -> impl Iterator<Item = &str> {
        self.defined().filter(|s| s.is_external && s.is_function).map(|s| s.name.as_str())
    }

    /// Symbols named by `/INCLUDE:` directives.
    pub fn included_symbols(&self) -> impl Iterator<Item = &str> {
        self.directives.iter().filter_map(|d| include_directive(d))
    }
}

/// Returns the symbol of an `/INCLUDE:` or `-include:` directive.
pub fn include_directive(directive: &str) -> Option<&str> {
    let body = directive.strip_prefix('/').or_else(|| directive.strip_prefix('-'))?;
    let (option, symbol) = body.split_once(':')?;
    option.eq_ignore_ascii_case("include").then(|| symbol.trim_matches('"'))
}

pub fn is_debug_section(flags: SectionFlags) -> bool {
    match flags {
        SectionFlags::Coff { characteristics } => {
            characteristics & (pe::IMAGE_SCN_MEM_DISCARDABLE | pe::IMAGE_SCN_LNK_INFO | pe::IMAGE_SCN_LNK_REMOVE) != 0
        }
        _ => false,
    }
}

fn read_implicit_addend(data: &[u8], offset: usize, size: usize) -> i64 {
    match (size, data.get(offset..offset + size)) {
        (4, Some(bytes)) => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64,
        (8, Some(bytes)) => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(bytes);
            i64::from_le_bytes(raw)
        }
        _ => 0,
    }
}

/// Collects the weak symbols of every member of a static library.
pub fn weak_symbols_in_library(library: &Path) -> Result<Vec<String>> {
    let file = File::open(library).with_context(|| format!("failed to open {}", library.display()))?;
    let mmap = unsafe { Mmap::map(&file)? };
    let archive = ArchiveFile::parse(&*mmap).context("failed to parse static library")?;

    let mut weak = Vec::new();
    for member in archive.members() {
        let member = member?;
        // Members are not aligned inside the archive.
        let data = member.data(&*mmap)?.to_vec();
        let Ok(obj) = object::File::parse(&*data) else {
            trace!("Skipping member {}", String::from_utf8_lossy(member.name()));
            continue;
        };
        for symbol in obj.symbols() {
            if symbol.is_weak() {
                weak.push(symbol.name()?.to_string());
            }
        }
    }
    Ok(weak)
}

/// Reads the little-endian header of a COFF object to tell it apart from other inputs.
pub fn is_coff_object(data: &[u8]) -> bool {
    object::pod::from_bytes::<pe::ImageFileHeader>(data)
        .map(|(header, _)| header.machine.get(LE) == pe::IMAGE_FILE_MACHINE_AMD64)
        .unwrap_or(false)
}
