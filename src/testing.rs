//! Fixtures shared by the unit tests: object file and image builders, plus fakes for the
//! provider, toolchain and transport seams.

use anyhow::{anyhow, Result};
use object::write::{Object, Relocation, SectionId, Symbol, SymbolId, SymbolSection};
use object::{pe, Architecture, BinaryFormat, Endianness, RelocationFlags, SectionKind, SymbolFlags, SymbolKind, SymbolScope};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::compiland::{CompilandDb, LinkerDb};
use crate::image::Image;
use crate::process::{Process, SimulatedProcess};
use crate::provider::{ImageDatabases, SymbolProvider};
use crate::symbol::{ContributionDb, ImageSectionDb, SymbolDb, ThunkDb};
use crate::toolchain::{ToolOutput, Toolchain};
use crate::transport::{Command, Reply, Transport};
use crate::utils::{align_up, split_command_line};

pub struct SymbolSpec {
    pub name: String,
    pub section: Option<SectionId>,
    pub offset: u64,
    pub size: u64,
    pub kind: SymbolKind,
    pub scope: SymbolScope,
}

impl SymbolSpec {
    pub fn data(section: SectionId, name: &str, offset: u64) -> Self {
        Self { name: name.into(), section: Some(section), offset, size: 0, kind: SymbolKind::Data, scope: SymbolScope::Linkage }
    }

    pub fn local_data(section: SectionId, name: &str, offset: u64) -> Self {
        Self { scope: SymbolScope::Compilation, ..Self::data(section, name, offset) }
    }
}

/// Builds x86_64 COFF object files.
pub struct ObjectBuilder {
    object: Object<'static>,
}

impl ObjectBuilder {
    pub fn new() -> Self {
        Self { object: Object::new(BinaryFormat::Coff, Architecture::X86_64, Endianness::Little) }
    }

    pub fn section(&mut self, name: &str, kind: SectionKind, bytes: &[u8]) -> SectionId {
        let id = self.object.add_section(Vec::new(), name.as_bytes().to_vec(), kind);
        self.object.append_section_data(id, bytes, 1);
        id
    }

    pub fn text(&mut self, code: &[u8]) -> SectionId {
        self.section(".text", SectionKind::Text, code)
    }

    pub fn data(&mut self, bytes: &[u8]) -> SectionId {
        self.section(".data", SectionKind::Data, bytes)
    }

    pub fn append(&mut self, section: SectionId, bytes: &[u8]) -> u64 {
        self.object.append_section_data(section, bytes, 1)
    }

    pub fn add(&mut self, spec: SymbolSpec) -> SymbolId {
        self.object.add_symbol(Symbol {
            name: spec.name.into_bytes(),
            value: spec.offset,
            size: spec.size,
            kind: spec.kind,
            scope: spec.scope,
            weak: false,
            section: spec.section.map_or(SymbolSection::Undefined, SymbolSection::Section),
            flags: SymbolFlags::None,
        })
    }

    pub fn section_symbol(&mut self, section: SectionId) -> SymbolId {
        self.object.section_symbol(section)
    }

    pub fn function(&mut self, section: SectionId, name: &str, offset: u64, size: u64) -> SymbolId {
        self.add(SymbolSpec {
            name: name.into(),
            section: Some(section),
            offset,
            size,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
        })
    }

    pub fn undefined(&mut self, name: &str, is_function: bool) -> SymbolId {
        self.add(SymbolSpec {
            name: name.into(),
            section: None,
            offset: 0,
            size: 0,
            kind: if is_function { SymbolKind::Text } else { SymbolKind::Data },
            scope: SymbolScope::Linkage,
        })
    }

    /// Adds a relocation whose in-place addend ends up zero.
    pub fn relocate(&mut self, section: SectionId, offset: u64, symbol: SymbolId, typ: u16) {
        let addend = match typ {
            pe::IMAGE_REL_AMD64_REL32..=pe::IMAGE_REL_AMD64_REL32_5 => -4 - (typ - pe::IMAGE_REL_AMD64_REL32) as i64,
            _ => 0,
        };
        self.object
            .add_relocation(section, Relocation { offset, symbol, addend, flags: RelocationFlags::Coff { typ } })
            .unwrap();
    }

    pub fn directives(&mut self, text: &str) {
        self.section(".drectve", SectionKind::Linker, text.as_bytes());
    }

    pub fn build(self) -> Vec<u8> {
        self.object.write().unwrap()
    }
}

const PAGE: u32 = 0x1000;
const PE_OFFSET: usize = 0x40;
const OPTIONAL_HEADER_OFFSET: usize = PE_OFFSET + 4 + 20;
const OPTIONAL_HEADER_SIZE: usize = 240;
const SECTION_TABLE_OFFSET: usize = OPTIONAL_HEADER_OFFSET + OPTIONAL_HEADER_SIZE;

/// Builds 64-bit PE images whose file layout matches their memory layout.
pub struct PeBuilder {
    image_base: u64,
    entry_rva: u32,
    sections: Vec<([u8; 8], u32, Vec<u8>, u32)>,
    dir64: Vec<u32>,
}

impl PeBuilder {
    pub fn new(image_base: u64) -> Self {
        Self { image_base, entry_rva: 0, sections: Vec::new(), dir64: Vec::new() }
    }

    pub fn section(mut self, name: &str, rva: u32, bytes: &[u8], characteristics: u32) -> Self {
        let mut raw = [0u8; 8];
        raw[..name.len()].copy_from_slice(name.as_bytes());
        self.sections.push((raw, rva, bytes.to_vec(), characteristics));
        self
    }

    pub fn text(self, rva: u32, code: &[u8]) -> Self {
        self.section(
            ".text",
            rva,
            code,
            pe::IMAGE_SCN_CNT_CODE | pe::IMAGE_SCN_MEM_EXECUTE | pe::IMAGE_SCN_MEM_READ,
        )
    }

    pub fn data(self, rva: u32, bytes: &[u8]) -> Self {
        self.section(
            ".data",
            rva,
            bytes,
            pe::IMAGE_SCN_CNT_INITIALIZED_DATA | pe::IMAGE_SCN_MEM_READ | pe::IMAGE_SCN_MEM_WRITE,
        )
    }

    pub fn entry(mut self, rva: u32) -> Self {
        self.entry_rva = rva;
        self
    }

    /// Registers a 64-bit base relocation.
    pub fn dir64(mut self, rva: u32) -> Self {
        self.dir64.push(rva);
        self
    }

    fn end_of_sections(&self) -> u32 {
        self.sections
            .iter()
            .map(|(_, rva, bytes, _)| align_up((*rva + bytes.len() as u32) as u64, PAGE as u64) as u32)
            .max()
            .unwrap_or(PAGE)
    }

    pub fn build(mut self) -> Vec<u8> {
        let mut reloc_directory = (0, 0);
        if !self.dir64.is_empty() {
            let mut blocks = Vec::new();
            let mut fixups = std::mem::take(&mut self.dir64);
            fixups.sort_unstable();
            let mut pages: Vec<u32> = fixups.iter().map(|rva| rva & !(PAGE - 1)).collect();
            pages.dedup();
            for page in pages {
                let mut entries: Vec<u16> = fixups
                    .iter()
                    .filter(|rva| *rva & !(PAGE - 1) == page)
                    .map(|rva| (pe::IMAGE_REL_BASED_DIR64 << 12) | (rva & (PAGE - 1)) as u16)
                    .collect();
                if entries.len() % 2 == 1 {
                    entries.push(0);
                }
                blocks.extend_from_slice(&page.to_le_bytes());
                blocks.extend_from_slice(&(8 + 2 * entries.len() as u32).to_le_bytes());
                for entry in entries {
                    blocks.extend_from_slice(&entry.to_le_bytes());
                }
            }
            let rva = self.end_of_sections();
            reloc_directory = (rva, blocks.len() as u32);
            self = self.section(
                ".reloc",
                rva,
                &blocks,
                pe::IMAGE_SCN_CNT_INITIALIZED_DATA | pe::IMAGE_SCN_MEM_READ | pe::IMAGE_SCN_MEM_DISCARDABLE,
            );
        }

        let size_of_image = self.end_of_sections();
        let mut image = vec![0u8; size_of_image as usize];
        let put16 = |image: &mut Vec<u8>, offset: usize, value: u16| image[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
        let put32 = |image: &mut Vec<u8>, offset: usize, value: u32| image[offset..offset + 4].copy_from_slice(&value.to_le_bytes());

        image[0..2].copy_from_slice(b"MZ");
        put32(&mut image, 0x3c, PE_OFFSET as u32);
        image[PE_OFFSET..PE_OFFSET + 4].copy_from_slice(b"PE\0\0");

        let file_header = PE_OFFSET + 4;
        put16(&mut image, file_header, pe::IMAGE_FILE_MACHINE_AMD64);
        put16(&mut image, file_header + 2, self.sections.len() as u16);
        put16(&mut image, file_header + 16, OPTIONAL_HEADER_SIZE as u16);
        put16(
            &mut image,
            file_header + 18,
            pe::IMAGE_FILE_EXECUTABLE_IMAGE | pe::IMAGE_FILE_LARGE_ADDRESS_AWARE | pe::IMAGE_FILE_DLL,
        );

        let optional = OPTIONAL_HEADER_OFFSET;
        put16(&mut image, optional, pe::IMAGE_NT_OPTIONAL_HDR64_MAGIC);
        put32(&mut image, optional + 16, self.entry_rva);
        image[optional + 24..optional + 32].copy_from_slice(&self.image_base.to_le_bytes());
        put32(&mut image, optional + 32, PAGE);
        put32(&mut image, optional + 36, PAGE);
        put16(&mut image, optional + 40, 6);
        put16(&mut image, optional + 48, 6);
        put32(&mut image, optional + 56, size_of_image);
        put32(&mut image, optional + 60, PAGE);
        put16(&mut image, optional + 68, pe::IMAGE_SUBSYSTEM_WINDOWS_GUI);
        put32(&mut image, optional + 108, 16);
        let reloc_entry = optional + 112 + 8 * pe::IMAGE_DIRECTORY_ENTRY_BASERELOC;
        put32(&mut image, reloc_entry, reloc_directory.0);
        put32(&mut image, reloc_entry + 4, reloc_directory.1);

        for (i, (name, rva, bytes, characteristics)) in self.sections.iter().enumerate() {
            let header = SECTION_TABLE_OFFSET + i * 40;
            image[header..header + 8].copy_from_slice(name);
            put32(&mut image, header + 8, bytes.len() as u32);
            put32(&mut image, header + 12, *rva);
            put32(&mut image, header + 16, align_up(bytes.len() as u64, PAGE as u64) as u32);
            put32(&mut image, header + 20, *rva);
            put32(&mut image, header + 36, *characteristics);
            image[*rva as usize..*rva as usize + bytes.len()].copy_from_slice(bytes);
        }
        image
    }
}

/// Transport that records every command and plays the agent's part against a simulated process.
#[derive(Default)]
pub struct RecordingTransport {
    process: Option<Arc<SimulatedProcess>>,
    refuse_loads: bool,
    load_base: Option<u64>,
    fails: Option<fn(&Command) -> bool>,
    commands: Mutex<Vec<Command>>,
    entry_code: Mutex<Vec<Vec<u8>>>,
}

impl RecordingTransport {
    pub fn with_process(process: Arc<SimulatedProcess>) -> Self {
        Self { process: Some(process), ..Self::default() }
    }

    pub fn refusing_loads(mut self) -> Self {
        self.refuse_loads = true;
        self
    }

    /// Maps every patch at `base`, wherever it was rebased to.
    pub fn loading_at(mut self, base: u64) -> Self {
        self.load_base = Some(base);
        self
    }

    /// Records matching commands, then fails them like a broken connection.
    pub fn failing_on(mut self, fails: fn(&Command) -> bool) -> Self {
        self.fails = Some(fails);
        self
    }

    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().clone()
    }

    pub fn loads(&self) -> usize {
        self.count(|c| matches!(c, Command::LoadPatch { .. }))
    }

    pub fn count(&self, wanted: impl Fn(&Command) -> bool) -> usize {
        self.commands.lock().iter().filter(|c| wanted(*c)).count()
    }

    /// Code found at the entry point whenever one was called.
    pub fn entry_code(&self) -> Vec<Vec<u8>> {
        self.entry_code.lock().clone()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, command: Command) -> Result<Reply> {
        self.commands.lock().push(command.clone());
        if self.fails.map_or(false, |fails| fails(&command)) {
            return Err(anyhow!("pipe broken"));
        }
        let Some(process) = &self.process else {
            return Ok(match command {
                Command::LoadPatch { .. } => Reply::PatchLoaded { base: None },
                _ => Reply::Ack,
            });
        };
        match command {
            Command::LoadPatch { path } => {
                if self.refuse_loads {
                    return Ok(Reply::PatchLoaded { base: None });
                }
                let image = Image::open(&path)?;
                let base = match self.load_base {
                    Some(base) => base,
                    None => image.image_base()?,
                };
                process.map(base, image.bytes().to_vec());
                Ok(Reply::PatchLoaded { base: Some(base) })
            }
            Command::UnloadPatch { base } => {
                process.unmap(base);
                Ok(Reply::Ack)
            }
            Command::CallEntryPoint { base, entry_rva } => {
                let mut code = vec![0u8; 8];
                process.read_memory(base + entry_rva as u64, &mut code)?;
                self.entry_code.lock().push(code);
                Ok(Reply::Ack)
            }
            _ => Ok(Reply::Ack),
        }
    }
}

/// Symbol provider serving prepared tables, looked up by image file name.
#[derive(Default)]
pub struct FakeProvider {
    images: Mutex<HashMap<String, ImageDatabases>>,
    linker: LinkerDb,
}

impl FakeProvider {
    pub fn new(linker: LinkerDb) -> Self {
        Self { images: Mutex::new(HashMap::new()), linker }
    }

    pub fn add_image(&self, file_name: &str, databases: ImageDatabases) {
        self.images.lock().insert(file_name.to_string(), databases);
    }

    fn image(&self, image: &Path) -> Result<ImageDatabases> {
        let name = image.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        self.images.lock().get(&name).cloned().ok_or_else(|| anyhow!("no tables for {}", name))
    }
}

impl SymbolProvider for FakeProvider {
    fn symbols(&self, image: &Path) -> Result<SymbolDb> {
        Ok(self.image(image)?.symbols)
    }

    fn contributions(&self, image: &Path) -> Result<ContributionDb> {
        Ok(self.image(image)?.contributions)
    }

    fn compilands(&self, image: &Path) -> Result<CompilandDb> {
        Ok(self.image(image)?.compilands)
    }

    fn thunks(&self, image: &Path) -> Result<ThunkDb> {
        Ok(self.image(image)?.thunks)
    }

    fn image_sections(&self, image: &Path) -> Result<ImageSectionDb> {
        Ok(self.image(image)?.image_sections)
    }

    fn linker(&self, _image: &Path) -> Result<LinkerDb> {
        Ok(self.linker.clone())
    }
}

/// Toolchain whose tools are closures over the tool path and the response file contents.
pub struct ScriptedToolchain<F> {
    script: F,
    invocations: Mutex<Vec<(PathBuf, String)>>,
}

impl<F> ScriptedToolchain<F>
where
    F: Fn(&Path, &str) -> Result<ToolOutput> + Send + Sync,
{
    pub fn new(script: F) -> Self {
        Self { script, invocations: Mutex::new(Vec::new()) }
    }

    pub fn invocations(&self) -> Vec<(PathBuf, String)> {
        self.invocations.lock().clone()
    }
}

impl<F> Toolchain for ScriptedToolchain<F>
where
    F: Fn(&Path, &str) -> Result<ToolOutput> + Send + Sync,
{
    fn run(&self, tool: &Path, _working_directory: &Path, arguments: &str) -> Result<ToolOutput> {
        self.invocations.lock().push((tool.to_path_buf(), arguments.to_string()));
        (self.script)(tool, arguments)
    }
}

/// Path given to an option such as `/OUT:` or `-Fo`.
pub fn option_path(arguments: &str, option: &str) -> Option<PathBuf> {
    split_command_line(arguments)
        .iter()
        .find_map(|token| token.strip_prefix(option).map(|path| PathBuf::from(path.trim_matches('"'))))
}

pub fn succeeded() -> ToolOutput {
    ToolOutput { exit_code: 0, output: String::new() }
}
