//! Function patching.
//!
//! Redirects the existing instance of a function to its new instance in a patch. Two
//! techniques exist and one is chosen per function when the patch is built:
//! - a direct jump over the first instructions of the old function,
//! - an indirection: a jump in the padding in front of the function, reached through a short
//!   jump replacing the function's first instruction.
//!
//! Thunks to the function are redirected first. Functions linked in from static libraries go
//! the other way: the patch's copy jumps back to the original one.

use anyhow::{bail, Result};
use tracing::{debug, warn};

use crate::arch::Architecture;
use crate::module_cache::ModuleToken;
use crate::process::RemoteImage;

/// Most bytes an instruction sequence covering a jump can span.
const MAX_INSPECTED_BYTES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Technique {
    /// A jump overwriting the first `covered` bytes, rest padded with traps.
    DirectJump { covered: u8 },
    /// A jump in the padding before the function and a short jump to it at the start.
    Indirection,
}

/// Everything needed to (re)install a redirection of one function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionRecord {
    pub name: String,
    /// Image holding the instance being redirected.
    pub original: ModuleToken,
    pub original_rva: u32,
    pub patch_rva: u32,
    pub technique: Technique,
    /// Thunks in the original image that jump to the function.
    pub thunks: Vec<u32>,
}

/// A function of the patch that jumps back to the original instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryRecord {
    pub name: String,
    pub patch_rva: u32,
    pub original: ModuleToken,
    pub original_rva: u32,
    pub covered: u8,
}

/// Code around a function start in one process.
pub struct FunctionSite<'a> {
    /// Address of the function's first byte.
    pub start: u64,
    /// Function size in bytes, 0 if unknown.
    pub size: u32,
    /// The `jump_size` bytes in front of the function, if readable.
    pub preceding: Option<&'a [u8]>,
    /// Bytes starting at the function.
    pub code: &'a [u8],
    /// The function start already carries a redirection.
    pub was_patched: bool,
}

fn is_inside(ips: &[u64], start: u64, len: usize) -> bool {
    ips.iter().any(|&ip| ip > start && ip < start + len as u64)
}

/// The techniques usable for a function in one process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Options {
    /// Bytes a direct jump would cover.
    pub direct: Option<u8>,
    pub indirection: bool,
}

/// Works out which techniques can patch the function safely with threads at `ips`.
pub fn evaluate(arch: &dyn Architecture, site: &FunctionSite, ips: &[u64]) -> Options {
    let short_jump = arch.jump_to_preceding_padding();
    if site.was_patched && site.code.starts_with(short_jump) {
        // The old instructions behind an existing short jump no longer decode.
        return Options { direct: None, indirection: !is_inside(ips, site.start, short_jump.len()) };
    }

    let mut options = Options::default();
    if site.size as usize >= arch.jump_size() {
        match arch.covered_instruction_bytes(site.code, site.start, arch.jump_size()) {
            Ok(covered) if covered <= site.size as usize && !is_inside(ips, site.start, covered) => {
                options.direct = Some(covered as u8);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Cannot decode function at 0x{:x}: {:#}", site.start, e);
                return options;
            }
        }
    }

    let has_padding = site.was_patched
        || site.preceding.map_or(false, |bytes| bytes.len() == arch.jump_size() && bytes.iter().all(|&b| arch.is_padding(b)));
    let first = arch.covered_instruction_bytes(site.code, site.start, 1).unwrap_or(0);
    options.indirection = has_padding && first >= short_jump.len() && !is_inside(ips, site.start, short_jump.len());
    options
}

/// Picks one technique that is safe in every process. Direct jumps are preferred.
pub fn combine(options: &[Options]) -> Option<Technique> {
    if options.is_empty() {
        return None;
    }
    if options.iter().all(|o| o.direct.is_some()) {
        let covered = options.iter().filter_map(|o| o.direct).max().unwrap_or_default();
        return Some(Technique::DirectJump { covered });
    }
    options.iter().all(|o| o.indirection).then_some(Technique::Indirection)
}

/// Reads the code at a function start and the padding in front of it.
pub fn read_site(arch: &dyn Architecture, image: &RemoteImage, rva: u32, image_size: u32) -> Result<(Option<Vec<u8>>, Vec<u8>)> {
    let available = (image_size.saturating_sub(rva) as usize).min(MAX_INSPECTED_BYTES);
    if available == 0 {
        bail!("function at RVA 0x{:x} lies outside of its image", rva);
    }
    let code = image.read(rva, available)?;
    let jump = arch.jump_size() as u32;
    let preceding = if rva >= jump { Some(image.read(rva - jump, jump as usize)?) } else { None };
    Ok((preceding, code))
}

impl FunctionRecord {
    /// Whether the technique is still safe with threads at `ips`.
    pub fn is_safe(&self, arch: &dyn Architecture, start: u64, ips: &[u64]) -> bool {
        match self.technique {
            Technique::DirectJump { covered } => !is_inside(ips, start, covered as usize),
            Technique::Indirection => !is_inside(ips, start, arch.jump_to_preceding_padding().len()),
        }
    }

    /// Ranges of the original image `apply` overwrites, as `(rva, len)`.
    pub fn overwritten(&self, arch: &dyn Architecture) -> Vec<(u32, usize)> {
        let mut ranges: Vec<(u32, usize)> = self.thunks.iter().map(|&thunk| (thunk, arch.jump_size())).collect();
        match self.technique {
            Technique::DirectJump { covered } => ranges.push((self.original_rva, covered as usize)),
            Technique::Indirection => {
                let jump_size = arch.jump_size();
                ranges.push((self.original_rva - jump_size as u32, jump_size));
                ranges.push((self.original_rva, arch.jump_to_preceding_padding().len()));
            }
        }
        ranges
    }

    /// Installs the redirection. The process must be suspended.
    pub fn apply(&self, arch: &dyn Architecture, original: &RemoteImage, patch: &RemoteImage) -> Result<()> {
        let target = patch.address(self.patch_rva);
        for &thunk in &self.thunks {
            let jump = arch.encode_jump(original.address(thunk), target)?;
            original.write(thunk, &jump)?;
            debug!("Redirected thunk at RVA 0x{:x} of {}", thunk, self.name);
        }

        let start = original.address(self.original_rva);
        match self.technique {
            Technique::DirectJump { covered } => {
                let mut code = arch.encode_jump(start, target)?;
                code.resize(covered as usize, arch.trap_byte());
                original.write(self.original_rva, &code)?;
            }
            Technique::Indirection => {
                let jump_size = arch.jump_size() as u32;
                let padding = self.original_rva - jump_size;
                let jump = arch.encode_jump(original.address(padding), target)?;
                original.write(padding, &jump)?;
                original.write(self.original_rva, arch.jump_to_preceding_padding())?;
            }
        }
        debug!("Patched {} at 0x{:x} to 0x{:x} ({:?})", self.name, start, target, self.technique);
        Ok(())
    }
}

impl LibraryRecord {
    /// Makes the patch's copy jump to the original. The process must be suspended.
    pub fn apply(&self, arch: &dyn Architecture, original: &RemoteImage, patch: &RemoteImage) -> Result<()> {
        let start = patch.address(self.patch_rva);
        let mut code = arch.encode_jump(start, original.address(self.original_rva))?;
        code.resize(self.covered as usize, arch.trap_byte());
        patch.write(self.patch_rva, &code)?;
        debug!("Library function {} at 0x{:x} now jumps to the original", self.name, start);
        Ok(())
    }
}
