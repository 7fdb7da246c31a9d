//! Activating a loaded patch.
//!
//! Order matters. With every process held at a sync point:
//! 1. references to data and stripped symbols are redirected, so initializers see the
//!    existing state,
//! 2. initializers of objects that already exist are neutered, the security cookie is copied
//!    and `DllMain` is disabled,
//! 3. the entry point runs once,
//! 4. the remaining references are redirected,
//! 5. old functions are redirected to their new instances while every process is suspended.
//!
//! Each step is recorded in the `ModulePatch` and has a counterpart here that replays it into
//! a single process. A `Rollback` tracks what has to be taken back when a step fails.

use anyhow::Result;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn};

use super::strip::{stripped_from, Stripped};
use super::{remote_image, LiveModule};
use crate::arch::Architecture;
use crate::entry_point;
use crate::function::{combine, evaluate, read_site, FunctionRecord, FunctionSite, LibraryRecord, Options};
use crate::hooks::{self, HookKind};
use crate::image::Image;
use crate::live_process::LiveProcess;
use crate::module_cache::{FoundSymbol, ModuleCache, ModuleToken};
use crate::object_file::ObjectDb;
use crate::patch::{CookieRecord, ModulePatch};
use crate::process::{RemoteImage, Suspended};
use crate::provider::ImageDatabases;
use crate::relocation::{self, Phase, RelocationRecord};
use crate::symbol::{is_exception_related, is_runtime_check_related, is_sdl_check_related};
use crate::transport::Command;

const SECURITY_COOKIE: &str = "__security_cookie";
const DLL_MAIN: &str = "DllMain";

/// Most bytes decoded when looking at the start of a function.
const INSPECTED_BYTES: usize = 32;

/// Code of loaded images overwritten in one process.
#[derive(Default)]
pub(super) struct Undo {
    code: Vec<(u64, Vec<u8>)>,
    marked: Vec<u64>,
}

impl Undo {
    fn save(&mut self, image: &RemoteImage, rva: u32, len: usize) -> Result<()> {
        self.code.push((image.address(rva), image.read(rva, len)?));
        Ok(())
    }

    /// Writes the saved code back, newest first.
    fn revert(self, process: &LiveProcess) -> Result<()> {
        if self.code.is_empty() {
            return Ok(());
        }
        let _suspended = Suspended::new(process.process())?;
        for (address, bytes) in self.code.into_iter().rev() {
            process.process().write_memory(address, &bytes)?;
            process.process().flush_instruction_cache(address, bytes.len())?;
        }
        for address in self.marked {
            process.unmark_patched(address);
        }
        Ok(())
    }
}

/// What an activation changed so far, per process.
pub(super) struct Rollback {
    in_sync: Vec<bool>,
    code: Vec<Undo>,
}

impl Rollback {
    pub(super) fn new(processes: usize) -> Self {
        Self { in_sync: vec![false; processes], code: std::iter::repeat_with(Undo::default).take(processes).collect() }
    }

    pub(super) fn enter_sync_point(&mut self, index: usize, process: &LiveProcess) -> Result<()> {
        process.send(Command::EnterSyncPoint)?;
        self.in_sync[index] = true;
        Ok(())
    }

    pub(super) fn leave_sync_point(&mut self, index: usize, process: &LiveProcess) -> Result<()> {
        process.send(Command::LeaveSyncPoint)?;
        self.in_sync[index] = false;
        Ok(())
    }

    pub(super) fn undo(&mut self, index: usize) -> &mut Undo {
        &mut self.code[index]
    }

    /// Restores overwritten code and releases every process still held at the sync point.
    /// Failures are logged, the remaining processes are still reverted.
    pub(super) fn revert(self, processes: &[Arc<LiveProcess>]) {
        for ((process, undo), in_sync) in processes.iter().zip(self.code).zip(self.in_sync) {
            if let Err(e) = undo.revert(process) {
                error!("Cannot restore patched functions (PID: {}): {:#}", process.id(), e);
            }
            if in_sync {
                if let Err(e) = process.send(Command::LeaveSyncPoint) {
                    error!("Cannot leave sync point (PID: {}): {:#}", process.id(), e);
                }
            }
        }
    }
}

/// Applies relocation records in one process. Returns which ones failed.
pub(super) fn apply_relocations(
    arch: &dyn Architecture,
    cache: &ModuleCache,
    process: &LiveProcess,
    token: ModuleToken,
    records: &[RelocationRecord],
) -> Result<Vec<bool>> {
    let bases = cache.gather_module_bases(process.id());
    let Some(patch) = remote_image(cache, process, token, &bases) else {
        return Ok(vec![false; records.len()]);
    };
    let _suspended = Suspended::new(process.process())?;
    Ok(records
        .iter()
        .map(|record| match record.apply(arch, &patch, &bases) {
            Ok(()) => false,
            Err(e) => {
                warn!("Cannot relocate field at RVA 0x{:x} (PID: {}): {:#}", record.patch_rva, process.id(), e);
                true
            }
        })
        .collect())
}

/// Neuters initializers, copies the security cookie and disables `DllMain` in one process.
pub(super) fn prepare_entry(
    arch: &dyn Architecture,
    cache: &ModuleCache,
    process: &LiveProcess,
    patch: &ModulePatch,
) -> Result<()> {
    let bases = cache.gather_module_bases(process.id());
    let Some(image) = remote_image(cache, process, patch.token, &bases) else {
        return Ok(());
    };
    let _suspended = Suspended::new(process.process())?;
    for &slot in &patch.neutered_initializers {
        image.write_u64(slot, 0)?;
    }
    if let Some(cookie) = patch.cookie {
        if let Some(original) = remote_image(cache, process, ModuleToken::ORIGINAL, &bases) {
            image.write_u64(cookie.patch_rva, original.read_u64(cookie.original_rva)?)?;
        }
    }
    if let Some(rva) = patch.dll_main_rva {
        entry_point::neuter(arch, &image, rva)?;
    }
    Ok(())
}

/// Runs the patch's entry point once in one process.
pub(super) fn call_entry_point(
    arch: &dyn Architecture,
    cache: &ModuleCache,
    process: &LiveProcess,
    patch: &ModulePatch,
) -> Result<()> {
    let Some(saved) = &patch.entry_point else {
        return Ok(());
    };
    let bases = cache.gather_module_bases(process.id());
    match remote_image(cache, process, patch.token, &bases) {
        Some(image) => saved.call_once(arch, process, &image),
        None => Ok(()),
    }
}

/// Installs function redirections in one suspended process. `check` re-validates each
/// technique against the process's threads, for redirections planned elsewhere.
pub(super) fn apply_functions(
    arch: &dyn Architecture,
    cache: &ModuleCache,
    process: &LiveProcess,
    patch: &ModulePatch,
    ips: &[u64],
    check: bool,
    undo: &mut Undo,
) -> Result<()> {
    let bases = cache.gather_module_bases(process.id());
    let Some(image) = remote_image(cache, process, patch.token, &bases) else {
        return Ok(());
    };
    for record in &patch.functions {
        let Some(original) = remote_image(cache, process, record.original, &bases) else {
            continue;
        };
        let start = original.address(record.original_rva);
        if check && !record.is_safe(arch, start, ips) {
            warn!("A thread is executing the start of {}, leaving it unpatched (PID: {})", record.name, process.id());
            continue;
        }
        for (rva, len) in record.overwritten(arch) {
            undo.save(&original, rva, len)?;
        }
        if !process.was_patched(start) {
            undo.marked.push(start);
        }
        record.apply(arch, &original, &image)?;
        process.mark_patched(start);
    }
    for record in &patch.library_functions {
        if let Some(original) = remote_image(cache, process, record.original, &bases) {
            record.apply(arch, &original, &image)?;
        }
    }
    Ok(())
}

/// Options for a function nobody runs: read from the image file holding it.
fn options_on_disk(arch: &dyn Architecture, path: &Path, rva: u32, size: u32) -> Result<Options> {
    let image = Image::open(path)?;
    let start = image.image_base()? + rva as u64;
    let available = (image.size_of_image()?.saturating_sub(rva) as usize).min(INSPECTED_BYTES);
    let code = image.read(rva, available)?;
    let jump = arch.jump_size() as u32;
    let preceding = if rva >= jump { image.read(rva - jump, jump as usize).ok() } else { None };
    let site = FunctionSite { start, size, preceding, code, was_patched: false };
    Ok(evaluate(arch, &site, &[]))
}

impl<A: Architecture> LiveModule<A> {
    pub(super) fn activate(
        &self,
        patch: &mut ModulePatch,
        databases: &ImageDatabases,
        image: &Image,
        needed: &[PathBuf],
        stripped: &Stripped,
        rollback: &mut Rollback,
    ) -> Result<()> {
        let arch: &dyn Architecture = &self.arch;
        let cache = &*self.module_cache;
        let token = patch.token;
        let objects: Vec<Arc<ObjectDb>> =
            needed.iter().map(|p| self.services.object_cache.load(p)).collect::<Result<_>>()?;

        for (index, process) in self.processes.iter().enumerate() {
            rollback.enter_sync_point(index, process)?;
        }
        patch.pre_patch_hooks = hooks::call(cache, &self.processes, HookKind::PrePatch, Some(token))?;

        {
            let _span = info_span!("pre_entry").entered();
            let records = self.collect_relocations(Phase::PreEntry, &objects, stripped, token, databases);
            patch.pre_entry_relocations = self.apply_everywhere(token, records)?;

            patch.neutered_initializers = databases
                .symbols
                .dynamic_initializers
                .iter()
                .filter(|init| cache.find_symbol(Some(token), &init.name).is_some())
                .map(|init| init.rva)
                .collect();
            let original = cache.databases(ModuleToken::ORIGINAL);
            patch.cookie = original
                .as_ref()
                .and_then(|o| o.symbols.find(SECURITY_COOKIE))
                .zip(databases.symbols.find(SECURITY_COOKIE))
                .map(|(original, own)| CookieRecord { original_rva: original.rva, patch_rva: own.rva });
            patch.dll_main_rva = databases.symbols.find(DLL_MAIN).map(|s| s.rva);
            debug!("Neutering {} initializer(s)", patch.neutered_initializers.len());
            for process in &self.processes {
                prepare_entry(arch, cache, process, patch)?;
            }
        }

        for process in &self.processes {
            call_entry_point(arch, cache, process, patch)?;
        }

        {
            let _span = info_span!("post_entry").entered();
            let records = self.collect_relocations(Phase::PostEntry, &objects, stripped, token, databases);
            patch.post_entry_relocations = self.apply_everywhere(token, records)?;
        }

        self.patch_functions(patch, databases, image, &objects, rollback)?;

        patch.post_patch_hooks = hooks::call(cache, &self.processes, HookKind::PostPatch, None)?;
        for (index, process) in self.processes.iter().enumerate() {
            rollback.leave_sync_point(index, process)?;
        }
        Ok(())
    }

    fn collect_relocations(
        &self,
        phase: Phase,
        objects: &[Arc<ObjectDb>],
        stripped: &Stripped,
        token: ModuleToken,
        databases: &ImageDatabases,
    ) -> Vec<RelocationRecord> {
        let none = HashSet::new();
        let records: Vec<RelocationRecord> = objects
            .iter()
            .flat_map(|object| {
                let stripped = stripped_from(stripped, &object.path, &none);
                relocation::collect(phase, object, stripped, &self.module_cache, token, databases)
            })
            .collect();
        info!("{} relocation(s) to redirect in phase {:?}", records.len(), phase);
        records
    }

    /// Applies records in every process and keeps those that worked everywhere.
    fn apply_everywhere(&self, token: ModuleToken, records: Vec<RelocationRecord>) -> Result<Vec<RelocationRecord>> {
        let mut failed = vec![false; records.len()];
        for process in &self.processes {
            let outcome = apply_relocations(&self.arch, &self.module_cache, process, token, &records)?;
            for (failed, now) in failed.iter_mut().zip(outcome) {
                *failed |= now;
            }
        }
        Ok(records.into_iter().zip(failed).filter(|(_, failed)| !failed).map(|(record, _)| record).collect())
    }

    fn patch_functions(
        &self,
        patch: &mut ModulePatch,
        databases: &ImageDatabases,
        image: &Image,
        objects: &[Arc<ObjectDb>],
        rollback: &mut Rollback,
    ) -> Result<()> {
        let _span = info_span!("patch_functions").entered();
        let arch: &dyn Architecture = &self.arch;
        let suspended: Vec<Suspended> =
            self.processes.iter().map(|p| Suspended::new(p.process())).collect::<Result<_>>()?;
        let ips: Vec<Vec<u64>> = suspended.iter().map(Suspended::thread_ips).collect::<Result<_>>()?;

        let mut seen = HashSet::new();
        for object in objects {
            for symbol in object.defined().filter(|s| s.is_function) {
                if is_exception_related(&symbol.name) || !seen.insert(symbol.name.clone()) {
                    continue;
                }
                if let Some(record) = self.plan_function(&symbol.name, patch.token, databases, &ips)? {
                    patch.functions.push(record);
                }
            }
        }

        for name in &databases.symbols.library_functions {
            if seen.contains(name) || is_exception_related(name) || is_runtime_check_related(name) || is_sdl_check_related(name) {
                continue;
            }
            if let Some(record) = self.plan_library_function(name, patch.token, databases, image) {
                patch.library_functions.push(record);
            }
        }

        for (index, (process, ips)) in self.processes.iter().zip(&ips).enumerate() {
            apply_functions(arch, &self.module_cache, process, patch, ips, false, rollback.undo(index))?;
        }
        info!("Patched {} function(s), {} library function(s)", patch.functions.len(), patch.library_functions.len());
        drop(suspended);
        Ok(())
    }

    /// Decides how to redirect the existing instance of a recompiled function, if it has one.
    fn plan_function(
        &self,
        name: &str,
        token: ModuleToken,
        databases: &ImageDatabases,
        ips: &[Vec<u64>],
    ) -> Result<Option<FunctionRecord>> {
        let arch: &dyn Architecture = &self.arch;
        let Some(own) = databases.symbols.find(name) else {
            debug!("{} was discarded by the linker", name);
            return Ok(None);
        };
        let Some(existing) = self.module_cache.find_symbol(Some(token), name) else {
            debug!("{} is new", name);
            return Ok(None);
        };
        let contribution = existing.databases.contributions.find(existing.rva);
        if let Some(contribution) = contribution {
            let object = existing.databases.contributions.object(contribution);
            if !existing.databases.compilands.contains(object) {
                debug!("{} was linked in from a library, leaving it alone", name);
                return Ok(None);
            }
        }
        let size = contribution.map_or(0, |c| c.rva + c.size - existing.rva);

        let mut options = Vec::with_capacity(self.processes.len());
        for (process, ips) in self.processes.iter().zip(ips) {
            let bases = self.module_cache.gather_module_bases(process.id());
            let Some(original) = remote_image(&self.module_cache, process, existing.token, &bases) else {
                continue;
            };
            let (preceding, code) = match read_site(arch, &original, existing.rva, existing.image_size) {
                Ok(site) => site,
                Err(e) => {
                    warn!("Cannot read {} (PID: {}): {:#}", name, process.id(), e);
                    return Ok(None);
                }
            };
            let start = original.address(existing.rva);
            let site = FunctionSite {
                start,
                size,
                preceding: preceding.as_deref(),
                code: &code,
                was_patched: process.was_patched(start),
            };
            options.push(evaluate(arch, &site, ips));
        }
        if options.is_empty() {
            options.push(self.options_without_processes(&existing, size)?);
        }

        let Some(technique) = combine(&options) else {
            warn!("Cannot patch {} safely, it keeps running its old code", name);
            return Ok(None);
        };
        Ok(Some(FunctionRecord {
            name: name.to_string(),
            original: existing.token,
            original_rva: existing.rva,
            patch_rva: own.rva,
            technique,
            thunks: existing.databases.thunks.thunks_to(existing.rva).to_vec(),
        }))
    }

    fn options_without_processes(&self, existing: &FoundSymbol, size: u32) -> Result<Options> {
        match self.module_cache.path(existing.token) {
            Some(path) => options_on_disk(&self.arch, &path, existing.rva, size),
            None => Ok(Options::default()),
        }
    }

    /// A function the patch got from a static library jumps to the copy already loaded.
    fn plan_library_function(
        &self,
        name: &str,
        token: ModuleToken,
        databases: &ImageDatabases,
        image: &Image,
    ) -> Option<LibraryRecord> {
        let own = databases.symbols.find(name)?;
        let Some(contribution) = databases.contributions.find(own.rva) else {
            debug!("No contribution for library function {}", name);
            return None;
        };
        let size = (contribution.rva + contribution.size - own.rva) as usize;
        if size < self.arch.jump_size() {
            return None;
        }
        let existing = self.module_cache.find_symbol(Some(token), name)?;
        let start = image.image_base().ok()? + own.rva as u64;
        let covered = image
            .read(own.rva, size.min(INSPECTED_BYTES))
            .and_then(|code| self.arch.covered_instruction_bytes(code, start, self.arch.jump_size()));
        match covered {
            Ok(covered) if covered <= size => Some(LibraryRecord {
                name: name.to_string(),
                patch_rva: own.rva,
                original: existing.token,
                original_rva: existing.rva,
                covered: covered as u8,
            }),
            Ok(_) => None,
            Err(e) => {
                warn!("Cannot decode library function {}: {:#}", name, e);
                None
            }
        }
    }
}
