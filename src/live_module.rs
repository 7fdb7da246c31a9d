//! The live module.
//!
//! Drives one patch cycle end to end for a module loaded into any number of processes:
//!
//! 1. **Detect changes**: compare modification times of every tracked file.
//! 2. **Compile**: recompile the affected translation units.
//! 3. **Gather**: find the object files the patch needs.
//! 4. **Strip and link**: remove symbols that already exist from the object files and link
//!    them into a new image with a disabled entry point.
//! 5. **Load**: map the image into every process, near the module.
//! 6. **Activate**: redirect data references, run the initializers once, redirect the
//!    remaining references and finally the old functions.
//!
//! Compile and link errors leave the processes untouched. Load and activation errors take
//! back whatever the cycle changed in the processes and unload the patch. Units that failed
//! to compile are compiled again by the next cycle. Every successful cycle leaves a `ModulePatch` behind, so processes
//! attached later can receive the same patches without compiling anything.

use anyhow::{bail, Context, Result};
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{info, info_span, warn};

use crate::arch::x86_64::X86_64;
use crate::arch::Architecture;
use crate::compiland::{CompilandDb, LinkerDb};
use crate::config::Settings;
use crate::hooks::{self, HookKind};
use crate::image::Image;
use crate::live_process::LiveProcess;
use crate::module_cache::{ModuleCache, ModuleToken};
use crate::object_cache::ObjectCache;
use crate::object_file::weak_symbols_in_library;
use crate::patch::ModulePatch;
use crate::process::{Process, ProcessId, RemoteImage, ThreadId};
use crate::provider::{ImageDatabases, SymbolProvider};
use crate::toolchain::Toolchain;
use crate::transport::{self, Transport};

mod activate;
mod compile;
mod gather;
mod install;
mod link;
mod load;
mod strip;

/// How a cycle ended. Errors of the cycle itself are outcomes, not `Err`s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Success,
    NoChange,
    /// Units that failed to compile, and the exit code of the first failure.
    CompileError { failed: Vec<PathBuf>, exit_code: i32 },
    LinkError { exit_code: i32 },
    LoadError,
    ActivateError,
}

/// The collaborators a live module works with. Shared between modules of a session.
#[derive(Clone)]
pub struct Services {
    pub provider: Arc<dyn SymbolProvider>,
    pub toolchain: Arc<dyn Toolchain>,
    pub object_cache: Arc<ObjectCache>,
}

pub struct LiveModule<A: Architecture = X86_64> {
    arch: A,
    settings: Settings,
    services: Services,
    path: PathBuf,
    module_cache: Arc<ModuleCache>,
    compilands: CompilandDb,
    linker: LinkerDb,
    weak_library_symbols: Vec<String>,
    processes: Vec<Arc<LiveProcess>>,
    patches: Vec<ModulePatch>,
    /// Objects whose units have to be compiled.
    modified: BTreeSet<PathBuf>,
    /// Objects compiled but not linked into a patch yet.
    pending: BTreeSet<PathBuf>,
    patch_counter: u32,
}

fn modification_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// An image of the module cache as mapped into `process`, if it is.
fn remote_image<'p>(
    cache: &ModuleCache,
    process: &'p LiveProcess,
    token: ModuleToken,
    bases: &[Option<u64>],
) -> Option<RemoteImage<'p>> {
    let base = bases.get(token.index()).copied().flatten()?;
    Some(RemoteImage::new(process.process(), base, cache.image_size(token)?))
}

impl LiveModule<X86_64> {
    pub fn load(path: &Path, settings: Settings, services: Services) -> Result<Self> {
        Self::with_architecture(X86_64, path, settings, services)
    }
}

impl<A: Architecture> LiveModule<A> {
    /// Gathers the module's tables and prepares the first cycle.
    pub fn with_architecture(arch: A, path: &Path, settings: Settings, services: Services) -> Result<Self> {
        let _span = info_span!("load", module = %path.display()).entered();
        let provider = &*services.provider;
        let (databases, linker) = rayon::join(|| ImageDatabases::gather(provider, path), || provider.linker(path));
        let databases = databases.with_context(|| format!("failed to gather tables of {}", path.display()))?;
        let linker = linker.with_context(|| format!("failed to gather linker metadata of {}", path.display()))?;
        let image_size = Image::open(path)?.size_of_image()?;

        let module_cache = Arc::new(ModuleCache::new());
        let mut compilands = databases.compilands.clone();
        module_cache.insert(path, Arc::new(databases), image_size);

        for (file, dependency) in compilands.dependencies.iter_mut() {
            dependency.last_modification = modification_time(file);
        }

        let weak_library_symbols: Vec<String> = linker
            .libraries
            .par_iter()
            .map(|library| {
                weak_symbols_in_library(library).unwrap_or_else(|e| {
                    warn!("Cannot read weak symbols of {}: {:#}", library.display(), e);
                    Vec::new()
                })
            })
            .collect::<Vec<_>>()
            .concat();

        info!(
            "Loaded module {} ({} compilands, {} weak library symbols)",
            path.display(),
            compilands.compilands.len(),
            weak_library_symbols.len()
        );
        Ok(Self {
            arch,
            settings,
            services,
            path: path.to_path_buf(),
            module_cache,
            compilands,
            linker,
            weak_library_symbols,
            processes: Vec::new(),
            patches: Vec::new(),
            modified: BTreeSet::new(),
            pending: BTreeSet::new(),
            patch_counter: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn module_cache(&self) -> &Arc<ModuleCache> {
        &self.module_cache
    }

    pub fn compilands(&self) -> &CompilandDb {
        &self.compilands
    }

    pub fn patches(&self) -> &[ModulePatch] {
        &self.patches
    }

    pub fn processes(&self) -> &[Arc<LiveProcess>] {
        &self.processes
    }

    /// Attaches a process that has the module loaded at `module_base`.
    pub fn register_process(
        &mut self,
        process: Arc<dyn Process>,
        transport: Arc<dyn Transport>,
        command_thread: Option<ThreadId>,
        module_base: u64,
    ) -> Result<()> {
        let pid = process.id();
        if self.processes.iter().any(|p| p.id() == pid) {
            bail!("process {} is already registered", pid);
        }
        self.module_cache.register_process(ModuleToken::ORIGINAL, pid, module_base);
        self.processes.push(Arc::new(LiveProcess::new(process, transport, command_thread, module_base)));
        info!("Registered process {} (module at 0x{:x})", pid, module_base);
        Ok(())
    }

    pub fn unregister_process(&mut self, pid: ProcessId) {
        self.processes.retain(|p| p.id() != pid);
        self.module_cache.unregister_process(pid);
        info!("Unregistered process {}", pid);
    }

    /// Runs one cycle for whatever changed on disk since the last one.
    pub fn update(&mut self) -> Result<UpdateOutcome> {
        let _span = info_span!("update", module = %self.path.display()).entered();
        let modified = self.detect_changes();
        self.modified.extend(modified);
        if self.modified.is_empty() && self.pending.is_empty() {
            info!("No changes detected");
            return Ok(UpdateOutcome::NoChange);
        }

        if !self.modified.is_empty() {
            hooks::call(&self.module_cache, &self.processes, HookKind::CompileStart, None)?;
            let failures = self.compile()?;
            if let Some(&(_, exit_code)) = failures.first() {
                hooks::call(&self.module_cache, &self.processes, HookKind::CompileError, None)?;
                return Ok(UpdateOutcome::CompileError { failed: failures.into_iter().map(|(p, _)| p).collect(), exit_code });
            }
            hooks::call(&self.module_cache, &self.processes, HookKind::CompileSuccess, None)?;
        }
        self.build_and_install()
    }

    /// Runs one cycle for object files an external build produced. Objects unknown to the
    /// module are allowed: they are new translation units.
    pub fn update_with_objects(&mut self, objects: &[PathBuf]) -> Result<UpdateOutcome> {
        let _span = info_span!("update_with_objects", module = %self.path.display()).entered();
        for object in objects {
            self.services.object_cache.reload(object)?;
            if let Some(compiland) = self.compilands.compilands.get_mut(object) {
                compiland.was_recompiled = true;
            }
            self.pending.insert(object.clone());
        }
        if self.pending.is_empty() {
            return Ok(UpdateOutcome::NoChange);
        }
        self.build_and_install()
    }

    /// Maps modified files to the object files that need recompiling.
    fn detect_changes(&mut self) -> Vec<PathBuf> {
        let _span = info_span!("detect_changes").entered();
        let mut changed_files = Vec::new();
        let mut objects = BTreeSet::new();
        for (file, dependency) in self.compilands.dependencies.iter_mut() {
            let Some(time) = modification_time(file) else { continue };
            if dependency.last_modification == Some(time) {
                continue;
            }
            dependency.last_modification = Some(time);
            info!("File {} was modified", file.display());
            changed_files.push(file.clone());
            objects.extend(dependency.objects.iter().cloned());
        }

        let split = self.settings.split_amalgamations;
        let CompilandDb { compilands, amalgamations, .. } = &mut self.compilands;
        let mut resolved = BTreeSet::new();
        for object in objects {
            let unity = compilands.get(&object).and_then(|c| c.amalgamation.clone());
            match (split, unity, amalgamations.get_mut(&object)) {
                (false, Some(unity), _) => {
                    resolved.insert(unity);
                }
                (true, Some(unity), _) => {
                    if let Some(amalgamation) = amalgamations.get_mut(&unity) {
                        amalgamation.is_split = true;
                    }
                    resolved.insert(object);
                }
                (true, None, Some(amalgamation)) => {
                    let touched: Vec<PathBuf> = amalgamation
                        .single_parts
                        .iter()
                        .filter(|part| compilands.get(*part).map_or(false, |c| changed_files.contains(&c.source_path)))
                        .cloned()
                        .collect();
                    if !touched.is_empty() {
                        info!("Splitting amalgamation {} into {} part(s)", object.display(), touched.len());
                        amalgamation.is_split = true;
                        resolved.extend(touched);
                    } else if amalgamation.is_split {
                        resolved.extend(amalgamation.single_parts.iter().cloned());
                    } else {
                        resolved.insert(object);
                    }
                }
                _ => {
                    resolved.insert(object);
                }
            }
        }
        resolved.into_iter().collect()
    }

    /// Strips, links and installs everything pending.
    fn build_and_install(&mut self) -> Result<UpdateOutcome> {
        if self.pending.is_empty() {
            info!("Nothing to link");
            return Ok(UpdateOutcome::NoChange);
        }
        let recompiled = self.pending.clone();
        let owners = self.symbol_owners(&recompiled);
        let needed = self.gather_needed_objects(&recompiled, &owners)?;

        let stripped = self.strip_objects(&needed, &recompiled, &owners)?;
        let linked = self.link(&needed, &recompiled);
        // Object files go back to their original state whatever the link did.
        let restored = strip::restore(&stripped);
        let linked = linked?;
        restored?;

        if !linked.result.success() {
            warn!("Linking failed with exit code {}", linked.result.exit_code);
            hooks::call(&self.module_cache, &self.processes, HookKind::CompileError, None)?;
            return Ok(UpdateOutcome::LinkError { exit_code: linked.result.exit_code });
        }
        info!("Successfully linked patch {}", linked.image.display());
        self.load_and_activate(linked.image, &needed, &stripped)
    }

    /// Logs tool output and forwards it to every process.
    fn forward_output(&self, output: &str) {
        if output.trim().is_empty() {
            return;
        }
        info!("{}", output.trim_end());
        for process in &self.processes {
            if let Err(e) = transport::log_output(process.transport(), output) {
                warn!("Cannot forward output to process {}: {:#}", process.id(), e);
            }
        }
    }

    fn clear_pending(&mut self) {
        for object in std::mem::take(&mut self.pending) {
            if let Some(compiland) = self.compilands.compilands.get_mut(&object) {
                compiland.was_recompiled = false;
            }
        }
    }

    /// Bookkeeping after a cycle that compiled and linked but never became active. Its objects
    /// are not linked again until they change.
    fn abandon_cycle(&mut self, outcome: UpdateOutcome) -> UpdateOutcome {
        self.clear_pending();
        if let Err(e) = hooks::call(&self.module_cache, &self.processes, HookKind::CompileError, None) {
            warn!("Cannot call compile error hooks: {:#}", e);
        }
        outcome
    }

    /// Bookkeeping after a patch was installed.
    fn finish_cycle(&mut self, patch: ModulePatch) {
        self.clear_pending();
        info!("Patch {} installed with {} edits", patch.path.display(), patch.edit_count());
        self.patches.push(patch);
    }
}
