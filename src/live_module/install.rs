//! Installing existing patches into a process attached after they were built.
//!
//! Nothing is compiled, linked or resolved again: every patch is loaded and its recorded
//! edits are replayed, oldest patch first, so the process ends up with the same code as the
//! processes that were there all along.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tracing::{error, info, info_span};

use super::activate::{apply_functions, apply_relocations, call_entry_point, prepare_entry, Rollback};
use super::load::{load_into, unload_all};
use super::LiveModule;
use crate::arch::Architecture;
use crate::hooks::{self, HookRecord};
use crate::image::Image;
use crate::live_process::LiveProcess;
use crate::module_cache::{ModuleCache, ModuleToken};
use crate::patch::ModulePatch;
use crate::process::{is_within_relative_reach, ProcessId, Suspended};

fn call_recorded_hooks(cache: &ModuleCache, process: &LiveProcess, record: Option<&HookRecord>) -> Result<()> {
    let Some(record) = record else { return Ok(()) };
    let bases = cache.gather_module_bases(process.id());
    match bases.get(record.image.index()).copied().flatten() {
        Some(base) => hooks::call_in(process, base, record),
        None => Ok(()),
    }
}

impl<A: Architecture> LiveModule<A> {
    /// Replays every patch built so far into the process `pid`.
    pub fn install_compiled_patches(&self, pid: ProcessId) -> Result<()> {
        let _span = info_span!("install_compiled_patches", pid).entered();
        if !self.settings.install_patches_multi_process() {
            info!("Installing patches into other processes is disabled");
            return Ok(());
        }
        let process = self
            .processes
            .iter()
            .find(|p| p.id() == pid)
            .with_context(|| format!("process {} is not registered", pid))?;
        for patch in &self.patches {
            self.replay(process, patch)?;
        }
        if !self.patches.is_empty() {
            info!("Installed {} patch(es)", self.patches.len());
        }
        Ok(())
    }

    fn replay(&self, process: &Arc<LiveProcess>, patch: &ModulePatch) -> Result<()> {
        let _span = info_span!("replay", patch = %patch.path.display()).entered();
        let arch: &dyn Architecture = &self.arch;
        let cache = &*self.module_cache;
        let module_size = cache.image_size(ModuleToken::ORIGINAL).unwrap_or_default();

        let mut image = Image::open(&patch.path)?;
        let Some(base) = load_into(process, module_size, &mut image, &patch.path, false)? else {
            bail!("failed to load patch {} into process {}", patch.path.display(), process.id());
        };
        if !is_within_relative_reach(process.module_base(), module_size as u64, base, patch.image_size as u64) {
            unload_all(&[(process.clone(), base)]);
            bail!("patch {} at 0x{:x} is out of reach of the module", patch.path.display(), base);
        }
        cache.register_process(patch.token, process.id(), base);

        let mut rollback = Rollback::new(1);
        if let Err(e) = self.replay_edits(process, patch, &mut rollback) {
            error!("Cannot activate patch {} (PID: {}): {:#}", patch.path.display(), process.id(), e);
            rollback.revert(std::slice::from_ref(process));
            unload_all(&[(process.clone(), base)]);
            cache.forget_process(patch.token, process.id());
            return Err(e.context(format!("failed to activate patch {}", patch.path.display())));
        }
        Ok(())
    }

    fn replay_edits(&self, process: &Arc<LiveProcess>, patch: &ModulePatch, rollback: &mut Rollback) -> Result<()> {
        let arch: &dyn Architecture = &self.arch;
        let cache = &*self.module_cache;

        rollback.enter_sync_point(0, process)?;
        call_recorded_hooks(cache, process, patch.pre_patch_hooks.as_ref())?;

        apply_relocations(arch, cache, process, patch.token, &patch.pre_entry_relocations)?;
        prepare_entry(arch, cache, process, patch)?;
        call_entry_point(arch, cache, process, patch)?;
        apply_relocations(arch, cache, process, patch.token, &patch.post_entry_relocations)?;

        {
            let suspended = Suspended::new(process.process())?;
            let ips = suspended.thread_ips()?;
            apply_functions(arch, cache, process, patch, &ips, true, rollback.undo(0))?;
        }

        call_recorded_hooks(cache, process, patch.post_patch_hooks.as_ref())?;
        rollback.leave_sync_point(0, process)
    }
}
