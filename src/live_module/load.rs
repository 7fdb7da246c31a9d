//! Mapping a linked patch into the processes.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, info_span, warn};

use super::activate::Rollback;
use super::strip::Stripped;
use super::{LiveModule, UpdateOutcome};
use crate::arch::Architecture;
use crate::entry_point::disable_in_image;
use crate::image::Image;
use crate::live_process::LiveProcess;
use crate::module_cache::ModuleToken;
use crate::patch::ModulePatch;
use crate::process::{find_free_region_near, is_within_relative_reach, Suspended};
use crate::provider::ImageDatabases;
use crate::transport::{self, Command};
use crate::utils::insert_before_extension;

/// Loads a patch image into one process, somewhere its module can reach with 32-bit
/// displacements. Returns the base it ended up at, `None` when it could not be loaded.
///
/// The image is rebased to the chosen address first. With `rebase_in_place` the file itself
/// is rewritten, otherwise a per-process copy `<image>_<pid>` is loaded.
pub(super) fn load_into(
    process: &LiveProcess,
    module_size: u32,
    image: &mut Image,
    path: &Path,
    rebase_in_place: bool,
) -> Result<Option<u64>> {
    let size = image.size_of_image()? as u64;
    let base = {
        let _suspended = Suspended::new(process.process())?;
        find_free_region_near(process.process(), process.module_base(), module_size as u64, size)?
    };
    let Some(base) = base else {
        warn!("No free address range near the module (PID: {})", process.id());
        return Ok(None);
    };

    let file: PathBuf = if image.image_base()? == base {
        path.to_path_buf()
    } else if rebase_in_place {
        image.rebase(base)?;
        image.save(path)?;
        path.to_path_buf()
    } else {
        let copy = insert_before_extension(path, &format!("_{}", process.id()));
        let mut rebased = Image::from_bytes(&copy, image.bytes().to_vec())?;
        rebased.rebase(base)?;
        rebased.save(&copy)?;
        copy
    };

    info!("Loading {} at 0x{:x} (PID: {})", file.display(), base, process.id());
    let loaded = transport::load_patch(process.transport(), file)?;
    if let Some(actual) = loaded.filter(|&actual| actual != base) {
        warn!("Patch was loaded at 0x{:x} instead of 0x{:x} (PID: {})", actual, base, process.id());
    }
    Ok(loaded)
}

/// Unloads a patch from every process it was loaded into.
pub(super) fn unload_all(loaded: &[(Arc<LiveProcess>, u64)]) {
    for (process, base) in loaded {
        if let Err(e) = process.send(Command::UnloadPatch { base: *base }) {
            error!("Cannot unload patch at 0x{:x} (PID: {}): {:#}", base, process.id(), e);
        }
    }
}

impl<A: Architecture> LiveModule<A> {
    pub(super) fn load_and_activate(
        &mut self,
        image_path: PathBuf,
        needed: &[PathBuf],
        stripped: &Stripped,
    ) -> Result<UpdateOutcome> {
        let _span = info_span!("install", patch = %image_path.display()).entered();
        let mut image = Image::open(&image_path)?;
        let entry_point = disable_in_image(&mut image, &self.arch)?;
        image.save(&image_path)?;
        let image_size = image.size_of_image()?;
        let databases = Arc::new(ImageDatabases::gather(&*self.services.provider, &image_path)?);
        let module_size = self.module_cache.image_size(ModuleToken::ORIGINAL).unwrap_or_default();

        let mut loaded = Vec::with_capacity(self.processes.len());
        for (i, process) in self.processes.iter().enumerate() {
            match load_into(process, module_size, &mut image, &image_path, i == 0) {
                Ok(Some(base)) => loaded.push((process.clone(), base)),
                Ok(None) => {
                    error!("Cannot load patch {} (PID: {})", image_path.display(), process.id());
                    unload_all(&loaded);
                    return Ok(self.abandon_cycle(UpdateOutcome::LoadError));
                }
                Err(e) => {
                    error!("Cannot load patch {} (PID: {}): {:#}", image_path.display(), process.id(), e);
                    unload_all(&loaded);
                    return Ok(self.abandon_cycle(UpdateOutcome::LoadError));
                }
            }
        }
        for (process, base) in &loaded {
            if !is_within_relative_reach(process.module_base(), module_size as u64, *base, image_size as u64) {
                error!("Patch at 0x{:x} is out of reach of the module (PID: {})", base, process.id());
                unload_all(&loaded);
                return Ok(self.abandon_cycle(UpdateOutcome::ActivateError));
            }
        }

        let token = self.module_cache.insert(&image_path, databases.clone(), image_size);
        for (process, base) in &loaded {
            self.module_cache.register_process(token, process.id(), *base);
        }
        let mut patch = ModulePatch::new(image_path, token, image_size, entry_point);
        let mut rollback = Rollback::new(self.processes.len());
        if let Err(e) = self.activate(&mut patch, &databases, &image, needed, stripped, &mut rollback) {
            error!("Cannot activate patch {}: {:#}", patch.path.display(), e);
            rollback.revert(&self.processes);
            unload_all(&loaded);
            self.module_cache.discard(token);
            return Ok(self.abandon_cycle(UpdateOutcome::ActivateError));
        }
        self.finish_cycle(patch);
        Ok(UpdateOutcome::Success)
    }
}
