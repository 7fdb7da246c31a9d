//! Linking the stripped object files into a patch image.

use anyhow::Result;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, info_span};

use super::LiveModule;
use crate::arch::Architecture;
use crate::config::WeakSymbolPolicy;
use crate::toolchain::ToolOutput;
use crate::utils::quoted;

/// Options every patch is linked with. The image must not be relocated by the loader behind
/// our back, and it must not drag in default libraries the module already carries.
const COMMON_LINKER_OPTIONS: &[&str] = &[
    "/MACHINE:X64",
    "/NOLOGO",
    "/INCREMENTAL:NO",
    "/MANIFEST:NO",
    "/DEBUG",
    "/FUNCTIONPADMIN",
    "/FIXED:NO",
    "/DYNAMICBASE:NO",
    "/NODEFAULTLIB",
    "/OPT:REF",
    "/OPT:NOICF",
    "/DLL",
];

pub(super) struct Linked {
    pub image: PathBuf,
    pub result: ToolOutput,
}

/// A stale patch file from an earlier session can only be reused once nothing holds it.
fn is_reusable(path: &Path) -> bool {
    !path.exists() || fs::remove_file(path).is_ok()
}

impl<A: Architecture> LiveModule<A> {
    /// Picks the next free `<module>.patch_<n>.dll` and its debug database.
    fn next_patch_paths(&mut self) -> (PathBuf, PathBuf) {
        let stem = self.path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        loop {
            let image = self.path.with_file_name(format!("{}.patch_{}.dll", stem, self.patch_counter));
            let pdb = image.with_extension("pdb");
            self.patch_counter += 1;
            if is_reusable(&image) && is_reusable(&pdb) {
                return (image, pdb);
            }
            debug!("{} is in use, trying the next name", image.display());
        }
    }

    pub(super) fn link_arguments(
        &self,
        needed: &[PathBuf],
        recompiled: &BTreeSet<PathBuf>,
        image: &Path,
        pdb: &Path,
    ) -> Result<String> {
        let mut arguments: Vec<String> = COMMON_LINKER_OPTIONS.iter().map(|o| o.to_string()).collect();
        if !self.settings.linker_options.is_empty() {
            arguments.push(self.settings.linker_options.clone());
        }
        // Functions of recompiled units must survive even when nothing in the patch calls them.
        for object in recompiled {
            let db = self.services.object_cache.load(object)?;
            arguments.extend(db.external_functions().map(|f| format!("/INCLUDE:{f}")));
        }
        if self.settings.weak_symbols == WeakSymbolPolicy::ForceInclude {
            arguments.extend(self.weak_library_symbols.iter().map(|s| format!("/INCLUDE:{s}")));
        }
        arguments.push(format!("/OUT:{}", quoted(image)));
        arguments.push(format!("/PDB:{}", quoted(pdb)));
        arguments.extend(needed.iter().map(|o| quoted(o)));
        arguments.extend(self.linker.libraries.iter().map(|l| quoted(l)));
        Ok(arguments.join(" "))
    }

    pub(super) fn link(&mut self, needed: &[PathBuf], recompiled: &BTreeSet<PathBuf>) -> Result<Linked> {
        let _span = info_span!("link").entered();
        let (image, pdb) = self.next_patch_paths();
        let arguments = self.link_arguments(needed, recompiled, &image, &pdb)?;
        let linker = self.settings.linker_for(&self.linker.linker_path);
        let working_directory = if self.linker.working_directory.is_dir() {
            self.linker.working_directory.clone()
        } else {
            linker.parent().map(Path::to_path_buf).unwrap_or_default()
        };

        info!("Linking patch {} from {} object file(s)", image.display(), needed.len());
        let result = self.services.toolchain.run(&linker, &working_directory, &arguments)?;
        self.forward_output(&result.output);
        Ok(Linked { image, result })
    }
}
