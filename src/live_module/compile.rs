//! Recompilation of changed translation units.
//!
//! Units run in stages, and a stage only starts when every unit of the previous one compiled:
//! 1. units creating a precompiled header, one at a time, since everything else may depend
//!    on them,
//! 2. units with embedded debug information, all in parallel,
//! 3. units writing into a shared debug database, in parallel per database and serially
//!    within one. Units using minimal rebuild share state with previous compiles and run
//!    last, one at a time.
//!
//! A unit that failed or never ran stays modified and is compiled again by the next cycle.

use anyhow::Result;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{error, info, info_span, warn};

use super::LiveModule;
use crate::arch::Architecture;
use crate::compiland::Compiland;
use crate::config::Settings;
use crate::toolchain::ToolOutput;
use crate::utils::{has_option, quoted};

/// Builds the arguments of one compile. `shares_pdb` serializes writes to a shared database.
pub(super) fn compile_arguments(settings: &Settings, compiland: &Compiland, shares_pdb: bool) -> String {
    let mut arguments = vec!["-c".to_string()];
    if !settings.compiler_options.is_empty() {
        arguments.push(settings.compiler_options.clone());
    }
    if shares_pdb && !has_option(&compiland.command_line, "FS") {
        arguments.push("-FS".into());
    }
    arguments.push(compiland.command_line.clone());
    if !compiland.has_embedded_debug_info() && !has_option(&compiland.command_line, "Fd") {
        arguments.push(format!("-Fd{}", quoted(&compiland.pdb_path)));
    }
    if !has_option(&compiland.command_line, "Fo") {
        arguments.push(format!("-Fo{}", quoted(&compiland.obj_path)));
    }
    arguments.push(quoted(&compiland.source_path));
    arguments.retain(|a| !a.is_empty());
    arguments.join(" ")
}

type Compiled = (PathBuf, Result<ToolOutput>);

impl<A: Architecture> LiveModule<A> {
    /// Compiles the units owning the modified objects. Returns the units that failed with
    /// their exit codes.
    pub(super) fn compile(&mut self) -> Result<Vec<(PathBuf, i32)>> {
        let _span = info_span!("compile").entered();
        let mut headers = Vec::new();
        let mut serial = Vec::new();
        let mut parallel = Vec::new();
        let mut shared: BTreeMap<PathBuf, Vec<Compiland>> = BTreeMap::new();
        for object in self.modified.clone() {
            let Some(compiland) = self.compilands.get(&object) else {
                warn!("No compiland known for {}, skipping", object.display());
                self.modified.remove(&object);
                continue;
            };
            let compiland = compiland.clone();
            if compiland.creates_precompiled_header() {
                headers.push(compiland);
            } else if compiland.has_embedded_debug_info() {
                parallel.push(compiland);
            } else if compiland.uses_minimal_rebuild() {
                serial.push(compiland);
            } else {
                shared.entry(compiland.pdb_path.clone()).or_default().push(compiland);
            }
        }
        info!("Compiling {} file(s)", self.modified.len());

        let mut failures = Vec::new();
        let results: Vec<Compiled> = headers.iter().map(|c| (c.obj_path.clone(), self.compile_one(c, false))).collect();
        if !self.record(results, &mut failures)? {
            warn!("Precompiled header failed to compile, skipping the remaining files");
            return Ok(failures);
        }

        let this = &*self;
        let results: Vec<Compiled> =
            parallel.par_iter().map(|c| (c.obj_path.clone(), this.compile_one(c, false))).collect();
        if !self.record(results, &mut failures)? {
            return Ok(failures);
        }

        let this = &*self;
        let groups: Vec<&Vec<Compiland>> = shared.values().collect();
        let mut results: Vec<Compiled> = groups
            .par_iter()
            .flat_map_iter(|group| group.iter().map(|c| (c.obj_path.clone(), this.compile_one(c, true))).collect::<Vec<_>>())
            .collect();
        results.extend(serial.iter().map(|c| (c.obj_path.clone(), this.compile_one(c, false))));
        self.record(results, &mut failures)?;
        Ok(failures)
    }

    /// Books the results of one stage. Returns whether every unit compiled.
    fn record(&mut self, results: Vec<Compiled>, failures: &mut Vec<(PathBuf, i32)>) -> Result<bool> {
        let mut all_compiled = true;
        for (object, result) in results {
            let exit_code = match result {
                Ok(output) if output.success() => {
                    self.services.object_cache.reload(&object)?;
                    if let Some(compiland) = self.compilands.compilands.get_mut(&object) {
                        compiland.was_recompiled = true;
                    }
                    self.modified.remove(&object);
                    self.pending.insert(object);
                    continue;
                }
                Ok(output) => output.exit_code,
                Err(e) => {
                    error!("Cannot run compiler for {}: {:#}", object.display(), e);
                    -1
                }
            };
            // The object on disk is stale until the unit compiles again.
            if let Some(compiland) = self.compilands.compilands.get_mut(&object) {
                compiland.was_recompiled = false;
            }
            self.pending.remove(&object);
            failures.push((object, exit_code));
            all_compiled = false;
        }
        Ok(all_compiled)
    }

    fn compile_one(&self, compiland: &Compiland, shares_pdb: bool) -> Result<ToolOutput> {
        let compiler = self.settings.compiler_for(&compiland.compiler_path);
        let working_directory = if compiland.working_directory.is_dir() {
            compiland.working_directory.clone()
        } else {
            compiler.parent().map(Path::to_path_buf).unwrap_or_default()
        };
        let arguments = compile_arguments(&self.settings, compiland, shares_pdb);
        info!("Compiling {}", compiland.source_path.display());
        let output = self.services.toolchain.run(&compiler, &working_directory, &arguments)?;
        self.forward_output(&output.output);
        if !output.success() {
            warn!("Compiling {} failed with exit code {}", compiland.source_path.display(), output.exit_code);
        }
        Ok(output)
    }
}
