//! Which object files go into a patch.
//!
//! Recompiled files always do. A file that is not recompiled is pulled in when a recompiled
//! file references a symbol that only it defines and that no loaded image has yet, so the
//! linker finds a definition for new symbols without relinking the whole module.

use anyhow::Result;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info, info_span};

use super::LiveModule;
use crate::arch::Architecture;
use crate::symbol::is_precompiled_header_symbol;

/// The object file of the module defining each external symbol.
pub(super) type SymbolOwners = HashMap<String, PathBuf>;

impl<A: Architecture> LiveModule<A> {
    /// Whether `object` is what the linker sees for its unit: parts of an amalgamation only
    /// once it is split, the unity file only until then.
    fn is_linked_unit(&self, object: &Path) -> bool {
        if let Some(amalgamation) = self.compilands.amalgamations.get(object) {
            return !amalgamation.is_split;
        }
        match self.compilands.get(object).and_then(|c| c.amalgamation.as_ref()) {
            Some(unity) => self.compilands.amalgamations.get(unity).map_or(false, |a| a.is_split),
            None => true,
        }
    }

    pub(super) fn symbol_owners(&self, recompiled: &BTreeSet<PathBuf>) -> SymbolOwners {
        let mut paths: Vec<PathBuf> =
            self.compilands.compilands.keys().filter(|p| self.is_linked_unit(p)).cloned().collect();
        paths.extend(recompiled.iter().filter(|p| !self.compilands.contains(p)).cloned());
        paths.sort();

        let mut owners = SymbolOwners::new();
        for (path, db) in self.services.object_cache.load_all(&paths) {
            match db {
                Ok(db) => {
                    for name in db.external_definitions() {
                        owners.entry(name.to_string()).or_insert_with(|| path.clone());
                    }
                }
                Err(e) => debug!("Cannot read {}: {:#}", path.display(), e),
            }
        }
        owners
    }

    pub(super) fn gather_needed_objects(
        &self,
        recompiled: &BTreeSet<PathBuf>,
        owners: &SymbolOwners,
    ) -> Result<Vec<PathBuf>> {
        let _span = info_span!("gather").entered();
        let mut needed = recompiled.clone();
        let mut queue: Vec<PathBuf> = recompiled.iter().cloned().collect();
        while let Some(path) = queue.pop() {
            let db = self.services.object_cache.load(&path)?;
            let mut wanted = Vec::new();
            for symbol in db.undefined() {
                if self.module_cache.contains_symbol(&symbol.name) {
                    continue;
                }
                if let Some(owner) = owners.get(&symbol.name) {
                    wanted.push((owner.clone(), symbol.name.as_str()));
                }
            }
            for included in db.included_symbols().filter(|s| is_precompiled_header_symbol(s)) {
                if let Some(owner) = self.compilands.pch_symbol_to_compiland.get(included) {
                    wanted.push((owner.clone(), included));
                }
            }
            for (owner, symbol) in wanted {
                if needed.insert(owner.clone()) {
                    debug!("{} is needed for {} referenced by {}", owner.display(), symbol, path.display());
                    queue.push(owner);
                }
            }
        }
        info!("Patch needs {} object file(s), {} recompiled", needed.len(), recompiled.len());
        Ok(needed.into_iter().collect())
    }
}
