//! Symbol stripping.
//!
//! Before linking, object files of the patch lose every symbol whose existing instance must
//! be used instead of a fresh one: data (so state survives the patch) and anything defined
//! outside the recompiled units. The linker then leaves references to those symbols alone,
//! they get redirected into the loaded images once the patch is in memory.
//!
//! Files are rewritten in place. Each one is backed up first and `restore` must run once the
//! link is done, whatever its outcome.

use anyhow::Result;
use object::pe;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, info_span, trace};

use super::gather::SymbolOwners;
use super::LiveModule;
use crate::arch::Architecture;
use crate::config::SymbolRemovalStrategy;
use crate::module_cache::ModuleCache;
use crate::object_file::{include_directive, ObjectDb, ObjectSymbol};
use crate::relocation::{would_patch, would_patch_target};
use crate::symbol::is_compiler_generated;
use crate::writer::{self, CoffRewriter, RawSection, RawSymbol};

/// What stripping did to the object files of one patch.
#[derive(Debug, Default)]
pub struct Stripped {
    /// Symbols removed from each object file.
    pub symbols: HashMap<PathBuf, HashSet<String>>,
    /// Files rewritten in place, each with a backup next to it.
    pub rewritten: Vec<PathBuf>,
}

/// Puts every rewritten object file back. Keeps going after a failure and reports the first.
pub(super) fn restore(stripped: &Stripped) -> Result<()> {
    let mut result = Ok(());
    for object in &stripped.rewritten {
        if let Err(e) = writer::restore(object) {
            error!("{:#}", e);
            if result.is_ok() {
                result = Err(e);
            }
        }
    }
    result
}

/// Linker directives that would break the patch, or pull in what is already loaded.
fn keep_directive(directive: &str, cache: &ModuleCache) -> bool {
    let body = directive.trim_start_matches(['/', '-']);
    if body.eq_ignore_ascii_case("editandcontinue") || body.get(..7).map_or(false, |o| o.eq_ignore_ascii_case("export:")) {
        return false;
    }
    match include_directive(directive) {
        Some(symbol) => !cache.contains_symbol(symbol),
        None => true,
    }
}

/// Whether a defined or undefined symbol of `object` may be replaced by its existing instance.
fn can_strip(name: &str, object: &ObjectDb, cache: &ModuleCache) -> bool {
    if !would_patch_target(name) || object.unpatchable_references.contains(name) || !cache.contains_symbol(name) {
        return false;
    }
    object
        .defined()
        .all(|source| source.relocations.iter().filter(|r| r.target == name).all(|r| would_patch(r, &source.name)))
}

/// One object file being rewritten.
struct Rewrite {
    path: PathBuf,
    rewriter: CoffRewriter,
    db: Arc<ObjectDb>,
    /// Symbol table index to position in `db.symbols`.
    slots: HashMap<usize, usize>,
    removed: HashSet<String>,
    /// Removed undefined symbols whose definition lives outside the recompiled units.
    forced: HashSet<String>,
    /// Sections that held a removed definition.
    emptied: BTreeSet<usize>,
}

impl Rewrite {
    fn symbol_at(&self, raw: &RawSymbol) -> Option<&ObjectSymbol> {
        self.slots.get(&raw.index).map(|&slot| &self.db.symbols[slot])
    }

    fn remove(&mut self, raw: &RawSymbol, name: &str) -> Result<()> {
        self.rewriter.remove_symbol(raw.index)?;
        if raw.section_number > 0 {
            self.emptied.insert(raw.section_number as usize);
        }
        trace!("Stripped {} from {}", name, self.path.display());
        self.removed.insert(name.to_string());
        Ok(())
    }
}

impl<A: Architecture> LiveModule<A> {
    /// Strips every needed object file. On error, files rewritten so far are restored.
    pub(super) fn strip_objects(
        &self,
        needed: &[PathBuf],
        recompiled: &BTreeSet<PathBuf>,
        owners: &SymbolOwners,
    ) -> Result<Stripped> {
        let _span = info_span!("strip").entered();
        let mut stripped = Stripped::default();
        match self.strip_all(needed, recompiled, owners, &mut stripped) {
            Ok(()) => Ok(stripped),
            Err(e) => {
                restore(&stripped)?;
                Err(e)
            }
        }
    }

    fn strip_all(
        &self,
        needed: &[PathBuf],
        recompiled: &BTreeSet<PathBuf>,
        owners: &SymbolOwners,
        stripped: &mut Stripped,
    ) -> Result<()> {
        let cache = &*self.module_cache;
        let strategy = self.settings.removal_strategy(&self.settings.linker_for(&self.linker.linker_path));

        let mut rewrites = Vec::with_capacity(needed.len());
        for path in needed {
            writer::backup(path)?;
            stripped.rewritten.push(path.clone());
            let db = self.services.object_cache.load(path)?;
            let mut rewrite = Rewrite {
                path: path.clone(),
                rewriter: CoffRewriter::open(path, strategy)?,
                slots: db.symbols.iter().enumerate().map(|(slot, s)| (s.index, slot)).collect(),
                db,
                removed: HashSet::new(),
                forced: HashSet::new(),
                emptied: BTreeSet::new(),
            };
            strip_known_symbols(&mut rewrite, recompiled, owners, cache)?;
            let dropped = rewrite.rewriter.rewrite_directives(|d| keep_directive(d, cache))?;
            if dropped > 0 {
                debug!("Dropped {} directive(s) from {}", dropped, path.display());
            }
            rewrites.push(rewrite);
        }

        // A symbol stripped anywhere is stripped everywhere, so no file drags in a fresh copy.
        if rewrites.len() > 1 {
            let everywhere: HashSet<String> =
                rewrites.iter().flat_map(|r| r.removed.iter().chain(r.forced.iter()).cloned()).collect();
            for rewrite in &mut rewrites {
                for raw in rewrite.rewriter.symbols()? {
                    if raw.section_number != 0 || raw.is_removed() {
                        continue;
                    }
                    let Some(name) = rewrite.symbol_at(&raw).filter(|s| s.is_undefined).map(|s| s.name.clone()) else {
                        continue;
                    };
                    if everywhere.contains(&name) && !rewrite.removed.contains(&name) {
                        rewrite.remove(&raw, &name)?;
                        rewrite.forced.insert(name);
                    }
                }
            }
        }

        for mut rewrite in rewrites {
            remove_emptied_sections(&mut rewrite, cache)?;
            if strategy == SymbolRemovalStrategy::Absolute {
                retarget_section_relative(&mut rewrite.rewriter)?;
            }
            rewrite.rewriter.save(&rewrite.path)?;
            info!("Stripped {} symbol(s) from {}", rewrite.removed.len(), rewrite.path.display());
            stripped.symbols.insert(rewrite.path, rewrite.removed);
        }
        Ok(())
    }
}

fn strip_known_symbols(
    rewrite: &mut Rewrite,
    recompiled: &BTreeSet<PathBuf>,
    owners: &SymbolOwners,
    cache: &ModuleCache,
) -> Result<()> {
    for raw in rewrite.rewriter.symbols()? {
        if raw.section_number < 0 || raw.is_section_definition() {
            continue;
        }
        let Some((name, is_undefined, is_function)) =
            rewrite.symbol_at(&raw).map(|s| (s.name.clone(), s.is_undefined, s.is_function))
        else {
            continue;
        };
        if is_compiler_generated(&name) {
            continue;
        }
        let strip = if is_undefined {
            match owners.get(&name) {
                Some(owner) if recompiled.contains(owner) => can_strip(&name, &rewrite.db, cache),
                _ => {
                    let exists = cache.contains_symbol(&name);
                    if exists {
                        rewrite.forced.insert(name.clone());
                    }
                    exists
                }
            }
        } else {
            !is_function && can_strip(&name, &rewrite.db, cache)
        };
        if strip {
            rewrite.remove(&raw, &name)?;
        }
    }
    Ok(())
}

/// Drops sections whose definitions were all stripped, along with their associated COMDATs.
fn remove_emptied_sections(rewrite: &mut Rewrite, cache: &ModuleCache) -> Result<()> {
    if rewrite.emptied.is_empty() {
        return Ok(());
    }
    let symbols = rewrite.rewriter.symbols()?;
    let sections = rewrite.rewriter.sections()?;
    let section_of_definition: HashMap<usize, usize> = symbols
        .iter()
        .filter(|s| s.is_section_definition() && s.section_number > 0)
        .map(|s| (s.index, s.section_number as usize))
        .collect();
    let has_live_symbols: HashSet<usize> = symbols
        .iter()
        .filter(|s| s.section_number > 0 && !s.is_section_definition() && !s.is_removed())
        .map(|s| s.section_number as usize)
        .collect();

    let mut candidates: BTreeSet<usize> = rewrite
        .emptied
        .iter()
        .copied()
        .filter(|n| !has_live_symbols.contains(n))
        .filter(|n| sections.get(n - 1).map_or(false, RawSection::is_part_of_image))
        .collect();

    // Kept sections referencing a candidate through its section symbol keep it alive, and a
    // section kept that way keeps its own targets.
    let mut kept: Vec<usize> = sections
        .iter()
        .filter(|s| s.is_part_of_image() && !candidates.contains(&s.number))
        .map(|s| s.number)
        .collect();
    while let Some(number) = kept.pop() {
        for relocation in rewrite.rewriter.relocations(number)? {
            let Some(&target) = section_of_definition.get(&relocation.symbol_index) else { continue };
            if target != number && candidates.remove(&target) {
                debug!("Keeping section #{} of {}: referenced by section #{}", target, rewrite.path.display(), number);
                kept.push(target);
            }
        }
    }

    loop {
        let associated: Vec<usize> = sections
            .iter()
            .filter(|s| !candidates.contains(&s.number))
            .filter(|s| {
                s.comdat.map_or(false, |c| {
                    c.selection == pe::IMAGE_COMDAT_SELECT_ASSOCIATIVE && candidates.contains(&c.associated)
                })
            })
            .map(|s| s.number)
            .collect();
        if associated.is_empty() {
            break;
        }
        candidates.extend(associated);
    }

    // Whatever still lives in an associated section goes with it, if it can.
    let mut leftovers = Vec::new();
    for raw in &symbols {
        if raw.section_number <= 0 || raw.is_section_definition() || raw.is_removed() {
            continue;
        }
        let section = raw.section_number as usize;
        if !candidates.contains(&section) {
            continue;
        }
        let name = rewrite.symbol_at(raw).map_or_else(|| raw.name.clone(), |s| s.name.clone());
        let local = matches!(raw.storage_class, pe::IMAGE_SYM_CLASS_STATIC | pe::IMAGE_SYM_CLASS_LABEL);
        if local || can_strip(&name, &rewrite.db, cache) {
            leftovers.push((raw.clone(), name));
        } else {
            candidates.remove(&section);
        }
    }
    for (raw, name) in leftovers {
        if candidates.contains(&(raw.section_number as usize)) {
            rewrite.remove(&raw, &name)?;
        }
    }

    for number in &candidates {
        rewrite.rewriter.remove_section(*number)?;
    }
    if !candidates.is_empty() {
        debug!("Removed {} section(s) from {}", candidates.len(), rewrite.path.display());
    }
    Ok(())
}

/// Section-relative references to removed symbols in image sections would make LLD reject the
/// file; they become image-relative ones, which it accepts and which get redirected anyway.
fn retarget_section_relative(rewriter: &mut CoffRewriter) -> Result<()> {
    let removed: HashSet<usize> = rewriter.symbols()?.into_iter().filter(RawSymbol::is_removed).map(|s| s.index).collect();
    if removed.is_empty() {
        return Ok(());
    }
    for section in rewriter.sections()? {
        if !section.is_part_of_image() || section.is_discardable() {
            continue;
        }
        let relocations = rewriter.relocations(section.number)?;
        for (index, relocation) in relocations.iter().enumerate() {
            if relocation.typ == pe::IMAGE_REL_AMD64_SECREL && removed.contains(&relocation.symbol_index) {
                rewriter.set_relocation_type(section.number, index, pe::IMAGE_REL_AMD64_ADDR32NB)?;
            }
        }
    }
    Ok(())
}

/// Symbols stripped from `object`, empty for files that were not rewritten.
pub(super) fn stripped_from<'a>(stripped: &'a Stripped, object: &Path, none: &'a HashSet<String>) -> &'a HashSet<String> {
    stripped.symbols.get(object).unwrap_or(none)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ImageDatabases;
    use crate::testing::{ObjectBuilder, SymbolSpec};
    use object::SectionKind;
    use std::fs;
    use std::path::Path;

    fn cache_with(names: &[&str]) -> ModuleCache {
        let cache = ModuleCache::new();
        let mut databases = ImageDatabases::default();
        for (i, name) in names.iter().enumerate() {
            databases.symbols.insert(*name, 0x1000 + i as u32 * 0x10);
        }
        cache.insert(Path::new("app.dll"), Arc::new(databases), 0x3000);
        cache
    }

    #[test]
    fn directives() {
        let cache = cache_with(&["g_registry"]);
        assert!(!keep_directive("/EDITANDCONTINUE", &cache));
        assert!(!keep_directive("/EXPORT:GetX", &cache));
        assert!(!keep_directive("/INCLUDE:g_registry", &cache));
        assert!(keep_directive("/INCLUDE:g_new", &cache));
        assert!(keep_directive("/DEFAULTLIB:\"LIBCMT\"", &cache));
    }

    #[test]
    fn sections_referenced_from_kept_sections_stay() {
        // .text -> .rdata$a -> .rdata$b through section symbols, .rdata$c is unreferenced.
        let mut builder = ObjectBuilder::new();
        let text = builder.text(&[0x48, 0x8d, 0x05, 0, 0, 0, 0, 0xc3]);
        builder.function(text, "Main", 0, 8);
        let a = builder.section(".rdata$a", SectionKind::ReadOnlyData, &[0; 8]);
        let b = builder.section(".rdata$b", SectionKind::ReadOnlyData, &[0; 8]);
        let c = builder.section(".rdata$c", SectionKind::ReadOnlyData, &[0; 8]);
        builder.add(SymbolSpec::data(a, "g_first", 0));
        builder.add(SymbolSpec::data(b, "g_second", 0));
        builder.add(SymbolSpec::data(c, "g_third", 0));
        let a_symbol = builder.section_symbol(a);
        let b_symbol = builder.section_symbol(b);
        builder.relocate(text, 3, a_symbol, pe::IMAGE_REL_AMD64_REL32);
        builder.relocate(a, 0, b_symbol, pe::IMAGE_REL_AMD64_ADDR64);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.obj");
        fs::write(&path, builder.build()).unwrap();
        let db = Arc::new(ObjectDb::load(&path).unwrap());
        let cache = cache_with(&["Main", "g_first", "g_second", "g_third"]);
        let mut rewrite = Rewrite {
            rewriter: CoffRewriter::open(&path, SymbolRemovalStrategy::DebugSection).unwrap(),
            path,
            slots: db.symbols.iter().enumerate().map(|(slot, s)| (s.index, slot)).collect(),
            db,
            removed: HashSet::new(),
            forced: HashSet::new(),
            emptied: BTreeSet::new(),
        };

        strip_known_symbols(&mut rewrite, &BTreeSet::new(), &SymbolOwners::new(), &cache).unwrap();
        assert_eq!(rewrite.removed.len(), 3);
        remove_emptied_sections(&mut rewrite, &cache).unwrap();

        let names: Vec<String> = rewrite.rewriter.sections().unwrap().into_iter().map(|s| s.name).collect();
        assert!(names.contains(&".rdata$a".to_string()));
        assert!(names.contains(&".rdata$b".to_string()));
        assert!(!names.contains(&".rdata$c".to_string()));
    }
}
