//! Relocation patching.
//!
//! The linker resolves every reference of a patch image against the patch itself. References
//! to symbols that were stripped, or whose existing instance must be kept, are redirected to
//! the instance living in an older image once the patch is loaded. Each redirection becomes a
//! `RelocationRecord`: process independent, so it can be replayed into other processes.

use anyhow::{anyhow, Result};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, trace};

use crate::arch::Architecture;
use crate::module_cache::{ModuleCache, ModuleToken};
use crate::object_file::{ObjectDb, Relocation, RelocationType};
use crate::process::RemoteImage;
use crate::provider::ImageDatabases;
use crate::symbol::{is_compiler_generated, is_exception_related, is_rtti_object_locator};
use crate::utils::normalize_path;

/// When a relocation is redirected relative to the patch's entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Data and stripped destinations: fixed before initializers run, since they may read them.
    PreEntry,
    /// Everything else: fixed after initializers ran, so they call the new functions.
    PostEntry,
}

impl Phase {
    pub fn of(destination_is_function: bool, destination_is_stripped: bool) -> Self {
        if !destination_is_function || destination_is_stripped {
            Phase::PreEntry
        } else {
            Phase::PostEntry
        }
    }
}

/// A resolved redirection of one relocated field inside a patch image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocationRecord {
    pub kind: RelocationType,
    /// Address of the field in the patch.
    pub patch_rva: u32,
    /// Image holding the destination symbol.
    pub target: ModuleToken,
    pub target_rva: u32,
    pub addend: i64,
}

impl RelocationRecord {
    /// Writes the field. The value only depends on the record and the load addresses, so
    /// applying a record again changes nothing.
    pub fn apply(&self, arch: &dyn Architecture, patch: &RemoteImage, bases: &[Option<u64>]) -> Result<()> {
        let target_base = bases
            .get(self.target.index())
            .copied()
            .flatten()
            .ok_or_else(|| anyhow!("image {} is not loaded in process {}", self.target.index(), patch.process().id()))?;
        let p = patch.address(self.patch_rva);
        let s = target_base + self.target_rva as u64;
        let mut field = patch.read(self.patch_rva, self.kind.size())?;
        arch.apply_relocation(self.kind, p, s, self.addend, patch.base(), &mut field)?;
        trace!("Relocated field at 0x{:x} to 0x{:x}", p, s);
        patch.write(self.patch_rva, &field)
    }
}

/// Whether references to `name` are ever redirected into an older image.
pub fn would_patch_target(name: &str) -> bool {
    !is_compiler_generated(name)
}

/// Whether this relocation of `source` would be redirected if its destination was stripped.
pub fn would_patch(relocation: &Relocation, source: &str) -> bool {
    relocation.kind.is_patchable()
        && would_patch_target(&relocation.target)
        && !is_exception_related(source)
        && !is_rtti_object_locator(source)
}

/// Whether the patch image's instance of the symbol at `rva` was produced by `object`.
pub fn is_contributed_by(databases: &ImageDatabases, rva: u32, object: &Path) -> bool {
    match databases.contributions.object_at(rva) {
        Some(contributor) => normalize_path(contributor) == normalize_path(object),
        None => true,
    }
}

/// Resolves a relocation of the patch into a record, or `None` when the linker's own
/// resolution stands.
///
/// # Arguments
/// * `relocation` - The relocation, taken from the object file's tables.
/// * `source_rva` - Address of the symbol owning the relocation in the patch.
/// * `stripped` - Symbols stripped from the object file; references to them must be redirected.
pub fn resolve(
    relocation: &Relocation,
    source: &str,
    source_rva: u32,
    stripped: &HashSet<String>,
    cache: &ModuleCache,
    patch: ModuleToken,
    patch_databases: &ImageDatabases,
) -> Option<RelocationRecord> {
    if !would_patch(relocation, source) {
        return None;
    }
    let target = &relocation.target;
    let Some(existing) = cache.find_symbol(Some(patch), target) else {
        trace!("{} is new, keeping the reference from {}", target, source);
        return None;
    };
    if !stripped.contains(target) {
        if let Some(own) = patch_databases.symbols.find(target) {
            // A fresh definition from one of the patch's own units replaces the old one.
            let from_patch_unit = patch_databases
                .contributions
                .object_at(own.rva)
                .map_or(false, |object| patch_databases.compilands.contains(object));
            if from_patch_unit {
                return None;
            }
        }
    }
    debug!(
        "Redirecting reference from {} to {} into image {} at RVA 0x{:x}",
        source,
        target,
        existing.token.index(),
        existing.rva
    );
    Some(RelocationRecord {
        kind: relocation.kind,
        patch_rva: source_rva + relocation.offset,
        target: existing.token,
        target_rva: existing.rva,
        addend: relocation.addend,
    })
}

/// Collects the records of one phase for an object file linked into the patch.
pub fn collect(
    phase: Phase,
    object: &ObjectDb,
    stripped: &HashSet<String>,
    cache: &ModuleCache,
    patch: ModuleToken,
    patch_databases: &ImageDatabases,
) -> Vec<RelocationRecord> {
    let mut records = Vec::new();
    for symbol in object.defined() {
        if symbol.relocations.is_empty() {
            continue;
        }
        // Symbols missing from the patch were discarded by the linker.
        let Some(source) = patch_databases.symbols.find(&symbol.name) else {
            continue;
        };
        if !is_contributed_by(patch_databases, source.rva, &object.path) {
            debug!("Ignoring relocations of {} in {}: contributed by another unit", symbol.name, object.path.display());
            continue;
        }
        for relocation in &symbol.relocations {
            let is_function = object.symbol(&relocation.target).map_or(false, |s| s.is_function);
            if Phase::of(is_function, stripped.contains(&relocation.target)) != phase {
                continue;
            }
            if let Some(record) = resolve(relocation, &symbol.name, source.rva, stripped, cache, patch, patch_databases) {
                records.push(record);
            }
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86_64::X86_64;
    use crate::compiland::Compiland;
    use crate::process::{Process, SimulatedProcess};
    use crate::testing::{ObjectBuilder, SymbolSpec};
    use object::pe;
    use std::sync::Arc;

    const MODULE: u64 = 0x1_4000_0000;
    const PATCH: u64 = 0x1_4001_0000;

    fn setup() -> (ModuleCache, ModuleToken, ImageDatabases, ObjectDb) {
        let mut builder = ObjectBuilder::new();
        let g_x = builder.undefined("g_x", false);
        let helper = builder.undefined("Helper", true);
        let text = builder.text(&[0x8b, 0x05, 0, 0, 0, 0, 0xe8, 0, 0, 0, 0, 0xc3]);
        builder.function(text, "GetX", 0, 12);
        builder.relocate(text, 2, g_x, pe::IMAGE_REL_AMD64_REL32);
        builder.relocate(text, 7, helper, pe::IMAGE_REL_AMD64_REL32);
        let data = builder.data(&[0; 8]);
        builder.add(SymbolSpec::data(data, "g_table", 0));
        let object = ObjectDb::parse(Path::new("b.obj"), &builder.build()).unwrap();

        let cache = ModuleCache::new();
        let mut original = ImageDatabases::default();
        original.symbols.insert("GetX", 0x1010);
        original.symbols.insert("Helper", 0x1100);
        original.symbols.insert("g_x", 0x2000);
        cache.insert(Path::new("app.dll"), Arc::new(original), 0x3000);

        let mut patch_databases = ImageDatabases::default();
        patch_databases.symbols.insert("GetX", 0x1000);
        patch_databases.symbols.insert("Helper", 0x1040);
        patch_databases.contributions.add(Path::new("b.obj"), 0x1000, 0x20);
        patch_databases.compilands.add(Compiland::new("b.cpp", "b.obj"));
        let patch = cache.insert(Path::new("app.patch_0.dll"), Arc::new(patch_databases.clone()), 0x2000);
        (cache, patch, patch_databases, object)
    }

    #[test]
    fn phases_split_data_and_functions() {
        let (cache, patch, patch_databases, object) = setup();
        let stripped: HashSet<String> = ["g_x".to_string()].into();

        let pre = collect(Phase::PreEntry, &object, &stripped, &cache, patch, &patch_databases);
        assert_eq!(
            pre,
            vec![RelocationRecord {
                kind: RelocationType::Relative { extra: 0 },
                patch_rva: 0x1002,
                target: ModuleToken::ORIGINAL,
                target_rva: 0x2000,
                addend: 0,
            }]
        );

        // Helper comes from a library copy inside the patch, the original instance wins.
        let post = collect(Phase::PostEntry, &object, &stripped, &cache, patch, &patch_databases);
        assert_eq!(post.len(), 1);
        assert_eq!((post[0].patch_rva, post[0].target_rva), (0x1007, 0x1100));
    }

    #[test]
    fn own_definitions_are_kept() {
        let (cache, patch, mut patch_databases, object) = setup();
        patch_databases.contributions.add(Path::new("b.obj"), 0x1040, 0x10);
        let post = collect(Phase::PostEntry, &object, &HashSet::new(), &cache, patch, &patch_databases);
        assert!(post.is_empty());
    }

    #[test]
    fn applying_twice_is_idempotent() {
        let (cache, patch, patch_databases, object) = setup();
        let stripped: HashSet<String> = ["g_x".to_string()].into();
        let records = collect(Phase::PreEntry, &object, &stripped, &cache, patch, &patch_databases);

        let process = SimulatedProcess::new(1);
        process.map(MODULE, vec![0; 0x3000]);
        process.map(PATCH, vec![0; 0x2000]);
        cache.register_process(ModuleToken::ORIGINAL, 1, MODULE);
        cache.register_process(patch, 1, PATCH);
        let bases = cache.gather_module_bases(1);
        let remote = RemoteImage::new(&process, PATCH, 0x2000);

        let arch = X86_64;
        for record in &records {
            record.apply(&arch, &remote, &bases).unwrap();
        }
        let once = process.snapshot();
        for record in &records {
            record.apply(&arch, &remote, &bases).unwrap();
        }
        assert_eq!(process.snapshot(), once);

        let mut field = [0u8; 4];
        process.read_memory(PATCH + 0x1002, &mut field).unwrap();
        assert_eq!(PATCH as i64 + 0x1006 + i32::from_le_bytes(field) as i64, (MODULE + 0x2000) as i64);
    }

    #[test]
    fn compiler_generated_targets_are_left_alone() {
        let relocation = Relocation {
            offset: 0,
            target: "??_C@_05ABCDEF@hello@".into(),
            addend: 0,
            kind: RelocationType::Relative { extra: 0 },
        };
        assert!(!would_patch(&relocation, "GetX"));
        let relocation = Relocation { target: "g_x".into(), ..relocation };
        assert!(would_patch(&relocation, "GetX"));
        assert!(!would_patch(&relocation, "$pdata$GetX"));
    }
}
