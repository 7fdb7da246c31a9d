//! Registry of every image loaded for a live module.
//!
//! Entry 0 is the original module, entry N the N-th patch. Each entry knows in which
//! processes it is mapped and where; only the load address differs between processes.
//! The registry is append-only and shared with concurrently running installs, hence the lock.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::process::ProcessId;
use crate::provider::ImageDatabases;

/// Identifies an entry of the module cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleToken(usize);

impl ModuleToken {
    pub const ORIGINAL: ModuleToken = ModuleToken(0);

    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessData {
    pub pid: ProcessId,
    pub base: u64,
}

struct Entry {
    path: PathBuf,
    databases: Arc<ImageDatabases>,
    image_size: u32,
    processes: Vec<ProcessData>,
}

#[derive(Clone)]
pub struct FoundSymbol {
    pub token: ModuleToken,
    pub rva: u32,
    pub databases: Arc<ImageDatabases>,
    pub image_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundHooks {
    pub token: ModuleToken,
    pub first_rva: u32,
    pub last_rva: u32,
    pub processes: Vec<ProcessData>,
}

#[derive(Default)]
pub struct ModuleCache {
    entries: Mutex<Vec<Entry>>,
}

impl ModuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: &Path, databases: Arc<ImageDatabases>, image_size: u32) -> ModuleToken {
        let mut entries = self.entries.lock();
        entries.push(Entry { path: path.to_path_buf(), databases, image_size, processes: Vec::new() });
        debug!("Module cache entry {} is {}", entries.len() - 1, path.display());
        ModuleToken(entries.len() - 1)
    }

    pub fn register_process(&self, token: ModuleToken, pid: ProcessId, base: u64) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(token.0) {
            entry.processes.retain(|p| p.pid != pid);
            entry.processes.push(ProcessData { pid, base });
        }
    }

    /// Forgets where one image is mapped in process `pid`.
    pub fn forget_process(&self, token: ModuleToken, pid: ProcessId) {
        if let Some(entry) = self.entries.lock().get_mut(token.0) {
            entry.processes.retain(|p| p.pid != pid);
        }
    }

    /// Drops the newest entry, for a patch that never became active. Older entries stay.
    pub fn discard(&self, token: ModuleToken) -> bool {
        let mut entries = self.entries.lock();
        if token.0 == 0 || token.0 + 1 != entries.len() {
            return false;
        }
        if let Some(entry) = entries.pop() {
            debug!("Discarded module cache entry {} ({})", token.0, entry.path.display());
        }
        true
    }

    pub fn unregister_process(&self, pid: ProcessId) {
        for entry in self.entries.lock().iter_mut() {
            entry.processes.retain(|p| p.pid != pid);
        }
    }

    /// Finds the newest image defining `name`, skipping `exclude`.
    pub fn find_symbol(&self, exclude: Option<ModuleToken>, name: &str) -> Option<FoundSymbol> {
        let entries = self.entries.lock();
        entries.iter().enumerate().rev().find_map(|(index, entry)| {
            if Some(ModuleToken(index)) == exclude {
                return None;
            }
            entry.databases.symbols.find(name).map(|symbol| FoundSymbol {
                token: ModuleToken(index),
                rva: symbol.rva,
                databases: entry.databases.clone(),
                image_size: entry.image_size,
            })
        })
    }

    pub fn contains_symbol(&self, name: &str) -> bool {
        self.find_symbol(None, name).is_some()
    }

    /// Finds the newest image carrying a non-empty hook section, skipping `exclude`.
    pub fn find_hooks_in_section_backwards(&self, exclude: Option<ModuleToken>, section: &str) -> Option<FoundHooks> {
        let entries = self.entries.lock();
        entries.iter().enumerate().rev().find_map(|(index, entry)| {
            if Some(ModuleToken(index)) == exclude {
                return None;
            }
            let found = entry.databases.image_sections.find(section).filter(|s| s.size > 0)?;
            Some(FoundHooks {
                token: ModuleToken(index),
                first_rva: found.rva,
                last_rva: found.rva + found.size,
                processes: entry.processes.clone(),
            })
        })
    }

    /// Base address of every entry in process `pid`, indexed by token.
    pub fn gather_module_bases(&self, pid: ProcessId) -> Vec<Option<u64>> {
        self.entries
            .lock()
            .iter()
            .map(|entry| entry.processes.iter().find(|p| p.pid == pid).map(|p| p.base))
            .collect()
    }

    pub fn databases(&self, token: ModuleToken) -> Option<Arc<ImageDatabases>> {
        self.entries.lock().get(token.0).map(|e| e.databases.clone())
    }

    pub fn image_size(&self, token: ModuleToken) -> Option<u32> {
        self.entries.lock().get(token.0).map(|e| e.image_size)
    }

    pub fn path(&self, token: ModuleToken) -> Option<PathBuf> {
        self.entries.lock().get(token.0).map(|e| e.path.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::ImageSection;

    fn image(symbols: &[(&str, u32)], hooks: Option<(u32, u32)>) -> Arc<ImageDatabases> {
        let mut databases = ImageDatabases::default();
        for (name, rva) in symbols {
            databases.symbols.insert(*name, *rva);
        }
        if let Some((rva, size)) = hooks {
            databases.image_sections.sections.push(ImageSection { name: ".hl_pre".into(), rva, size });
        }
        Arc::new(databases)
    }

    #[test]
    fn symbol_lookup_walks_newest_first() {
        let cache = ModuleCache::new();
        let original = cache.insert(Path::new("app.dll"), image(&[("GetX", 0x1010), ("g_x", 0x2000)], None), 0x3000);
        let patch = cache.insert(Path::new("app.patch_0.dll"), image(&[("GetX", 0x1020)], None), 0x3000);
        assert_eq!(original, ModuleToken::ORIGINAL);

        let found = cache.find_symbol(None, "GetX").unwrap();
        assert_eq!((found.token, found.rva), (patch, 0x1020));
        let found = cache.find_symbol(Some(patch), "GetX").unwrap();
        assert_eq!((found.token, found.rva), (original, 0x1010));
        assert_eq!(cache.find_symbol(Some(patch), "g_x").unwrap().token, original);
        assert!(cache.find_symbol(None, "missing").is_none());
        assert!(cache.contains_symbol("g_x"));
    }

    #[test]
    fn hooks_and_bases() {
        let cache = ModuleCache::new();
        let original = cache.insert(Path::new("app.dll"), image(&[], Some((0x4000, 0x10))), 0x5000);
        let patch = cache.insert(Path::new("p.dll"), image(&[], Some((0x3000, 0))), 0x4000);
        cache.register_process(original, 10, 0x1_4000_0000);
        cache.register_process(original, 11, 0x1_5000_0000);
        cache.register_process(patch, 10, 0x1_4001_0000);

        let hooks = cache.find_hooks_in_section_backwards(None, ".hl_pre").unwrap();
        assert_eq!(hooks.token, original);
        assert_eq!((hooks.first_rva, hooks.last_rva), (0x4000, 0x4010));
        assert_eq!(hooks.processes.len(), 2);
        assert!(cache.find_hooks_in_section_backwards(Some(original), ".hl_pre").is_none());

        assert_eq!(cache.gather_module_bases(10), vec![Some(0x1_4000_0000), Some(0x1_4001_0000)]);
        assert_eq!(cache.gather_module_bases(11), vec![Some(0x1_5000_0000), None]);
        cache.unregister_process(10);
        assert_eq!(cache.gather_module_bases(10), vec![None, None]);
    }

    #[test]
    fn only_the_newest_patch_can_be_discarded() {
        let cache = ModuleCache::new();
        let original = cache.insert(Path::new("app.dll"), image(&[("GetX", 0x1010)], None), 0x3000);
        let first = cache.insert(Path::new("app.patch_0.dll"), image(&[("GetX", 0x1000)], None), 0x2000);
        let second = cache.insert(Path::new("app.patch_1.dll"), image(&[("GetX", 0x1000)], None), 0x2000);
        cache.register_process(second, 10, 0x1_4002_0000);
        cache.register_process(first, 10, 0x1_4001_0000);

        assert!(!cache.discard(original));
        assert!(!cache.discard(first));
        assert!(cache.discard(second));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.find_symbol(None, "GetX").unwrap().token, first);

        cache.forget_process(first, 10);
        assert_eq!(cache.gather_module_bases(10), vec![None, None]);
    }
}
