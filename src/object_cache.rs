//! Session-wide cache of parsed object files.
//!
//! Entries are keyed by the object path and live as long as the session. A table is only
//! replaced when its object file is recompiled.

use anyhow::Result;
use parking_lot::RwLock;
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::object_file::ObjectDb;

#[derive(Default)]
pub struct ObjectCache {
    entries: RwLock<HashMap<PathBuf, Arc<ObjectDb>>>,
}

impl ObjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &Path) -> Option<Arc<ObjectDb>> {
        self.entries.read().get(path).cloned()
    }

    /// Returns the cached table, parsing the file on first use.
    pub fn load(&self, path: &Path) -> Result<Arc<ObjectDb>> {
        if let Some(db) = self.get(path) {
            return Ok(db);
        }
        let db = Arc::new(ObjectDb::load(path)?);
        // Another thread may have won the race; keep the first table.
        Ok(self.entries.write().entry(path.to_path_buf()).or_insert(db).clone())
    }

    /// Parses the file again and replaces the cached table.
    pub fn reload(&self, path: &Path) -> Result<Arc<ObjectDb>> {
        let db = Arc::new(ObjectDb::load(path)?);
        self.entries.write().insert(path.to_path_buf(), db.clone());
        Ok(db)
    }

    /// Loads many files at once; files not cached yet are parsed in parallel.
    pub fn load_all(&self, paths: &[PathBuf]) -> Vec<(PathBuf, Result<Arc<ObjectDb>>)> {
        let missing = paths.iter().filter(|p| self.get(p).is_none()).count();
        debug!("Loading {} object files ({} not cached)", paths.len(), missing);
        paths.par_iter().map(|path| (path.clone(), self.load(path))).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ObjectBuilder;

    fn write_object(dir: &Path, name: &str, function: &str) -> PathBuf {
        let mut builder = ObjectBuilder::new();
        let text = builder.text(&[0xc3]);
        builder.function(text, function, 0, 1);
        let path = dir.join(name);
        std::fs::write(&path, builder.build()).unwrap();
        path
    }

    #[test]
    fn loads_lazily_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_object(dir.path(), "a.obj", "First");
        let cache = ObjectCache::new();
        assert!(cache.get(&a).is_none());

        let first = cache.load(&a).unwrap();
        assert!(Arc::ptr_eq(&first, &cache.load(&a).unwrap()));
        assert!(first.symbol("First").is_some());

        write_object(dir.path(), "a.obj", "Second");
        assert!(cache.load(&a).unwrap().symbol("First").is_some());
        let reloaded = cache.reload(&a).unwrap();
        assert!(reloaded.symbol("Second").is_some());
        assert!(cache.get(&a).unwrap().symbol("Second").is_some());
    }

    #[test]
    fn loads_in_parallel_and_reports_failures() {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<_> = (0..8)
            .map(|i| write_object(dir.path(), &format!("{i}.obj"), &format!("F{i}")))
            .chain(std::iter::once(dir.path().join("missing.obj")))
            .collect();
        let cache = ObjectCache::new();
        let results = cache.load_all(&paths);

        assert_eq!(results.iter().filter(|(_, r)| r.is_ok()).count(), 8);
        assert!(results.last().unwrap().1.is_err());
        assert_eq!(cache.len(), 8);
    }
}
