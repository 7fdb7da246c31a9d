//! Build metadata of the module's translation units.
//!
//! Unlike the symbol tables, the compiland table is mutable: modification times advance as
//! files change, and the `was_recompiled` flag tracks units compiled but not yet linked.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::utils::{has_option, unique_id};

/// One translation unit.
#[derive(Debug, Clone)]
pub struct Compiland {
    pub source_path: PathBuf,
    pub obj_path: PathBuf,
    pub pdb_path: PathBuf,
    pub compiler_path: PathBuf,
    pub command_line: String,
    pub working_directory: PathBuf,
    /// Object path of the amalgamated unit this file is a part of.
    pub amalgamation: Option<PathBuf>,
    pub unique_id: u32,
    pub was_recompiled: bool,
}

impl Compiland {
    pub fn new(source_path: impl Into<PathBuf>, obj_path: impl Into<PathBuf>) -> Self {
        let obj_path = obj_path.into();
        Self {
            source_path: source_path.into(),
            pdb_path: obj_path.with_extension("pdb"),
            unique_id: unique_id(&obj_path),
            obj_path,
            compiler_path: PathBuf::from("cl.exe"),
            command_line: String::new(),
            working_directory: PathBuf::new(),
            amalgamation: None,
            was_recompiled: false,
        }
    }

    pub fn creates_precompiled_header(&self) -> bool {
        has_option(&self.command_line, "Yc")
    }

    /// Debug information lives in the object file itself, no database is shared.
    pub fn has_embedded_debug_info(&self) -> bool {
        has_option(&self.command_line, "Z7")
    }

    pub fn uses_minimal_rebuild(&self) -> bool {
        has_option(&self.command_line, "Gm") && !has_option(&self.command_line, "Gm-")
    }
}

/// A unity file and the translation units it is made of.
#[derive(Debug, Clone, Default)]
pub struct Amalgamation {
    pub single_parts: Vec<PathBuf>,
    /// Set once the parts are compiled individually.
    pub is_split: bool,
}

/// A source or header file and the object files that depend on it.
#[derive(Debug, Clone, Default)]
pub struct Dependency {
    pub last_modification: Option<SystemTime>,
    pub objects: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct CompilandDb {
    pub compilands: HashMap<PathBuf, Compiland>,
    pub dependencies: HashMap<PathBuf, Dependency>,
    /// Amalgamations keyed by the object path of the unity file.
    pub amalgamations: HashMap<PathBuf, Amalgamation>,
    /// Symbol emitted by a precompiled header, and the unit that created it.
    pub pch_symbol_to_compiland: HashMap<String, PathBuf>,
}

impl CompilandDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a compiland along with a dependency on its own source file.
    pub fn add(&mut self, compiland: Compiland) {
        let dependency = self.dependencies.entry(compiland.source_path.clone()).or_default();
        if !dependency.objects.contains(&compiland.obj_path) {
            dependency.objects.push(compiland.obj_path.clone());
        }
        self.compilands.insert(compiland.obj_path.clone(), compiland);
    }

    pub fn add_dependency(&mut self, file: &Path, object: &Path, last_modification: Option<SystemTime>) {
        let dependency = self.dependencies.entry(file.to_path_buf()).or_default();
        dependency.last_modification = last_modification;
        if !dependency.objects.iter().any(|o| o == object) {
            dependency.objects.push(object.to_path_buf());
        }
    }

    pub fn get(&self, obj_path: &Path) -> Option<&Compiland> {
        self.compilands.get(obj_path)
    }

    pub fn contains(&self, obj_path: &Path) -> bool {
        self.compilands.contains_key(obj_path)
    }
}

/// How the module itself was linked.
#[derive(Debug, Clone, Default)]
pub struct LinkerDb {
    pub linker_path: PathBuf,
    pub pdb_path: PathBuf,
    pub command_line: String,
    pub working_directory: PathBuf,
    pub libraries: Vec<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_flags() {
        let mut compiland = Compiland::new("a.cpp", "a.obj");
        compiland.command_line = "/nologo /Z7 /Yc\"pch.h\"".into();
        assert!(compiland.creates_precompiled_header());
        assert!(compiland.has_embedded_debug_info());
        assert!(!compiland.uses_minimal_rebuild());

        compiland.command_line = "/Zi /Gm".into();
        assert!(compiland.uses_minimal_rebuild());
        assert!(!compiland.has_embedded_debug_info());
        assert_eq!(compiland.pdb_path, PathBuf::from("a.pdb"));
    }

    #[test]
    fn dependencies_track_objects() {
        let mut db = CompilandDb::new();
        db.add(Compiland::new("a.cpp", "a.obj"));
        db.add_dependency(Path::new("shared.h"), Path::new("a.obj"), None);
        db.add_dependency(Path::new("shared.h"), Path::new("b.obj"), None);
        db.add_dependency(Path::new("shared.h"), Path::new("a.obj"), None);

        assert_eq!(db.dependencies[Path::new("a.cpp")].objects, vec![PathBuf::from("a.obj")]);
        assert_eq!(db.dependencies[Path::new("shared.h")].objects.len(), 2);
        assert!(db.contains(Path::new("a.obj")));
    }
}
