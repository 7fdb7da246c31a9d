//! Symbol databases of a linked image.
//!
//! An image (the original module or a patch) is described by a handful of tables produced
//! by the symbol provider. They are gathered once per image and never change afterwards:
//! - `SymbolDb`: public and static symbols by name.
//! - `ContributionDb`: which object file produced which address range.
//! - `ThunkDb`: incremental-linking thunks that jump to a function.
//! - `ImageSectionDb`: named sections, used to locate hook tables.
//!
//! The name predicates at the bottom classify compiler-generated symbols that must never be
//! stripped, relocated or patched.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A symbol and its load-relative address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub rva: u32,
}

/// A compiler-generated pointer to a dynamic initializer in the CRT initializer table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicInitializer {
    /// Name of the initializer function the pointer refers to.
    pub name: String,
    /// Address of the pointer slot.
    pub rva: u32,
}

#[derive(Debug, Clone, Default)]
pub struct SymbolDb {
    symbols: HashMap<String, Symbol>,
    pub dynamic_initializers: Vec<DynamicInitializer>,
    /// Functions linked in from static libraries.
    pub library_functions: Vec<String>,
}

impl SymbolDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, rva: u32) {
        let name = name.into();
        self.symbols.insert(name.clone(), Symbol { name, rva });
    }

    pub fn find(&self, name: &str) -> Option<&Symbol> {
        self.symbols.get(name)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.values()
    }
}

/// The object file that produced an address range of the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contribution {
    pub rva: u32,
    pub size: u32,
    object: usize,
}

/// Contributions sorted by address.
#[derive(Debug, Clone, Default)]
pub struct ContributionDb {
    contributions: Vec<Contribution>,
    objects: Vec<PathBuf>,
    object_index: HashMap<PathBuf, usize>,
}

impl ContributionDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, object: &Path, rva: u32, size: u32) {
        let object = match self.object_index.get(object) {
            Some(&index) => index,
            None => {
                self.objects.push(object.to_path_buf());
                self.object_index.insert(object.to_path_buf(), self.objects.len() - 1);
                self.objects.len() - 1
            }
        };
        let position = self.contributions.partition_point(|c| c.rva < rva);
        self.contributions.insert(position, Contribution { rva, size, object });
    }

    /// Finds the contribution that covers `rva`.
    pub fn find(&self, rva: u32) -> Option<&Contribution> {
        let position = self.contributions.partition_point(|c| c.rva <= rva);
        let candidate = self.contributions.get(position.checked_sub(1)?)?;
        (rva < candidate.rva + candidate.size.max(1)).then_some(candidate)
    }

    pub fn object(&self, contribution: &Contribution) -> &Path {
        &self.objects[contribution.object]
    }

    /// Object file that produced the byte at `rva`, if any.
    pub fn object_at(&self, rva: u32) -> Option<&Path> {
        self.find(rva).map(|c| self.object(c))
    }
}

/// Incremental-linking thunks, keyed by the address of the function they jump to.
#[derive(Debug, Clone, Default)]
pub struct ThunkDb {
    thunks: HashMap<u32, Vec<u32>>,
}

impl ThunkDb {
    pub fn add(&mut self, target_rva: u32, thunk_rva: u32) {
        self.thunks.entry(target_rva).or_default().push(thunk_rva);
    }

    pub fn thunks_to(&self, target_rva: u32) -> &[u32] {
        self.thunks.get(&target_rva).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSection {
    pub name: String,
    pub rva: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ImageSectionDb {
    pub sections: Vec<ImageSection>,
}

impl ImageSectionDb {
    pub fn find(&self, name: &str) -> Option<&ImageSection> {
        self.sections.iter().find(|s| s.name == name)
    }
}

/// Name under which a static (file-local) symbol is known across images.
///
/// Two translation units may both define `static int s_count`; tagging the name with the
/// unit's id keeps them apart.
pub fn disambiguate_local(name: &str, unique_id: u32) -> String {
    format!("{name}@{unique_id:08x}")
}

pub fn is_string_literal(name: &str) -> bool {
    name.starts_with("??_C@") || name.starts_with("$SG")
}

pub fn is_floating_point_constant(name: &str) -> bool {
    name.starts_with("__real@") || name.starts_with("__xmm@") || name.starts_with("__ymm@")
}

pub fn is_precompiled_header_symbol(name: &str) -> bool {
    name.starts_with("__@@_PchSym_")
}

pub fn is_rtti_object_locator(name: &str) -> bool {
    name.starts_with("??_R4")
}

pub fn is_dynamic_initializer(name: &str) -> bool {
    name.starts_with("??__E") || name.starts_with("??__F") || name.contains("$initializer$")
}

pub fn is_exception_related(name: &str) -> bool {
    const PREFIXES: &[&str] = &[
        "$unwind$", "$pdata$", "$chain$", "$ip2state$", "$cppxdata$", "$stateUnwindMap$",
        "$tryMap$", "$handlerMap$", "$xdatasym", "__catch$", "__unwindfunclet$",
        "__CxxFrameHandler", "__C_specific_handler", "__GSHandlerCheck", "_CxxThrowException",
        "__std_terminate", "_TI", "_CTA", "_CT??",
    ];
    PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

pub fn is_runtime_check_related(name: &str) -> bool {
    name.starts_with("_RTC_") || name.starts_with("__RTC_")
}

pub fn is_sdl_check_related(name: &str) -> bool {
    matches!(
        name,
        "__security_check_cookie" | "__CheckForDebuggerJustMyCode" | "__report_rangecheckfailure"
    ) || name.starts_with("__sdl_")
}

/// Symbols whose identity is owned by the compiler rather than by user code.
pub fn is_compiler_generated(name: &str) -> bool {
    is_string_literal(name)
        || is_floating_point_constant(name)
        || is_precompiled_header_symbol(name)
        || is_rtti_object_locator(name)
        || is_dynamic_initializer(name)
        || is_exception_related(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contribution_lookup() {
        let mut db = ContributionDb::new();
        db.add(Path::new("b.obj"), 0x2000, 0x10);
        db.add(Path::new("a.obj"), 0x1000, 0x20);
        db.add(Path::new("a.obj"), 0x3000, 0x8);

        assert_eq!(db.object_at(0x1000), Some(Path::new("a.obj")));
        assert_eq!(db.object_at(0x101f), Some(Path::new("a.obj")));
        assert_eq!(db.object_at(0x1020), None);
        assert_eq!(db.object_at(0x2004), Some(Path::new("b.obj")));
        assert_eq!(db.object_at(0x3004), Some(Path::new("a.obj")));
        assert_eq!(db.object_at(0x0fff), None);
        assert_eq!(db.find(0x2000).map(|c| c.size), Some(0x10));
    }

    #[test]
    fn compiler_generated_names() {
        assert!(is_compiler_generated("??_C@_05ABCDEF@hello@"));
        assert!(is_compiler_generated("__real@3ff0000000000000"));
        assert!(is_compiler_generated("$unwind$GetX"));
        assert!(is_compiler_generated("??__Eg_object@@YAXXZ"));
        assert!(is_compiler_generated("__@@_PchSym_@00@UxlwvUkxs@"));
        assert!(!is_compiler_generated("g_x"));
        assert!(!is_compiler_generated("?GetX@@YAHXZ"));
        assert!(is_runtime_check_related("_RTC_CheckStackVars"));
        assert!(is_sdl_check_related("__CheckForDebuggerJustMyCode"));
    }

    #[test]
    fn thunks() {
        let mut db = ThunkDb::default();
        db.add(0x1010, 0x5);
        db.add(0x1010, 0xa);
        assert_eq!(db.thunks_to(0x1010), &[0x5, 0xa]);
        assert!(db.thunks_to(0x2000).is_empty());
        assert_eq!(disambiguate_local("s_count", 0xab), "s_count@000000ab");
    }
}
