//! Replay log of an installed patch.
//!
//! Everything done to the processes while a patch was installed, expressed in load-relative
//! terms so that it can be repeated verbatim in a process attached later.

use std::path::PathBuf;

use crate::entry_point::SavedEntryPoint;
use crate::function::{FunctionRecord, LibraryRecord};
use crate::hooks::HookRecord;
use crate::module_cache::ModuleToken;
use crate::relocation::RelocationRecord;

/// The security cookie of the patch is overwritten with the original module's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CookieRecord {
    pub original_rva: u32,
    pub patch_rva: u32,
}

#[derive(Debug, Clone)]
pub struct ModulePatch {
    /// The linked image, entry point already disabled.
    pub path: PathBuf,
    pub token: ModuleToken,
    pub image_size: u32,
    pub entry_point: Option<SavedEntryPoint>,
    pub pre_entry_relocations: Vec<RelocationRecord>,
    pub post_entry_relocations: Vec<RelocationRecord>,
    /// Initializer pointer slots zeroed because their objects already exist.
    pub neutered_initializers: Vec<u32>,
    pub cookie: Option<CookieRecord>,
    pub dll_main_rva: Option<u32>,
    pub functions: Vec<FunctionRecord>,
    pub library_functions: Vec<LibraryRecord>,
    pub pre_patch_hooks: Option<HookRecord>,
    pub post_patch_hooks: Option<HookRecord>,
}

impl ModulePatch {
    pub fn new(path: PathBuf, token: ModuleToken, image_size: u32, entry_point: Option<SavedEntryPoint>) -> Self {
        Self {
            path,
            token,
            image_size,
            entry_point,
            pre_entry_relocations: Vec::new(),
            post_entry_relocations: Vec::new(),
            neutered_initializers: Vec::new(),
            cookie: None,
            dll_main_rva: None,
            functions: Vec::new(),
            library_functions: Vec::new(),
            pre_patch_hooks: None,
            post_patch_hooks: None,
        }
    }

    /// Number of recorded edits.
    pub fn edit_count(&self) -> usize {
        self.pre_entry_relocations.len()
            + self.post_entry_relocations.len()
            + self.neutered_initializers.len()
            + self.functions.len()
            + self.library_functions.len()
            + usize::from(self.cookie.is_some())
            + usize::from(self.dll_main_rva.is_some())
    }
}
