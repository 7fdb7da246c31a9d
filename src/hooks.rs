//! User hooks.
//!
//! Applications register callbacks by placing function pointers into dedicated sections of
//! their image. The most recent image carrying a non-empty section wins.

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use crate::live_process::LiveProcess;
use crate::module_cache::{FoundHooks, ModuleCache, ModuleToken};
use crate::transport::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    PrePatch,
    PostPatch,
    CompileStart,
    CompileSuccess,
    CompileError,
}

impl HookKind {
    pub fn section(self) -> &'static str {
        match self {
            HookKind::PrePatch => ".hl_pre",
            HookKind::PostPatch => ".hl_post",
            HookKind::CompileStart => ".hl_cst",
            HookKind::CompileSuccess => ".hl_csu",
            HookKind::CompileError => ".hl_cer",
        }
    }
}

/// Hooks found for a patch, kept for replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookRecord {
    pub image: ModuleToken,
    pub first_rva: u32,
    pub last_rva: u32,
}

impl From<&FoundHooks> for HookRecord {
    fn from(found: &FoundHooks) -> Self {
        Self { image: found.token, first_rva: found.first_rva, last_rva: found.last_rva }
    }
}

/// Calls the hooks of one image in a single process.
pub fn call_in(process: &LiveProcess, base: u64, record: &HookRecord) -> Result<()> {
    process.send(Command::CallHooks { first: base + record.first_rva as u64, last: base + record.last_rva as u64 })
}

/// Finds the newest hooks of `kind` and calls them in every process the image is loaded into.
pub fn call(
    cache: &ModuleCache,
    processes: &[Arc<LiveProcess>],
    kind: HookKind,
    exclude: Option<ModuleToken>,
) -> Result<Option<HookRecord>> {
    let Some(found) = cache.find_hooks_in_section_backwards(exclude, kind.section()) else {
        return Ok(None);
    };
    let record = HookRecord::from(&found);
    for data in &found.processes {
        if let Some(process) = processes.iter().find(|p| p.id() == data.pid) {
            info!("Calling {:?} hooks (PID: {})", kind, data.pid);
            call_in(process, data.base, &record)?;
        }
    }
    Ok(Some(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::SimulatedProcess;
    use crate::provider::ImageDatabases;
    use crate::symbol::ImageSection;
    use crate::testing::RecordingTransport;
    use std::path::Path;

    #[test]
    fn newest_hooks_are_called() {
        let cache = ModuleCache::new();
        let mut original = ImageDatabases::default();
        original.image_sections.sections.push(ImageSection { name: ".hl_post".into(), rva: 0x4000, size: 0x10 });
        let mut patch = ImageDatabases::default();
        patch.image_sections.sections.push(ImageSection { name: ".hl_post".into(), rva: 0x3000, size: 0x8 });
        let token = cache.insert(Path::new("app.dll"), Arc::new(original), 0x5000);
        let patch_token = cache.insert(Path::new("p.dll"), Arc::new(patch), 0x4000);
        cache.register_process(token, 9, 0x1_4000_0000);
        cache.register_process(patch_token, 9, 0x1_4001_0000);

        let process = Arc::new(SimulatedProcess::new(9));
        let transport = Arc::new(RecordingTransport::default());
        let live = Arc::new(LiveProcess::new(process, transport.clone(), None, 0x1_4000_0000));

        let record = call(&cache, &[live.clone()], HookKind::PostPatch, None).unwrap().unwrap();
        assert_eq!(record, HookRecord { image: patch_token, first_rva: 0x3000, last_rva: 0x3008 });
        let record = call(&cache, &[live], HookKind::PostPatch, Some(patch_token)).unwrap().unwrap();
        assert_eq!(record.image, token);
        assert_eq!(
            transport.commands(),
            vec![
                Command::CallHooks { first: 0x1_4001_3000, last: 0x1_4001_3008 },
                Command::CallHooks { first: 0x1_4000_4000, last: 0x1_4000_4010 },
            ]
        );
        assert!(call(&cache, &[], HookKind::PrePatch, None).unwrap().is_none());
    }
}
