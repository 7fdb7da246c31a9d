//! Entry point control.
//!
//! A patch is linked like any other DLL, so loading it would run its initializers right away,
//! before any of its references to existing data are redirected. The entry point is therefore
//! replaced on disk with a stub returning success, and the original code is only put back for
//! the single, explicit call made once the data references are in place.

use anyhow::Result;
use tracing::{debug, info};

use crate::arch::Architecture;
use crate::image::Image;
use crate::live_process::LiveProcess;
use crate::process::{CodeCave, RemoteImage};
use crate::transport::Command;

/// The code an entry point started with before it was disabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedEntryPoint {
    pub rva: u32,
    pub original: Vec<u8>,
}

/// Replaces the entry point of an image file with the success stub.
///
/// Returns `None` for images without an entry point.
pub fn disable_in_image(image: &mut Image, arch: &dyn Architecture) -> Result<Option<SavedEntryPoint>> {
    let rva = image.entry_point_rva()?;
    if rva == 0 {
        return Ok(None);
    }
    let stub = arch.return_success_stub();
    let original = image.read(rva, stub.len())?.to_vec();
    image.write(rva, stub)?;
    debug!("Disabled entry point at RVA 0x{:x} of {}", rva, image.path().display());
    Ok(Some(SavedEntryPoint { rva, original }))
}

/// Makes a function of a loaded image return success without doing anything.
pub fn neuter(arch: &dyn Architecture, image: &RemoteImage, rva: u32) -> Result<()> {
    image.write(rva, arch.return_success_stub())
}

impl SavedEntryPoint {
    /// Runs the real entry point once: the code is restored, called through the transport and
    /// disabled again, also when the call fails. Every thread but the command thread stays
    /// parked in a code cave meanwhile.
    pub fn call_once(&self, arch: &dyn Architecture, process: &LiveProcess, patch: &RemoteImage) -> Result<()> {
        info!("Calling entry point of patch at 0x{:x} (PID: {})", patch.base(), process.id());
        let _cave = CodeCave::enter(process.process(), process.command_thread())?;
        patch.write(self.rva, &self.original)?;
        let called = process.send(Command::CallEntryPoint { base: patch.base(), entry_rva: self.rva });
        neuter(arch, patch, self.rva)?;
        called
    }
}
