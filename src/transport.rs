//! Command channel to the agent running inside a target process.
//!
//! Every command is acknowledged before the next one is sent.

use anyhow::{bail, Result};
use std::path::PathBuf;

/// Largest chunk of text sent in a single `LogOutput` command.
pub const LOG_CHUNK_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Loads an image; answered with `Reply::PatchLoaded`.
    LoadPatch { path: PathBuf },
    UnloadPatch { base: u64 },
    /// Brings every application thread to a halt at a safe point.
    EnterSyncPoint,
    LeaveSyncPoint,
    CallEntryPoint { base: u64, entry_rva: u32 },
    /// Calls every hook function pointer in `[first, last)`.
    CallHooks { first: u64, last: u64 },
    LogOutput { text: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ack,
    /// Base address of a loaded patch, `None` when loading failed.
    PatchLoaded { base: Option<u64> },
}

pub trait Transport: Send + Sync {
    fn send(&self, command: Command) -> Result<Reply>;
}

/// Sends a command that expects a plain acknowledgement.
pub fn send_acked(transport: &dyn Transport, command: Command) -> Result<()> {
    match transport.send(command.clone())? {
        Reply::Ack => Ok(()),
        other => bail!("unexpected reply {:?} to {:?}", other, command),
    }
}

/// Loads a patch and returns its base address.
pub fn load_patch(transport: &dyn Transport, path: PathBuf) -> Result<Option<u64>> {
    match transport.send(Command::LoadPatch { path })? {
        Reply::PatchLoaded { base } => Ok(base),
        other => bail!("unexpected reply {:?} to a load request", other),
    }
}

/// Forwards tool output, split into transport-sized chunks on character boundaries.
pub fn log_output(transport: &dyn Transport, text: &str) -> Result<()> {
    let mut rest = text;
    while !rest.is_empty() {
        let mut end = rest.len().min(LOG_CHUNK_SIZE);
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        send_acked(transport, Command::LogOutput { text: rest[..end].to_string() })?;
        rest = &rest[end..];
    }
    Ok(())
}
