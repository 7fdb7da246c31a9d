//! Process primitives.
//!
//! The engine never talks to the operating system directly: everything it needs from a
//! target process goes through the `Process` trait. On top of it this module provides
//! scoped suspension and the search for free address ranges near a module.

use anyhow::Result;
use tracing::error;

use crate::utils::{align_down, align_up};

pub mod code_cave;
pub mod remote;
pub mod simulated;

pub use code_cave::CodeCave;
pub use remote::RemoteImage;
pub use simulated::SimulatedProcess;

pub type ProcessId = u32;
pub type ThreadId = u32;

/// Granularity at which images can be placed.
pub const ALLOCATION_GRANULARITY: u64 = 0x1_0000;

/// Largest distance a 32-bit displacement can bridge.
pub const RELATIVE_RANGE: u64 = 0x8000_0000;

/// Lowest scheduling priority a thread can be given.
pub const LOWEST_PRIORITY: i32 = -15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadContext {
    pub ip: u64,
}

/// A running target process.
pub trait Process: Send + Sync {
    fn id(&self) -> ProcessId;

    /// Suspends every thread. Calls nest.
    fn suspend(&self) -> Result<()>;
    fn resume(&self) -> Result<()>;

    fn read_memory(&self, address: u64, buffer: &mut [u8]) -> Result<()>;
    fn write_memory(&self, address: u64, bytes: &[u8]) -> Result<()>;
    fn flush_instruction_cache(&self, address: u64, len: usize) -> Result<()>;

    fn threads(&self) -> Result<Vec<ThreadId>>;
    fn thread_context(&self, thread: ThreadId) -> Result<ThreadContext>;
    fn set_thread_context(&self, thread: ThreadId, context: ThreadContext) -> Result<()>;
    fn thread_priority(&self, thread: ThreadId) -> Result<i32>;
    fn set_thread_priority(&self, thread: ThreadId, priority: i32) -> Result<()>;

    /// Allocates executable memory anywhere in the address space.
    fn allocate(&self, size: usize) -> Result<u64>;
    fn free(&self, address: u64) -> Result<()>;

    /// Whether `[address, address + size)` is not reserved by anything.
    fn is_range_free(&self, address: u64, size: u64) -> Result<bool>;
}

/// Keeps a process suspended for as long as it lives.
pub struct Suspended<'a> {
    process: &'a dyn Process,
}

impl<'a> Suspended<'a> {
    pub fn new(process: &'a dyn Process) -> Result<Self> {
        process.suspend()?;
        Ok(Self { process })
    }

    /// Instruction pointers of all threads.
    pub fn thread_ips(&self) -> Result<Vec<u64>> {
        self.process
            .threads()?
            .into_iter()
            .map(|thread| Ok(self.process.thread_context(thread)?.ip))
            .collect()
    }
}

impl Drop for Suspended<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.process.resume() {
            error!("Failed to resume process {}: {:#}", self.process.id(), e);
        }
    }
}

/// Finds a free range of `size` bytes whose every byte lies within 32-bit displacement
/// reach of the module at `[module_base, module_base + module_size)`.
///
/// Addresses above the module are preferred.
pub fn find_free_region_near(
    process: &dyn Process,
    module_base: u64,
    module_size: u64,
    size: u64,
) -> Result<Option<u64>> {
    let module_end = module_base + module_size;
    let highest = (module_base + RELATIVE_RANGE).saturating_sub(size);
    let lowest = module_end.saturating_sub(RELATIVE_RANGE);

    let mut candidate = align_up(module_end, ALLOCATION_GRANULARITY);
    while candidate <= highest {
        if process.is_range_free(candidate, size)? {
            return Ok(Some(candidate));
        }
        candidate += ALLOCATION_GRANULARITY;
    }

    let mut candidate = align_down(module_base.saturating_sub(size), ALLOCATION_GRANULARITY);
    while candidate >= lowest && candidate >= ALLOCATION_GRANULARITY {
        if process.is_range_free(candidate, size)? {
            return Ok(Some(candidate));
        }
        candidate -= ALLOCATION_GRANULARITY;
    }
    Ok(None)
}

/// Whether a relative displacement from anywhere in one range can reach anywhere in the other.
pub fn is_within_relative_reach(module_base: u64, module_size: u64, patch_base: u64, patch_size: u64) -> bool {
    let low = module_base.min(patch_base);
    let high = (module_base + module_size).max(patch_base + patch_size);
    high - low < RELATIVE_RANGE
}
