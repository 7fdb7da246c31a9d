//! Live patching of native x86_64 PE/COFF modules.
//!
//! A module loaded into one or more running processes is kept in sync with its source code:
//! changed translation units are recompiled, linked into a small patch image next to the
//! module and the old functions are redirected to the new ones, without restarting anything.
//!
//! The crate is organized into several modules:
//! - `live_module`: The patch cycle orchestration.
//! - `object_file`, `object_cache`, `writer`: Reading and rewriting COFF object files.
//! - `image`: PE image files (entry point, relocation, rebasing).
//! - `provider`, `symbol`, `compiland`, `module_cache`: Tables describing loaded images.
//! - `relocation`, `function`, `entry_point`, `hooks`, `patch`: Individual patch edits.
//! - `process`, `live_process`, `transport`: Access to the patched processes.
//! - `toolchain`: Running the compiler and the linker.
//! - `arch`: Architecture-specific encoding of jumps and relocations.

pub mod arch;
pub mod compiland;
pub mod config;
pub mod entry_point;
pub mod function;
pub mod hooks;
pub mod image;
pub mod live_module;
pub mod live_process;
pub mod module_cache;
pub mod object_cache;
pub mod object_file;
pub mod patch;
pub mod process;
pub mod provider;
pub mod relocation;
pub mod symbol;
pub mod toolchain;
pub mod transport;
pub mod utils;
pub mod writer;

#[cfg(test)]
mod testing;
