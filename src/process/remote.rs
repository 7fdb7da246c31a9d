//! Typed access to an image mapped into a target process.
//!
//! All address arithmetic on remote memory goes through here: callers speak in
//! load-relative addresses, and every access is checked against the image size in debug builds.

use anyhow::{Context, Result};

use super::Process;

#[derive(Clone, Copy)]
pub struct RemoteImage<'a> {
    process: &'a dyn Process,
    base: u64,
    size: u32,
}

impl<'a> RemoteImage<'a> {
    pub fn new(process: &'a dyn Process, base: u64, size: u32) -> Self {
        Self { process, base, size }
    }

    pub fn process(&self) -> &'a dyn Process {
        self.process
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn address(&self, rva: u32) -> u64 {
        debug_assert!(rva < self.size, "RVA 0x{:x} outside of image of size 0x{:x}", rva, self.size);
        self.base + rva as u64
    }

    fn check(&self, rva: u32, len: usize) {
        debug_assert!(
            rva as u64 + len as u64 <= self.size as u64,
            "access of {} bytes at RVA 0x{:x} outside of image of size 0x{:x}",
            len,
            rva,
            self.size
        );
    }

    pub fn read(&self, rva: u32, len: usize) -> Result<Vec<u8>> {
        self.check(rva, len);
        let mut buffer = vec![0; len];
        self.process
            .read_memory(self.address(rva), &mut buffer)
            .with_context(|| format!("failed to read {} bytes at RVA 0x{:x}", len, rva))?;
        Ok(buffer)
    }

    /// Writes code or data and flushes the instruction cache for the range.
    pub fn write(&self, rva: u32, bytes: &[u8]) -> Result<()> {
        self.check(rva, bytes.len());
        let address = self.address(rva);
        self.process
            .write_memory(address, bytes)
            .with_context(|| format!("failed to write {} bytes at RVA 0x{:x}", bytes.len(), rva))?;
        self.process.flush_instruction_cache(address, bytes.len())
    }

    pub fn read_u64(&self, rva: u32) -> Result<u64> {
        let bytes = self.read(rva, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn write_u64(&self, rva: u32, value: u64) -> Result<()> {
        self.write(rva, &value.to_le_bytes())
    }
}
