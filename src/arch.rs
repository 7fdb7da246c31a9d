//! Architecture abstraction.
//!
//! This module defines the `Architecture` trait, which encapsulates the instruction-level
//! knowledge the patchers need: how relocated fields are computed, how jumps are encoded and
//! how long the instructions at the start of a function are. The patchers stay generic while a
//! backend supplies the encodings.

use anyhow::Result;

use crate::object_file::RelocationType;

pub mod x86_64;

/// A trait representing a target architecture.
pub trait Architecture: Send + Sync {
    /// Size of a jump that reaches anything within the relative displacement range.
    fn jump_size(&self) -> usize;

    /// Encodes a jump at `from` to `to`.
    fn encode_jump(&self, from: u64, to: u64) -> Result<Vec<u8>>;

    /// A two-byte jump from a function's start into the `jump_size` bytes before it.
    fn jump_to_preceding_padding(&self) -> &'static [u8];

    /// Filler for bytes that must never execute.
    fn trap_byte(&self) -> u8;

    /// Whether `byte` is a filler the compiler emits between functions.
    fn is_padding(&self, byte: u8) -> bool;

    /// Code that returns success immediately; replaces disabled entry points.
    fn return_success_stub(&self) -> &'static [u8];

    /// Decodes whole instructions from the start of `code` (located at `ip`) until at least
    /// `min_len` bytes are covered, and returns the number of bytes covered.
    fn covered_instruction_bytes(&self, code: &[u8], ip: u64, min_len: usize) -> Result<usize>;

    /// Computes a relocated field and writes it into `field`.
    ///
    /// # Arguments
    /// * `kind` - How the field is computed.
    /// * `p` - The runtime address of the field (P).
    /// * `s` - The runtime address of the destination symbol (S).
    /// * `a` - The addend (A).
    /// * `image_base` - Base of the image the field lives in, for image-relative fields.
    /// * `field` - The bytes to write, `kind.size()` long.
    fn apply_relocation(&self, kind: RelocationType, p: u64, s: u64, a: i64, image_base: u64, field: &mut [u8]) -> Result<()>;
}
