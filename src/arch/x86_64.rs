//! x86_64 Architecture backend.
//!
//! Implements the `Architecture` trait for 64-bit x86. Instruction lengths come from `iced-x86`.

use super::Architecture;
use anyhow::{anyhow, bail, Result};
use iced_x86::{Decoder, DecoderOptions};
use tracing::trace;

use crate::object_file::RelocationType;

/// `jmp rel32`
const JMP_REL32: u8 = 0xe9;
/// `jmp rel8` back over the five bytes preceding the instruction.
const JMP_TO_PADDING: [u8; 2] = [0xeb, 0xf9];
const INT3: u8 = 0xcc;
const NOP: u8 = 0x90;
/// `mov eax, 1; ret`
const RETURN_TRUE: [u8; 6] = [0xb8, 0x01, 0x00, 0x00, 0x00, 0xc3];

/// The x86_64 architecture backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct X86_64;

fn displacement(p: u64, s: u64, a: i64) -> Result<i32> {
    let value = (s as i64).wrapping_add(a).wrapping_sub(p as i64);
    i32::try_from(value).map_err(|_| {
        anyhow!(
            "Relocation overflow at VA 0x{:x}: displacement 0x{:x} exceeds 32-bit signed range. \
             Target (S) is 0x{:x}. Ensure the patch is within 2GB of the module.",
            p,
            value,
            s
        )
    })
}

impl Architecture for X86_64 {
    fn jump_size(&self) -> usize {
        5
    }

    fn encode_jump(&self, from: u64, to: u64) -> Result<Vec<u8>> {
        let rel = displacement(from + 5, to, 0)?;
        let mut code = Vec::with_capacity(5);
        code.push(JMP_REL32);
        code.extend_from_slice(&rel.to_le_bytes());
        Ok(code)
    }

    fn jump_to_preceding_padding(&self) -> &'static [u8] {
        &JMP_TO_PADDING
    }

    fn trap_byte(&self) -> u8 {
        INT3
    }

    fn is_padding(&self, byte: u8) -> bool {
        byte == INT3 || byte == NOP
    }

    fn return_success_stub(&self) -> &'static [u8] {
        &RETURN_TRUE
    }

    fn covered_instruction_bytes(&self, code: &[u8], ip: u64, min_len: usize) -> Result<usize> {
        let mut decoder = Decoder::with_ip(64, code, ip, DecoderOptions::NONE);
        let mut covered = 0;
        while covered < min_len {
            if !decoder.can_decode() {
                bail!("ran out of code at 0x{:x} after {} bytes", ip + covered as u64, covered);
            }
            let instruction = decoder.decode();
            if instruction.is_invalid() {
                bail!("invalid instruction at 0x{:x}", instruction.ip());
            }
            covered += instruction.len();
        }
        Ok(covered)
    }

    fn apply_relocation(&self, kind: RelocationType, p: u64, s: u64, a: i64, image_base: u64, field: &mut [u8]) -> Result<()> {
        let target = (s as i64).wrapping_add(a) as u64;
        let bytes: Vec<u8> = match kind {
            // REL32_n: S + A - (P + 4 + n)
            RelocationType::Relative { extra } => displacement(p + 4 + extra as u64, s, a)?.to_le_bytes().to_vec(),
            // ADDR32: S + A
            RelocationType::NarrowVa => u32::try_from(target)
                .map_err(|_| anyhow!("address 0x{:x} does not fit a 32-bit field at VA 0x{:x}", target, p))?
                .to_le_bytes()
                .to_vec(),
            // ADDR32NB: S + A - ImageBase
            RelocationType::NarrowRva => u32::try_from(target.wrapping_sub(image_base))
                .map_err(|_| anyhow!("RVA of 0x{:x} does not fit a 32-bit field at VA 0x{:x}", target, p))?
                .to_le_bytes()
                .to_vec(),
            // ADDR64: S + A
            RelocationType::WideVa => target.to_le_bytes().to_vec(),
            RelocationType::SectionRelative | RelocationType::Unknown(_) => {
                trace!("Unsupported relocation kind: {:?}", kind);
                return Ok(());
            }
        };
        if field.len() != bytes.len() {
            bail!("relocation field at VA 0x{:x} is {} bytes, expected {}", p, field.len(), bytes.len());
        }
        field.copy_from_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::Mnemonic;

    #[test]
    fn jumps() {
        let arch = X86_64;
        let code = arch.encode_jump(0x1000, 0x2000).unwrap();
        let mut decoder = Decoder::with_ip(64, &code, 0x1000, DecoderOptions::NONE);
        let jump = decoder.decode();
        assert_eq!(jump.mnemonic(), Mnemonic::Jmp);
        assert_eq!(jump.near_branch_target(), 0x2000);
        assert!(arch.encode_jump(0x1000, 0x1_0000_2000).is_err());

        let mut decoder = Decoder::with_ip(64, arch.jump_to_preceding_padding(), 0x1005, DecoderOptions::NONE);
        assert_eq!(decoder.decode().near_branch_target(), 0x1000);
    }

    #[test]
    fn instruction_coverage() {
        let arch = X86_64;
        // push rbx; sub rsp, 0x20; mov eax, [rip+0]
        let code = [0x40, 0x53, 0x48, 0x83, 0xec, 0x20, 0x8b, 0x05, 0, 0, 0, 0];
        assert_eq!(arch.covered_instruction_bytes(&code, 0x1000, 5).unwrap(), 6);
        assert_eq!(arch.covered_instruction_bytes(&code, 0x1000, 1).unwrap(), 2);
        assert!(arch.covered_instruction_bytes(&code[..3], 0x1000, 5).is_err());
    }

    #[test]
    fn relocations() {
        let arch = X86_64;
        let mut field = [0u8; 4];
        arch.apply_relocation(RelocationType::Relative { extra: 0 }, 0x1002, 0x2000, 0, 0, &mut field).unwrap();
        assert_eq!(i32::from_le_bytes(field), 0x2000 - 0x1006);

        arch.apply_relocation(RelocationType::Relative { extra: 1 }, 0x1002, 0x2000, 8, 0, &mut field).unwrap();
        assert_eq!(i32::from_le_bytes(field), 0x2008 - 0x1007);

        arch.apply_relocation(RelocationType::NarrowRva, 0, 0x1_8000_2000, 0, 0x1_8000_0000, &mut field).unwrap();
        assert_eq!(u32::from_le_bytes(field), 0x2000);

        let mut wide = [0u8; 8];
        arch.apply_relocation(RelocationType::WideVa, 0, 0x1_8000_2000, 4, 0, &mut wide).unwrap();
        assert_eq!(u64::from_le_bytes(wide), 0x1_8000_2004);

        assert!(arch
            .apply_relocation(RelocationType::Relative { extra: 0 }, 0x1000, 0x2_0000_0000, 0, 0, &mut field)
            .is_err());
    }
}
