//! x86 disassembler adapter backed by [iced_x86].

use super::{DecodedInst, Disassembler};
use crate::errors::DisasmError;
use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, IntelFormatter};

/// Decodes 16/32/64-bit x86 instruction streams.
pub struct X64Disasm {
    bitness: u32,
}

impl X64Disasm {
    pub fn new() -> Self {
        Self::with_bitness(64)
    }

    pub fn with_bitness(bitness: u32) -> Self {
        assert!(matches!(bitness, 16 | 32 | 64));
        X64Disasm { bitness }
    }
}

impl Default for X64Disasm {
    fn default() -> Self {
        Self::new()
    }
}

impl Disassembler for X64Disasm {
    fn decode_one(&self, bytes: &[u8], vaddr: u64) -> Result<DecodedInst, DisasmError> {
        let mut decoder = Decoder::with_ip(self.bitness, bytes, vaddr, DecoderOptions::NONE);
        if !decoder.can_decode() {
            return Err(DisasmError::Truncated { vaddr });
        }
        let mut inst = Instruction::default();
        decoder.decode_out(&mut inst);
        if inst.is_invalid() {
            return Err(DisasmError::BadEncoding {
                vaddr,
                msg: format!("{:?}", decoder.last_error()),
            });
        }
        let mut text = String::new();
        IntelFormatter::new().format(&inst, &mut text);
        Ok(DecodedInst::new(text, inst.len() as u8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_one_instruction_at_a_time() {
        let disasm = X64Disasm::new();
        // nop; mov rbp, rsp
        let bytes = [0x90, 0x48, 0x89, 0xe5];
        let first = disasm.decode_one(&bytes, 0x1000).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first.text(), "nop");
        let second = disasm.decode_one(&bytes[1..], 0x1001).unwrap();
        assert_eq!(second.len(), 3);
    }

    #[test]
    fn rejects_garbage() {
        let disasm = X64Disasm::new();
        // A lone operand-size prefix is not an instruction.
        assert!(disasm.decode_one(&[0x66], 0).is_err());
    }
}
