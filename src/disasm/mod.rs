//! Disassembly of raw translation-block bytes into decoded instructions.
//!
//! The broker core only depends on the [`Disassembler`] capability: given
//! bytes and a start address, decode one instruction and report its byte
//! size. Two adapters are provided, [`x64::X64Disasm`] (iced-x86) and
//! [`arm::ArmDisasm`] (yaxpeax), but anything implementing the trait works.
//!
//! Architectures with two instruction encodings selected by the low bit of
//! the program counter (ARM/Thumb interworking) are handled by pairing a
//! primary and a secondary decoder in a [`DisasmEngine`]; the engine also
//! masks the mode bit out of addresses before any address arithmetic.

pub mod arm;
pub mod x64;

use crate::errors::DisasmError;
use crate::tb::TranslationBlock;
use log::{debug, error};
use std::fmt;
use std::sync::Arc;

/// One decoded machine instruction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DecodedInst {
    text: Box<str>,
    len: u8,
}

impl DecodedInst {
    pub fn new(text: impl Into<Box<str>>, len: u8) -> Self {
        DecodedInst {
            text: text.into(),
            len,
        }
    }

    /// The instruction rendered in its decoder's assembly syntax.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Encoded byte length.
    pub fn len(&self) -> u8 {
        self.len
    }
}

impl fmt::Display for DecodedInst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// The capability the broker needs from a concrete disassembler.
pub trait Disassembler: Send {
    /// Decode a single instruction from the front of `bytes`, which start at
    /// virtual address `vaddr`.
    fn decode_one(&self, bytes: &[u8], vaddr: u64) -> Result<DecodedInst, DisasmError>;
}

/// Holds one or two [`Disassembler`] instances and drives block decoding.
pub struct DisasmEngine {
    primary: Box<dyn Disassembler>,
    secondary: Option<Box<dyn Disassembler>>,
    /// With a secondary decoder present: does the primary decode addresses
    /// whose low bit is set?
    primary_on_set_bit: bool,
}

impl DisasmEngine {
    /// An engine for architectures with a single instruction encoding.
    pub fn single(primary: Box<dyn Disassembler>) -> Self {
        DisasmEngine {
            primary,
            secondary: None,
            primary_on_set_bit: false,
        }
    }

    /// An engine for dual-encoding architectures. The low bit of a block's
    /// start PC picks the decoder: `primary` if the bit state matches
    /// `primary_on_set_bit`, `secondary` otherwise. The bit is masked off
    /// before it can disturb address arithmetic.
    pub fn dual(
        primary: Box<dyn Disassembler>,
        secondary: Box<dyn Disassembler>,
        primary_on_set_bit: bool,
    ) -> Self {
        DisasmEngine {
            primary,
            secondary: Some(secondary),
            primary_on_set_bit,
        }
    }

    pub fn is_dual(&self) -> bool {
        self.secondary.is_some()
    }

    fn select(&self, pc: u64) -> &dyn Disassembler {
        match &self.secondary {
            Some(secondary) => {
                if (pc & 1 == 1) == self.primary_on_set_bit {
                    &*self.primary
                } else {
                    &**secondary
                }
            }
            None => &*self.primary,
        }
    }

    /// Strip the encoding-select bit, if this architecture has one.
    pub(crate) fn mask_addr(&self, pc: u64) -> u64 {
        if self.is_dual() {
            pc & !1
        } else {
            pc
        }
    }

    /// Disassemble a block in place, capturing its start address from `pc`.
    ///
    /// Each raw instruction is decoded from its own byte range; a raw
    /// instruction that yields several decoded instructions shifts the
    /// indices of everything after it, which is what the block's skew map
    /// records. A decode failure is logged and stops decoding the block,
    /// keeping whatever was decoded so far.
    pub(crate) fn disassemble(&self, tb: &mut TranslationBlock, pc: u64) {
        if tb.is_decoded() {
            return;
        }
        let disasm = self.select(pc);
        let start = self.mask_addr(pc);

        let TranslationBlock {
            raw_insts,
            decoded,
            skew,
            vaddr,
            v_offsets,
        } = tb;
        *vaddr = start;

        debug!("disassembling {} instructions @ {start:#x}", raw_insts.len());
        let mut cursor = start;
        let mut skew_offset = 0u32;
        for (raw_idx, raw) in raw_insts.iter().enumerate() {
            let raw_idx = raw_idx as u32;
            if skew_offset > 0 {
                skew.insert(raw_idx, raw_idx + skew_offset);
            }

            let mut j = 0usize;
            let mut produced = 0u32;
            while j < raw.len() {
                let at = cursor + j as u64;
                match disasm.decode_one(&raw[j..], at) {
                    Ok(inst) => {
                        // A zero-sized answer would never advance; force
                        // one byte of progress.
                        let size = usize::from(inst.len()).max(1);
                        v_offsets.push((at - start) as u32);
                        decoded.push(Arc::new(inst));
                        produced += 1;
                        if produced > 1 {
                            skew_offset += 1;
                        }
                        j += size;
                    }
                    Err(e) => {
                        error!("failed to disassemble {:02x?}: {e}", &raw[j..]);
                        return;
                    }
                }
            }
            cursor += raw.len() as u64;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_helpers::ChunkDisasm;
    use super::*;
    use crate::tb::TranslationBlock;
    use smallvec::smallvec;

    fn engine() -> DisasmEngine {
        DisasmEngine::single(Box::new(ChunkDisasm))
    }

    #[test]
    fn offsets_accumulate_across_raw_insts() {
        let mut tb = TranslationBlock::new(vec![smallvec![4, 0, 0, 0], smallvec![2, 0]]);
        engine().disassemble(&mut tb, 0x1000);
        assert_eq!(tb.vaddr(), 0x1000);
        assert_eq!(tb.decoded().len(), 2);
        assert_eq!(tb.v_offsets(), &[0, 4]);
        assert!(tb.skew.is_empty());
    }

    #[test]
    fn multi_decode_populates_skew_map() {
        // Raw instruction 0 decodes into two instructions; raw 1 and 2 into
        // one each, so their decoded indices are shifted by one.
        let mut tb = TranslationBlock::new(vec![
            smallvec![2, 0, 2, 0],
            smallvec![4, 0, 0, 0],
            smallvec![2, 0],
        ]);
        engine().disassemble(&mut tb, 0x2000);
        assert_eq!(tb.decoded().len(), 4);
        assert_eq!(tb.v_offsets(), &[0, 2, 4, 8]);
        assert_eq!(tb.skew_index(0), 0);
        assert_eq!(tb.skew_index(1), 2);
        assert_eq!(tb.skew_index(2), 3);
    }

    #[test]
    fn decode_error_keeps_partial_block() {
        let mut tb = TranslationBlock::new(vec![
            smallvec![2, 0],
            smallvec![0xff, 0],
            smallvec![2, 0],
        ]);
        engine().disassemble(&mut tb, 0);
        assert_eq!(tb.decoded().len(), 1);
        // A later execution must not re-decode a partially decoded block.
        engine().disassemble(&mut tb, 0x100);
        assert_eq!(tb.decoded().len(), 1);
        assert_eq!(tb.vaddr(), 0);
    }

    #[test]
    fn zero_sized_decode_still_advances() {
        let mut tb = TranslationBlock::new(vec![smallvec![0, 0]]);
        engine().disassemble(&mut tb, 0);
        assert_eq!(tb.decoded().len(), 2);
        assert_eq!(tb.v_offsets(), &[0, 1]);
    }

    #[test]
    fn dual_engine_selects_by_low_pc_bit() {
        struct Tagged(&'static str);
        impl Disassembler for Tagged {
            fn decode_one(&self, bytes: &[u8], _: u64) -> Result<DecodedInst, DisasmError> {
                Ok(DecodedInst::new(self.0, bytes.len() as u8))
            }
        }
        let engine = DisasmEngine::dual(Box::new(Tagged("a")), Box::new(Tagged("b")), true);
        let mut tb = TranslationBlock::new(vec![smallvec![0, 0]]);
        engine.disassemble(&mut tb, 0x2001);
        assert_eq!(tb.decoded()[0].text(), "a");
        // The mode bit never reaches address arithmetic.
        assert_eq!(tb.vaddr(), 0x2000);

        let mut tb = TranslationBlock::new(vec![smallvec![0, 0]]);
        engine.disassemble(&mut tb, 0x2000);
        assert_eq!(tb.decoded()[0].text(), "b");
    }
}
