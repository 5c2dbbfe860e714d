//! ARMv7 disassembler adapter backed by [yaxpeax_arm].
//!
//! ARM/Thumb interworking encodes the instruction set in the low bit of the
//! branch-target address, so a broker serving an interworking target holds
//! two decoders and picks one per block. [`armv7_engine`] builds that pair.

use super::{DecodedInst, DisasmEngine, Disassembler};
use crate::errors::DisasmError;
use yaxpeax_arch::*;
use yaxpeax_arm::armv7::InstDecoder;

/// Decodes either the ARM or the Thumb encoding of ARMv7.
pub struct ArmDisasm {
    decoder: InstDecoder,
}

impl ArmDisasm {
    pub fn arm() -> Self {
        ArmDisasm {
            decoder: InstDecoder::armv7(),
        }
    }

    pub fn thumb() -> Self {
        ArmDisasm {
            decoder: InstDecoder::armv7_thumb(),
        }
    }
}

impl Disassembler for ArmDisasm {
    fn decode_one(&self, bytes: &[u8], vaddr: u64) -> Result<DecodedInst, DisasmError> {
        let mut reader = U8Reader::new(bytes);
        let inst = self
            .decoder
            .decode(&mut reader)
            .map_err(|e| DisasmError::BadEncoding {
                vaddr,
                msg: e.to_string(),
            })?;
        let len = inst.len().to_const() as u8;
        Ok(DecodedInst::new(inst.to_string(), len))
    }
}

/// An engine for an ARM/Thumb interworking target. `thumb_primary` mirrors
/// whether the configured subtarget starts out in Thumb state; the other
/// encoding becomes the secondary decoder. Blocks whose start PC has the
/// low bit set decode as Thumb either way.
pub fn armv7_engine(thumb_primary: bool) -> DisasmEngine {
    if thumb_primary {
        DisasmEngine::dual(Box::new(ArmDisasm::thumb()), Box::new(ArmDisasm::arm()), true)
    } else {
        DisasmEngine::dual(
            Box::new(ArmDisasm::arm()),
            Box::new(ArmDisasm::thumb()),
            false,
        )
    }
}
