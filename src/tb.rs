//! The translation-block cache.
//!
//! Blocks arrive in two phases: registration delivers the raw instruction
//! bytes, and the first execution event triggers disassembly (see
//! [`crate::disasm`]), which fixes the block's start address and populates
//! its decoded form. Once decoded, a block's decoded sequence is never
//! cleared; it only goes away if the emulator re-registers the index.

use crate::disasm::DecodedInst;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::Arc;

/// The bytes of one emulator-visible machine instruction as seen on the
/// wire. Typically at most 16 bytes.
pub type RawBytes = SmallVec<[u8; 16]>;

/// Stable identity of one decoded instruction: the owning translation
/// block's index plus the position in its decoded sequence.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct InstId {
    pub tb_index: u32,
    pub inst_idx: u32,
}

/// One translation block: a contiguous run of guest instructions the
/// emulator executes as a unit.
#[derive(Debug, Default)]
pub struct TranslationBlock {
    pub(crate) raw_insts: Vec<RawBytes>,
    pub(crate) decoded: Vec<Arc<DecodedInst>>,
    /// Maps a raw instruction index to the index of its first decoded
    /// instruction. Only populated for raw instructions *after* one that
    /// decoded into more than one instruction; absent entries map to
    /// themselves.
    pub(crate) skew: HashMap<u32, u32>,
    /// Virtual start address, captured (and mode-bit masked) on first
    /// execution.
    pub(crate) vaddr: u64,
    /// Byte offset of each decoded instruction from `vaddr`. Parallel to
    /// `decoded`.
    pub(crate) v_offsets: Vec<u32>,
}

impl TranslationBlock {
    pub fn new(raw_insts: Vec<RawBytes>) -> Self {
        TranslationBlock {
            raw_insts,
            ..Default::default()
        }
    }

    /// Has the first execution already disassembled this block?
    pub fn is_decoded(&self) -> bool {
        !self.decoded.is_empty()
    }

    pub fn decoded(&self) -> &[Arc<DecodedInst>] {
        &self.decoded
    }

    pub fn v_offsets(&self) -> &[u32] {
        &self.v_offsets
    }

    pub fn vaddr(&self) -> u64 {
        self.vaddr
    }

    /// Translate a raw instruction index into a decoded instruction index.
    pub fn skew_index(&self, raw_idx: u32) -> u32 {
        *self.skew.get(&raw_idx).unwrap_or(&raw_idx)
    }
}

/// Index-addressed store of translation blocks. Indices are assigned by the
/// emulator; the store grows on demand and slots are overwritten when the
/// emulator re-registers an index.
#[derive(Debug, Default)]
pub struct TbCache {
    slots: Vec<Option<TranslationBlock>>,
}

impl TbCache {
    pub fn new() -> Self {
        TbCache::default()
    }

    /// Grow the cache so that `index` is addressable.
    pub fn reserve(&mut self, index: u32) {
        let needed = index as usize + 1;
        if self.slots.len() < needed {
            self.slots.resize_with(needed, || None);
        }
    }

    /// Register (or replace) the block at `index`. A replaced block loses
    /// its decoded state and will be disassembled afresh on next execution.
    pub fn put(&mut self, index: u32, raw_insts: Vec<RawBytes>) {
        self.reserve(index);
        self.slots[index as usize] = Some(TranslationBlock::new(raw_insts));
    }

    pub fn get(&self, index: u32) -> Option<&TranslationBlock> {
        self.slots.get(index as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut TranslationBlock> {
        self.slots.get_mut(index as usize)?.as_mut()
    }

    /// Fetch the block at `index` for an execution starting at `pc`,
    /// disassembling it first if this is its first execution. The only
    /// cache operation that can trigger decoding.
    pub fn get_for_execution(
        &mut self,
        index: u32,
        pc: u64,
        disasm: &crate::disasm::DisasmEngine,
    ) -> Option<&mut TranslationBlock> {
        let tb = self.get_mut(index)?;
        if !tb.is_decoded() {
            disasm.disassemble(tb, pc);
        }
        Some(tb)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn grows_on_put() {
        let mut cache = TbCache::new();
        assert!(cache.get(3).is_none());
        cache.put(3, vec![smallvec![0x90]]);
        assert_eq!(cache.len(), 4);
        assert!(cache.get(2).is_none());
        assert_eq!(cache.get(3).unwrap().raw_insts.len(), 1);
    }

    #[test]
    fn reserve_is_idempotent() {
        let mut cache = TbCache::new();
        cache.reserve(5);
        cache.put(1, vec![]);
        cache.reserve(2);
        assert_eq!(cache.len(), 6);
        assert!(cache.get(1).is_some());
    }

    #[test]
    fn put_replaces_decoded_state() {
        let mut cache = TbCache::new();
        cache.put(0, vec![smallvec![0x90]]);
        let tb = cache.get_mut(0).unwrap();
        tb.decoded.push(Arc::new(DecodedInst::new("nop", 1)));
        tb.v_offsets.push(0);
        assert!(tb.is_decoded());
        cache.put(0, vec![smallvec![0xc3]]);
        assert!(!cache.get(0).unwrap().is_decoded());
    }

    #[test]
    fn get_for_execution_decodes_once() {
        use crate::disasm::test_helpers::ChunkDisasm;
        use crate::disasm::DisasmEngine;

        let engine = DisasmEngine::single(Box::new(ChunkDisasm));
        let mut cache = TbCache::new();
        cache.put(0, vec![smallvec![2, 0]]);
        let tb = cache.get_for_execution(0, 0x1000, &engine).unwrap();
        assert_eq!(tb.decoded().len(), 1);
        assert_eq!(tb.vaddr(), 0x1000);
        // A later execution at another address must not re-decode.
        let tb = cache.get_for_execution(0, 0x2000, &engine).unwrap();
        assert_eq!(tb.vaddr(), 0x1000);
        assert!(cache.get_for_execution(1, 0, &engine).is_none());
    }

    #[test]
    fn skew_index_defaults_to_identity() {
        let mut tb = TranslationBlock::new(vec![]);
        assert_eq!(tb.skew_index(4), 4);
        tb.skew.insert(4, 6);
        assert_eq!(tb.skew_index(4), 6);
        assert_eq!(tb.skew_index(5), 5);
    }
}
