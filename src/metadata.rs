//! The metadata side-channel between the broker and the simulator.
//!
//! Instructions flow through the fetch interface; anything else rides here.
//! The broker stamps every delivered instruction with a broker-wide sequence
//! number and, for instructions that touched memory, publishes the access
//! descriptor under that number. Today "memory-access" is the only metadata
//! category; the simulator's load/store-unit model is its consumer.

use crate::tb::InstId;
use std::collections::HashMap;

/// One (possibly merged) memory operation performed by an instruction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemoryAccess {
    pub is_store: bool,
    pub vaddr: u64,
    pub size: u32,
}

/// Per-category metadata keyed by instruction sequence number.
#[derive(Debug, Default)]
pub struct MetadataRegistry {
    mem_accesses: HashMap<u64, MemoryAccess>,
}

impl MetadataRegistry {
    pub fn insert_mem_access(&mut self, seq: u64, access: MemoryAccess) {
        self.mem_accesses.insert(seq, access);
    }

    pub fn mem_access(&self, seq: u64) -> Option<&MemoryAccess> {
        self.mem_accesses.get(&seq)
    }

    /// Hand the descriptor over to the consumer.
    pub fn take_mem_access(&mut self, seq: u64) -> Option<MemoryAccess> {
        self.mem_accesses.remove(&seq)
    }
}

/// What the simulator passes into `fetch` to receive metadata: the registry
/// plus the mapping from delivered instruction identities to their sequence
/// numbers. A repeatedly executed instruction keeps only its most recent
/// sequence number, so the maps are meant to be drained between fetches.
#[derive(Debug, Default)]
pub struct MetadataExchanger {
    pub registry: MetadataRegistry,
    pub index_map: HashMap<InstId, u64>,
}
