//! The receiver task: accepts emulator connections, verifies framed
//! messages and turns execution events into queued slices.
//!
//! One receiver runs per broker, on its own thread. It is the only writer
//! of the translation-block cache and the only producer for the slice
//! queue; the region tracker state machine lives entirely on this side.

use crate::broker::Shared;
use crate::disasm::DisasmEngine;
use crate::metadata::MemoryAccess;
use crate::proto::{self, MemAccessRecord, Message, END_OF_STREAM_INDEX, END_OF_STREAM_PC};
use crate::queue::{MemoryAccessChain, TbSlice};
use crate::regions::BinaryRegion;
use crate::tb::{RawBytes, TranslationBlock};
use log::{debug, error, info};
use std::io::BufReader;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub(crate) struct Receiver {
    shared: Arc<Shared>,
    disasm: DisasmEngine,
    merge_mem_accesses: bool,
    /// Region tracker state: `Some` while inside a region.
    cur_region: Option<Arc<BinaryRegion>>,
}

impl Receiver {
    pub(crate) fn new(shared: Arc<Shared>, disasm: DisasmEngine, merge_mem_accesses: bool) -> Self {
        Receiver {
            shared,
            disasm,
            merge_mem_accesses,
            cur_region: None,
        }
    }

    /// Accept and serve connections until the connection budget is spent.
    pub(crate) fn run(mut self, listener: TcpListener, max_connections: u32) {
        match listener.local_addr() {
            Ok(addr) => info!("listening on {addr}..."),
            Err(_) => info!("listening..."),
        }
        let mut remaining = max_connections;
        loop {
            let (stream, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("failed to accept client: {e}");
                    continue;
                }
            };
            debug!("new client {peer}");

            if let Err(e) = self.serve(stream) {
                error!("closing client connection: {e}");
            } else {
                debug!("closing current client");
            }

            if max_connections > 0 {
                remaining -= 1;
                if remaining == 0 {
                    break;
                }
            }
        }
    }

    /// Read frames until EOF or a verification failure.
    fn serve(&mut self, stream: TcpStream) -> Result<(), crate::errors::ProtoError> {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        while proto::read_frame(&mut reader, &mut buf)?.is_some() {
            match Message::decode(&buf)? {
                Message::Metadata { load_addr } => {
                    debug!("code starts at {load_addr:#x}");
                    self.shared.code_start.store(load_addr, Ordering::Release);
                }
                Message::TranslatedBlock { index, insts } => self.register_block(index, insts),
                Message::ExecTb {
                    index,
                    pc,
                    mem_accesses,
                } => self.block_executed(index, pc, &mem_accesses),
            }
        }
        Ok(())
    }

    fn register_block(&self, index: u32, insts: Vec<RawBytes>) {
        self.shared.tbs.lock().put(index, insts);
    }

    fn block_executed(&mut self, index: u32, pc: u64, mem_accesses: &[MemAccessRecord]) {
        if index == END_OF_STREAM_INDEX && pc == END_OF_STREAM_PC {
            debug!("received end-of-stream signal");
            self.shared.queue.signal_end_of_stream();
            return;
        }

        let slice = {
            let mut tbs = self.shared.tbs.lock();
            let Some(tb) = tbs.get_for_execution(index, pc, &self.disasm) else {
                error!("invalid translation block index {index}");
                return;
            };

            let code_start = self.shared.code_start.load(Ordering::Acquire);
            let (begin, end, region_end) = Self::region_window(
                self.shared.regions.as_ref(),
                &mut self.cur_region,
                tb,
                code_start,
            );
            if begin == end {
                return;
            }
            TbSlice {
                tb_index: index,
                begin: begin as u32,
                end: end as u32,
                region_end,
                mem_accesses: self.build_chain(tb, mem_accesses, begin, end),
            }
        };
        self.shared.queue.push(slice);
    }

    /// Work out which part of the executed block belongs to a region.
    ///
    /// Outside a region, the block's instruction addresses are scanned for a
    /// region start; inside one, for the instruction that ends exactly at
    /// the region's end address. A single block may do both: enter a region
    /// and finish it. With no regions configured the whole block is taken.
    fn region_window(
        regions: Option<&crate::regions::BinaryRegions>,
        cur_region: &mut Option<Arc<BinaryRegion>>,
        tb: &TranslationBlock,
        code_start: u64,
    ) -> (usize, usize, Option<Arc<BinaryRegion>>) {
        let n = tb.decoded().len();
        let regions = match regions {
            Some(regions) if !regions.is_empty() => regions,
            _ => return (0, n, None),
        };

        let mut begin = 0;
        let mut end = n;
        let mut region_end = None;
        let mut i = 0;

        if cur_region.is_none() {
            begin = end;
            if tb.vaddr() >= code_start {
                let va = tb.vaddr() - code_start;
                while i < n {
                    if let Some(region) = regions.lookup_start(va + u64::from(tb.v_offsets()[i])) {
                        debug!("start to analyze region {region}");
                        *cur_region = Some(Arc::clone(region));
                        begin = i;
                        break;
                    }
                    i += 1;
                }
            }
        }

        if let Some(cur) = cur_region.clone() {
            if tb.vaddr() >= code_start {
                let va = tb.vaddr() - code_start;
                while i < n {
                    let inst_end =
                        va + u64::from(tb.v_offsets()[i]) + u64::from(tb.decoded()[i].len());
                    if cur.end == inst_end {
                        break;
                    }
                    i += 1;
                }
                if i < n {
                    debug!("terminating region {}", cur.description);
                    end = i + 1;
                    region_end = cur_region.take();
                }
            }
        }

        (begin, end, region_end)
    }

    /// Turn the event's raw-indexed memory accesses into the slice's chain:
    /// indices are translated through the block's skew map, accesses landing
    /// outside the slice window are dropped, and (policy permitting)
    /// co-located accesses merge into one range-spanning descriptor.
    fn build_chain(
        &self,
        tb: &TranslationBlock,
        records: &[MemAccessRecord],
        begin: usize,
        end: usize,
    ) -> MemoryAccessChain {
        let mut chain = MemoryAccessChain::new();
        for rec in records {
            let di = tb.skew_index(rec.inst_index);
            if (di as usize) < begin || (di as usize) >= end {
                debug!("dropping memory access outside the sliced window");
                continue;
            }
            if self.merge_mem_accesses {
                if let Some((last_idx, last)) = chain.last_mut() {
                    if *last_idx == di {
                        last.is_store |= rec.is_store;
                        let start = last.vaddr.min(rec.vaddr);
                        let end_addr = (last.vaddr + u64::from(last.size))
                            .max(rec.vaddr + u64::from(rec.size));
                        last.vaddr = start;
                        last.size = (end_addr - start) as u32;
                        continue;
                    }
                }
            }
            chain.push((
                di,
                MemoryAccess {
                    is_store: rec.is_store,
                    vaddr: rec.vaddr,
                    size: rec.size,
                },
            ));
        }
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Shared;
    use crate::disasm::test_helpers::ChunkDisasm;
    use crate::regions::BinaryRegions;
    use smallvec::smallvec;
    use std::io::Write;

    fn receiver(manifest: Option<&str>) -> Receiver {
        let regions = manifest.map(|content| {
            let mut f = tempfile::NamedTempFile::new().unwrap();
            f.write_all(content.as_bytes()).unwrap();
            BinaryRegions::from_manifest(f.path()).unwrap()
        });
        Receiver::new(
            Arc::new(Shared::new(regions)),
            DisasmEngine::single(Box::new(ChunkDisasm)),
            true,
        )
    }

    /// Decode a chunk-encoded block in the receiver's cache and return its
    /// region window.
    fn window(r: &mut Receiver, raw: Vec<RawBytes>, pc: u64) -> (usize, usize, bool) {
        let shared = Arc::clone(&r.shared);
        let mut tbs = shared.tbs.lock();
        let index = tbs.len() as u32;
        tbs.put(index, raw);
        let tb = tbs.get_for_execution(index, pc, &r.disasm).unwrap();
        let (begin, end, region_end) =
            Receiver::region_window(r.shared.regions.as_ref(), &mut r.cur_region, tb, 0x1000);
        (begin, end, region_end.is_some())
    }

    #[test]
    fn no_regions_takes_whole_block() {
        let mut r = receiver(None);
        let w = window(&mut r, vec![smallvec![4, 0, 0, 0], smallvec![4, 0, 0, 0]], 0x1000);
        assert_eq!(w, (0, 2, false));
    }

    #[test]
    fn enter_and_exit_in_one_block() {
        let mut r = receiver(Some(r#"[{"start": "0x10", "end": "0x18", "description": "hot"}]"#));
        // Offsets 0x0, 0x4, 0x10, 0x14: the region covers the last two.
        let raw = vec![
            smallvec![4, 0, 0, 0],
            smallvec![12, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
            smallvec![4, 0, 0, 0],
            smallvec![4, 0, 0, 0],
        ];
        let w = window(&mut r, raw, 0x1000);
        assert_eq!(w, (2, 4, true));
        assert!(r.cur_region.is_none());
    }

    #[test]
    fn block_outside_all_regions_is_empty() {
        let mut r = receiver(Some(r#"[{"start": "0x100", "end": "0x108"}]"#));
        let w = window(&mut r, vec![smallvec![4, 0, 0, 0]], 0x1000);
        assert_eq!(w.0, w.1);
    }

    #[test]
    fn region_spanning_blocks() {
        let mut r = receiver(Some(r#"[{"start": "0x0", "end": "0xc"}]"#));
        // First block enters the region but does not finish it...
        let w = window(&mut r, vec![smallvec![4, 0, 0, 0], smallvec![4, 0, 0, 0]], 0x1000);
        assert_eq!(w, (0, 2, false));
        assert!(r.cur_region.is_some());
        // ...the next one ends it on its first instruction.
        let w = window(&mut r, vec![smallvec![4, 0, 0, 0], smallvec![4, 0, 0, 0]], 0x1008);
        assert_eq!(w, (0, 1, true));
    }

    #[test]
    fn blocks_below_load_address_stay_outside() {
        let mut r = receiver(Some(r#"[{"start": "0x0", "end": "0x8"}]"#));
        let w = window(&mut r, vec![smallvec![4, 0, 0, 0]], 0x10);
        assert_eq!(w.0, w.1);
    }

    #[test]
    fn chain_merges_colocated_accesses() {
        let r = receiver(None);
        let mut tb = TranslationBlock::new(vec![smallvec![4, 0, 0, 0]]);
        r.disasm.disassemble(&mut tb, 0);
        let records = [
            MemAccessRecord {
                inst_index: 0,
                is_store: true,
                vaddr: 0x20,
                size: 4,
            },
            MemAccessRecord {
                inst_index: 0,
                is_store: false,
                vaddr: 0x22,
                size: 4,
            },
        ];
        let chain = r.build_chain(&tb, &records, 0, 1);
        assert_eq!(chain.len(), 1);
        let (idx, ma) = &chain[0];
        assert_eq!(*idx, 0);
        assert_eq!(
            *ma,
            MemoryAccess {
                is_store: true,
                vaddr: 0x20,
                size: 6
            }
        );
    }

    #[test]
    fn chain_drops_out_of_window_accesses() {
        let r = receiver(None);
        let mut tb = TranslationBlock::new(vec![smallvec![2, 0], smallvec![2, 0]]);
        r.disasm.disassemble(&mut tb, 0);
        let records = [
            MemAccessRecord {
                inst_index: 0,
                is_store: false,
                vaddr: 0x10,
                size: 4,
            },
            MemAccessRecord {
                inst_index: 1,
                is_store: false,
                vaddr: 0x18,
                size: 4,
            },
        ];
        let chain = r.build_chain(&tb, &records, 1, 2);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].0, 1);
    }
}
