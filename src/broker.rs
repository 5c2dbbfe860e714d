//! The broker value: owns the cache, the queue, the decoders and the
//! receiver thread, and implements the simulator-facing [`Broker`] trait.

use crate::config::BrokerConfig;
use crate::disasm::DisasmEngine;
use crate::errors::BrokerError;
use crate::metadata::MetadataExchanger;
use crate::queue::{SliceQueue, TbSlice};
use crate::recv::Receiver;
use crate::regions::BinaryRegions;
use crate::tb::{InstId, TbCache};
use crate::{Broker, Features, FetchedInst, RegionDescriptor};
use log::{debug, error, warn};
use parking_lot::Mutex;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::thread::JoinHandle;

/// State shared between the receiver thread and the fetching worker.
///
/// Lock order: the queue mutex is taken before the cache mutex on the fetch
/// side; the receiver never holds both at once.
pub(crate) struct Shared {
    pub(crate) tbs: Mutex<TbCache>,
    pub(crate) queue: SliceQueue,
    /// The emulator's base load address, written once per stream by the
    /// receiver and read on both sides.
    pub(crate) code_start: AtomicU64,
    pub(crate) regions: Option<BinaryRegions>,
}

impl Shared {
    pub(crate) fn new(regions: Option<BinaryRegions>) -> Self {
        Shared {
            tbs: Mutex::new(TbCache::new()),
            queue: SliceQueue::new(),
            code_start: AtomicU64::new(0),
            regions,
        }
    }
}

/// A broker fed by an emulator over a stream socket.
///
/// Construction binds the listening socket and spawns the receiver thread;
/// from then on the owner only ever pulls via [`Broker::fetch`] /
/// [`Broker::fetch_region`]. Dropping the broker joins the receiver, which
/// exits once its connection budget is spent.
pub struct EmuBroker {
    shared: Arc<Shared>,
    recv_thread: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
    /// Sequence number of the next delivered instruction.
    total_traces: u64,
}

impl EmuBroker {
    pub fn new(config: BrokerConfig, disasm: DisasmEngine) -> Result<Self, BrokerError> {
        let regions = match &config.regions_manifest {
            Some(path) => match BinaryRegions::from_manifest(path) {
                Ok(regions) => Some(regions),
                Err(e) => {
                    error!("{e}");
                    None
                }
            },
            None => None,
        };

        let listener = TcpListener::bind(&config.host).map_err(|source| BrokerError::Bind {
            addr: config.host.clone(),
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| BrokerError::Bind {
            addr: config.host.clone(),
            source,
        })?;

        let shared = Arc::new(Shared::new(regions));
        let receiver = Receiver::new(
            Arc::clone(&shared),
            disasm,
            config.merge_mem_accesses,
        );
        let max_connections = config.max_connections;
        let recv_thread = std::thread::Builder::new()
            .name("tracebroker-recv".into())
            .spawn(move || receiver.run(listener, max_connections))
            .map_err(BrokerError::Spawn)?;

        Ok(EmuBroker {
            shared,
            recv_thread: Some(recv_thread),
            local_addr,
            total_traces: 0,
        })
    }

    /// The address the broker is actually listening on. Useful when the
    /// configured port was 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Has the end-of-stream sentinel arrived? Everything queued before the
    /// sentinel is already visible to `fetch` once this returns true.
    pub fn end_of_stream(&self) -> bool {
        self.shared.queue.lock().end_of_stream
    }
}

impl Broker for EmuBroker {
    fn features(&self) -> Features {
        let mut features = Features::METADATA;
        if matches!(&self.shared.regions, Some(r) if !r.is_empty()) {
            features = features | Features::REGION;
        }
        features
    }

    fn fetch_region(
        &mut self,
        out: &mut Vec<FetchedInst>,
        max: usize,
        mut mde: Option<&mut MetadataExchanger>,
    ) -> (Option<usize>, RegionDescriptor) {
        out.clear();
        if max == 0 {
            return (Some(0), RegionDescriptor::not_end());
        }

        let mut queue = self.shared.queue.lock();
        // Only block if the queue is completely empty.
        if queue.slices.is_empty() {
            if queue.end_of_stream {
                return (None, RegionDescriptor::end(None));
            }
            self.shared.queue.wait_for_work(&mut queue);
        }
        if queue.slices.is_empty() && queue.end_of_stream {
            return (None, RegionDescriptor::end(None));
        }

        // Select enough slices from the queue head to satisfy the request,
        // splitting the last one if it ends past the request.
        let tbs = self.shared.tbs.lock();
        let mut selected: Vec<TbSlice> = Vec::new();
        let mut remaining = max;
        while remaining > 0 {
            let Some(head) = queue.slices.front_mut() else {
                break;
            };
            let available = match tbs.get(head.tb_index) {
                Some(tb) => tb.decoded().len(),
                None => {
                    // The emulator re-registered the block after queueing
                    // this slice; nothing sensible can be delivered.
                    warn!(
                        "dropping queued slice for re-registered block {}",
                        head.tb_index
                    );
                    queue.slices.pop_front();
                    continue;
                }
            };
            let slice_len = head.clamped_len(available);
            if slice_len > remaining {
                let taken = head.split_front(head.begin + remaining as u32);
                selected.push(taken);
                remaining = 0;
            } else {
                // Cannot fail: the queue head was just peeked.
                let slice = queue.slices.pop_front().unwrap();
                let is_region_end = slice.region_end.is_some();
                remaining -= slice_len;
                selected.push(slice);
                if is_region_end {
                    break;
                }
            }
        }
        drop(queue);

        // Resolve the selected windows into instruction references,
        // publishing memory-access metadata as each instruction is emitted.
        for slice in &mut selected {
            let Some(tb) = tbs.get(slice.tb_index) else {
                continue;
            };
            let end = (slice.end as usize).min(tb.decoded().len());
            let mut accesses = slice.mem_accesses.drain(..).peekable();
            for i in slice.begin as usize..end {
                if out.len() == max {
                    break;
                }
                let seq = self.total_traces;
                self.total_traces += 1;
                while accesses.peek().is_some_and(|(idx, _)| *idx as usize == i) {
                    // Cannot fail: peeked just above.
                    let (_, access) = accesses.next().unwrap();
                    if let Some(mde) = mde.as_deref_mut() {
                        mde.index_map.insert(
                            InstId {
                                tb_index: slice.tb_index,
                                inst_idx: i as u32,
                            },
                            seq,
                        );
                        mde.registry.insert_mem_access(seq, access);
                    }
                }
                out.push(FetchedInst {
                    id: InstId {
                        tb_index: slice.tb_index,
                        inst_idx: i as u32,
                    },
                    inst: Arc::clone(&tb.decoded()[i]),
                });
            }
        }
        drop(tbs);

        debug!("fetched {} instructions", out.len());
        match selected.last().and_then(|slice| slice.region_end.as_ref()) {
            Some(region) => (
                Some(out.len()),
                RegionDescriptor::end(Some(Arc::clone(&region.description))),
            ),
            None => (Some(out.len()), RegionDescriptor::not_end()),
        }
    }
}

impl Drop for EmuBroker {
    fn drop(&mut self) {
        if let Some(handle) = self.recv_thread.take() {
            debug!("cleaning up receiver thread...");
            if handle.join().is_err() {
                error!("receiver thread panicked");
            }
        }
    }
}
