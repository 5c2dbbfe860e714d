//! The bounded hand-off between the receiver and the simulator worker: a
//! FIFO of translation-block slices plus the end-of-stream flag, guarded by
//! one mutex and one condition variable.

use crate::metadata::MemoryAccess;
use crate::regions::BinaryRegion;
use log::warn;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::Arc;

/// Memory operations attributed to a slice, `(decoded index, descriptor)`
/// pairs in ascending index order. Indices always lie inside the owning
/// slice's `[begin, end)` window.
pub(crate) type MemoryAccessChain = Vec<(u32, MemoryAccess)>;

/// A half-open window `[begin, end)` into one translation block's decoded
/// instructions, the unit of work handed to the simulator.
#[derive(Debug)]
pub(crate) struct TbSlice {
    pub(crate) tb_index: u32,
    pub(crate) begin: u32,
    pub(crate) end: u32,
    /// Set iff this slice ends exactly at the region's closing instruction.
    pub(crate) region_end: Option<Arc<BinaryRegion>>,
    pub(crate) mem_accesses: MemoryAccessChain,
}

impl TbSlice {
    /// Instructions this slice can deliver, given how many decoded
    /// instructions its block actually has. The clamp matters when the
    /// emulator re-registered the block after the slice was queued, leaving
    /// the window pointing past the (new, shorter) decoded sequence.
    pub(crate) fn clamped_len(&self, available: usize) -> usize {
        (self.end as usize)
            .min(available)
            .saturating_sub(self.begin as usize)
    }

    /// Split off the front `[begin, point)` as a new slice, leaving
    /// `[point, end)` behind. The front keeps the memory accesses strictly
    /// below the split point; it never carries a region-end marker since
    /// the split point is in the middle of the window.
    pub(crate) fn split_front(&mut self, point: u32) -> TbSlice {
        debug_assert!(point > self.begin && point < self.end);
        let at = self.mem_accesses.partition_point(|(idx, _)| *idx < point);
        let front = TbSlice {
            tb_index: self.tb_index,
            begin: self.begin,
            end: point,
            region_end: None,
            mem_accesses: self.mem_accesses.drain(..at).collect(),
        };
        self.begin = point;
        front
    }
}

#[derive(Debug, Default)]
pub(crate) struct QueueState {
    pub(crate) slices: VecDeque<TbSlice>,
    pub(crate) end_of_stream: bool,
}

pub(crate) struct SliceQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl SliceQueue {
    pub(crate) fn new() -> Self {
        SliceQueue {
            state: Mutex::new(QueueState::default()),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock()
    }

    pub(crate) fn push(&self, slice: TbSlice) {
        {
            let mut state = self.state.lock();
            if state.end_of_stream {
                // The stream is over; whatever the peer sends now cannot
                // be delivered.
                warn!("dropping slice queued after end-of-stream");
                return;
            }
            state.slices.push_back(slice);
        }
        self.cond.notify_one();
    }

    pub(crate) fn signal_end_of_stream(&self) {
        {
            self.state.lock().end_of_stream = true;
        }
        self.cond.notify_one();
    }

    /// Block until there is a slice to take or the stream has ended.
    pub(crate) fn wait_for_work(&self, state: &mut MutexGuard<'_, QueueState>) {
        while !state.end_of_stream && state.slices.is_empty() {
            self.cond.wait(state);
        }
    }
}
