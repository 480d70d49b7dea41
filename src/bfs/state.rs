//! Per-level traversal state.
//!
//! Owns the predecessor array, the visited bitmaps, the next-queue chunk
//! bag, and the per-worker packet buffers. Lifecycle: everything is zeroed
//! by `reset`; predecessor entries transition `-1 -> encoded` exactly
//! once, gated by the visited bit's 0 -> 1 flip; queues are rebuilt every
//! level.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_utils::CachePadded;

use crate::bitmap::{AtomicBitmap, Bitmap};
use crate::fiber::FiberScheduler;
use crate::graph::CsrShard;
use crate::grid::GridContext;
use crate::params::{GridVertex, BUCKET_UNIT_SIZE, PACKET_LENGTH};
use crate::pred::{PredLayout, UNVISITED};

/// A fixed-size batch of newly discovered vertices.
pub struct QueueChunk {
    len: usize,
    verts: [GridVertex; BUCKET_UNIT_SIZE],
}

impl QueueChunk {
    /// A fresh, empty chunk.
    pub fn boxed() -> Box<Self> {
        Box::new(Self {
            len: 0,
            verts: [0; BUCKET_UNIT_SIZE],
        })
    }

    /// Appends `v`; returns `false` when the chunk is full.
    #[inline]
    pub fn push(&mut self, v: GridVertex) -> bool {
        if self.len == BUCKET_UNIT_SIZE {
            return false;
        }
        self.verts[self.len] = v;
        self.len += 1;
        true
    }

    /// The occupied prefix.
    pub fn as_slice(&self) -> &[GridVertex] {
        &self.verts[..self.len]
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the chunk is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Multi-producer bag of full chunks, drained single-threaded at the
/// level boundary.
#[derive(Default)]
pub struct ChunkBag {
    stack: Mutex<Vec<Box<QueueChunk>>>,
}

impl ChunkBag {
    /// Adds a full chunk.
    pub fn push(&self, chunk: Box<QueueChunk>) {
        self.stack
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(chunk);
    }

    /// Takes every queued chunk.
    pub fn drain(&self) -> Vec<Box<QueueChunk>> {
        std::mem::take(&mut *self.stack.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

/// A per-worker, per-destination packet under assembly.
pub struct Packet {
    /// Packet body: u32 words in the active handler's wire format.
    pub words: Vec<u32>,
    /// Source whose header is already written, if any.
    pub cur_src: Option<GridVertex>,
}

impl Packet {
    fn new() -> Self {
        Self {
            words: Vec::with_capacity(PACKET_LENGTH),
            cur_src: None,
        }
    }
}

/// State shared by kernels, receivers, and the expand phase of one rank.
pub struct BfsShared {
    /// This rank's graph shard.
    pub graph: Arc<CsrShard>,
    /// Grid placement and transport.
    pub ctx: GridContext,
    /// Predecessor word layout for this grid.
    pub layout: PredLayout,
    /// The rank's task queue.
    pub fiber: Arc<FiberScheduler>,
    /// Packed predecessor per local vertex; `-1` = unvisited. Stores are
    /// relaxed: the visited CAS hands exactly one thread the right to
    /// write each slot.
    pub pred: Box<[AtomicI64]>,
    /// Visited bits for this rank's own vertices; accumulates across
    /// levels.
    pub visited: AtomicBitmap,
    /// Frontier-before-this-step snapshot, refreshed at every bottom-up
    /// step.
    pub visited_old: Mutex<Bitmap>,
    /// Target-space reachability oracle, replicated down the grid column.
    pub shared_visited: AtomicBitmap,
    /// Next-queue chunk bag.
    pub nq: ChunkBag,
    /// Per-worker packet buffers, one slot per destination.
    pub worker_packets: Box<[CachePadded<Mutex<Vec<Packet>>>]>,
    /// Per-worker current next-queue chunk.
    pub worker_chunks: Box<[CachePadded<Mutex<Option<Box<QueueChunk>>>>]>,
    /// Vertices discovered this level (top-down bookkeeping).
    pub nq_count: AtomicI64,
    /// Extraction jobs still running this level.
    pub remaining_extract_jobs: AtomicUsize,
}

impl BfsShared {
    /// Allocates state for one rank.
    pub fn new(
        graph: Arc<CsrShard>,
        ctx: GridContext,
        fiber: Arc<FiberScheduler>,
    ) -> Arc<Self> {
        let nloc = graph.local_verts();
        let layout = PredLayout::new(
            graph.log_rows(),
            graph.log_cols(),
            graph.log_local_verts(),
        );
        let workers = ctx.pool.current_num_threads();
        let dests = ctx.shape.rows().max(ctx.shape.cols());
        let pred = (0..nloc)
            .map(|_| AtomicI64::new(UNVISITED))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Arc::new(Self {
            visited: AtomicBitmap::new(nloc),
            visited_old: Mutex::new(Bitmap::new(nloc)),
            shared_visited: AtomicBitmap::new(graph.target_space_bits()),
            pred,
            nq: ChunkBag::default(),
            worker_packets: (0..workers)
                .map(|_| CachePadded::new(Mutex::new((0..dests).map(|_| Packet::new()).collect())))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            worker_chunks: (0..workers)
                .map(|_| CachePadded::new(Mutex::new(None)))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            nq_count: AtomicI64::new(0),
            remaining_extract_jobs: AtomicUsize::new(0),
            graph,
            ctx,
            layout,
            fiber,
        })
    }

    /// Zeroes all traversal state for a fresh run.
    pub fn reset(&self) {
        for p in self.pred.iter() {
            p.store(UNVISITED, Ordering::Relaxed);
        }
        self.visited.clear_all();
        self.visited_old
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear_all();
        self.shared_visited.clear_all();
        let _ = self.nq.drain();
        self.nq_count.store(0, Ordering::Relaxed);
    }

    /// Index of the calling worker within this rank's pool.
    #[inline]
    pub fn worker_index(&self) -> usize {
        let idx = rayon::current_thread_index();
        debug_assert!(idx.is_some(), "state access outside the worker pool");
        idx.unwrap_or(0)
    }

    /// Appends a discovery to the calling worker's next-queue chunk.
    pub fn push_nq(&self, local: GridVertex) {
        let slot = &self.worker_chunks[self.worker_index()];
        let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
        let chunk = guard.get_or_insert_with(QueueChunk::boxed);
        if !chunk.push(local) {
            let full = guard.take().unwrap_or_else(QueueChunk::boxed);
            self.nq.push(full);
            let fresh = guard.get_or_insert_with(QueueChunk::boxed);
            let ok = fresh.push(local);
            debug_assert!(ok);
        }
        self.nq_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Collects this level's discoveries from the bag and every worker
    /// chunk. Single-threaded at the level boundary.
    pub fn flatten_nq(&self) -> Vec<GridVertex> {
        let mut out = Vec::new();
        for chunk in self.nq.drain() {
            out.extend_from_slice(chunk.as_slice());
        }
        for slot in self.worker_chunks.iter() {
            if let Some(chunk) = slot.lock().unwrap_or_else(|e| e.into_inner()).take() {
                out.extend_from_slice(chunk.as_slice());
            }
        }
        out
    }

    /// Snapshots `visited` into `visited_old` (start of a bottom-up
    /// step).
    pub fn swap_visited(&self) {
        let mut old = self.visited_old.lock().unwrap_or_else(|e| e.into_inner());
        self.visited.snapshot_into(&mut old);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_fills_and_reports() {
        let mut c = QueueChunk::boxed();
        for i in 0..BUCKET_UNIT_SIZE as u32 {
            assert!(c.push(i));
        }
        assert!(!c.push(0));
        assert_eq!(c.len(), BUCKET_UNIT_SIZE);
    }

    #[test]
    fn bag_drains_everything() {
        let bag = ChunkBag::default();
        let mut a = QueueChunk::boxed();
        a.push(7);
        bag.push(a);
        let drained = bag.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].as_slice(), &[7]);
        assert!(bag.drain().is_empty());
    }
}
