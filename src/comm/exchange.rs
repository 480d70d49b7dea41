//! Asynchronous all-to-all exchange.
//!
//! Producer threads append packets to per-destination buffers through a
//! lock-free reservation protocol; one background thread per rank drives
//! the transport and publishes receive completions as priority-1 fiber
//! tasks, so workers keep extracting edges while communication makes
//! progress.
//!
//! Reservation protocol, per destination: a single packed atomic holds
//! `epoch | reserved-offset`. A producer `fetch_add`s its length; if the
//! granted range fits it copies into the current buffer and bumps the
//! `filled` counter. The unique reservation that crosses the capacity
//! becomes the rotator: it waits for `filled` to reach its start offset,
//! publishes the buffer to the send queue, installs a fresh buffer, and
//! opens the next epoch. Later reservations observe the stale epoch and
//! retry, draining receive tasks while they spin. Only the rotation itself
//! takes the per-destination mutex.
//!
//! End of level: one zero-length sentinel per destination. The handler is
//! finished when every destination was flushed, every queued buffer was
//! sent, a sentinel arrived from every peer, and every receive task was
//! drained; the finish closes the fiber bracket.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use crossbeam_utils::CachePadded;
use tracing::debug;

use crate::comm::buffer::{BufferPool, CommChunk};
use crate::comm::{u32s_as_bytes, u32s_from_bytes, Tag};
use crate::error::{BfsError, Result};
use crate::fiber::{FiberScheduler, PRIORITY_RECV};
use crate::grid::{CommScope, GridContext};
use crate::params::{COMM_BUFFER_SIZE, PRE_ALLOCATE_COMM_BUFFER, SEND_BUFFER_LIMIT};

/// Which handler the exchange is running this level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Top-down fold: u32 packets over the column communicator.
    TopDown,
    /// Bottom-up predecessor pairs over the row communicator.
    BottomUp,
}

impl ExchangeKind {
    /// Message tag of this handler.
    pub fn tag(self) -> Tag {
        match self {
            ExchangeKind::TopDown => Tag::TopDownFold,
            ExchangeKind::BottomUp => Tag::BottomUpPred,
        }
    }

    /// Communicator this handler spans.
    pub fn scope(self) -> CommScope {
        match self {
            ExchangeKind::TopDown => CommScope::Col,
            ExchangeKind::BottomUp => CommScope::Row,
        }
    }
}

/// Receive callback: decoded words plus the sender's index within the
/// handler's communicator.
pub type ReceiverFn = Arc<dyn Fn(Vec<u32>, usize) + Send + Sync>;

#[derive(Clone)]
struct Plan {
    kind: ExchangeKind,
    receiver: ReceiverFn,
}

enum QueueItem {
    Data(Box<CommChunk>, usize),
    End,
}

const EPOCH_SHIFT: u32 = 40;
const OFFSET_MASK: u64 = (1 << EPOCH_SHIFT) - 1;

#[inline]
fn unpack(head: u64) -> (u64, usize) {
    (head >> EPOCH_SHIFT, (head & OFFSET_MASK) as usize)
}

struct DestState {
    head: AtomicU64,
    filled: AtomicUsize,
    cur: AtomicPtr<CommChunk>,
    rotate_mu: Mutex<()>,
    queue: Mutex<VecDeque<QueueItem>>,
    depth: AtomicUsize,
}

impl DestState {
    fn new() -> Self {
        Self {
            head: AtomicU64::new(0),
            filled: AtomicUsize::new(0),
            cur: AtomicPtr::new(Box::into_raw(CommChunk::new_boxed())),
            rotate_mu: Mutex::new(()),
            queue: Mutex::new(VecDeque::new()),
            depth: AtomicUsize::new(0),
        }
    }
}

impl Drop for DestState {
    fn drop(&mut self) {
        let p = self.cur.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if !p.is_null() {
            // SAFETY: the pointer came from Box::into_raw and is dropped once.
            drop(unsafe { Box::from_raw(p) });
        }
    }
}

struct ExchangeShared {
    ctx: GridContext,
    fiber: Arc<FiberScheduler>,
    pool: BufferPool,
    dests: Box<[CachePadded<DestState>]>,
    plan: Mutex<Option<Plan>>,
    ends_remaining: AtomicUsize,
    sends_unfinished: AtomicUsize,
    peers_remaining: AtomicUsize,
    recv_tasks: AtomicUsize,
    active: AtomicBool,
    wake: Sender<Cmd>,
}

enum Cmd {
    Wake,
    Shutdown,
}

impl ExchangeShared {
    /// Lock-free packet append; see the module docs for the protocol.
    fn send(&self, dst: usize, words: &[u32]) {
        debug_assert!(!words.is_empty() && words.len() <= COMM_BUFFER_SIZE);
        let d = &self.dests[dst];
        loop {
            let head = d.head.fetch_add(words.len() as u64, Ordering::AcqRel);
            let (epoch, start) = unpack(head);
            let end = start + words.len();
            if end <= COMM_BUFFER_SIZE {
                let chunk = d.cur.load(Ordering::Acquire);
                // SAFETY: the fetch_add granted us `start..end` in the
                // buffer current for `epoch`; rotation cannot retire it
                // until our filled bump lands.
                unsafe { (*chunk).write(start, words) };
                d.filled.fetch_add(words.len(), Ordering::Release);
                return;
            }
            if start <= COMM_BUFFER_SIZE {
                self.rotate(dst, epoch, start.min(COMM_BUFFER_SIZE));
            } else {
                self.stall(dst, epoch);
            }
        }
    }

    /// Waits, as the unique crossing reservation, for earlier writes to
    /// land, then publishes the buffer and opens the next epoch.
    fn rotate(&self, dst: usize, epoch: u64, len: usize) {
        let d = &self.dests[dst];
        let _guard = d.rotate_mu.lock().unwrap_or_else(|e| e.into_inner());
        debug_assert_eq!(unpack(d.head.load(Ordering::Acquire)).0, epoch);
        self.wait_filled(d, len);

        while d.depth.load(Ordering::Acquire) > SEND_BUFFER_LIMIT {
            if !self.fiber.process_one(PRIORITY_RECV) {
                std::hint::spin_loop();
            }
        }

        let fresh = Box::into_raw(self.pool.take());
        let old = d.cur.swap(fresh, Ordering::AcqRel);
        // SAFETY: `old` came from Box::into_raw; all reservations of its
        // epoch are complete and no producer can reach it past the swap.
        let old = unsafe { Box::from_raw(old) };
        {
            let mut q = d.queue.lock().unwrap_or_else(|e| e.into_inner());
            q.push_back(QueueItem::Data(old, len));
        }
        d.depth.fetch_add(1, Ordering::Release);
        self.sends_unfinished.fetch_add(1, Ordering::AcqRel);
        d.filled.store(0, Ordering::Relaxed);
        d.head
            .store((epoch + 1) << EPOCH_SHIFT, Ordering::Release);
        let _ = self.wake.send(Cmd::Wake);
    }

    fn wait_filled(&self, d: &DestState, target: usize) {
        while d.filled.load(Ordering::Acquire) != target {
            std::hint::spin_loop();
        }
    }

    /// A reservation past the capacity: wait out the rotation in progress,
    /// draining receive work instead of blocking.
    fn stall(&self, dst: usize, epoch: u64) {
        let d = &self.dests[dst];
        while unpack(d.head.load(Ordering::Acquire)).0 == epoch {
            if !self.fiber.process_one(PRIORITY_RECV) {
                std::hint::spin_loop();
            }
        }
    }

    /// Flushes the residual buffer for `dst` and queues the end-of-level
    /// sentinel. Callable only after every producer for this level has
    /// returned.
    fn send_end(&self, dst: usize) {
        let d = &self.dests[dst];
        let _guard = d.rotate_mu.lock().unwrap_or_else(|e| e.into_inner());
        let (epoch, reserved) = unpack(d.head.load(Ordering::Acquire));
        debug_assert!(reserved <= COMM_BUFFER_SIZE);
        if reserved > 0 {
            self.wait_filled(d, reserved);
            let fresh = Box::into_raw(self.pool.take());
            let old = d.cur.swap(fresh, Ordering::AcqRel);
            // SAFETY: as in `rotate`: quiesced and unreachable.
            let old = unsafe { Box::from_raw(old) };
            {
                let mut q = d.queue.lock().unwrap_or_else(|e| e.into_inner());
                q.push_back(QueueItem::Data(old, reserved));
            }
            d.depth.fetch_add(1, Ordering::Release);
            self.sends_unfinished.fetch_add(1, Ordering::AcqRel);
            d.filled.store(0, Ordering::Relaxed);
            d.head
                .store((epoch + 1) << EPOCH_SHIFT, Ordering::Release);
        }
        {
            let mut q = d.queue.lock().unwrap_or_else(|e| e.into_inner());
            q.push_back(QueueItem::End);
        }
        self.sends_unfinished.fetch_add(1, Ordering::AcqRel);
        self.ends_remaining.fetch_sub(1, Ordering::AcqRel);
        let _ = self.wake.send(Cmd::Wake);
    }

    fn recv_task_done(&self) {
        self.recv_tasks.fetch_sub(1, Ordering::AcqRel);
        self.maybe_finish();
    }

    fn maybe_finish(&self) {
        if self.ends_remaining.load(Ordering::Acquire) == 0
            && self.sends_unfinished.load(Ordering::Acquire) == 0
            && self.peers_remaining.load(Ordering::Acquire) == 0
            && self.recv_tasks.load(Ordering::Acquire) == 0
            && self
                .active
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            debug!(rank = self.ctx.rank, "exchange level finished");
            self.fiber.end_processing();
        }
    }
}

/// Cloneable producer handle, capturable by extraction jobs.
#[derive(Clone)]
pub struct ExchangeClient {
    shared: Arc<ExchangeShared>,
}

impl ExchangeClient {
    /// Appends `words` to the buffer headed for destination index `dst` of
    /// the active handler's communicator.
    pub fn send(&self, dst: usize, words: &[u32]) {
        self.shared.send(dst, words);
    }

    /// Flushes `dst` and marks this rank's stream to it complete.
    pub fn send_end(&self, dst: usize) {
        self.shared.send_end(dst);
    }
}

/// The per-rank exchange: owns the background progress thread.
pub struct AsyncExchange {
    shared: Arc<ExchangeShared>,
    thread: Option<JoinHandle<()>>,
}

impl AsyncExchange {
    /// Spawns the progress thread for `ctx`. Fails if the OS refuses the
    /// thread.
    pub fn new(ctx: GridContext, fiber: Arc<FiberScheduler>) -> Result<Self> {
        let comm_len = ctx.shape.rows().max(ctx.shape.cols());
        let (tx, rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(ExchangeShared {
            ctx,
            fiber,
            pool: BufferPool::new(PRE_ALLOCATE_COMM_BUFFER),
            dests: (0..comm_len)
                .map(|_| CachePadded::new(DestState::new()))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            plan: Mutex::new(None),
            ends_remaining: AtomicUsize::new(0),
            sends_unfinished: AtomicUsize::new(0),
            peers_remaining: AtomicUsize::new(0),
            recv_tasks: AtomicUsize::new(0),
            active: AtomicBool::new(false),
            wake: tx,
        });
        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name(format!("wavefront-comm-{}", thread_shared.ctx.rank))
            .spawn(move || progress_loop(&thread_shared, &rx))
            .map_err(|e| BfsError::Transport(format!("progress thread: {e}")))?;
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Producer handle.
    pub fn client(&self) -> ExchangeClient {
        ExchangeClient {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Arms the exchange for one level. The fiber bracket must already be
    /// open; it is closed again by the finish condition.
    pub fn begin_comm(&self, kind: ExchangeKind, receiver: ReceiverFn) {
        let shared = &self.shared;
        assert!(!shared.active.load(Ordering::Acquire));
        let peers = shared.ctx.comm_size(kind.scope());
        shared.ends_remaining.store(peers, Ordering::Release);
        shared.peers_remaining.store(peers, Ordering::Release);
        shared.sends_unfinished.store(0, Ordering::Release);
        shared.recv_tasks.store(0, Ordering::Release);
        *shared.plan.lock().unwrap_or_else(|e| e.into_inner()) = Some(Plan { kind, receiver });
        shared.active.store(true, Ordering::Release);
        let _ = shared.wake.send(Cmd::Wake);
    }

    /// Buffers allocated by this rank's pool so far.
    pub fn buffers_allocated(&self) -> usize {
        self.shared.pool.allocated()
    }
}

impl Drop for AsyncExchange {
    fn drop(&mut self) {
        let _ = self.shared.wake.send(Cmd::Shutdown);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

fn progress_loop(shared: &Arc<ExchangeShared>, rx: &Receiver<Cmd>) {
    loop {
        match rx.recv_timeout(Duration::from_micros(200)) {
            Ok(Cmd::Shutdown) => return,
            Ok(Cmd::Wake) | Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
        }
        let plan = shared
            .plan
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(plan) = plan else { continue };
        let tag = plan.kind.tag();
        let scope = plan.kind.scope();

        drain_sends(shared, tag, scope);

        while shared.active.load(Ordering::Acquire) {
            let Some(env) = shared.ctx.fabric.try_recv(shared.ctx.rank, None, tag) else {
                break;
            };
            if env.payload.is_empty() {
                shared.peers_remaining.fetch_sub(1, Ordering::AcqRel);
            } else {
                shared.recv_tasks.fetch_add(1, Ordering::AcqRel);
                let idx = sender_index(shared, scope, env.src);
                let receiver = Arc::clone(&plan.receiver);
                let task_shared = Arc::clone(shared);
                let payload = env.payload;
                shared.fiber.submit(
                    move || {
                        receiver(u32s_from_bytes(&payload), idx);
                        task_shared.recv_task_done();
                    },
                    PRIORITY_RECV,
                );
            }
        }
        shared.maybe_finish();
    }
}

fn sender_index(shared: &ExchangeShared, scope: CommScope, src: usize) -> usize {
    let (row, col) = shared.ctx.shape.coord_of(src);
    match scope {
        CommScope::Full => src,
        CommScope::Row => col as usize,
        CommScope::Col => row as usize,
    }
}

fn drain_sends(shared: &Arc<ExchangeShared>, tag: Tag, scope: CommScope) {
    for dst in 0..shared.ctx.comm_size(scope) {
        let d = &shared.dests[dst];
        loop {
            let item = {
                let mut q = d.queue.lock().unwrap_or_else(|e| e.into_inner());
                q.pop_front()
            };
            let Some(item) = item else { break };
            let peer = shared.ctx.peer_rank(scope, dst);
            let result = match item {
                QueueItem::Data(chunk, len) => {
                    d.depth.fetch_sub(1, Ordering::Release);
                    // SAFETY: the buffer was quiesced before it was queued.
                    let bytes = u32s_as_bytes(unsafe { chunk.filled_slice(len) }).to_vec();
                    let r = shared
                        .ctx
                        .fabric
                        .send(shared.ctx.rank, peer, tag, bytes);
                    shared.pool.put(chunk);
                    r
                }
                QueueItem::End => shared
                    .ctx
                    .fabric
                    .send(shared.ctx.rank, peer, tag, Vec::new()),
            };
            shared.sends_unfinished.fetch_sub(1, Ordering::AcqRel);
            if result.is_err() {
                // The fabric is aborting; stop pushing.
                return;
            }
        }
    }
    shared.maybe_finish();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::fabric::Fabric;
    use crate::grid::GridShape;

    fn single_rank() -> (GridContext, Arc<FiberScheduler>) {
        let shape = GridShape::new(1, 1).unwrap();
        let fabric = Fabric::new(shape);
        let ctx = GridContext::new(shape, 0, fabric, 2).unwrap();
        (ctx, Arc::new(FiberScheduler::new()))
    }

    #[test]
    fn round_trip_to_self() {
        let (ctx, fiber) = single_rank();
        let exchange = AsyncExchange::new(ctx, Arc::clone(&fiber)).unwrap();
        let got = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&got);

        fiber.begin_processing();
        exchange.begin_comm(
            ExchangeKind::TopDown,
            Arc::new(move |words, idx| {
                assert_eq!(idx, 0);
                sink.lock().unwrap().extend(words);
            }),
        );
        let client = exchange.client();
        client.send(0, &[1, 2, 3]);
        client.send(0, &[4, 5]);
        client.send_end(0);
        fiber.worker_loop();
        assert_eq!(*got.lock().unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn rotation_under_pressure_preserves_words() {
        let (ctx, fiber) = single_rank();
        let exchange = AsyncExchange::new(ctx, Arc::clone(&fiber)).unwrap();
        let total = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&total);

        fiber.begin_processing();
        exchange.begin_comm(
            ExchangeKind::TopDown,
            Arc::new(move |words, _| {
                sink.fetch_add(words.iter().map(|&w| w as usize).sum(), Ordering::Relaxed);
            }),
        );
        let client = exchange.client();
        // Enough to force several buffer rotations.
        let packet = vec![1u32; 1024];
        let packets = (COMM_BUFFER_SIZE / 1024) * 3 + 5;
        std::thread::scope(|s| {
            for _ in 0..4 {
                let c = client.clone();
                let p = packet.clone();
                s.spawn(move || {
                    for _ in 0..packets {
                        c.send(0, &p);
                    }
                });
            }
        });
        client.send_end(0);
        fiber.worker_loop();
        assert_eq!(total.load(Ordering::Relaxed), 4 * packets * 1024);
    }

    #[test]
    fn two_levels_reuse_the_exchange() {
        let (ctx, fiber) = single_rank();
        let exchange = AsyncExchange::new(ctx, Arc::clone(&fiber)).unwrap();
        for level in 0..2u32 {
            let seen = Arc::new(AtomicUsize::new(0));
            let sink = Arc::clone(&seen);
            fiber.begin_processing();
            exchange.begin_comm(
                ExchangeKind::BottomUp,
                Arc::new(move |words, _| {
                    sink.fetch_add(words.len(), Ordering::Relaxed);
                }),
            );
            let client = exchange.client();
            client.send(0, &[level, level]);
            client.send_end(0);
            fiber.worker_loop();
            assert_eq!(seen.load(Ordering::Relaxed), 2);
        }
    }
}
