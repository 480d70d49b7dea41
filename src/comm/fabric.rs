//! In-process transport fabric.
//!
//! Every rank of the grid runs as a thread of one process. Point-to-point
//! messages go through per-rank mailboxes with MPI-style matching on
//! (source, tag); sends are eager and complete at the sender immediately.
//! Collectives are generation-counted rendezvous: each member deposits its
//! contribution, the last arrival publishes the round, and the last
//! departure recycles the slot for the next call.
//!
//! A fatal error on any rank raises the fabric-wide abort flag; every
//! blocked or future transport call on any rank then fails, which is the
//! in-process analog of aborting the full communicator.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crossbeam_utils::CachePadded;

use crate::comm::{Envelope, Tag};
use crate::error::{BfsError, Result};
use crate::grid::{CommScope, GridContext, GridShape};

struct Mailbox {
    queue: Mutex<VecDeque<Envelope>>,
    cv: Condvar,
}

impl Mailbox {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
        }
    }

    fn match_take(
        queue: &mut VecDeque<Envelope>,
        src: Option<usize>,
        tag: Tag,
    ) -> Option<Envelope> {
        let pos = queue
            .iter()
            .position(|e| e.tag == tag && src.map_or(true, |s| s == e.src))?;
        queue.remove(pos)
    }
}

struct Rendezvous {
    state: Mutex<RvState>,
    cv: Condvar,
}

struct RvState {
    members: usize,
    arrived: usize,
    departed: usize,
    slots: Vec<Option<Vec<u8>>>,
    result: Option<Arc<Vec<Vec<u8>>>>,
    generation: u64,
}

impl Rendezvous {
    fn new(members: usize) -> Self {
        Self {
            state: Mutex::new(RvState {
                members,
                arrived: 0,
                departed: 0,
                slots: (0..members).map(|_| None).collect(),
                result: None,
                generation: 0,
            }),
            cv: Condvar::new(),
        }
    }
}

/// The shared transport connecting all ranks of one grid.
pub struct Fabric {
    shape: GridShape,
    mailboxes: Box<[CachePadded<Mailbox>]>,
    full: Rendezvous,
    rows: Box<[Rendezvous]>,
    cols: Box<[Rendezvous]>,
    fatal: Mutex<Option<String>>,
}

impl Fabric {
    /// Creates the fabric for `shape`.
    pub fn new(shape: GridShape) -> Arc<Self> {
        let mailboxes = (0..shape.size())
            .map(|_| CachePadded::new(Mailbox::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let rows = (0..shape.rows())
            .map(|_| Rendezvous::new(shape.cols()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let cols = (0..shape.cols())
            .map(|_| Rendezvous::new(shape.rows()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Arc::new(Self {
            shape,
            mailboxes,
            full: Rendezvous::new(shape.size()),
            rows,
            cols,
            fatal: Mutex::new(None),
        })
    }

    /// Grid dimensions this fabric serves.
    pub fn shape(&self) -> GridShape {
        self.shape
    }

    /// Raises the fabric-wide abort flag and wakes every waiter.
    pub fn abort(&self, reason: &str) {
        {
            let mut f = self.fatal.lock().unwrap_or_else(|e| e.into_inner());
            if f.is_none() {
                *f = Some(reason.to_string());
            }
        }
        for mb in self.mailboxes.iter() {
            mb.cv.notify_all();
        }
        self.full.cv.notify_all();
        for r in self.rows.iter() {
            r.cv.notify_all();
        }
        for c in self.cols.iter() {
            c.cv.notify_all();
        }
    }

    /// Fails if any rank has aborted.
    pub fn check_fatal(&self) -> Result<()> {
        match &*self.fatal.lock().unwrap_or_else(|e| e.into_inner()) {
            Some(reason) => Err(BfsError::Transport(reason.clone())),
            None => Ok(()),
        }
    }

    /// Posts a message into `dst`'s mailbox. Eager: completion at the
    /// sender is immediate.
    pub fn send(&self, from: usize, dst: usize, tag: Tag, payload: Vec<u8>) -> Result<()> {
        self.check_fatal()?;
        let mb = &self.mailboxes[dst];
        let mut q = mb.queue.lock().unwrap_or_else(|e| e.into_inner());
        q.push_back(Envelope {
            src: from,
            tag,
            payload,
        });
        mb.cv.notify_all();
        Ok(())
    }

    /// Nonblocking matched receive at rank `at`.
    pub fn try_recv(&self, at: usize, src: Option<usize>, tag: Tag) -> Option<Envelope> {
        let mb = &self.mailboxes[at];
        let mut q = mb.queue.lock().unwrap_or_else(|e| e.into_inner());
        Mailbox::match_take(&mut q, src, tag)
    }

    /// Matched receive with a bounded wait. `Ok(None)` on timeout.
    pub fn recv_timeout(
        &self,
        at: usize,
        src: Option<usize>,
        tag: Tag,
        timeout: Duration,
    ) -> Result<Option<Envelope>> {
        self.check_fatal()?;
        let mb = &self.mailboxes[at];
        let mut q = mb.queue.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(env) = Mailbox::match_take(&mut q, src, tag) {
            return Ok(Some(env));
        }
        let (mut q, _) = mb
            .cv
            .wait_timeout(q, timeout)
            .unwrap_or_else(|e| e.into_inner());
        self.check_fatal()?;
        Ok(Mailbox::match_take(&mut q, src, tag))
    }

    /// Matched receive that waits until the message arrives or a rank
    /// aborts.
    pub fn recv_blocking(&self, at: usize, src: Option<usize>, tag: Tag) -> Result<Envelope> {
        loop {
            if let Some(env) = self.recv_timeout(at, src, tag, Duration::from_millis(5))? {
                return Ok(env);
            }
        }
    }

    fn rendezvous(&self, ctx: &GridContext, scope: CommScope) -> &Rendezvous {
        match scope {
            CommScope::Full => &self.full,
            CommScope::Row => &self.rows[ctx.row as usize],
            CommScope::Col => &self.cols[ctx.col as usize],
        }
    }

    /// One collective round on `scope`: deposits `bytes`, returns every
    /// member's contribution in member order. All typed collectives are
    /// built on this.
    pub fn collective_exchange(
        &self,
        ctx: &GridContext,
        scope: CommScope,
        bytes: Vec<u8>,
    ) -> Result<Arc<Vec<Vec<u8>>>> {
        let rv = self.rendezvous(ctx, scope);
        let my = ctx.comm_index(scope);
        let mut st = rv.state.lock().unwrap_or_else(|e| e.into_inner());

        // A previous round may still be draining; wait until it recycles.
        while st.result.is_some() {
            self.check_fatal()?;
            st = rv
                .cv
                .wait_timeout(st, Duration::from_millis(5))
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }

        let gen = st.generation;
        debug_assert!(st.slots[my].is_none());
        st.slots[my] = Some(bytes);
        st.arrived += 1;
        if st.arrived == st.members {
            let round: Vec<Vec<u8>> = st
                .slots
                .iter_mut()
                .map(|s| s.take().unwrap_or_default())
                .collect();
            st.result = Some(Arc::new(round));
            rv.cv.notify_all();
        } else {
            while st.generation == gen && st.result.is_none() {
                self.check_fatal()?;
                st = rv
                    .cv
                    .wait_timeout(st, Duration::from_millis(5))
                    .unwrap_or_else(|e| e.into_inner())
                    .0;
            }
        }

        let out = match &st.result {
            Some(r) => Arc::clone(r),
            None => return Err(BfsError::Transport("collective round lost".into())),
        };
        st.departed += 1;
        if st.departed == st.members {
            st.result = None;
            st.arrived = 0;
            st.departed = 0;
            st.generation += 1;
            rv.cv.notify_all();
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{Comm, ReduceOp};

    fn contexts(rows: usize, cols: usize) -> Vec<GridContext> {
        let shape = GridShape::new(rows, cols).unwrap();
        let fabric = Fabric::new(shape);
        (0..shape.size())
            .map(|r| GridContext::new(shape, r, Arc::clone(&fabric), 1).unwrap())
            .collect()
    }

    #[test]
    fn point_to_point_matches_src_and_tag() {
        let ctxs = contexts(1, 2);
        let fabric = &ctxs[0].fabric;
        fabric
            .send(1, 0, Tag::TopDownFold, vec![1, 2, 3])
            .unwrap();
        fabric.send(1, 0, Tag::BottomUpWave, vec![9]).unwrap();
        assert!(fabric.try_recv(0, Some(0), Tag::TopDownFold).is_none());
        let env = fabric.try_recv(0, Some(1), Tag::BottomUpWave).unwrap();
        assert_eq!(env.payload, vec![9]);
        let env = fabric.try_recv(0, None, Tag::TopDownFold).unwrap();
        assert_eq!(env.src, 1);
        assert_eq!(env.payload, vec![1, 2, 3]);
    }

    #[test]
    fn self_send_is_delivered() {
        let ctxs = contexts(1, 1);
        let fabric = &ctxs[0].fabric;
        fabric.send(0, 0, Tag::BottomUpWave, vec![7]).unwrap();
        let env = fabric.recv_blocking(0, Some(0), Tag::BottomUpWave).unwrap();
        assert_eq!(env.payload, vec![7]);
    }

    #[test]
    fn collectives_across_threads() {
        let ctxs = contexts(2, 2);
        let results: Vec<(Vec<u32>, i64, i64)> = std::thread::scope(|s| {
            let handles: Vec<_> = ctxs
                .iter()
                .map(|ctx| {
                    s.spawn(move || {
                        let full = Comm::new(ctx, CommScope::Full);
                        let gathered = full
                            .all_gather_v_u32(&[ctx.rank as u32; 2])
                            .unwrap();
                        let sum = full.all_reduce_i64(ReduceOp::Sum, ctx.rank as i64).unwrap();
                        let any = full
                            .all_reduce_i64(ReduceOp::LogicalOr, i64::from(ctx.rank == 2))
                            .unwrap();
                        assert_eq!(any, 1);
                        let max = full.all_reduce_i64(ReduceOp::Max, ctx.rank as i64).unwrap();
                        assert_eq!(max, 3);
                        let contrib = vec![ctx.rank as i64; 4];
                        let rs = full.reduce_scatter_i64(&contrib).unwrap();
                        (gathered, sum, rs)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for (gathered, sum, rs) in results {
            assert_eq!(gathered, vec![0, 0, 1, 1, 2, 2, 3, 3]);
            assert_eq!(sum, 6);
            // Every rank contributes its own id to every slot.
            assert_eq!(rs, 6);
        }
    }

    #[test]
    fn row_collectives_are_disjoint() {
        let ctxs = contexts(2, 2);
        let results: Vec<Vec<u32>> = std::thread::scope(|s| {
            let handles: Vec<_> = ctxs
                .iter()
                .map(|ctx| {
                    s.spawn(move || {
                        let row = Comm::new(ctx, CommScope::Row);
                        row.all_gather_v_u32(&[ctx.rank as u32]).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(results[0], vec![0, 1]);
        assert_eq!(results[1], vec![0, 1]);
        assert_eq!(results[2], vec![2, 3]);
        assert_eq!(results[3], vec![2, 3]);
    }

    #[test]
    fn abort_propagates() {
        let ctxs = contexts(1, 2);
        ctxs[0].fabric.abort("unit test abort");
        assert!(ctxs[1].fabric.check_fatal().is_err());
        assert!(ctxs[1]
            .fabric
            .send(1, 0, Tag::TopDownFold, vec![])
            .is_err());
    }
}
