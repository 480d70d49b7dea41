//! Transport layer: message tags, the in-process fabric, typed collective
//! wrappers, and the asynchronous all-to-all exchange.
//!
//! The engine core talks to an abstract transport: nonblocking tagged
//! point-to-point sends with completion polling, plus the collective set
//! (all-gather, all-gather-v, all-reduce, reduce-scatter, barrier). The
//! fabric in this crate runs every rank as a thread of one process; an MPI
//! or RDMA backend would sit behind the same surface.

pub mod buffer;
pub mod exchange;
pub mod fabric;

use zerocopy::{AsBytes, FromBytes};

use crate::error::Result;
use crate::grid::{CommScope, GridContext};

/// Message channels. Tags separate concurrent traffic classes; the
/// all-reduce fence between levels keeps reuse across levels safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    /// Top-down fold packets (u32 streams, column communicator).
    TopDownFold = 0,
    /// Bottom-up predecessor pairs (row communicator).
    BottomUpPred = 1,
    /// Bottom-up ring wave: half-bitmap words or candidate lists.
    BottomUpWave = 2,
}

/// A delivered message.
#[derive(Debug)]
pub struct Envelope {
    /// Global rank of the sender.
    pub src: usize,
    /// Channel the message arrived on.
    pub tag: Tag,
    /// Raw payload; empty for end-of-level sentinels.
    pub payload: Vec<u8>,
}

/// Reduction operators for [`Comm::all_reduce_i64`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    /// Arithmetic sum.
    Sum,
    /// Maximum.
    Max,
    /// Logical OR of nonzero-ness.
    LogicalOr,
}

/// Reinterprets a u32 slice as wire bytes.
pub fn u32s_as_bytes(words: &[u32]) -> &[u8] {
    words.as_bytes()
}

/// Reinterprets a u64 slice as wire bytes.
pub fn u64s_as_bytes(words: &[u64]) -> &[u8] {
    words.as_bytes()
}

/// Copies wire bytes back into u32 words. Trailing partial chunks cannot
/// occur for well-formed payloads and are dropped.
pub fn u32s_from_bytes(bytes: &[u8]) -> Vec<u32> {
    bytes.chunks_exact(4).filter_map(u32::read_from).collect()
}

/// Copies wire bytes back into u64 words.
pub fn u64s_from_bytes(bytes: &[u8]) -> Vec<u64> {
    bytes.chunks_exact(8).filter_map(u64::read_from).collect()
}

/// A rank's handle on one of its communicators.
#[derive(Clone, Copy)]
pub struct Comm<'a> {
    ctx: &'a GridContext,
    scope: CommScope,
}

impl<'a> Comm<'a> {
    /// Creates the handle for `scope` at this rank.
    pub fn new(ctx: &'a GridContext, scope: CommScope) -> Self {
        Self { ctx, scope }
    }

    /// Member count.
    pub fn size(&self) -> usize {
        self.ctx.comm_size(self.scope)
    }

    /// This rank's member index.
    pub fn index(&self) -> usize {
        self.ctx.comm_index(self.scope)
    }

    /// Global rank of member `index`.
    pub fn peer_rank(&self, index: usize) -> usize {
        self.ctx.peer_rank(self.scope, index)
    }

    /// Blocks until every member has arrived.
    pub fn barrier(&self) -> Result<()> {
        self.exchange(Vec::new()).map(|_| ())
    }

    /// Variable-count all-gather of u32 ids, concatenated in member order.
    pub fn all_gather_v_u32(&self, send: &[u32]) -> Result<Vec<u32>> {
        let parts = self.exchange(u32s_as_bytes(send).to_vec())?;
        let mut out = Vec::with_capacity(parts.iter().map(|p| p.len() / 4).sum());
        for part in parts.iter() {
            out.extend(u32s_from_bytes(part));
        }
        Ok(out)
    }

    /// Equal-count all-gather of bitmap words, concatenated in member
    /// order.
    pub fn all_gather_words(&self, send: &[u64]) -> Result<Vec<u64>> {
        let parts = self.exchange(u64s_as_bytes(send).to_vec())?;
        let mut out = Vec::with_capacity(parts.iter().map(|p| p.len() / 8).sum());
        for part in parts.iter() {
            out.extend(u64s_from_bytes(part));
        }
        Ok(out)
    }

    /// All-reduce of one i64.
    pub fn all_reduce_i64(&self, op: ReduceOp, value: i64) -> Result<i64> {
        let parts = self.exchange(value.to_ne_bytes().to_vec())?;
        let mut acc = match op {
            ReduceOp::Sum => 0,
            ReduceOp::Max => i64::MIN,
            ReduceOp::LogicalOr => 0,
        };
        for part in parts.iter() {
            let v = i64::read_from(part.as_slice()).unwrap_or(0);
            acc = match op {
                ReduceOp::Sum => acc + v,
                ReduceOp::Max => acc.max(v),
                ReduceOp::LogicalOr => i64::from(acc != 0 || v != 0),
            };
        }
        Ok(acc)
    }

    /// Reduce-scatter with one element per member: returns the sum over
    /// all members of their contribution slot for this rank.
    ///
    /// # Panics
    /// Panics if `contrib.len() != self.size()`.
    pub fn reduce_scatter_i64(&self, contrib: &[i64]) -> Result<i64> {
        assert_eq!(contrib.len(), self.size());
        let parts = self.exchange(contrib.as_bytes().to_vec())?;
        let my = self.index();
        let mut acc = 0i64;
        for part in parts.iter() {
            let vals: Vec<i64> = part
                .chunks_exact(8)
                .filter_map(i64::read_from)
                .collect();
            acc += vals.get(my).copied().unwrap_or(0);
        }
        Ok(acc)
    }

    fn exchange(&self, bytes: Vec<u8>) -> Result<std::sync::Arc<Vec<Vec<u8>>>> {
        self.ctx
            .fabric
            .collective_exchange(self.ctx, self.scope, bytes)
    }
}
