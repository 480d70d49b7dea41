//! The top-down kernel.
//!
//! Extraction jobs walk the current queue, emitting `(pred, target)`
//! packets to each target's owner row through the async exchange. A
//! change of source inside a packet is announced by a two-word header
//! (the bitwise NOT of the source id, high word first); receivers
//! reconstruct the packed predecessor from the header, the current level,
//! and the sender's position in the column communicator.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::comm::exchange::{AsyncExchange, ExchangeClient, ExchangeKind};
use crate::fiber::PRIORITY_EXTRACT;
use crate::params::{GridVertex, PACKET_LENGTH};
use crate::pred::{header_decode, header_words, is_header_word, UNVISITED};

use super::state::{BfsShared, Packet};

/// Runs one top-down level: submits extraction jobs over `cq`, lets the
/// worker pool drain extraction and receive work, and returns once the
/// exchange has finished the level.
pub fn run_level(shared: &Arc<BfsShared>, exchange: &AsyncExchange, cq: Arc<Vec<GridVertex>>, level: u16) {
    let client = exchange.client();
    let num_dest_rows = shared.ctx.shape.rows();

    exchange.begin_comm(ExchangeKind::TopDown, make_receiver(shared, level));

    let workers = shared.ctx.pool.current_num_threads();
    let num_jobs = (workers * 4).max(1).min(cq.len().max(1));
    shared
        .remaining_extract_jobs
        .store(num_jobs, Ordering::Release);

    let fiber = Arc::clone(&shared.fiber);
    let chunk = cq.len().div_ceil(num_jobs);
    for job in 0..num_jobs {
        let begin = (job * chunk).min(cq.len());
        let end = ((job + 1) * chunk).min(cq.len());
        let shared = Arc::clone(shared);
        let client = client.clone();
        let cq = Arc::clone(&cq);
        fiber.submit(
            move || {
                extract_range(&shared, &client, &cq[begin..end]);
                if shared
                    .remaining_extract_jobs
                    .fetch_sub(1, Ordering::AcqRel)
                    == 1
                {
                    submit_flush_jobs(&shared, &client, num_dest_rows);
                }
            },
            PRIORITY_EXTRACT,
        );
    }

    shared.ctx.pool.broadcast(|_| fiber.worker_loop());
}

/// Walks one slice of the current queue.
fn extract_range(shared: &BfsShared, client: &ExchangeClient, cq: &[GridVertex]) {
    let graph = &shared.graph;
    let lgl = graph.log_local_verts();
    let lmask = (1u32 << lgl) - 1;
    let widx = shared.worker_index();
    let mut packets = shared.worker_packets[widx]
        .lock()
        .unwrap_or_else(|e| e.into_inner());

    for &s in cq {
        if !graph.has_row(s) {
            continue;
        }
        let nz = graph.row_nz_index(s);
        graph.iterate_out_edges(s, nz, |t| {
            let dest = (t >> lgl) as usize;
            emit(client, &mut packets[dest], dest, s, t & lmask);
        });
    }
}

/// Appends one target under its source's header, flushing on overflow.
#[inline]
fn emit(client: &ExchangeClient, pk: &mut Packet, dest: usize, src: GridVertex, tgt_local: u32) {
    let need = if pk.cur_src == Some(src) { 1 } else { 3 };
    if pk.words.len() + need > PACKET_LENGTH {
        client.send(dest, &pk.words);
        pk.words.clear();
        pk.cur_src = None;
    }
    if pk.cur_src != Some(src) {
        let (hi, lo) = header_words(src);
        pk.words.push(hi);
        pk.words.push(lo);
        pk.cur_src = Some(src);
    }
    pk.words.push(tgt_local);
}

/// After the last extraction job: one flush job per destination row,
/// draining every worker's residual packet before the sentinel.
pub(super) fn submit_flush_jobs(shared: &Arc<BfsShared>, client: &ExchangeClient, num_dests: usize) {
    let fiber = Arc::clone(&shared.fiber);
    for dest in 0..num_dests {
        let shared = Arc::clone(shared);
        let client = client.clone();
        fiber.submit(
            move || {
                for slot in shared.worker_packets.iter() {
                    let mut packets = slot.lock().unwrap_or_else(|e| e.into_inner());
                    let pk = &mut packets[dest];
                    if !pk.words.is_empty() {
                        client.send(dest, &pk.words);
                        pk.words.clear();
                    }
                    pk.cur_src = None;
                }
                client.send_end(dest);
            },
            PRIORITY_EXTRACT,
        );
    }
}

/// Builds the receive-side decoder for one level.
fn make_receiver(
    shared: &Arc<BfsShared>,
    level: u16,
) -> Arc<dyn Fn(Vec<u32>, usize) + Send + Sync> {
    let shared = Arc::clone(shared);
    Arc::new(move |words: Vec<u32>, sender_row: usize| {
        let lgl = shared.graph.log_local_verts();
        let lmask = (1u32 << lgl) - 1;
        let mut cur_pred: i64 = UNVISITED;
        let mut i = 0;
        while i < words.len() {
            let w = words[i];
            if is_header_word(w) {
                if i + 1 >= words.len() {
                    break;
                }
                let src = header_decode(w, words[i + 1]);
                let src_col = src >> lgl;
                let src_local = src & lmask;
                cur_pred = shared
                    .layout
                    .encode(level, src_col, sender_row as u32, src_local);
                i += 2;
            } else {
                let local = w as usize;
                if shared.visited.test_and_set(local, Ordering::AcqRel) {
                    debug_assert!(cur_pred != UNVISITED, "target before any header");
                    debug_assert_eq!(shared.pred[local].load(Ordering::Relaxed), UNVISITED);
                    shared.pred[local].store(cur_pred, Ordering::Relaxed);
                    shared.push_nq(w);
                }
                i += 1;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_writes_header_once_per_source() {
        let mut pk = Packet {
            words: Vec::new(),
            cur_src: None,
        };
        // No client interaction below the packet limit; use a throwaway
        // exchange-free check of the header layout instead.
        let (hi, lo) = header_words(5);
        pk.words.push(hi);
        pk.words.push(lo);
        pk.cur_src = Some(5);
        assert!(is_header_word(pk.words[0]));
        assert_eq!(header_decode(pk.words[0], pk.words[1]), 5);
    }
}
