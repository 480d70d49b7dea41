//! The bottom-up kernel.
//!
//! A level runs in `2 * C` phases arranged as a ring across the process
//! row. The row-wide visited state is split into half-bitmap windows that
//! circulate right-to-left; each rank scans the window it holds for
//! unvisited rows, probes their stored neighbors against the
//! shared-visited oracle, and marks a hit directly in the circulating
//! window, so a vertex is discovered at most once around the ring. The
//! `(pred, target)` pair streams out to the target's owner column while
//! the ring keeps moving; after the last phase each rank's own windows
//! return home and become its new visited bitmap.
//!
//! The list variant circulates compact candidate lists instead of bitmap
//! windows once the frontier is small; each rank removes what it
//! discovered and forwards the shrunken list.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use rayon::prelude::*;
use tracing::trace;

use crate::comm::exchange::{AsyncExchange, ExchangeClient, ExchangeKind};
use crate::comm::{u32s_as_bytes, u32s_from_bytes, u64s_as_bytes, u64s_from_bytes, Tag};
use crate::error::{BfsError, Result};
use crate::params::{
    BitmapWord, GridVertex, SortIdx, BFELL_SORT, BOTTOM_UP_BUFFER, LOG_BFELL_SORT, NBPE,
    PACKET_LENGTH, WORDS_PER_BLOCK,
};
use crate::pred::UNVISITED;

use super::direction::BottomUpVariant;
use super::state::BfsShared;

/// Outcome of one bottom-up level on this rank.
pub struct BottomUpOutcome {
    /// Discoveries this rank made, bucketed by the target's owner column.
    pub found_per_dest: Vec<i64>,
}

/// Runs one bottom-up level and returns the per-destination discovery
/// counts (reduce-scattered by the caller into this rank's NQ size).
pub fn run_level(
    shared: &Arc<BfsShared>,
    exchange: &AsyncExchange,
    variant: BottomUpVariant,
    level: u16,
) -> Result<BottomUpOutcome> {
    shared.swap_visited();
    let client = exchange.client();
    exchange.begin_comm(ExchangeKind::BottomUp, make_pred_receiver(shared, level));

    let cols = shared.ctx.shape.cols();
    let outcome = match variant {
        BottomUpVariant::Bitmap => ring_bitmap(shared, &client)?,
        BottomUpVariant::List => ring_list(shared, &client)?,
    };

    // Flush residual pairs and close every stream, then drain receive
    // work until the exchange finishes the level.
    for dest in 0..cols {
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
    }
    let fiber = Arc::clone(&shared.fiber);
    shared.ctx.pool.broadcast(|_| fiber.worker_loop());
    Ok(outcome)
}

fn ring_neighbors(shared: &BfsShared) -> (usize, usize) {
    let shape = shared.ctx.shape;
    let c = shared.ctx.col as usize;
    let cols = shape.cols();
    let left = shape.rank_of(shared.ctx.row, ((c + cols - 1) % cols) as u32);
    let right = shape.rank_of(shared.ctx.row, ((c + 1) % cols) as u32);
    (left, right)
}

/// Bitmap variant: the windows are raw half-bitmaps of the row-wide
/// visited state.
fn ring_bitmap(shared: &Arc<BfsShared>, client: &ExchangeClient) -> Result<BottomUpOutcome> {
    let ctx = &shared.ctx;
    let cols = ctx.shape.cols();
    let total_phases = 2 * cols;
    let half_words = shared.graph.bitmap_width_local() / 2;
    let (left, right) = ring_neighbors(shared);
    let mut found = vec![0i64; cols];

    let mut slots: Vec<Vec<BitmapWord>> = vec![Vec::new(); BOTTOM_UP_BUFFER.min(total_phases + 2)];
    let nbuf = slots.len();
    for half in 0..2 {
        let mut words = vec![0u64; half_words];
        for (i, w) in words.iter_mut().enumerate() {
            *w = shared.visited.load_word(half * half_words + i, Ordering::Relaxed);
        }
        slots[half] = words;
    }

    for phase in 0..total_phases {
        if phase >= 2 {
            let env = ctx
                .fabric
                .recv_blocking(ctx.rank, Some(right), Tag::BottomUpWave)?;
            slots[phase % nbuf] = u64s_from_bytes(&env.payload);
        }
        let window_off_words =
            ((2 * ctx.col as usize + phase) % total_phases) * half_words;
        let mut window = std::mem::take(&mut slots[phase % nbuf]);
        let discovered = process_window_bitmap(shared, client, &mut window, window_off_words, &mut found);
        trace!(rank = ctx.rank, phase, discovered, "bottom-up bitmap step");
        ctx.fabric
            .send(ctx.rank, left, Tag::BottomUpWave, u64s_as_bytes(&window).to_vec())?;
        slots[phase % nbuf] = window;
    }

    // The two home windows complete the ring and become the new visited.
    for half in 0..2 {
        let env = ctx
            .fabric
            .recv_blocking(ctx.rank, Some(right), Tag::BottomUpWave)?;
        let words = u64s_from_bytes(&env.payload);
        if words.len() != half_words {
            return Err(BfsError::Transport(format!(
                "wave window size {} != {}",
                words.len(),
                half_words
            )));
        }
        for (i, &w) in words.iter().enumerate() {
            shared
                .visited
                .store_word(half * half_words + i, w, Ordering::Relaxed);
        }
    }
    Ok(BottomUpOutcome {
        found_per_dest: found,
    })
}

/// List variant: windows travel as candidate lists of still-unvisited
/// rows; discoveries are removed before forwarding.
fn ring_list(shared: &Arc<BfsShared>, client: &ExchangeClient) -> Result<BottomUpOutcome> {
    let ctx = &shared.ctx;
    let cols = ctx.shape.cols();
    let total_phases = 2 * cols;
    let half_words = shared.graph.bitmap_width_local() / 2;
    let half_bits = half_words * NBPE;
    let (left, right) = ring_neighbors(shared);
    let mut found = vec![0i64; cols];

    // Seed this rank's two windows: rows with edges, not yet visited.
    let my_base = (ctx.col as usize) << shared.graph.log_local_verts();
    let mut seeds: Vec<Vec<GridVertex>> = Vec::with_capacity(2);
    for half in 0..2 {
        let mut list = Vec::new();
        for bit in 0..half_bits {
            let local = half * half_bits + bit;
            let row = (my_base + local) as GridVertex;
            if shared.graph.has_row(row) && !shared.visited.is_set(local) {
                list.push(row);
            }
        }
        seeds.push(list);
    }

    let mut slots: Vec<Vec<GridVertex>> = vec![Vec::new(); BOTTOM_UP_BUFFER.min(total_phases + 2)];
    let nbuf = slots.len();
    slots[0] = seeds.remove(0);
    slots[1] = seeds.remove(0);

    for phase in 0..total_phases {
        if phase >= 2 {
            let env = ctx
                .fabric
                .recv_blocking(ctx.rank, Some(right), Tag::BottomUpWave)?;
            slots[phase % nbuf] = u32s_from_bytes(&env.payload);
        }
        let list = std::mem::take(&mut slots[phase % nbuf]);
        let survivors = shared
            .ctx
            .pool
            .install(|| process_window_list(shared, client, &list, &mut found));
        trace!(
            rank = ctx.rank,
            phase,
            before = list.len(),
            after = survivors.len(),
            "bottom-up list step"
        );
        ctx.fabric.send(
            ctx.rank,
            left,
            Tag::BottomUpWave,
            u32s_as_bytes(&survivors).to_vec(),
        )?;
        slots[phase % nbuf] = survivors;
    }

    // Discoveries of this rank's own vertices arrived (or are arriving)
    // through the predecessor stream; the receiver sets the visited bits,
    // so the returning survivor lists only need to be consumed.
    for _ in 0..2 {
        let _ = ctx
            .fabric
            .recv_blocking(ctx.rank, Some(right), Tag::BottomUpWave)?;
    }
    Ok(BottomUpOutcome {
        found_per_dest: found,
    })
}

/// One ACTIVE row mid-scan: its bit inside the block and its sorted
/// position.
#[derive(Clone, Copy, Default)]
struct ActiveRow {
    orig: u16,
    sorted: SortIdx,
}

/// Scans one bitmap window; returns the number of discoveries.
fn process_window_bitmap(
    shared: &Arc<BfsShared>,
    client: &ExchangeClient,
    window: &mut [BitmapWord],
    window_off_words: usize,
    found: &mut [i64],
) -> i64 {
    let block_base = window_off_words / WORDS_PER_BLOCK;
    let ndest = found.len();
    let per_block: Vec<Vec<i64>> = shared.ctx.pool.install(|| {
        window
            .par_chunks_mut(WORDS_PER_BLOCK)
            .enumerate()
            .map(|(bi, blk_bits)| {
                let mut counts = vec![0i64; ndest];
                process_block(shared, client, blk_bits, block_base + bi, &mut counts);
                counts
            })
            .collect()
    });
    let mut total = 0;
    for counts in per_block {
        for (f, c) in found.iter_mut().zip(counts) {
            *f += c;
            total += c;
        }
    }
    total
}

/// The block scan shared by both variants: column-by-column over the
/// degree-sorted rows, ending each row at its first reachable neighbor or
/// at exhaustion.
fn scan_rows(
    shared: &BfsShared,
    client: &ExchangeClient,
    block: usize,
    rows: &mut [ActiveRow],
    mut on_hit: impl FnMut(u16),
    counts: &mut [i64],
) {
    let graph = &shared.graph;
    let blk = graph.block(block);
    let lgl = graph.log_local_verts();
    let widx = shared.worker_index();
    let mut packets = shared.worker_packets[widx]
        .lock()
        .unwrap_or_else(|e| e.into_inner());

    let mut n = rows.len();
    let mut offset = 0usize;
    let mut c = 0usize;
    while n > 0 {
        let len = blk.col_len[c];
        let next_len = blk.col_len[c + 1];
        let mut i = n;
        while i > 0 {
            i -= 1;
            let s = rows[i].sorted;
            debug_assert!(s < len);
            let src = blk.edges[offset + s as usize];
            if shared.shared_visited.is_set(src as usize) {
                let orig = rows[i].orig;
                let tgt = (block * BFELL_SORT + orig as usize) as GridVertex;
                let dest = (tgt >> lgl) as usize;
                let pk = &mut packets[dest];
                if pk.words.len() + 2 > PACKET_LENGTH {
                    client.send(dest, &pk.words);
                    pk.words.clear();
                }
                pk.words.push(src);
                pk.words.push(tgt);
                counts[dest] += 1;
                on_hit(orig);
                n -= 1;
                rows[i] = rows[n];
            } else if s >= next_len {
                n -= 1;
                rows[i] = rows[n];
            }
        }
        offset += len as usize;
        c += 1;
    }
}

/// Gathers and scans the unvisited rows of one block of a bitmap window.
fn process_block(
    shared: &Arc<BfsShared>,
    client: &ExchangeClient,
    blk_bits: &mut [BitmapWord],
    block: usize,
    counts: &mut [i64],
) {
    let graph = &shared.graph;
    let base_word = block * WORDS_PER_BLOCK;
    let mut rows = [ActiveRow::default(); BFELL_SORT];
    let mut n = 0usize;
    for (wi, &bits) in blk_bits.iter().enumerate() {
        let row_word = graph.row_bitmap()[base_word + wi];
        let mut unvis = !bits & row_word;
        let sums = graph.row_sums()[base_word + wi] as usize;
        while unvis != 0 {
            let bit = unvis.trailing_zeros() as usize;
            let below = (1u64 << bit) - 1;
            let nz = sums + (row_word & below).count_ones() as usize;
            rows[n] = ActiveRow {
                orig: (wi * NBPE + bit) as u16,
                sorted: graph.sorted_idx()[nz],
            };
            n += 1;
            unvis &= unvis - 1;
        }
    }
    let (active, _) = rows.split_at_mut(n);
    scan_rows(shared, client, block, active, |orig| {
        blk_bits[orig as usize / NBPE] |= 1u64 << (orig as usize % NBPE);
    }, counts);
}

/// Scans one candidate list; returns the rows that stayed unvisited.
fn process_window_list(
    shared: &Arc<BfsShared>,
    client: &ExchangeClient,
    list: &[GridVertex],
    found: &mut [i64],
) -> Vec<GridVertex> {
    let graph = &shared.graph;
    let mut survivors = Vec::with_capacity(list.len());
    let mut i = 0usize;
    while i < list.len() {
        let block = (list[i] as usize) >> LOG_BFELL_SORT;
        let begin = i;
        while i < list.len() && (list[i] as usize) >> LOG_BFELL_SORT == block {
            i += 1;
        }
        let group = &list[begin..i];

        let mut rows = [ActiveRow::default(); BFELL_SORT];
        let mut dropped = [false; BFELL_SORT];
        for (k, &row) in group.iter().enumerate() {
            rows[k] = ActiveRow {
                orig: (row as usize & (BFELL_SORT - 1)) as u16,
                sorted: graph.sorted_idx()[graph.row_nz_index(row)],
            };
            debug_assert!(!dropped[k]);
        }
        let orig_to_slot: Vec<u16> = group
            .iter()
            .map(|&row| (row as usize & (BFELL_SORT - 1)) as u16)
            .collect();
        let (active, _) = rows.split_at_mut(group.len());
        scan_rows(
            shared,
            client,
            block,
            active,
            |orig| {
                if let Some(slot) = orig_to_slot.iter().position(|&o| o == orig) {
                    dropped[slot] = true;
                }
            },
            found,
        );
        for (k, &row) in group.iter().enumerate() {
            if !dropped[k] {
                survivors.push(row);
            }
        }
    }
    survivors
}

/// Builds the predecessor-pair decoder for one level. Pairs arrive as
/// `(src, tgt)`: the parent in the sender's target space, the discovered
/// vertex as one of this rank's row-space ids.
fn make_pred_receiver(
    shared: &Arc<BfsShared>,
    level: u16,
) -> Arc<dyn Fn(Vec<u32>, usize) + Send + Sync> {
    let shared = Arc::clone(shared);
    Arc::new(move |words: Vec<u32>, sender_col: usize| {
        let lgl = shared.graph.log_local_verts();
        let lmask = (1u32 << lgl) - 1;
        for pair in words.chunks_exact(2) {
            let src = pair[0];
            let tgt = pair[1];
            debug_assert_eq!((tgt >> lgl) as usize, shared.ctx.col as usize);
            let local = (tgt & lmask) as usize;
            let parent_row = src >> lgl;
            let parent_local = src & lmask;
            let encoded =
                shared
                    .layout
                    .encode(level, sender_col as u32, parent_row, parent_local);
            // The ring serializes window ownership: each vertex is
            // discovered at most once, so the slot must still be empty.
            debug_assert_eq!(shared.pred[local].load(Ordering::Relaxed), UNVISITED);
            shared.pred[local].store(encoded, Ordering::Relaxed);
            shared.visited.test_and_set(local, Ordering::AcqRel);
        }
    })
}
