//! The expand phase: inter-level collectives turning the distributed NQ
//! into the next CQ, in whichever representation the next direction
//! needs.
//!
//! - staying top-down: flatten the chunk bag into src-format ids and
//!   all-gather within the process row, so every rank replicates its
//!   row's frontier.
//! - top-down -> bottom-up: flatten in dst format, all-gather within the
//!   process column, OR into the shared-visited oracle. Only the current
//!   frontier is needed: anything visited earlier already relaxed its
//!   edges in the level it was current.
//! - staying bottom-up: with a large frontier, all-gather the whole local
//!   visited bitmap down the column into the oracle; with a small one,
//!   gather the NQ as a dst-format list and OR it in.
//! - bottom-up -> top-down: gather the NQ in src format within the row to
//!   rebuild the CQ list.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use rayon::prelude::*;

use crate::comm::Comm;
use crate::error::Result;
use crate::grid::CommScope;
use crate::params::GridVertex;

use super::state::BfsShared;

/// Local vertices newly visited this level: `visited & !visited_old`.
/// Valid after a bottom-up level, whose step boundary refreshed the
/// snapshot.
pub fn newly_visited_locals(shared: &BfsShared) -> Vec<GridVertex> {
    let old = shared.visited_old.lock().unwrap_or_else(|e| e.into_inner());
    let mut out = Vec::new();
    for (wi, &old_word) in old.words().iter().enumerate() {
        let mut fresh = shared.visited.load_word(wi, Ordering::Relaxed) & !old_word;
        while fresh != 0 {
            let bit = fresh.trailing_zeros() as usize;
            out.push((wi * 64 + bit) as GridVertex);
            fresh &= fresh - 1;
        }
    }
    out
}

/// NQ -> CQ, both in src format: all-gather over the process row.
pub fn top_down_expand(shared: &BfsShared, nq_locals: &[GridVertex]) -> Result<Vec<GridVertex>> {
    let lgl = shared.graph.log_local_verts();
    let high = (shared.ctx.col) << lgl;
    let send: Vec<GridVertex> = nq_locals.iter().map(|&l| l | high).collect();
    Comm::new(&shared.ctx, CommScope::Row).all_gather_v_u32(&send)
}

/// Top-down -> bottom-up switch: dst-format NQ down the column, OR'd into
/// the oracle.
pub fn top_down_switch_expand(shared: &Arc<BfsShared>, nq_locals: &[GridVertex]) -> Result<()> {
    let lgl = shared.graph.log_local_verts();
    let high = (shared.ctx.row) << lgl;
    let send: Vec<GridVertex> = nq_locals.iter().map(|&l| l | high).collect();
    let gathered = Comm::new(&shared.ctx, CommScope::Col).all_gather_v_u32(&send)?;
    or_into_shared_visited(shared, &gathered);
    Ok(())
}

/// Steady bottom-up, large frontier: replicate whole visited bitmaps down
/// the column.
pub fn bottom_up_expand_bitmap(shared: &BfsShared) -> Result<()> {
    let width = shared.graph.bitmap_width_local();
    let mut mine = vec![0u64; width];
    for (i, w) in mine.iter_mut().enumerate() {
        *w = shared.visited.load_word(i, Ordering::Relaxed);
    }
    let gathered = Comm::new(&shared.ctx, CommScope::Col).all_gather_words(&mine)?;
    debug_assert_eq!(gathered.len(), shared.shared_visited.len_words());
    for (i, &w) in gathered.iter().enumerate() {
        shared.shared_visited.store_word(i, w, Ordering::Relaxed);
    }
    Ok(())
}

/// Steady bottom-up, small frontier: gather the NQ as a dst-format list.
pub fn bottom_up_expand_list(shared: &Arc<BfsShared>, nq_locals: &[GridVertex]) -> Result<()> {
    top_down_switch_expand(shared, nq_locals)
}

/// Bottom-up -> top-down switch: rebuild the CQ list in src format over
/// the row.
pub fn bottom_up_switch_expand(
    shared: &BfsShared,
    nq_locals: &[GridVertex],
) -> Result<Vec<GridVertex>> {
    top_down_expand(shared, nq_locals)
}

fn or_into_shared_visited(shared: &Arc<BfsShared>, ids: &[GridVertex]) {
    let sv = &shared.shared_visited;
    shared.ctx.pool.install(|| {
        ids.par_iter().for_each(|&id| {
            sv.set_relaxed(id as usize);
        });
    });
}
