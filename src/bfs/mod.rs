//! The hybrid direction-optimizing BFS engine.
//!
//! Per level: the direction controller picks a mode, the search kernel
//! scans the current queue and streams discoveries through the async
//! exchange, receivers update visited/pred/NQ, the global NQ size is
//! all-reduced (the level fence), and the expand phase materializes the
//! next current queue. The loop ends when the global NQ reaches zero.

pub mod bottom_up;
pub mod direction;
pub mod expand;
pub mod state;
pub mod top_down;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info};

use crate::comm::exchange::AsyncExchange;
use crate::comm::{Comm, ReduceOp};
use crate::error::Result;
use crate::fiber::FiberScheduler;
use crate::graph::CsrShard;
use crate::grid::{CommScope, GridContext};
use crate::params::{DENOM_TO_BOTTOM_UP, DENOM_TO_TOP_DOWN, GridVertex};
use crate::pred::UNVISITED;

pub use direction::{BottomUpVariant, Direction, DirectionController};
pub use state::BfsShared;

/// Tunables of one engine instance.
#[derive(Debug, Clone)]
pub struct BfsConfig {
    /// `alpha` of the direction policy.
    pub denom_to_bottom_up: i64,
    /// `beta` of the direction policy.
    pub denom_to_top_down: f64,
    /// Pin the search direction (testing and experiments).
    pub force_direction: Option<Direction>,
    /// Pin the bottom-up representation (testing and experiments).
    pub force_variant: Option<BottomUpVariant>,
}

impl Default for BfsConfig {
    fn default() -> Self {
        Self {
            denom_to_bottom_up: DENOM_TO_BOTTOM_UP,
            denom_to_top_down: DENOM_TO_TOP_DOWN,
            force_direction: None,
            force_variant: None,
        }
    }
}

/// Statistics of one BFS run on this rank.
#[derive(Debug, Clone, Default)]
pub struct BfsStats {
    /// Levels executed (depth of the tree plus one).
    pub levels: u16,
    /// Levels run bottom-up.
    pub bottom_up_levels: u16,
    /// Exchange buffers allocated by this rank.
    pub comm_buffers: usize,
}

/// One rank's BFS engine. Reusable across roots: `run` resets all
/// traversal state first.
pub struct BfsEngine {
    shared: Arc<BfsShared>,
    exchange: AsyncExchange,
    cfg: BfsConfig,
    num_global_verts: i64,
}

impl BfsEngine {
    /// Builds the engine for one rank. Fails if the exchange cannot start
    /// its progress thread.
    pub fn new(
        ctx: GridContext,
        graph: Arc<CsrShard>,
        num_global_verts: i64,
        cfg: BfsConfig,
    ) -> Result<Self> {
        let fiber = Arc::new(FiberScheduler::new());
        let shared = BfsShared::new(graph, ctx, Arc::clone(&fiber));
        let exchange = AsyncExchange::new(shared.ctx.clone(), fiber)?;
        Ok(Self {
            shared,
            exchange,
            cfg,
            num_global_verts,
        })
    }

    /// The state this engine drives (test and harness access).
    pub fn shared(&self) -> &Arc<BfsShared> {
        &self.shared
    }

    /// Runs BFS from `root` and returns this rank's packed predecessor
    /// array.
    pub fn run(&mut self, root: i64) -> Result<(Box<[i64]>, BfsStats)> {
        let shared = &self.shared;
        let ctx = &shared.ctx;
        let lgl = shared.graph.log_local_verts();
        shared.reset();

        let full = Comm::new(ctx, CommScope::Full);
        let mut controller =
            DirectionController::new(self.cfg.denom_to_bottom_up, self.cfg.denom_to_top_down);
        controller.force_direction = self.cfg.force_direction;
        let mut stats = BfsStats::default();

        // Level 0: the root discovers itself.
        let (root_row, root_col, root_local) = shared.layout.global_parts(root);
        let is_owner = root_row == ctx.row && root_col == ctx.col;
        if is_owner {
            shared.pred[root_local as usize].store(
                shared.layout.encode(0, root_col, root_row, root_local),
                Ordering::Relaxed,
            );
            shared.visited.test_and_set(root_local as usize, Ordering::AcqRel);
        }
        let mut global_nq = full.all_reduce_i64(ReduceOp::Sum, i64::from(is_owner))?;
        let mut global_visited = global_nq;
        let mut max_nq = global_nq;
        let mut direction = Direction::TopDown;
        let mut cq: Arc<Vec<GridVertex>> = {
            let send = if is_owner {
                vec![(root_col << lgl) | root_local]
            } else {
                Vec::new()
            };
            Arc::new(Comm::new(ctx, CommScope::Row).all_gather_v_u32(&send)?)
        };
        debug!(rank = ctx.rank, root, cq = cq.len(), "root expanded");

        let mut level: u16 = 0;
        loop {
            level += 1;
            shared.fiber.begin_processing();

            let nq_local = match direction {
                Direction::TopDown => {
                    top_down::run_level(shared, &self.exchange, Arc::clone(&cq), level);
                    shared.nq_count.swap(0, Ordering::AcqRel)
                }
                Direction::BottomUp => {
                    stats.bottom_up_levels += 1;
                    let variant = self
                        .cfg
                        .force_variant
                        .unwrap_or_else(|| {
                            direction::choose_variant(
                                max_nq,
                                shared.graph.bitmap_width_local(),
                            )
                        });
                    let outcome =
                        bottom_up::run_level(shared, &self.exchange, variant, level)?;
                    Comm::new(ctx, CommScope::Row).reduce_scatter_i64(&outcome.found_per_dest)?
                }
            };

            global_nq = full.all_reduce_i64(ReduceOp::Sum, nq_local)?;
            max_nq = full.all_reduce_i64(ReduceOp::Max, nq_local)?;
            global_visited += global_nq;
            if ctx.rank == 0 {
                info!(
                    level,
                    direction = ?direction,
                    global_nq,
                    visited_pct =
                        100.0 * global_visited as f64 / self.num_global_verts as f64,
                    "level complete"
                );
            }
            if global_nq == 0 {
                break;
            }

            let next = controller.decide(
                direction,
                global_nq,
                global_visited,
                self.num_global_verts,
            );
            cq = match (direction, next) {
                (Direction::TopDown, Direction::TopDown) => {
                    let nq = shared.flatten_nq();
                    Arc::new(expand::top_down_expand(shared, &nq)?)
                }
                (Direction::TopDown, Direction::BottomUp) => {
                    let nq = shared.flatten_nq();
                    expand::top_down_switch_expand(shared, &nq)?;
                    Arc::new(Vec::new())
                }
                (Direction::BottomUp, Direction::BottomUp) => {
                    let variant_next = self.cfg.force_variant.unwrap_or_else(|| {
                        direction::choose_variant(max_nq, shared.graph.bitmap_width_local())
                    });
                    match variant_next {
                        BottomUpVariant::Bitmap => expand::bottom_up_expand_bitmap(shared)?,
                        BottomUpVariant::List => {
                            let nq = expand::newly_visited_locals(shared);
                            expand::bottom_up_expand_list(shared, &nq)?;
                        }
                    }
                    Arc::new(Vec::new())
                }
                (Direction::BottomUp, Direction::TopDown) => {
                    let nq = expand::newly_visited_locals(shared);
                    Arc::new(expand::bottom_up_switch_expand(shared, &nq)?)
                }
            };
            direction = next;
        }

        stats.levels = level;
        stats.comm_buffers = self.exchange.buffers_allocated();
        let pred: Box<[i64]> = shared
            .pred
            .iter()
            .map(|p| p.load(Ordering::Relaxed))
            .collect();
        debug_assert!(pred.iter().filter(|&&p| p != UNVISITED).count() >= usize::from(is_owner));
        Ok((pred, stats))
    }
}
