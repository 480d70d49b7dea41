//! The direction controller.
//!
//! Evaluated between levels, once the global next-queue size is known
//! from the all-reduce. A large frontier makes the unvisited side cheaper
//! to scan (switch to bottom-up); once the frontier shrinks against the
//! remaining unvisited set, switch back.

use crate::params::{BOTTOM_UP_BUFFER, DENOM_TO_BOTTOM_UP, DENOM_TO_TOP_DOWN, NBPE};

/// Search direction of one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Expand the frontier outward from the current queue.
    TopDown,
    /// Scan unvisited rows against the shared-visited oracle.
    BottomUp,
}

/// Representation of the bottom-up wavefront.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BottomUpVariant {
    /// Operate on the half-bitmap windows directly.
    Bitmap,
    /// Circulate compact lists of still-unvisited candidates.
    List,
}

/// Level-to-level switching policy.
#[derive(Debug, Clone)]
pub struct DirectionController {
    /// `alpha`: top-down -> bottom-up once `nq > verts / alpha`.
    pub denom_to_bottom_up: i64,
    /// `beta`: bottom-up -> top-down once `nq < (verts - visited) / beta`.
    pub denom_to_top_down: f64,
    /// Pin the direction regardless of the thresholds.
    pub force_direction: Option<Direction>,
    prev_global_nq: i64,
}

impl DirectionController {
    /// A controller with the given thresholds.
    pub fn new(denom_to_bottom_up: i64, denom_to_top_down: f64) -> Self {
        Self {
            denom_to_bottom_up,
            denom_to_top_down,
            force_direction: None,
            prev_global_nq: 0,
        }
    }

    /// Picks the direction for the next level.
    pub fn decide(
        &mut self,
        current: Direction,
        global_nq: i64,
        global_visited: i64,
        num_global_verts: i64,
    ) -> Direction {
        self.prev_global_nq = global_nq;
        if let Some(forced) = self.force_direction {
            return forced;
        }
        match current {
            Direction::TopDown => {
                if global_nq > num_global_verts / self.denom_to_bottom_up {
                    Direction::BottomUp
                } else {
                    Direction::TopDown
                }
            }
            Direction::BottomUp => {
                let unvisited = (num_global_verts - global_visited) as f64;
                if (global_nq as f64) < unvisited / self.denom_to_top_down {
                    Direction::TopDown
                } else {
                    Direction::BottomUp
                }
            }
        }
    }

    /// Global next-queue size of the previous level.
    pub fn prev_global_nq(&self) -> i64 {
        self.prev_global_nq
    }
}

impl Default for DirectionController {
    fn default() -> Self {
        Self::new(DENOM_TO_BOTTOM_UP, DENOM_TO_TOP_DOWN)
    }
}

/// Picks the bottom-up representation from the largest per-rank
/// next-queue size: lists pay off only while the frontier stays under
/// half a half-bitmap window's worth of vertices, capped by the window
/// buffers' list capacity.
pub fn choose_variant(max_nq_size: i64, bitmap_width_words: usize) -> BottomUpVariant {
    let half_window_verts = bitmap_width_words / 2 * NBPE / 2;
    let list_capacity = (half_window_verts * BOTTOM_UP_BUFFER) as i64;
    let threshold = (half_window_verts as i64).min(list_capacity);
    if max_nq_size > threshold {
        BottomUpVariant::Bitmap
    } else {
        BottomUpVariant::List
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switches_to_bottom_up_on_large_frontier() {
        let mut c = DirectionController::new(2, 2.0);
        let n = 1 << 20;
        assert_eq!(
            c.decide(Direction::TopDown, n / 2 + 1, n / 2, n),
            Direction::BottomUp
        );
        assert_eq!(c.decide(Direction::TopDown, 10, n / 2, n), Direction::TopDown);
    }

    #[test]
    fn switches_back_when_frontier_shrinks() {
        let mut c = DirectionController::new(2000, 2.0);
        let n = 1 << 20;
        // Most of the graph visited, small frontier: go top-down.
        assert_eq!(
            c.decide(Direction::BottomUp, 100, n - 1000, n),
            Direction::TopDown
        );
        // Frontier still comparable to the unvisited remainder: stay.
        assert_eq!(
            c.decide(Direction::BottomUp, n / 4, n / 2, n),
            Direction::BottomUp
        );
    }

    #[test]
    fn forced_direction_wins() {
        let mut c = DirectionController::new(2000, 2.0);
        c.force_direction = Some(Direction::TopDown);
        let n = 1 << 20;
        assert_eq!(
            c.decide(Direction::TopDown, n, 0, n),
            Direction::TopDown
        );
    }

    #[test]
    fn variant_tracks_frontier_size() {
        assert_eq!(choose_variant(1, 64), BottomUpVariant::List);
        assert_eq!(choose_variant(10_000, 64), BottomUpVariant::Bitmap);
    }

    #[test]
    fn variant_switches_at_half_window() {
        // 64 words -> 32-word half windows -> 1024-vertex threshold.
        assert_eq!(choose_variant(1024, 64), BottomUpVariant::List);
        assert_eq!(choose_variant(1025, 64), BottomUpVariant::Bitmap);
    }
}
