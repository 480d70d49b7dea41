//! The 2D process grid.
//!
//! P ranks form an `R x C` grid, both sides powers of two. Every rank sees
//! three communicators: the full grid, its row (C peers), and its column
//! (R peers). The grid context is an explicit value handed to every
//! component; there is no process-wide mutable state.

use std::sync::Arc;

use crate::comm::fabric::Fabric;
use crate::error::{BfsError, Result};

/// Dimensions of the process grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridShape {
    log_rows: u32,
    log_cols: u32,
}

impl GridShape {
    /// Creates a shape from explicit side lengths.
    pub fn new(rows: usize, cols: usize) -> Result<Self> {
        if !rows.is_power_of_two() || !cols.is_power_of_two() {
            return Err(BfsError::GridShape { rows, cols });
        }
        Ok(Self {
            log_rows: rows.trailing_zeros(),
            log_cols: cols.trailing_zeros(),
        })
    }

    /// Factors a total rank count into the squarest `R <= C` grid.
    pub fn from_total(ranks: usize) -> Result<Self> {
        if !ranks.is_power_of_two() {
            return Err(BfsError::GridShape {
                rows: ranks,
                cols: 1,
            });
        }
        let log_total = ranks.trailing_zeros();
        let log_rows = log_total / 2;
        Ok(Self {
            log_rows,
            log_cols: log_total - log_rows,
        })
    }

    /// log2 of the row count.
    pub fn log_rows(&self) -> u32 {
        self.log_rows
    }

    /// log2 of the column count.
    pub fn log_cols(&self) -> u32 {
        self.log_cols
    }

    /// Number of grid rows (R).
    pub fn rows(&self) -> usize {
        1 << self.log_rows
    }

    /// Number of grid columns (C).
    pub fn cols(&self) -> usize {
        1 << self.log_cols
    }

    /// Total ranks (P).
    pub fn size(&self) -> usize {
        self.rows() * self.cols()
    }

    /// Rank id of the cell at `(row, col)`.
    #[inline]
    pub fn rank_of(&self, row: u32, col: u32) -> usize {
        (row as usize) * self.cols() + col as usize
    }

    /// Coordinates of a rank id.
    #[inline]
    pub fn coord_of(&self, rank: usize) -> (u32, u32) {
        ((rank / self.cols()) as u32, (rank % self.cols()) as u32)
    }
}

/// One of the three communicators every rank belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommScope {
    /// The full 2D grid; member index = rank id.
    Full,
    /// Ranks sharing this rank's grid row; member index = column.
    Row,
    /// Ranks sharing this rank's grid column; member index = row.
    Col,
}

/// A rank's view of the grid: its coordinates, the transport fabric, and
/// its worker pool.
#[derive(Clone)]
pub struct GridContext {
    /// Grid dimensions.
    pub shape: GridShape,
    /// This rank's grid row.
    pub row: u32,
    /// This rank's grid column.
    pub col: u32,
    /// This rank's id (`row * C + col`).
    pub rank: usize,
    /// The transport connecting all ranks.
    pub fabric: Arc<Fabric>,
    /// This rank's worker pool.
    pub pool: Arc<rayon::ThreadPool>,
}

impl GridContext {
    /// Builds the context for one rank.
    pub fn new(shape: GridShape, rank: usize, fabric: Arc<Fabric>, workers: usize) -> Result<Self> {
        let (row, col) = shape.coord_of(rank);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| BfsError::Transport(format!("worker pool: {e}")))?;
        Ok(Self {
            shape,
            row,
            col,
            rank,
            fabric,
            pool: Arc::new(pool),
        })
    }

    /// Number of members of `scope`.
    pub fn comm_size(&self, scope: CommScope) -> usize {
        match scope {
            CommScope::Full => self.shape.size(),
            CommScope::Row => self.shape.cols(),
            CommScope::Col => self.shape.rows(),
        }
    }

    /// This rank's member index within `scope`.
    pub fn comm_index(&self, scope: CommScope) -> usize {
        match scope {
            CommScope::Full => self.rank,
            CommScope::Row => self.col as usize,
            CommScope::Col => self.row as usize,
        }
    }

    /// Global rank of member `index` of `scope`.
    #[inline]
    pub fn peer_rank(&self, scope: CommScope, index: usize) -> usize {
        match scope {
            CommScope::Full => index,
            CommScope::Row => self.shape.rank_of(self.row, index as u32),
            CommScope::Col => self.shape.rank_of(index as u32, self.col),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_round_trips_ranks() {
        let s = GridShape::new(2, 4).unwrap();
        assert_eq!(s.size(), 8);
        for rank in 0..8 {
            let (r, c) = s.coord_of(rank);
            assert_eq!(s.rank_of(r, c), rank);
        }
    }

    #[test]
    fn from_total_prefers_wide() {
        let s = GridShape::from_total(8).unwrap();
        assert_eq!((s.rows(), s.cols()), (2, 4));
        let s1 = GridShape::from_total(1).unwrap();
        assert_eq!((s1.rows(), s1.cols()), (1, 1));
    }

    #[test]
    fn non_power_of_two_rejected() {
        assert!(GridShape::new(3, 2).is_err());
        assert!(GridShape::from_total(12).is_err());
    }
}
