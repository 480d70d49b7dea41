//! # `wavefront`: hybrid direction-optimizing BFS on a 2D process grid
//!
//! A Graph500-style breadth-first-search engine for very large undirected
//! graphs partitioned across an `R x C` grid of ranks. The hard core is
//! the per-level machinery: a twice-compressed CSR store with
//! column-sorted edge blocks, top-down and bottom-up search kernels, a
//! policy that switches direction as the frontier grows and shrinks, an
//! asynchronous all-to-all exchange that overlaps edge extraction with
//! communication, and the collective expand phases between levels.
//!
//! ## Architecture
//!
//! - One rank per grid cell; the in-process [`comm::fabric::Fabric`] runs
//!   every rank as a thread and implements the transport surface an MPI
//!   or RDMA backend would provide.
//! - Within a rank: a rayon worker pool, one background progress thread
//!   owned by [`comm::exchange::AsyncExchange`], and a [`fiber`] task
//!   queue that lets workers interleave receive processing with edge
//!   extraction.
//! - [`harness::run_benchmark`] drives the whole cycle: deterministic
//!   R-MAT generation, graph assembly, multi-root BFS with validation,
//!   and a resumable run log.
//!
//! ## Example
//!
//! ```no_run
//! use wavefront::grid::GridShape;
//! use wavefront::harness::{run_benchmark, BenchmarkConfig};
//!
//! let shape = GridShape::new(2, 2).unwrap();
//! let mut cfg = BenchmarkConfig::new(14, shape);
//! cfg.num_roots = 8;
//! let summary = run_benchmark(&cfg).unwrap();
//! println!("mean TEPS: {:.3e}", summary.mean_teps);
//! ```

#![warn(missing_docs, clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod bfs;
pub mod bitmap;
pub mod comm;
pub mod error;
pub mod fiber;
pub mod graph;
pub mod grid;
pub mod harness;
pub mod params;
pub mod pred;
pub mod runlog;

pub use bfs::{BfsConfig, BfsEngine, Direction};
pub use error::{BfsError, Result};
pub use graph::builder::{build_grid_graph, MemoryEdgeList};
pub use graph::CsrShard;
pub use grid::{GridContext, GridShape};
