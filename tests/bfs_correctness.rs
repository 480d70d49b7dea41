//! End-to-end BFS correctness on single-rank and 2x2 grids, checked
//! against a reference traversal and the validator.

mod common;

use common::{reference_depths, run_grid_bfs};
use wavefront::bfs::BfsConfig;
use wavefront::grid::GridShape;
use wavefront::harness::{generate_rmat_edges, sample_roots, validate_bfs};

const SCALE: u32 = 10;
const EDGE_FACTOR: u32 = 16;
const SEED: u64 = 0x0302;

fn rmat() -> Vec<(i64, i64)> {
    generate_rmat_edges(SCALE, EDGE_FACTOR, SEED)
}

#[test]
fn single_rank_matches_reference() {
    let edges = rmat();
    let n = 1i64 << SCALE;
    let shape = GridShape::new(1, 1).unwrap();
    let root = sample_roots(&edges, n, 1, SEED)[0];

    let run = run_grid_bfs(shape, &edges, SCALE, &BfsConfig::default(), root, 2);
    let got = run.depths(n);
    let want = reference_depths(&edges, n, root);
    assert_eq!(got, want);

    let stats = validate_bfs(&edges, shape, run.log_local, &run.preds, root).expect("valid");
    assert!(stats.reached > 1);
}

#[test]
fn grid_matches_single_rank() {
    let edges = rmat();
    let n = 1i64 << SCALE;
    let root = sample_roots(&edges, n, 1, SEED)[0];

    let single = run_grid_bfs(
        GridShape::new(1, 1).unwrap(),
        &edges,
        SCALE,
        &BfsConfig::default(),
        root,
        2,
    );
    let grid_shape = GridShape::new(2, 2).unwrap();
    let grid = run_grid_bfs(grid_shape, &edges, SCALE, &BfsConfig::default(), root, 2);

    // Parent choice may differ between partitions; the depth map may not.
    assert_eq!(single.depths(n), grid.depths(n));

    let s1 = validate_bfs(&edges, single.shape, single.log_local, &single.preds, root).unwrap();
    let s4 = validate_bfs(&edges, grid_shape, grid.log_local, &grid.preds, root).unwrap();
    assert_eq!(s1.edge_visit_count, s4.edge_visit_count);
    assert_eq!(s1.reached, s4.reached);
}

#[test]
fn wide_grid_matches_reference() {
    let edges = rmat();
    let n = 1i64 << SCALE;
    let root = sample_roots(&edges, n, 2, SEED)[1];
    let shape = GridShape::new(1, 2).unwrap();

    let run = run_grid_bfs(shape, &edges, SCALE, &BfsConfig::default(), root, 2);
    assert_eq!(run.depths(n), reference_depths(&edges, n, root));
    validate_bfs(&edges, shape, run.log_local, &run.preds, root).expect("valid");
}

#[test]
fn isolated_root_terminates_immediately() {
    // Vertex n-1 is touched by no edge: BFS from it must stop after one
    // level with only the root discovered and no other predecessor set.
    let n: i64 = 1 << SCALE;
    let isolated = n - 1;
    let edges: Vec<(i64, i64)> = (0..64).map(|v| (v, v + 1)).collect();
    let shape = GridShape::new(2, 2).unwrap();

    let run = run_grid_bfs(shape, &edges, SCALE, &BfsConfig::default(), isolated, 2);
    let depths = run.depths(n);
    assert_eq!(depths[isolated as usize], 0);
    assert_eq!(depths.iter().filter(|&&d| d >= 0).count(), 1);

    let stats = validate_bfs(&edges, shape, run.log_local, &run.preds, isolated).unwrap();
    assert_eq!(stats.reached, 1);
    assert_eq!(stats.edge_visit_count, 0);
}

#[test]
fn every_sampled_root_validates_on_the_grid() {
    let edges = rmat();
    let n = 1i64 << SCALE;
    let shape = GridShape::new(2, 2).unwrap();
    for root in sample_roots(&edges, n, 4, SEED ^ 1) {
        let run = run_grid_bfs(shape, &edges, SCALE, &BfsConfig::default(), root, 2);
        validate_bfs(&edges, shape, run.log_local, &run.preds, root).expect("valid");
        assert_eq!(run.depths(n), reference_depths(&edges, n, root));
    }
}
