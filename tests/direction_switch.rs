//! Direction-switch and representation-switch equivalence: whatever mix
//! of kernels runs, the discovered set and depths must match a pure
//! top-down traversal.

mod common;

use common::{reference_depths, run_grid_bfs};
use wavefront::bfs::{BfsConfig, BottomUpVariant, Direction};
use wavefront::grid::GridShape;
use wavefront::harness::{generate_rmat_edges, sample_roots, validate_bfs};

const SCALE: u32 = 10;
const SEED: u64 = 0x0203;

fn hybrid_cfg(alpha: i64) -> BfsConfig {
    BfsConfig {
        denom_to_bottom_up: alpha,
        ..BfsConfig::default()
    }
}

fn forced_top_down() -> BfsConfig {
    BfsConfig {
        force_direction: Some(Direction::TopDown),
        ..BfsConfig::default()
    }
}

#[test]
fn eager_switch_matches_forced_top_down() {
    // alpha = 2 drags the engine into bottom-up as soon as the frontier
    // passes half the graph... in practice right after the hub levels.
    let edges = generate_rmat_edges(SCALE, 16, SEED);
    let n = 1i64 << SCALE;
    let shape = GridShape::new(2, 2).unwrap();
    let root = sample_roots(&edges, n, 1, SEED)[0];

    let hybrid = run_grid_bfs(shape, &edges, SCALE, &hybrid_cfg(2), root, 2);
    let reference = run_grid_bfs(shape, &edges, SCALE, &forced_top_down(), root, 2);

    assert_eq!(hybrid.depths(n), reference.depths(n));
    validate_bfs(&edges, shape, hybrid.log_local, &hybrid.preds, root).expect("hybrid valid");
    validate_bfs(&edges, shape, reference.log_local, &reference.preds, root)
        .expect("top-down valid");
}

#[test]
fn very_eager_switch_still_matches_reference() {
    // alpha large enough that any nontrivial frontier flips the
    // direction; depths must still agree with the oracle.
    let edges = generate_rmat_edges(SCALE, 16, SEED ^ 7);
    let n = 1i64 << SCALE;
    let shape = GridShape::new(2, 2).unwrap();
    let root = sample_roots(&edges, n, 1, SEED ^ 7)[0];

    let run = run_grid_bfs(shape, &edges, SCALE, &hybrid_cfg(1 << SCALE), root, 2);
    assert_eq!(run.depths(n), reference_depths(&edges, n, root));
}

#[test]
fn list_and_bitmap_variants_agree() {
    let edges = generate_rmat_edges(SCALE, 16, SEED ^ 21);
    let n = 1i64 << SCALE;
    let shape = GridShape::new(2, 2).unwrap();
    let root = sample_roots(&edges, n, 1, SEED ^ 21)[0];

    let mut list_cfg = hybrid_cfg(2);
    list_cfg.force_variant = Some(BottomUpVariant::List);
    let mut bitmap_cfg = hybrid_cfg(2);
    bitmap_cfg.force_variant = Some(BottomUpVariant::Bitmap);

    let with_list = run_grid_bfs(shape, &edges, SCALE, &list_cfg, root, 2);
    let with_bitmap = run_grid_bfs(shape, &edges, SCALE, &bitmap_cfg, root, 2);

    assert_eq!(with_list.depths(n), with_bitmap.depths(n));
    assert_eq!(with_list.depths(n), reference_depths(&edges, n, root));
    validate_bfs(&edges, shape, with_list.log_local, &with_list.preds, root).expect("list valid");
    validate_bfs(
        &edges,
        shape,
        with_bitmap.log_local,
        &with_bitmap.preds,
        root,
    )
    .expect("bitmap valid");
}

#[test]
fn single_rank_hybrid_matches_reference() {
    // The ring degenerates to self-sends on a 1x1 grid; the hybrid path
    // must still be exact.
    let edges = generate_rmat_edges(SCALE, 16, SEED ^ 99);
    let n = 1i64 << SCALE;
    let shape = GridShape::new(1, 1).unwrap();
    let root = sample_roots(&edges, n, 1, SEED ^ 99)[0];

    let run = run_grid_bfs(shape, &edges, SCALE, &hybrid_cfg(2), root, 2);
    assert_eq!(run.depths(n), reference_depths(&edges, n, root));
}
