//! Run-log resume: an interrupted benchmark picks up after the recorded
//! roots and reproduces the same per-root edge counts as an
//! uninterrupted run.

use wavefront::grid::GridShape;
use wavefront::harness::{run_benchmark, BenchmarkConfig};

fn cfg(scale: u32, num_roots: usize, log: Option<std::path::PathBuf>) -> BenchmarkConfig {
    let shape = GridShape::new(2, 2).unwrap();
    let mut cfg = BenchmarkConfig::new(scale, shape);
    cfg.edge_factor = 8;
    cfg.num_roots = num_roots;
    cfg.workers_per_rank = 2;
    cfg.log_path = log;
    cfg
}

#[test]
fn resume_skips_completed_roots_and_matches() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("run.log");

    // Uninterrupted reference run, no log.
    let full = run_benchmark(&cfg(10, 6, None)).expect("full run");
    assert_eq!(full.results.len(), 6);

    // First invocation "dies" after 3 roots.
    let first = run_benchmark(&cfg(10, 3, Some(log_path.clone()))).expect("first half");
    assert_eq!(first.results.len(), 3);
    assert_eq!(first.resumed, 0);

    // Second invocation resumes from the log and finishes the rest.
    let second = run_benchmark(&cfg(10, 6, Some(log_path))).expect("second half");
    assert_eq!(second.resumed, 3);
    assert_eq!(second.results.len(), 3);

    // Per-root edge counts line up with the uninterrupted run.
    for (resumed, reference) in second.results.iter().zip(&full.results[3..]) {
        assert_eq!(resumed.root, reference.root);
        assert_eq!(resumed.times.edge_counts, reference.times.edge_counts);
    }
    for (done, reference) in first.results.iter().zip(&full.results[..3]) {
        assert_eq!(done.root, reference.root);
        assert_eq!(done.times.edge_counts, reference.times.edge_counts);
    }
}

#[test]
fn mismatched_log_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("run.log");
    run_benchmark(&cfg(10, 2, Some(log_path.clone()))).expect("seed log");
    let err = run_benchmark(&cfg(11, 2, Some(log_path))).unwrap_err();
    assert!(matches!(
        err,
        wavefront::BfsError::LogMismatch { field: "scale", .. }
    ));
}
