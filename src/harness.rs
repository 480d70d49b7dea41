//! The multi-root benchmark driver.
//!
//! Builds the graph once, samples roots deterministically, runs BFS per
//! root across all ranks (each rank a thread over the in-process fabric),
//! validates every result against the edge list, and appends to the run
//! log so an interrupted invocation resumes where it stopped.
//!
//! The R-MAT generator and the validator here stand in for the external
//! generation and validation collaborators of a full deployment; both are
//! deterministic for a fixed `(scale, edgefactor, seed)` so resumed runs
//! reproduce per-root edge counts.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use crate::bfs::{BfsConfig, BfsEngine};
use crate::comm::fabric::Fabric;
use crate::error::{BfsError, Result};
use crate::graph::builder::{build_grid_graph, BuiltGraph, EdgeSink, FileEdgeList, MemoryEdgeList};
use crate::grid::{GridContext, GridShape};
use crate::params::{
    COMM_BUFFER_SIZE, NUM_BFS_ROOTS, PACKET_LENGTH, SEND_BUFFER_LIMIT, USERSEED1, USERSEED2,
};
use crate::pred::{PredLayout, UNVISITED};
use crate::runlog::{RootTimes, RunLog};

/// Environment variable naming the optional edge spill file.
pub const TMPFILE_ENV: &str = "TMPFILE";

/// R-MAT partition probabilities of the reference generator.
const RMAT_A: f64 = 0.57;
const RMAT_B: f64 = 0.19;
const RMAT_C: f64 = 0.19;

/// Benchmark parameters.
#[derive(Debug, Clone)]
pub struct BenchmarkConfig {
    /// log2 of the global vertex count.
    pub scale: u32,
    /// Edges generated per vertex.
    pub edge_factor: u32,
    /// Grid to partition over.
    pub shape: GridShape,
    /// Worker threads per rank.
    pub workers_per_rank: usize,
    /// Roots to run (at most [`NUM_BFS_ROOTS`]).
    pub num_roots: usize,
    /// Engine tunables.
    pub bfs: BfsConfig,
    /// Log path override; `None` consults `LOGFILE`.
    pub log_path: Option<PathBuf>,
}

impl BenchmarkConfig {
    /// A config with conventional defaults for `scale` on `shape`.
    pub fn new(scale: u32, shape: GridShape) -> Self {
        Self {
            scale,
            edge_factor: 16,
            shape,
            workers_per_rank: (num_cpus::get() / shape.size().max(1)).clamp(1, 4),
            num_roots: NUM_BFS_ROOTS,
            bfs: BfsConfig::default(),
            log_path: None,
        }
    }
}

/// Result of one validated root.
#[derive(Debug, Clone)]
pub struct RootResult {
    /// The starting vertex.
    pub root: i64,
    /// Measured times and traversed edges.
    pub times: RootTimes,
    /// Vertices reached from the root.
    pub reached: i64,
}

/// Aggregate outcome of a benchmark invocation.
#[derive(Debug)]
pub struct BenchmarkSummary {
    /// Every root completed in this invocation (resumed roots excluded).
    pub results: Vec<RootResult>,
    /// Roots skipped by log resume.
    pub resumed: usize,
    /// Mean traversed-edges-per-second over completed roots.
    pub mean_teps: f64,
}

/// Generates the undirected R-MAT edge list of the benchmark.
pub fn generate_rmat_edges(scale: u32, edge_factor: u32, seed: u64) -> Vec<(i64, i64)> {
    let n = 1i64 << scale;
    let m = (n as u64 * edge_factor as u64) as usize;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut edges = Vec::with_capacity(m);
    for _ in 0..m {
        let (mut u, mut v) = (0i64, 0i64);
        for _ in 0..scale {
            let r: f64 = rng.gen();
            let (ub, vb) = if r < RMAT_A {
                (0, 0)
            } else if r < RMAT_A + RMAT_B {
                (0, 1)
            } else if r < RMAT_A + RMAT_B + RMAT_C {
                (1, 0)
            } else {
                (1, 1)
            };
            u = (u << 1) | ub;
            v = (v << 1) | vb;
        }
        edges.push((u, v));
    }
    edges
}

/// Samples `count` distinct roots with degree >= 1, deterministically.
pub fn sample_roots(edges: &[(i64, i64)], n: i64, count: usize, seed: u64) -> Vec<i64> {
    let mut has_edge = vec![false; n as usize];
    for &(a, b) in edges {
        if a != b && a >= 0 && b >= 0 && a < n && b < n {
            has_edge[a as usize] = true;
            has_edge[b as usize] = true;
        }
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut chosen = Vec::with_capacity(count);
    let mut seen = HashSet::new();
    let candidates = has_edge.iter().filter(|&&h| h).count();
    while chosen.len() < count.min(candidates) {
        let v = rng.gen_range(0..n);
        if has_edge[v as usize] && seen.insert(v) {
            chosen.push(v);
        }
    }
    chosen
}

/// Statistics from validating one BFS result.
pub struct ValidationStats {
    /// Undirected edges with both endpoints reached.
    pub edge_visit_count: i64,
    /// Vertices reached, including the root.
    pub reached: i64,
}

/// Checks a distributed predecessor map against the edge list: tree
/// shape, level consistency, parent-edge existence, and reachability
/// completeness.
pub fn validate_bfs(
    edges: &[(i64, i64)],
    shape: GridShape,
    log_local: u32,
    preds: &[Box<[i64]>],
    root: i64,
) -> Result<ValidationStats> {
    let layout = PredLayout::new(shape.log_rows(), shape.log_cols(), log_local);
    let p = shape.size() as i64;
    let n_padded = (1i64 << log_local) * p;
    let word_of = |v: i64| -> i64 {
        let rank = (v % p) as usize;
        let local = (v / p) as usize;
        preds[rank][local]
    };

    let mut level = vec![-1i64; n_padded as usize];
    let mut parent = vec![UNVISITED; n_padded as usize];
    for v in 0..n_padded {
        let w = word_of(v);
        if w != UNVISITED {
            level[v as usize] = i64::from(layout.level(w));
            parent[v as usize] = layout.parent_global(w);
        }
    }

    if parent[root as usize] != root || level[root as usize] != 0 {
        return Err(BfsError::Validation(format!(
            "root {root} has parent {} at level {}",
            parent[root as usize], level[root as usize]
        )));
    }

    let edge_set: HashSet<(i64, i64)> = edges
        .iter()
        .filter(|&&(a, b)| a != b)
        .map(|&(a, b)| (a.min(b), a.max(b)))
        .collect();

    for v in 0..n_padded {
        if level[v as usize] < 0 || v == root {
            continue;
        }
        let u = parent[v as usize];
        if u < 0 || u >= n_padded || level[u as usize] < 0 {
            return Err(BfsError::Validation(format!(
                "vertex {v} has unreached parent {u}"
            )));
        }
        if level[v as usize] != level[u as usize] + 1 {
            return Err(BfsError::Validation(format!(
                "vertex {v} at level {} under parent {u} at level {}",
                level[v as usize], level[u as usize]
            )));
        }
        if !edge_set.contains(&(u.min(v), u.max(v))) {
            return Err(BfsError::Validation(format!(
                "tree edge ({u}, {v}) is not a graph edge"
            )));
        }
    }

    let mut edge_visit_count = 0i64;
    for &(a, b) in &edge_set {
        let (la, lb) = (level[a as usize], level[b as usize]);
        match (la >= 0, lb >= 0) {
            (true, true) => {
                if (la - lb).abs() > 1 {
                    return Err(BfsError::Validation(format!(
                        "edge ({a}, {b}) spans levels {la} and {lb}"
                    )));
                }
                edge_visit_count += 1;
            }
            (false, false) => {}
            _ => {
                return Err(BfsError::Validation(format!(
                    "edge ({a}, {b}) crosses the reached boundary"
                )));
            }
        }
    }

    let reached = level.iter().filter(|&&l| l >= 0).count() as i64;
    Ok(ValidationStats {
        edge_visit_count,
        reached,
    })
}

/// Runs the full benchmark: generate, build, then BFS + validate + log
/// per root.
pub fn run_benchmark(cfg: &BenchmarkConfig) -> Result<BenchmarkSummary> {
    let shape = cfg.shape;
    info!(
        scale = cfg.scale,
        edge_factor = cfg.edge_factor,
        rows = shape.rows(),
        cols = shape.cols(),
        workers_per_rank = cfg.workers_per_rank,
        packet_length = PACKET_LENGTH,
        comm_buffer_size = COMM_BUFFER_SIZE,
        send_buffer_limit = SEND_BUFFER_LIMIT,
        alpha = cfg.bfs.denom_to_bottom_up,
        beta = cfg.bfs.denom_to_top_down,
        "benchmark starting"
    );

    let seed = USERSEED1 | (USERSEED2 << 32);
    let gen_start = Instant::now();
    let edges = generate_rmat_edges(cfg.scale, cfg.edge_factor, seed);
    let generation_time = gen_start.elapsed().as_secs_f64();

    let build_start = Instant::now();
    let built = build_with_optional_spill(shape, cfg.scale, edges.clone())?;
    let construction_time = build_start.elapsed().as_secs_f64();
    info!(
        edges = built.num_global_edges,
        log_local = built.log_local,
        generation_time,
        construction_time,
        "graph constructed"
    );

    let (mut log, resume) = RunLog::open_at(
        cfg.log_path
            .clone()
            .or_else(|| std::env::var_os(crate::runlog::LOGFILE_ENV).map(PathBuf::from)),
        cfg.scale as i32,
        cfg.edge_factor as i32,
        shape.size() as i32,
    )?;
    log.set_build_times(generation_time, construction_time, 0.0);
    if resume > 0 {
        info!(resume, "resuming from run log");
    }

    let num_roots = cfg.num_roots.min(NUM_BFS_ROOTS);
    let roots = sample_roots(&edges, 1i64 << cfg.scale, num_roots, seed ^ 0x9e37_79b9);
    if roots.len() < num_roots {
        warn!(found = roots.len(), wanted = num_roots, "root pool exhausted");
    }

    let results = run_roots(cfg, &built, &edges, &roots, resume, &mut log)?;
    let mean_teps = if results.is_empty() {
        0.0
    } else {
        results
            .iter()
            .map(|r| r.times.edge_counts / r.times.bfs_time.max(1e-9))
            .sum::<f64>()
            / results.len() as f64
    };
    info!(
        completed = results.len(),
        resumed = resume,
        mean_teps,
        "benchmark complete"
    );
    Ok(BenchmarkSummary {
        results,
        resumed: resume,
        mean_teps,
    })
}

fn build_with_optional_spill(
    shape: GridShape,
    scale: u32,
    edges: Vec<(i64, i64)>,
) -> Result<BuiltGraph> {
    if let Some(path) = std::env::var_os(TMPFILE_ENV) {
        let mut spill = FileEdgeList::new(PathBuf::from(path));
        spill.begin_write();
        spill.write_chunk(&edges)?;
        spill.end_write()?;
        build_grid_graph(shape, scale, &mut spill)
    } else {
        let mut list = MemoryEdgeList::new(edges);
        build_grid_graph(shape, scale, &mut list)
    }
}

fn run_roots(
    cfg: &BenchmarkConfig,
    built: &BuiltGraph,
    edges: &[(i64, i64)],
    roots: &[i64],
    resume: usize,
    log: &mut RunLog,
) -> Result<Vec<RootResult>> {
    let shape = built.shape;
    let ranks = shape.size();
    let fabric = Fabric::new(shape);
    let todo = &roots[resume.min(roots.len())..];
    let mut results = Vec::with_capacity(todo.len());

    // Ranks report each root's predecessor slice; the driver answers with
    // a go token once validation and logging are done. A dropped channel
    // end unwinds the other side, so failures cannot strand a rank at a
    // rendezvous.
    let (res_tx, res_rx) = crossbeam_channel::unbounded::<(usize, Result<Box<[i64]>>)>();
    let mut go_txs = Vec::with_capacity(ranks);
    let mut go_rxs = Vec::with_capacity(ranks);
    for _ in 0..ranks {
        let (tx, rx) = crossbeam_channel::bounded::<()>(1);
        go_txs.push(tx);
        go_rxs.push(rx);
    }

    std::thread::scope(|scope| -> Result<()> {
        let mut handles = Vec::with_capacity(ranks);
        for (rank, go_rx) in go_rxs.into_iter().enumerate() {
            let fabric = Arc::clone(&fabric);
            let res_tx = res_tx.clone();
            let graph = Arc::clone(&built.shards[rank]);
            let bfs_cfg = cfg.bfs.clone();
            let workers = cfg.workers_per_rank;
            let num_verts = built.num_actual_verts;
            handles.push(scope.spawn(move || -> Result<()> {
                let built = GridContext::new(shape, rank, fabric.clone(), workers)
                    .and_then(|ctx| BfsEngine::new(ctx, graph, num_verts, bfs_cfg));
                let mut engine = match built {
                    Ok(engine) => engine,
                    Err(e) => {
                        // Surface the failure to the driver before dying,
                        // or it would wait on this rank's first result.
                        fabric.abort(&format!("rank {rank}: {e}"));
                        let _ = res_tx.send((rank, Err(e)));
                        return Err(BfsError::Transport(format!("rank {rank} aborted")));
                    }
                };
                for &root in todo {
                    let outcome = engine.run(root).map(|(pred, _stats)| pred);
                    let failed = outcome.is_err();
                    if failed {
                        fabric.abort(&format!("rank {rank} failed"));
                    }
                    let _ = res_tx.send((rank, outcome));
                    if failed {
                        return Err(BfsError::Transport(format!("rank {rank} aborted")));
                    }
                    if go_rx.recv().is_err() {
                        // Driver stopped (validation or log failure).
                        return Ok(());
                    }
                }
                Ok(())
            }));
        }
        drop(res_tx);

        for &root in todo {
            let bfs_start = Instant::now();
            let mut preds: Vec<Box<[i64]>> = (0..ranks).map(|_| Box::from([])).collect();
            for _ in 0..ranks {
                let (rank, outcome) = res_rx
                    .recv()
                    .map_err(|_| BfsError::Transport("rank threads exited early".into()))?;
                preds[rank] = outcome?;
            }
            let bfs_time = bfs_start.elapsed().as_secs_f64();
            let validate_start = Instant::now();
            let stats = validate_bfs(edges, shape, built.log_local, &preds, root)?;
            let validate_time = validate_start.elapsed().as_secs_f64();
            let times = RootTimes {
                bfs_time,
                validate_time,
                edge_counts: stats.edge_visit_count as f64,
            };
            log.record_run(times)?;
            info!(
                root,
                bfs_time,
                reached = stats.reached,
                edges = stats.edge_visit_count,
                "root validated"
            );
            results.push(RootResult {
                root,
                times,
                reached: stats.reached,
            });
            for tx in &go_txs {
                let _ = tx.send(());
            }
        }
        drop(go_txs);

        for h in handles {
            match h.join() {
                Ok(r) => r?,
                Err(_) => return Err(BfsError::Transport("rank thread panicked".into())),
            }
        }
        Ok(())
    })?;

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rmat_is_deterministic() {
        let a = generate_rmat_edges(6, 4, 42);
        let b = generate_rmat_edges(6, 4, 42);
        assert_eq!(a, b);
        assert_eq!(a.len(), (1 << 6) * 4);
    }

    #[test]
    fn roots_are_distinct_and_connected() {
        let edges = generate_rmat_edges(8, 8, 7);
        let roots = sample_roots(&edges, 1 << 8, 16, 7);
        let mut seen = HashSet::new();
        for &r in &roots {
            assert!(seen.insert(r));
            assert!(edges
                .iter()
                .any(|&(a, b)| a != b && (a == r || b == r)));
        }
    }
}
