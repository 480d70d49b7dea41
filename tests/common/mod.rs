//! Shared scaffolding for the integration tests: grid runs over the
//! in-process fabric and a petgraph reference oracle.

use std::collections::VecDeque;
use std::sync::Arc;

use petgraph::graph::{NodeIndex, UnGraph};

use wavefront::bfs::{BfsConfig, BfsEngine};
use wavefront::comm::fabric::Fabric;
use wavefront::graph::builder::{build_grid_graph, MemoryEdgeList};
use wavefront::grid::{GridContext, GridShape};
use wavefront::pred::{PredLayout, UNVISITED};

/// Result of one grid BFS run.
pub struct GridRun {
    pub preds: Vec<Box<[i64]>>,
    pub log_local: u32,
    pub shape: GridShape,
}

impl GridRun {
    /// Depth of every vertex (`-1` = unreached), decoded from the packed
    /// predecessor words.
    pub fn depths(&self, num_verts: i64) -> Vec<i64> {
        let layout = PredLayout::new(
            self.shape.log_rows(),
            self.shape.log_cols(),
            self.log_local,
        );
        let p = self.shape.size() as i64;
        (0..num_verts)
            .map(|v| {
                let w = self.preds[(v % p) as usize][(v / p) as usize];
                if w == UNVISITED {
                    -1
                } else {
                    i64::from(layout.level(w))
                }
            })
            .collect()
    }
}

/// Runs one root on every rank of `shape` and collects the predecessor
/// arrays.
pub fn run_grid_bfs(
    shape: GridShape,
    edges: &[(i64, i64)],
    scale: u32,
    cfg: &BfsConfig,
    root: i64,
    workers: usize,
) -> GridRun {
    let mut list = MemoryEdgeList::new(edges.to_vec());
    let built = build_grid_graph(shape, scale, &mut list).expect("graph builds");
    let fabric = Fabric::new(shape);
    let preds: Vec<Box<[i64]>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..shape.size())
            .map(|rank| {
                let fabric = Arc::clone(&fabric);
                let graph = Arc::clone(&built.shards[rank]);
                let cfg = cfg.clone();
                let num_verts = built.num_actual_verts;
                scope.spawn(move || {
                    let ctx = GridContext::new(shape, rank, fabric, workers).expect("context");
                    let mut engine =
                        BfsEngine::new(ctx, graph, num_verts, cfg).expect("engine");
                    let (pred, _stats) = engine.run(root).expect("bfs run");
                    pred
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().expect("rank")).collect()
    });
    GridRun {
        preds,
        log_local: built.log_local,
        shape,
    }
}

/// Reference BFS depths via petgraph adjacency.
pub fn reference_depths(edges: &[(i64, i64)], num_verts: i64, root: i64) -> Vec<i64> {
    let mut g: UnGraph<(), ()> = UnGraph::new_undirected();
    let nodes: Vec<NodeIndex> = (0..num_verts).map(|_| g.add_node(())).collect();
    for &(a, b) in edges {
        if a != b && a >= 0 && b >= 0 && a < num_verts && b < num_verts {
            g.update_edge(nodes[a as usize], nodes[b as usize], ());
        }
    }
    let mut depth = vec![-1i64; num_verts as usize];
    depth[root as usize] = 0;
    let mut queue = VecDeque::from([nodes[root as usize]]);
    while let Some(u) = queue.pop_front() {
        let du = depth[u.index()];
        for v in g.neighbors(u) {
            if depth[v.index()] < 0 {
                depth[v.index()] = du + 1;
                queue.push_back(v);
            }
        }
    }
    depth
}
