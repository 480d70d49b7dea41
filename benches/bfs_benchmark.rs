use criterion::{black_box, criterion_group, criterion_main, Criterion};

use std::sync::Arc;

use wavefront::bfs::{BfsConfig, BfsEngine};
use wavefront::comm::fabric::Fabric;
use wavefront::graph::builder::{build_grid_graph, MemoryEdgeList};
use wavefront::grid::{GridContext, GridShape};
use wavefront::harness::{generate_rmat_edges, sample_roots};

fn bench_single_rank_bfs(c: &mut Criterion) {
    let scale = 14;
    let edges = generate_rmat_edges(scale, 16, 2u64 | (3u64 << 32));
    let shape = GridShape::new(1, 1).unwrap();
    let mut list = MemoryEdgeList::new(edges.clone());
    let built = build_grid_graph(shape, scale, &mut list).unwrap();
    let root = sample_roots(&edges, 1 << scale, 1, 7)[0];

    let fabric = Fabric::new(shape);
    let ctx = GridContext::new(shape, 0, fabric, 4).unwrap();
    let mut engine = BfsEngine::new(
        ctx,
        Arc::clone(&built.shards[0]),
        built.num_actual_verts,
        BfsConfig::default(),
    )
    .unwrap();

    c.bench_function("bfs_scale14_single_rank", |b| {
        b.iter(|| {
            let (pred, _stats) = engine.run(black_box(root)).unwrap();
            black_box(pred);
        });
    });
}

fn bench_graph_build(c: &mut Criterion) {
    let scale = 14;
    let edges = generate_rmat_edges(scale, 16, 2u64 | (3u64 << 32));
    let shape = GridShape::new(2, 2).unwrap();
    c.bench_function("build_scale14_2x2", |b| {
        b.iter(|| {
            let mut list = MemoryEdgeList::new(edges.clone());
            black_box(build_grid_graph(shape, scale, &mut list).unwrap());
        });
    });
}

criterion_group!(benches, bench_single_rank_bfs, bench_graph_build);
criterion_main!(benches);
