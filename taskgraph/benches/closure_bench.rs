//! Benchmarks for graph closure and wave computation.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::BTreeSet;
use taskgraph::graph::{Edge, Graph};

/// A layered graph: every node depends on two nodes of the previous layer.
fn layered_graph(layers: usize, width: usize) -> Graph {
    let label = |layer: usize, i: usize| format!("task-{layer}-{i}");
    let mut nodes = BTreeSet::new();
    let mut edges = BTreeSet::new();
    for layer in 0..layers {
        for i in 0..width {
            nodes.insert(label(layer, i));
            if layer > 0 {
                edges.insert(Edge::new(label(layer, i), label(layer - 1, i), "left"));
                edges.insert(Edge::new(label(layer, i), label(layer - 1, (i + 1) % width), "right"));
            }
        }
    }
    Graph::new(nodes, edges)
}

fn closure_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("transitive_closure");
    for layers in [10, 50, 200] {
        let graph = layered_graph(layers, 20);
        let leaf = format!("task-{}-0", layers - 1);
        group.bench_with_input(BenchmarkId::new("upstream", layers), &graph, |b, graph| {
            b.iter(|| black_box(graph.transitive_closure([leaf.as_str()], false)));
        });
        group.bench_with_input(BenchmarkId::new("downstream", layers), &graph, |b, graph| {
            b.iter(|| black_box(graph.transitive_closure(["task-0-0"], true)));
        });
    }
    group.finish();
}

fn waves_benchmark(c: &mut Criterion) {
    let graph = layered_graph(100, 50);
    c.bench_function("waves", |b| b.iter(|| black_box(graph.waves())));
}

criterion_group!(benches, closure_benchmark, waves_benchmark);
criterion_main!(benches);
