//! Benchmarks for pipeline planning and input keying.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use qhub::core::StageName;
use qhub::pipeline::PipelineGraph;
use qhub::utils::{normalize_semantic, KeyHasher};

fn planning_benchmark(c: &mut Criterion) {
    let graph = PipelineGraph::standard();

    c.bench_function("build_standard_graph", |b| {
        b.iter(|| black_box(PipelineGraph::standard()))
    });

    c.bench_function("topological_order", |b| {
        b.iter(|| black_box(graph.topological_order()))
    });

    c.bench_function("order_for_analyze", |b| {
        b.iter(|| black_box(graph.order_for(&[StageName::Analyze])))
    });
}

fn keying_benchmark(c: &mut Criterion) {
    let circuit = "OPENQASM 2.0;\r\ninclude \"qelib1.inc\";  \r\nqreg q[2];\r\nh q[0];\r\ncx q[0], q[1];\r\n"
        .repeat(200)
        .into_bytes();

    c.bench_function("normalize_semantic", |b| {
        b.iter(|| black_box(normalize_semantic("bell.qasm", &circuit)))
    });

    c.bench_function("input_key", |b| {
        b.iter(|| {
            let mut hasher = KeyHasher::new();
            hasher.part("simulate").part("scripted:simulate").part(&circuit);
            black_box(hasher.finish())
        })
    });
}

criterion_group!(benches, planning_benchmark, keying_benchmark);
criterion_main!(benches);
