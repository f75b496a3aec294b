//! Benchmarks for graph loading, run planning and branch matching.

use buildchain::core::{ChangeEvent, FailurePolicy};
use buildchain::definition::{
    BranchFilter, PipelineConfig, PipelineGraph, StageConfig, StepSpec, TriggerConfig,
};
use buildchain::run::{plan, TriggerScope};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

/// `layers` layers of `width` stages, each depending on every stage of
/// the layer above.
fn layered(layers: usize, width: usize) -> PipelineConfig {
    let mut config = PipelineConfig::new("bench");
    for layer in 0..layers {
        for i in 0..width {
            let mut stage =
                StageConfig::new(format!("L{layer}S{i}")).with_step(StepSpec::new("make"));
            if layer == 0 {
                stage = stage.with_trigger(TriggerConfig::branches(["+:main", "+:release/*"]));
            } else {
                for up in 0..width {
                    stage = stage.depends_on(format!("L{}S{up}", layer - 1), FailurePolicy::FailToStart);
                }
            }
            config = config.with_stage(stage);
        }
    }
    config
}

fn graph_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("load_graph");
    for (layers, width) in [(5, 5), (10, 10), (20, 10)] {
        let config = layered(layers, width);
        group.bench_with_input(
            BenchmarkId::from_parameter(layers * width),
            &config,
            |b, config| b.iter(|| PipelineGraph::from_config(black_box(config))),
        );
    }
    group.finish();

    let graph = PipelineGraph::from_config(&layered(20, 10)).expect("valid bench graph");
    let event = ChangeEvent::new("app", "refs/heads/main", "a1b2c3");
    c.bench_function("plan_run_200", |b| {
        b.iter(|| plan(black_box(&graph), black_box(&event), &TriggerScope::Vcs))
    });
}

fn filter_benchmark(c: &mut Criterion) {
    let rules = vec![
        "+:main".to_string(),
        "+:release/*".to_string(),
        "-:release/*-rc?".to_string(),
    ];
    let filter = BranchFilter::compile("Build", &rules, None).expect("valid bench filter");
    c.bench_function("branch_filter", |b| {
        b.iter(|| filter.matches(black_box("refs/heads/release/2.4-rc1")))
    });
}

criterion_group!(benches, graph_benchmark, filter_benchmark);
criterion_main!(benches);
