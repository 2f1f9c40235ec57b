use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dagflow_core::definitions::{InputDefinition, JobDefinition, StepDefinition};
use dagflow_core::execution::ExecutionPlanBuilder;
use dagflow_core::partitions::{PartitionsDefinition, TimeWindowPartitionsDefinition};
use dagflow_core::versioning::resolve_config_version;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};

/// Layered job: every step of a layer reads every step of the previous layer
fn layered_job(layers: usize, width: usize) -> JobDefinition {
    let mut builder = JobDefinition::builder("layered");
    for layer in 0..layers {
        for index in 0..width {
            let mut step = StepDefinition::new(format!("l{layer}_{index}"), |_, _| Ok(()))
                .with_code_version(format!("{layer}.{index}"));
            if layer > 0 {
                for upstream in 0..width {
                    step = step.with_input(InputDefinition::from_output(
                        format!("in_{upstream}"),
                        format!("l{}_{upstream}", layer - 1),
                        "result",
                    ));
                }
            }
            builder = builder.step(step);
        }
    }
    builder.build().expect("layered job is valid")
}

fn benchmark_plan_build(c: &mut Criterion) {
    let job = layered_job(10, 10);
    c.bench_function("plan_build_100_steps", |b| {
        b.iter(|| ExecutionPlanBuilder::new(black_box(&job), &Value::Null).build())
    });
}

fn benchmark_partition_subset(c: &mut Criterion) {
    let partitions = PartitionsDefinition::from(
        TimeWindowPartitionsDefinition::daily("2020-01-01").expect("valid partitions"),
    );
    let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().expect("valid timestamp");
    let every_other: Vec<String> = partitions
        .get_partition_keys(now)
        .into_iter()
        .step_by(2)
        .collect();

    c.bench_function("subset_add_keys_and_serialize", |b| {
        b.iter(|| {
            let subset = partitions
                .empty_subset()
                .with_partition_keys(black_box(&every_other))
                .expect("valid keys");
            subset.serialize()
        })
    });
    c.bench_function("subset_keys_not_in_subset", |b| {
        let subset = partitions.empty_subset().with_partition_keys(&every_other).expect("valid keys");
        b.iter(|| subset.get_partition_keys_not_in_subset(black_box(now)))
    });
}

fn benchmark_config_version(c: &mut Criterion) {
    let config = json!({
        "ops": {
            "extract": {"config": {"tables": ["a", "b", "c"], "limit": 1000}},
            "load": {"config": {"target": {"schema": "analytics", "mode": "append"}}}
        },
        "resources": {"warehouse": {"config": {"host": "localhost", "port": 5432}}}
    });
    c.bench_function("resolve_config_version", |b| b.iter(|| resolve_config_version(black_box(&config))));
}

criterion_group!(benches, benchmark_plan_build, benchmark_partition_subset, benchmark_config_version);
criterion_main!(benches);
