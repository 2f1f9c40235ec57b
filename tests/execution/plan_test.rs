//! Plan building, memoization and step versions

use dagflow_core::definitions::{InputDefinition, JobDefinition, StepDefinition};
use dagflow_core::execution::{build_memoized_plan, ExecutionPlanBuilder, InMemoryIoManager, IoManager, OutputContext};
use dagflow_core::models::StepOutputHandle;
use dagflow_core::versioning::{join_and_hash, resolve_step_version, StepVersionInputs};
use dagflow_core::DagflowError;
use proptest::prelude::*;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::common::{dag_edges_strategy, named_versions_strategy, version_strategy};

fn noop(name: &str) -> StepDefinition {
    StepDefinition::new(name, |_, _| Ok(()))
}

/// Job with steps `s0..s{nodes}` wired by `edges`, every step versioned
fn job_from_edges(nodes: usize, edges: &[(usize, usize)]) -> JobDefinition {
    let mut builder = JobDefinition::builder("generated");
    for node in 0..nodes {
        let mut step = noop(&format!("s{node}")).with_code_version(format!("v{node}"));
        for (upstream, _) in edges.iter().filter(|(_, downstream)| *downstream == node) {
            step = step.with_input(InputDefinition::from_output(
                format!("in_{upstream}"),
                format!("s{upstream}"),
                "result",
            ));
        }
        builder = builder.step(step);
    }
    builder.build().expect("generated job is valid")
}

#[test]
fn test_memoized_rebuild_of_stored_step_executes_nothing() {
    let job = JobDefinition::builder("answer")
        .step(noop("answer").with_code_version("42"))
        .build()
        .unwrap();
    let io_manager = InMemoryIoManager::new();

    let first = ExecutionPlanBuilder::new(&job, &Value::Null).build().unwrap();
    let first = build_memoized_plan(first, Uuid::new_v4(), &io_manager).unwrap();
    assert_eq!(first.step_keys_to_execute(), vec!["answer"]);

    let handle = StepOutputHandle::new("answer", "result");
    let version = first.output_version(&handle).map(str::to_string);
    assert!(version.is_some());
    io_manager
        .handle_output(&OutputContext::new(Uuid::new_v4(), handle).with_version(version), &json!(42))
        .unwrap();

    let second = ExecutionPlanBuilder::new(&job, &Value::Null).build().unwrap();
    let second = build_memoized_plan(second, Uuid::new_v4(), &io_manager).unwrap();
    assert!(second.step_keys_to_execute().is_empty());
}

#[test]
fn test_upstream_code_change_invalidates_downstream_versions() {
    let build = |root_version: &str| {
        JobDefinition::builder("chain")
            .step(noop("root").with_code_version(root_version))
            .step(
                noop("leaf")
                    .with_code_version("1")
                    .with_input(InputDefinition::from_output("x", "root", "result")),
            )
            .build()
            .unwrap()
    };
    let (v1, v2) = (build("1"), build("2"));
    let plan_one = ExecutionPlanBuilder::new(&v1, &Value::Null).build().unwrap();
    let plan_two = ExecutionPlanBuilder::new(&v2, &Value::Null).build().unwrap();
    assert_ne!(plan_one.step_version("root"), plan_two.step_version("root"));
    assert_ne!(plan_one.step_version("leaf"), plan_two.step_version("leaf"));
}

#[test]
fn test_definition_errors_are_not_retried_into_a_plan() {
    let job = JobDefinition::builder("self_loop")
        .step(noop("a").with_input(InputDefinition::from_output("x", "a", "result")))
        .build();
    let error = match job {
        Ok(job) => ExecutionPlanBuilder::new(&job, &Value::Null).build().unwrap_err(),
        Err(error) => error,
    };
    assert!(error.is_definition_error());
    assert!(matches!(error, DagflowError::Cycle { .. } | DagflowError::Definition { .. }));
}

proptest! {
    /// Reordering inputs never changes a step version
    #[test]
    fn step_version_ignores_input_order(
        code in version_strategy(),
        inputs in named_versions_strategy(),
    ) {
        let as_inputs = |inputs: Vec<(String, String)>| StepVersionInputs {
            code_version: Some(code.clone()),
            config_version: "cfg".to_string(),
            resource_versions: Vec::new(),
            input_versions: inputs.into_iter().map(|(name, version)| (name, Some(version))).collect(),
        };
        let mut reversed = inputs.clone();
        reversed.reverse();
        prop_assert_eq!(
            resolve_step_version(&as_inputs(inputs)),
            resolve_step_version(&as_inputs(reversed))
        );
    }

    /// Changing any single upstream version changes the step version
    #[test]
    fn step_version_tracks_each_upstream(
        inputs in named_versions_strategy(),
        index in any::<prop::sample::Index>(),
        replacement in version_strategy(),
    ) {
        let position = index.index(inputs.len());
        prop_assume!(inputs[position].1 != replacement);

        let version_of = |inputs: &[(String, String)]| {
            resolve_step_version(&StepVersionInputs {
                code_version: Some("1".to_string()),
                config_version: "cfg".to_string(),
                resource_versions: Vec::new(),
                input_versions: inputs.iter().map(|(n, v)| (n.clone(), Some(v.clone()))).collect(),
            })
        };
        let mut changed = inputs.clone();
        changed[position].1 = replacement;
        prop_assert_ne!(version_of(&inputs), version_of(&changed));
    }

    /// Moving characters between parts changes the combined hash
    #[test]
    fn join_and_hash_respects_part_boundaries(left in "[a-z]{1,8}", right in "[a-z]{1,8}") {
        let shifted_left = format!("{left}{}", &right[..1]);
        let shifted_right = right[1..].to_string();
        prop_assume!(!shifted_right.is_empty());
        prop_assert_ne!(
            join_and_hash(&[Some(left.as_str()), Some(right.as_str())]),
            join_and_hash(&[Some(shifted_left.as_str()), Some(shifted_right.as_str())])
        );
    }

    /// Every step left to execute has its upstreams executing or already stored
    #[test]
    fn memoized_plans_have_no_dangling_dependencies(
        edges in dag_edges_strategy(6),
        stored in prop::collection::btree_set(0usize..6, 0..6),
    ) {
        let job = job_from_edges(6, &edges);
        let io_manager = InMemoryIoManager::new();
        let plan = ExecutionPlanBuilder::new(&job, &Value::Null).build().unwrap();
        for node in &stored {
            let handle = StepOutputHandle::new(format!("s{node}"), "result");
            let version = plan.output_version(&handle).map(str::to_string);
            io_manager
                .handle_output(&OutputContext::new(Uuid::new_v4(), handle).with_version(version), &json!(null))
                .unwrap();
        }

        let memoized = build_memoized_plan(plan, Uuid::new_v4(), &io_manager).unwrap();
        let executing = memoized.step_keys_to_execute();
        prop_assert!(memoized.dangling_dependencies().is_empty());
        for key in &executing {
            let step = memoized.step(key).unwrap();
            for upstream in step.upstream_step_keys() {
                let upstream_node: usize = upstream[1..].parse().unwrap();
                prop_assert!(
                    executing.iter().any(|k| k == upstream) || stored.contains(&upstream_node),
                    "{} depends on {} which is neither executing nor stored", key, upstream
                );
            }
        }
    }
}
