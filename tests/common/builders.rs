//! Job and instance builders shared by the integration suites

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use dagflow_core::config::{DagflowConfig, ExecutionConfig, TagConcurrencyLimit};
use dagflow_core::definitions::{
    InputDefinition, JobDefinition, JobRepository, OutputDefinition, RetryPolicy, StepDefinition,
};
use dagflow_core::execution::ComputeError;
use dagflow_core::models::Run;
use dagflow_core::storage::EventLogStorage;
use dagflow_core::DagflowInstance;
use serde_json::{json, Value};
use uuid::Uuid;

pub const RUN_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration with short polling intervals so runs finish quickly
pub fn fast_config() -> DagflowConfig {
    DagflowConfig {
        execution: ExecutionConfig {
            max_concurrent_steps: 4,
            step_poll_interval_ms: 5,
            interrupt_grace_period_ms: 200,
        },
        ..DagflowConfig::default()
    }
}

pub fn limited_config(max_concurrent_runs: i64, limits: Vec<TagConcurrencyLimit>) -> DagflowConfig {
    let mut config = fast_config();
    config.run_coordinator.max_concurrent_runs = max_concurrent_runs;
    config.run_coordinator.tag_concurrency_limits = limits;
    config
}

pub fn repository(jobs: Vec<JobDefinition>) -> Arc<JobRepository> {
    let repository = Arc::new(JobRepository::new());
    for job in jobs {
        repository.register(job);
    }
    repository
}

pub fn instance(jobs: Vec<JobDefinition>) -> DagflowInstance {
    DagflowInstance::builder(repository(jobs))
        .config(fast_config())
        .build()
        .expect("failed to build test instance")
}

pub fn queued_instance(jobs: Vec<JobDefinition>, config: DagflowConfig) -> DagflowInstance {
    DagflowInstance::builder(repository(jobs))
        .config(config)
        .queued(true)
        .build()
        .expect("failed to build queued test instance")
}

/// `emit -> add_one`
pub fn linear_job(name: &str) -> JobDefinition {
    JobDefinition::builder(name)
        .step(StepDefinition::new("emit", |ctx, _| {
            ctx.output("result", json!(1));
            Ok(())
        }))
        .step(
            StepDefinition::new("add_one", |ctx, inputs| {
                let value = inputs.require("value")?.as_i64().unwrap_or_default();
                ctx.output("result", json!(value + 1));
                Ok(())
            })
            .with_input(InputDefinition::from_output("value", "emit", "result")),
        )
        .build()
        .expect("linear job is valid")
}

/// `source -> ok`, `broken -> after_broken`; `broken` always fails
pub fn split_failure_job() -> JobDefinition {
    JobDefinition::builder("split")
        .step(StepDefinition::new("source", |ctx, _| {
            ctx.output("result", json!("data"));
            Ok(())
        }))
        .step(
            StepDefinition::new("ok", |ctx, inputs| {
                ctx.output("result", inputs.require("data")?.clone());
                Ok(())
            })
            .with_input(InputDefinition::from_output("data", "source", "result")),
        )
        .step(StepDefinition::new("broken", |_, _| Err(ComputeError::failure("upstream API down"))))
        .step(
            StepDefinition::new("after_broken", |ctx, _| {
                ctx.output("result", Value::Null);
                Ok(())
            })
            .with_input(InputDefinition::from_output("x", "broken", "result")),
        )
        .build()
        .expect("split job is valid")
}

/// A single versioned step that counts its invocations
pub fn versioned_job(calls: Arc<AtomicUsize>) -> JobDefinition {
    JobDefinition::builder("versioned")
        .step(
            StepDefinition::new("answer", move |ctx, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                ctx.output("result", json!(42));
                Ok(())
            })
            .with_code_version("42"),
        )
        .build()
        .expect("versioned job is valid")
}

/// `maybe` declares an optional output it never produces
pub fn optional_output_job() -> JobDefinition {
    JobDefinition::builder("optional")
        .step(
            StepDefinition::new("maybe", |_, _| Ok(()))
                .with_outputs(vec![OutputDefinition::new("result").optional()]),
        )
        .step(
            StepDefinition::new("consumer", |ctx, inputs| {
                ctx.output("result", inputs.require("value")?.clone());
                Ok(())
            })
            .with_input(InputDefinition::from_output("value", "maybe", "result")),
        )
        .step(
            StepDefinition::new("grand_consumer", |ctx, inputs| {
                ctx.output("result", inputs.require("value")?.clone());
                Ok(())
            })
            .with_input(InputDefinition::from_output("value", "consumer", "result")),
        )
        .build()
        .expect("optional job is valid")
}

/// Fails `failures` times, then succeeds
pub fn flaky_job(failures: usize, calls: Arc<AtomicUsize>) -> JobDefinition {
    JobDefinition::builder("flaky")
        .step(
            StepDefinition::new("flaky", move |ctx, _| {
                if calls.fetch_add(1, Ordering::SeqCst) < failures {
                    return Err(ComputeError::failure("transient"));
                }
                ctx.output("result", json!("recovered"));
                Ok(())
            })
            .with_retry_policy(RetryPolicy::new(failures as u32).with_delay(Duration::from_millis(5))),
        )
        .build()
        .expect("flaky job is valid")
}

pub fn tagged_run(job_name: &str, key: &str, value: &str) -> Run {
    Run::new(job_name, Value::Null).with_tag(key, value)
}

/// Event types recorded for `step_key`, oldest first
pub async fn step_event_types(event_log: &dyn EventLogStorage, run_id: Uuid, step_key: &str) -> Vec<&'static str> {
    event_log
        .get_events(run_id, None, None)
        .await
        .expect("event log read failed")
        .into_iter()
        .filter(|record| record.step_key.as_deref() == Some(step_key))
        .map(|record| record.event.event_type())
        .collect()
}

pub fn utc(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, 0, 0)
        .single()
        .expect("valid test timestamp")
}
