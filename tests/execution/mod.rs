//! Execution engine integration tests

pub mod plan_test;
pub mod run_test;
