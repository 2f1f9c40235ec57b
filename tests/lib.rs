//! Integration Tests for Dagflow Core
//!
//! Suites run against in-memory storages, either directly or through a
//! `DagflowInstance`, so no external services are needed.

mod common;
mod execution;
mod orchestration;
mod partitions;
