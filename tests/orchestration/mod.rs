//! Coordinator, monitor, scheduler, sensor and daemon integration tests

pub mod coordinator_test;
pub mod daemon_test;
pub mod instigator_test;
pub mod monitor_test;
