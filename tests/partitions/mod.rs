//! Partition calendar integration tests

pub mod subset_test;
pub mod time_window_test;
