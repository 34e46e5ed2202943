//! Test support: an in-memory mock cluster and balance assertions.

pub mod cluster;
