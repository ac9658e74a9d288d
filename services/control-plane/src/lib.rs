//! fleetsim control plane library.
//!
//! This crate primarily ships a `control-plane` binary, but we expose the
//! library surface so integration tests can drive a cluster against the
//! mock runtime.

pub mod cluster;
pub mod config;
pub mod health;
pub mod recovery;
pub mod registry;
pub mod runtime;
pub mod scheduler;

pub use cluster::{Cluster, ClusterError, ShutdownSummary};
