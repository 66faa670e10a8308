//! GuidStore's cluster manager, hosting replicas in-process for tests and
//! the node executable.

mod cluster;

#[cfg(test)]
mod scenarios;

pub use cluster::{ClusterConfig, GroupSpec, LocalCluster};
