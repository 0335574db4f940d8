//! Custom Resource Definitions for the JMeter operator

mod cluster;
mod types;

pub use cluster::{owner_reference, ClusterSpec, Jmeter, JmeterClusterSpec, JmeterClusterStatus};
pub use types::{ClusterPhase, ClusterState};
