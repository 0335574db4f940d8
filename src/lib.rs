//! JMeter Operator - declarative JMeter cluster lifecycle management
//!
//! This operator reconciles `Jmeter` custom resources into the set of
//! Kubernetes resources that realize a distributed JMeter cluster: a
//! ConfigMap, two shared storage claims, a StatefulSet of worker pods, an
//! nginx report front end, and a LoadBalancer Service.
//!
//! # Architecture
//!
//! An external event source (the watch adapter in `main.rs`) delivers
//! triggers to the lifecycle controller, which validates the spec, serializes
//! conflicting mutations through a per-cluster mutex, and drives the
//! idempotent provisioner. All persisted status updates go through a
//! read-modify-write merge-patch so concurrent writers of different fields
//! never clobber each other.
//!
//! # Modules
//!
//! - [`crd`] - The Jmeter Custom Resource Definition and validated spec view
//! - [`controller`] - Lifecycle handlers for the five trigger kinds
//! - [`provision`] - Idempotent dependent-resource provisioner
//! - [`health`] - Running-replica health evaluation
//! - [`merge`] - Recursive merge-patch engine with named-list semantics
//! - [`mutex`] - Per-cluster test-and-set mutual exclusion
//! - [`platform`] - Abstract platform capabilities (resource store, command
//!   dispatch, notification sink) and their kube-backed implementations
//! - [`template`] - Manifest builders for each dependent resource kind
//! - [`config`] - Operator configuration from the environment
//! - [`error`] - Error types with retryable/fatal classification

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod health;
pub mod merge;
pub mod mutex;
pub mod platform;
pub mod provision;
pub mod template;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// These constants define the default values used throughout the operator.
// Centralizing them here ensures consistency across handlers, templates,
// and test fixtures.

/// Maximum allowed length for a cluster name
///
/// Dependent resource names are derived from the cluster name with suffixes
/// such as `-share-config`; the cap keeps every derived name within label
/// value limits.
pub const MAX_CLUSTER_NAME_LEN: usize = 28;

/// Suffix for the shared configuration storage claim
pub const CONFIG_STORAGE_SUFFIX: &str = "share-config";

/// Suffix for the shared report data storage claim
pub const DATA_STORAGE_SUFFIX: &str = "share-data";

/// Fixed delay before a trigger that lost the cluster mutex is re-delivered
pub const MUTEX_RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(10);

/// Interval between periodic health probes of each cluster
pub const HEALTH_PROBE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// Delay before the first health probe after operator startup
pub const HEALTH_PROBE_INITIAL_DELAY: std::time::Duration = std::time::Duration::from_secs(30);

/// Current UTC time as an RFC3339 string with whole-second precision
///
/// This is the format used for `lastProbeTime` and `createTime` in the
/// persisted cluster status.
pub fn iso_time() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iso_time_is_rfc3339_utc() {
        let ts = iso_time();
        assert!(ts.ends_with('Z'), "timestamp should be UTC: {ts}");
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }
}
