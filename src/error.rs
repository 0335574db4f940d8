//! Error types for the JMeter operator
//!
//! Every failure a handler can surface is classified here as either
//! retryable (the trigger adapter re-delivers after a delay) or fatal
//! (the operation is abandoned until the user changes something).

use std::time::Duration;

use thiserror::Error;

/// Main error type for JMeter operator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for a Jmeter spec
    ///
    /// User input error. Never retried automatically; requires a corrected
    /// spec.
    #[error("spec validation error: {0}")]
    SpecValidation(String),

    /// Another trigger holds the cluster mutex
    ///
    /// Retryable after [`crate::MUTEX_RETRY_DELAY`].
    #[error("cluster {cluster} busy, lock owner={owner}")]
    ResourceConflict {
        /// Cluster whose mutex is contended
        cluster: String,
        /// Current lock owner
        owner: String,
    },

    /// Merge-patch found incompatible shapes at a path
    ///
    /// Programming or data error; fatal to the operation, no partial apply.
    #[error("shape mismatch in merge patch at {path}")]
    ShapeMismatch {
        /// Dotted path to the offending position
        path: String,
    },

    /// A mapping element in a merged sequence is missing its `name` key
    #[error("object in merged list at {path} must have a non-empty name")]
    MissingKeyField {
        /// Dotted path to the offending sequence
        path: String,
    },

    /// Command dispatch to a cluster member failed
    #[error("command dispatch error: {0}")]
    Dispatch(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a spec validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::SpecValidation(msg.into())
    }

    /// Create a dispatch error with the given message
    pub fn dispatch(msg: impl Into<String>) -> Self {
        Self::Dispatch(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Whether re-delivering the failed trigger can succeed without a spec
    /// change
    pub fn is_retryable(&self) -> bool {
        self.retry_after().is_some()
    }

    /// Delay after which the trigger adapter should re-deliver, or `None`
    /// for fatal errors
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::ResourceConflict { .. } => Some(crate::MUTEX_RETRY_DELAY),
            Self::Kube(_) | Self::Dispatch(_) => Some(Duration::from_secs(5)),
            Self::SpecValidation(_)
            | Self::ShapeMismatch { .. }
            | Self::MissingKeyField { .. }
            | Self::Serialization(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: spec validation catches misconfigurations before provisioning
    ///
    /// When a user creates a Jmeter cluster with invalid configuration the
    /// validation layer rejects it with a clear message, and the failure is
    /// never retried automatically.
    #[test]
    fn story_validation_errors_are_fatal() {
        let err = Error::validation("spec.instances must be set and > 0");
        assert!(err.to_string().contains("spec validation error"));
        assert!(err.to_string().contains("instances"));
        assert!(!err.is_retryable());
        assert_eq!(err.retry_after(), None);
    }

    /// Story: mutex contention is surfaced as a fixed-delay retry
    ///
    /// Two concurrent mutations of the same cluster must not interleave.
    /// The loser fails fast with a retryable outcome carrying the fixed
    /// backoff delay instead of blocking.
    #[test]
    fn story_mutex_contention_retries_after_fixed_delay() {
        let err = Error::ResourceConflict {
            cluster: "load-test".to_string(),
            owner: "load-test".to_string(),
        };
        assert!(err.to_string().contains("busy"));
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(crate::MUTEX_RETRY_DELAY));
    }

    /// Story: merge-patch shape errors abort the operation with no partial
    /// apply
    #[test]
    fn story_merge_errors_are_fatal() {
        let shape = Error::ShapeMismatch {
            path: "spec.resources".to_string(),
        };
        assert!(shape.to_string().contains("spec.resources"));
        assert!(!shape.is_retryable());

        let key = Error::MissingKeyField {
            path: "spec.containers".to_string(),
        };
        assert!(key.to_string().contains("name"));
        assert!(!key.is_retryable());
    }

    /// Story: error constructors accept both String and &str
    #[test]
    fn story_error_construction_ergonomics() {
        let dynamic = format!("cluster {} not found", "perf-a");
        assert!(Error::dispatch(dynamic).to_string().contains("perf-a"));
        assert!(Error::serialization("static").to_string().contains("static"));
    }
}
