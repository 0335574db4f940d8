//! Supporting types for the Jmeter CRD

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a JMeter cluster
///
/// `Pending` covers everything from "just created" to "scaling"; a cluster
/// is `Online` only while its observed running member count matches the
/// desired instance count.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ClusterPhase {
    /// Members are being scheduled or are catching up to the desired count
    #[default]
    Pending,
    /// All desired members are running
    Online,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Online => write!(f, "ONLINE"),
        }
    }
}

/// The `status.cluster` sub-structure persisted on a Jmeter resource
///
/// `create_time` is set once by the first successful provisioning pass and
/// never overwritten; its presence defines readiness of the cluster object.
/// The flattened map carries per-member command dispatch acknowledgments
/// keyed by `{namespace}-{memberName}`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterState {
    /// Current lifecycle status
    #[serde(default)]
    pub status: ClusterPhase,

    /// Number of members observed running at the last probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online_instances: Option<i32>,

    /// Timestamp of the last health probe or status write (RFC3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_time: Option<String>,

    /// Timestamp of the first successful provisioning pass (RFC3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<String>,

    /// Per-member dispatch acknowledgments, keyed `{namespace}-{memberName}`
    #[serde(default, flatten, skip_serializing_if = "BTreeMap::is_empty")]
    pub dispatch_acks: BTreeMap<String, bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_serializes_uppercase() {
        assert_eq!(
            serde_json::to_string(&ClusterPhase::Online).unwrap(),
            "\"ONLINE\""
        );
        assert_eq!(
            serde_json::from_str::<ClusterPhase>("\"PENDING\"").unwrap(),
            ClusterPhase::Pending
        );
    }

    #[test]
    fn test_dispatch_acks_flatten_beside_status_fields() {
        let raw = serde_json::json!({
            "status": "PENDING",
            "onlineInstances": 2,
            "createTime": "2026-01-01T00:00:00Z",
            "load-perf-a-0": true,
            "load-perf-a-1": true
        });
        let state: ClusterState = serde_json::from_value(raw).unwrap();
        assert_eq!(state.online_instances, Some(2));
        assert_eq!(state.dispatch_acks.len(), 2);
        assert_eq!(state.dispatch_acks.get("load-perf-a-0"), Some(&true));

        let back = serde_json::to_value(&state).unwrap();
        assert_eq!(back["load-perf-a-1"], serde_json::json!(true));
    }
}
