//! Jmeter Custom Resource Definition
//!
//! The Jmeter CRD describes the desired shape of a JMeter cluster: how many
//! worker instances to run, optional overrides for the shared storage
//! claims, and an optional command to execute inside running members.
//!
//! The raw spec is deliberately loose (`instances` optional, storage
//! overrides free-form) so user mistakes surface as typed
//! [`Error::SpecValidation`](crate::Error::SpecValidation) outcomes from
//! [`ClusterSpec::parse`] instead of opaque admission failures, matching the
//! "observe, reject, report" error policy.

use kube::{CustomResource, Resource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::ClusterState;
use crate::{Error, Result, CONFIG_STORAGE_SUFFIX, DATA_STORAGE_SUFFIX, MAX_CLUSTER_NAME_LEN};

/// Specification for a Jmeter cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "jmeter.zs.com",
    version = "v1",
    kind = "Jmeter",
    plural = "jmeters",
    shortname = "jm",
    status = "JmeterClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.cluster.status"}"#,
    printcolumn = r#"{"name":"Instances","type":"integer","jsonPath":".spec.instances"}"#,
    printcolumn = r#"{"name":"Online","type":"integer","jsonPath":".status.cluster.onlineInstances"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct JmeterClusterSpec {
    /// Desired number of JMeter worker instances (required, must be > 0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instances: Option<i32>,

    /// Free-form override merged onto the generated shared-config claim spec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_storage: Option<Value>,

    /// Free-form override merged onto the generated shared-data claim spec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_storage: Option<Value>,

    /// Shell command to execute inside every running member
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

/// Status for a Jmeter cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct JmeterClusterStatus {
    /// The persisted cluster state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterState>,
}

impl Jmeter {
    /// The persisted `createTime`, if the cluster has completed a
    /// provisioning pass
    pub fn create_time(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.cluster.as_ref())
            .and_then(|c| c.create_time.as_deref())
    }

    /// Whether the cluster object itself is ready
    ///
    /// Readiness is defined by the presence of `createTime`; field-change
    /// mutations on an unready cluster are observed but not applied.
    pub fn is_ready(&self) -> bool {
        self.create_time().is_some()
    }
}

/// Immutable, validated per-reconciliation view of a cluster's desired state
///
/// Reconstructed fresh on every trigger from the latest observed document;
/// never cached across triggers.
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterSpec {
    /// Cluster name (namespace-unique, at most [`MAX_CLUSTER_NAME_LEN`])
    pub name: String,
    /// Namespace the cluster and its dependents live in
    pub namespace: String,
    /// Desired worker instance count, always > 0
    pub instances: i32,
    /// Override for the shared-config claim, if any
    pub config_storage: Option<Value>,
    /// Override for the shared-data claim, if any
    pub data_storage: Option<Value>,
    /// Command to run inside members, if any
    pub command: Option<String>,
}

impl ClusterSpec {
    /// Validate the raw document into a typed spec
    ///
    /// Invalid input produces a [`Error::SpecValidation`] and never mutates
    /// persisted state.
    pub fn parse(cluster: &Jmeter) -> Result<Self> {
        let name = cluster
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::validation("cluster has no metadata.name"))?;
        let namespace = cluster
            .metadata
            .namespace
            .clone()
            .ok_or_else(|| Error::validation("cluster has no metadata.namespace"))?;

        if name.len() > MAX_CLUSTER_NAME_LEN {
            return Err(Error::validation(format!(
                "cluster name {name} is too long, must be <= {MAX_CLUSTER_NAME_LEN}"
            )));
        }

        let instances = match cluster.spec.instances {
            Some(n) if n > 0 => n,
            other => {
                return Err(Error::validation(format!(
                    "spec.instances must be set and > 0, got {other:?}"
                )))
            }
        };

        for (field, value) in [
            ("configStorage", &cluster.spec.config_storage),
            ("dataStorage", &cluster.spec.data_storage),
        ] {
            if let Some(v) = value {
                if !v.is_object() {
                    return Err(Error::validation(format!(
                        "spec.{field} expected to be a Map"
                    )));
                }
            }
        }

        Ok(Self {
            name,
            namespace,
            instances,
            config_storage: cluster.spec.config_storage.clone(),
            data_storage: cluster.spec.data_storage.clone(),
            command: cluster.spec.command.clone(),
        })
    }

    /// Name of the ConfigMap dependent: `{name}-config`
    pub fn config_map_name(&self) -> String {
        format!("{}-config", self.name)
    }

    /// Name of the shared-config storage claim: `{name}-share-config`
    pub fn config_volume_name(&self) -> String {
        format!("{}-{CONFIG_STORAGE_SUFFIX}", self.name)
    }

    /// Name of the shared-data storage claim: `{name}-share-data`
    pub fn data_volume_name(&self) -> String {
        format!("{}-{DATA_STORAGE_SUFFIX}", self.name)
    }

    /// Name of the scalable pod group (StatefulSet): the cluster name itself
    pub fn pod_group_name(&self) -> String {
        self.name.clone()
    }

    /// Name of the front-end Deployment: `{name}-nginx`
    pub fn frontend_name(&self) -> String {
        format!("{}-nginx", self.name)
    }

    /// Name of the network endpoint (Service): `{name}-svc`
    pub fn service_name(&self) -> String {
        format!("{}-svc", self.name)
    }

    /// Label selector matching this cluster's member pods
    pub fn instance_label(&self) -> String {
        format!("app.kubernetes.io/instance={}", self.name)
    }
}

/// Owner reference marking a dependent resource for cascade deletion
///
/// Storage claims are the exception: they are excluded from the cascade and
/// deleted explicitly by the deletion handler.
pub fn owner_reference(
    cluster: &Jmeter,
) -> Option<k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference> {
    cluster.controller_owner_ref(&())
}
