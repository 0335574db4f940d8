//! Manifest templates for dependent resources
//!
//! Each builder is a pure function of the validated [`ClusterSpec`] (plus
//! the operator image configuration) producing the desired manifest for one
//! dependent resource kind. Ownership references are attached by the
//! provisioner, not here.
//!
//! Storage claims are the one place where user input shapes the manifest:
//! the free-form `configStorage`/`dataStorage` overrides are merge-patched
//! onto the generated claim spec, including named-list semantics for fields
//! like `accessModes` overrides carrying objects.

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Service};
use serde_json::{json, Value};

use crate::config::OperatorConfig;
use crate::crd::ClusterSpec;
use crate::merge::merge_patch;
use crate::{Error, Result};

/// Name of the JMeter worker container inside member pods
pub const WORKER_CONTAINER: &str = "jmeter-cluster";

/// Default storage request for the shared claims
const DEFAULT_STORAGE_REQUEST: &str = "10Gi";

/// Default storage class for the shared claims
const DEFAULT_STORAGE_CLASS: &str = "csi-minio-s3";

fn typed<T: serde::de::DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::serialization(e.to_string()))
}

/// Standard labels for a cluster-owned resource
///
/// `instance` is the member pod selector value: the cluster name for the
/// pod group, `{name}-nginx` for the front end.
fn labels(spec: &ClusterSpec, instance: &str) -> Value {
    json!({
        "app": spec.name,
        "app.kubernetes.io/created-by": "jmeter",
        "app.kubernetes.io/instance": instance,
        "app.kubernetes.io/managed-by": "jmeter-operator",
        "app.kubernetes.io/name": "jmeter",
        "app.kubernetes.io/part-of": "jmeter",
    })
}

/// nginx configuration serving the cluster's report directory
fn nginx_conf(spec: &ClusterSpec) -> String {
    format!(
        r#"user  nginx;
worker_processes  auto;
error_log  /var/log/nginx/error.log notice;
pid  /var/run/nginx.pid;
events {{
    worker_connections  1024;
}}
http {{
    server {{
        listen 80;
        server_name localhost;
        location / {{
            root /opt/report/{}/;
            autoindex on;
            autoindex_exact_size off;
            autoindex_localtime on;
        }}
    }}
}}
"#,
        spec.name
    )
}

/// ConfigMap `{name}-config` carrying the generated nginx.conf
pub fn config_map(spec: &ClusterSpec) -> Result<ConfigMap> {
    typed(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": spec.config_map_name(),
            "namespace": spec.namespace,
            "labels": labels(spec, &spec.name),
        },
        "data": { "nginx.conf": nginx_conf(spec) },
    }))
}

/// Shared storage claim with the user's override merged onto the spec
fn volume_claim(
    spec: &ClusterSpec,
    name: String,
    overlay: Option<&Value>,
) -> Result<PersistentVolumeClaim> {
    let mut claim = json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": {
            "name": name,
            "namespace": spec.namespace,
            "labels": labels(spec, &spec.name),
        },
        "spec": {
            "accessModes": ["ReadWriteMany"],
            "resources": { "requests": { "storage": DEFAULT_STORAGE_REQUEST } },
            "storageClassName": DEFAULT_STORAGE_CLASS,
            "volumeMode": "Filesystem",
        },
    });
    if let Some(overlay) = overlay {
        merge_patch(&mut claim["spec"], overlay)?;
    }
    typed(claim)
}

/// Shared-config claim `{name}-share-config`
pub fn config_volume(spec: &ClusterSpec) -> Result<PersistentVolumeClaim> {
    volume_claim(spec, spec.config_volume_name(), spec.config_storage.as_ref())
}

/// Shared-data claim `{name}-share-data`
pub fn data_volume(spec: &ClusterSpec) -> Result<PersistentVolumeClaim> {
    volume_claim(spec, spec.data_volume_name(), spec.data_storage.as_ref())
}

/// The scalable pod group: StatefulSet `{name}` with `replicas = instances`
pub fn stateful_set(spec: &ClusterSpec, config: &OperatorConfig) -> Result<StatefulSet> {
    let member_labels = labels(spec, &spec.name);
    typed(json!({
        "apiVersion": "apps/v1",
        "kind": "StatefulSet",
        "metadata": {
            "name": spec.pod_group_name(),
            "namespace": spec.namespace,
            "labels": member_labels,
        },
        "spec": {
            "podManagementPolicy": "Parallel",
            "replicas": spec.instances,
            "serviceName": spec.service_name(),
            "selector": { "matchLabels": member_labels },
            "template": {
                "metadata": { "labels": member_labels },
                "spec": {
                    "containers": [{
                        "name": WORKER_CONTAINER,
                        "image": config.jmeter_image(),
                        "imagePullPolicy": "Always",
                        "command": ["/bin/sh", "-c", "sleep 1000000"],
                        "env": [
                            { "name": "CLUSTER_NAME", "value": spec.name },
                        ],
                        "resources": {
                            "limits": { "cpu": "2", "memory": "6G" },
                            "requests": { "cpu": "2", "memory": "6G" },
                        },
                        "livenessProbe": {
                            "failureThreshold": 3,
                            "initialDelaySeconds": 20,
                            "periodSeconds": 5,
                            "timeoutSeconds": 5,
                            "exec": { "command": ["ls", "/opt/report"] },
                        },
                        "volumeMounts": [
                            { "name": "share-config", "mountPath": "/opt/config" },
                            { "name": "share-data", "mountPath": "/opt/report" },
                        ],
                    }],
                    "dnsPolicy": "ClusterFirst",
                    "restartPolicy": "Always",
                    "volumes": [
                        {
                            "name": "share-config",
                            "persistentVolumeClaim": { "claimName": spec.config_volume_name() },
                        },
                        {
                            "name": "share-data",
                            "persistentVolumeClaim": { "claimName": spec.data_volume_name() },
                        },
                    ],
                },
            },
        },
    }))
}

/// The report front end: Deployment `{name}-nginx`
pub fn frontend_deployment(spec: &ClusterSpec, config: &OperatorConfig) -> Result<Deployment> {
    let frontend_labels = labels(spec, &spec.frontend_name());
    typed(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": spec.frontend_name(),
            "namespace": spec.namespace,
            "labels": frontend_labels,
        },
        "spec": {
            "replicas": 1,
            "selector": { "matchLabels": frontend_labels },
            "template": {
                "metadata": { "labels": frontend_labels },
                "spec": {
                    "volumes": [
                        {
                            "name": "share-data",
                            "persistentVolumeClaim": { "claimName": spec.data_volume_name() },
                        },
                        {
                            "name": "share-config",
                            "persistentVolumeClaim": { "claimName": spec.config_volume_name() },
                        },
                        {
                            "name": "nginx-config",
                            "configMap": {
                                "name": spec.config_map_name(),
                                "defaultMode": 420,
                                "items": [{ "key": "nginx.conf", "path": "nginx.conf" }],
                            },
                        },
                    ],
                    "containers": [{
                        "name": "nginx",
                        "image": config.nginx_image(),
                        "imagePullPolicy": "Always",
                        "ports": [
                            { "containerPort": 80, "name": "tcp-80", "protocol": "TCP" },
                            { "containerPort": 8080, "name": "tcp-8080", "protocol": "TCP" },
                        ],
                        "livenessProbe": {
                            "failureThreshold": 3,
                            "initialDelaySeconds": 20,
                            "periodSeconds": 5,
                            "timeoutSeconds": 5,
                            "exec": { "command": ["ls", "/opt/report"] },
                        },
                        "resources": {
                            "limits": { "cpu": "2", "memory": "4G" },
                            "requests": { "cpu": "1", "memory": "2G" },
                        },
                        "volumeMounts": [
                            { "name": "share-data", "mountPath": "/opt/report" },
                            { "name": "share-config", "mountPath": "/opt/config" },
                            {
                                "name": "nginx-config",
                                "mountPath": "/etc/nginx/nginx.conf",
                                "subPath": "nginx.conf",
                                "readOnly": true,
                            },
                        ],
                    }],
                },
            },
        },
    }))
}

/// The network endpoint: LoadBalancer Service `{name}-svc`
pub fn frontend_service(spec: &ClusterSpec) -> Result<Service> {
    typed(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": spec.service_name(),
            "namespace": spec.namespace,
            "labels": labels(spec, &spec.frontend_name()),
        },
        "spec": {
            "type": "LoadBalancer",
            "externalTrafficPolicy": "Cluster",
            "sessionAffinity": "None",
            "ports": [
                { "name": "tcp-80", "port": 80, "protocol": "TCP", "targetPort": 80 },
                { "name": "tcp-8080", "port": 8080, "protocol": "TCP", "targetPort": 8080 },
            ],
            "selector": { "app.kubernetes.io/instance": spec.frontend_name() },
        },
    }))
}
