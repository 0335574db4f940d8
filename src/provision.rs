//! Idempotent provisioning of dependent resources
//!
//! `ensure_all` walks the dependent resources in a fixed order. Each step
//! probes for the resource first and only creates it when absent, so a
//! re-delivered creation trigger never overwrites what is already there.
//! A failing step is reported (warn log plus error event) and the walk
//! continues with the next resource; the existence probes complete the
//! remainder on a later pass.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::OperatorConfig;
use crate::crd::{owner_reference, ClusterSpec, Jmeter};
use crate::platform::{truncate_message, NotificationSink, ResourceStore, Severity};
use crate::template;
use crate::Result;

const CREATE_ACTION: &str = "CreateCluster";
const CREATE_FAILED: &str = "CreateResourceFailed";
const DELETE_ACTION: &str = "DeleteCluster";
const DELETE_FAILED: &str = "DeleteResourceFailed";

/// Creates, scales, and deletes the resources a cluster depends on
pub struct Provisioner {
    store: Arc<dyn ResourceStore>,
    events: Arc<dyn NotificationSink>,
    config: OperatorConfig,
}

impl Provisioner {
    /// Build a provisioner on top of the given platform capabilities
    pub fn new(
        store: Arc<dyn ResourceStore>,
        events: Arc<dyn NotificationSink>,
        config: OperatorConfig,
    ) -> Self {
        Self {
            store,
            events,
            config,
        }
    }

    /// Ensure every dependent resource exists, in dependency order
    ///
    /// Order: config map, config storage, data storage, pod group, front
    /// end, service. Steps that fail are logged and reported but do not
    /// abort the remaining steps. Returns `true` only when every step
    /// succeeded; an incomplete pass leaves the cluster Unready so the
    /// missing dependents are retried on the next creation delivery.
    pub async fn ensure_all(&self, cluster: &Jmeter, spec: &ClusterSpec) -> Result<bool> {
        let mut complete = true;
        if let Err(e) = self.ensure_config_map(cluster, spec).await {
            complete = false;
            self.report_create_failure(cluster, spec, "config map", &e)
                .await;
        }
        if spec.config_storage.is_some() {
            if let Err(e) = self.ensure_config_volume(cluster, spec).await {
                complete = false;
                self.report_create_failure(cluster, spec, "config storage", &e)
                    .await;
            }
        }
        if spec.data_storage.is_some() {
            if let Err(e) = self.ensure_data_volume(cluster, spec).await {
                complete = false;
                self.report_create_failure(cluster, spec, "data storage", &e)
                    .await;
            }
        }
        if spec.instances > 0 {
            if let Err(e) = self.ensure_pod_group(cluster, spec).await {
                complete = false;
                self.report_create_failure(cluster, spec, "pod group", &e)
                    .await;
            }
        }
        if let Err(e) = self.ensure_frontend(cluster, spec).await {
            complete = false;
            self.report_create_failure(cluster, spec, "front end", &e)
                .await;
        }
        if let Err(e) = self.ensure_service(cluster, spec).await {
            complete = false;
            self.report_create_failure(cluster, spec, "service", &e)
                .await;
        }
        Ok(complete)
    }

    async fn ensure_config_map(&self, cluster: &Jmeter, spec: &ClusterSpec) -> Result<()> {
        let name = spec.config_map_name();
        if self
            .store
            .get_config_map(&name, &spec.namespace)
            .await?
            .is_some()
        {
            return Ok(());
        }
        let mut body = template::config_map(spec)?;
        body.metadata.owner_references = owner_reference(cluster).map(|r| vec![r]);
        self.store.create_config_map(&spec.namespace, &body).await?;
        info!(cluster = %spec.name, config_map = %name, "created config map");
        Ok(())
    }

    async fn ensure_config_volume(&self, cluster: &Jmeter, spec: &ClusterSpec) -> Result<()> {
        let name = spec.config_volume_name();
        if self
            .store
            .get_volume_claim(&name, &spec.namespace)
            .await?
            .is_some()
        {
            return Ok(());
        }
        let mut body = template::config_volume(spec)?;
        body.metadata.owner_references = owner_reference(cluster).map(|r| vec![r]);
        self.store
            .create_volume_claim(&spec.namespace, &body)
            .await?;
        info!(cluster = %spec.name, claim = %name, "created config storage");
        Ok(())
    }

    async fn ensure_data_volume(&self, cluster: &Jmeter, spec: &ClusterSpec) -> Result<()> {
        let name = spec.data_volume_name();
        if self
            .store
            .get_volume_claim(&name, &spec.namespace)
            .await?
            .is_some()
        {
            return Ok(());
        }
        let mut body = template::data_volume(spec)?;
        body.metadata.owner_references = owner_reference(cluster).map(|r| vec![r]);
        self.store
            .create_volume_claim(&spec.namespace, &body)
            .await?;
        info!(cluster = %spec.name, claim = %name, "created data storage");
        Ok(())
    }

    async fn ensure_pod_group(&self, cluster: &Jmeter, spec: &ClusterSpec) -> Result<()> {
        let name = spec.pod_group_name();
        if self
            .store
            .get_stateful_set(&name, &spec.namespace)
            .await?
            .is_some()
        {
            return Ok(());
        }
        let mut body = template::stateful_set(spec, &self.config)?;
        body.metadata.owner_references = owner_reference(cluster).map(|r| vec![r]);
        self.store
            .create_stateful_set(&spec.namespace, &body)
            .await?;
        info!(cluster = %spec.name, stateful_set = %name, "created pod group");
        Ok(())
    }

    async fn ensure_frontend(&self, cluster: &Jmeter, spec: &ClusterSpec) -> Result<()> {
        let name = spec.frontend_name();
        if self
            .store
            .get_deployment(&name, &spec.namespace)
            .await?
            .is_some()
        {
            return Ok(());
        }
        let mut body = template::frontend_deployment(spec, &self.config)?;
        body.metadata.owner_references = owner_reference(cluster).map(|r| vec![r]);
        self.store.create_deployment(&spec.namespace, &body).await?;
        info!(cluster = %spec.name, deployment = %name, "created front end");
        Ok(())
    }

    async fn ensure_service(&self, cluster: &Jmeter, spec: &ClusterSpec) -> Result<()> {
        let name = spec.service_name();
        if self
            .store
            .get_service(&name, &spec.namespace)
            .await?
            .is_some()
        {
            return Ok(());
        }
        let mut body = template::frontend_service(spec)?;
        body.metadata.owner_references = owner_reference(cluster).map(|r| vec![r]);
        self.store.create_service(&spec.namespace, &body).await?;
        info!(cluster = %spec.name, service = %name, "created service");
        Ok(())
    }

    /// Patch the pod group's replica count, or provision it fresh if it
    /// does not exist yet (scale requested before creation completed)
    pub async fn set_replicas(&self, cluster: &Jmeter, spec: &ClusterSpec) -> Result<()> {
        let name = spec.pod_group_name();
        if self
            .store
            .get_stateful_set(&name, &spec.namespace)
            .await?
            .is_some()
        {
            let patch = json!({ "spec": { "replicas": spec.instances } });
            self.store
                .patch_stateful_set(&name, &spec.namespace, &patch)
                .await?;
            info!(cluster = %spec.name, replicas = spec.instances, "scaled pod group");
            return Ok(());
        }
        self.ensure_pod_group(cluster, spec).await
    }

    /// Patch the pod group's volume-claim templates; no-op when the pod
    /// group has not been created yet
    pub async fn set_storage_templates(
        &self,
        spec: &ClusterSpec,
        templates: &Value,
    ) -> Result<()> {
        let name = spec.pod_group_name();
        if self
            .store
            .get_stateful_set(&name, &spec.namespace)
            .await?
            .is_none()
        {
            return Ok(());
        }
        let patch = json!({ "spec": { "volumeClaimTemplates": templates } });
        self.store
            .patch_stateful_set(&name, &spec.namespace, &patch)
            .await?;
        info!(cluster = %spec.name, "updated pod group storage templates");
        Ok(())
    }

    /// Best-effort deletion of the shared storage claims
    ///
    /// Missing claims are skipped. Delete failures are reported as events
    /// and logs, never raised; the rest of the teardown cascades through
    /// ownership references.
    pub async fn delete_storage(&self, cluster: &Jmeter, spec: &ClusterSpec) {
        for claim in [spec.config_volume_name(), spec.data_volume_name()] {
            match self.store.get_volume_claim(&claim, &spec.namespace).await {
                Ok(Some(_)) => {
                    if let Err(e) = self.store.delete_volume_claim(&claim, &spec.namespace).await
                    {
                        self.report_delete_failure(cluster, spec, &claim, &e).await;
                    } else {
                        info!(cluster = %spec.name, claim = %claim, "deleted storage claim");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    self.report_delete_failure(cluster, spec, &claim, &e).await;
                }
            }
        }
    }

    async fn report_create_failure(
        &self,
        cluster: &Jmeter,
        spec: &ClusterSpec,
        step: &str,
        error: &crate::Error,
    ) {
        warn!(cluster = %spec.name, step, error = %error, "provisioning step failed");
        let message = format!("failed to create {} for {}: {}", step, spec.name, error);
        if let Err(e) = self
            .events
            .post(
                cluster,
                Severity::Error,
                CREATE_ACTION,
                CREATE_FAILED,
                truncate_message(&message),
            )
            .await
        {
            warn!(cluster = %spec.name, error = %e, "failed to post event");
        }
    }

    async fn report_delete_failure(
        &self,
        cluster: &Jmeter,
        spec: &ClusterSpec,
        claim: &str,
        error: &crate::Error,
    ) {
        warn!(cluster = %spec.name, claim, error = %error, "storage deletion failed");
        let message = format!("failed to delete {} for {}: {}", claim, spec.name, error);
        if let Err(e) = self
            .events
            .post(
                cluster,
                Severity::Error,
                DELETE_ACTION,
                DELETE_FAILED,
                truncate_message(&message),
            )
            .await
        {
            warn!(cluster = %spec.name, error = %e, "failed to post event");
        }
    }
}
