//! Resource store abstraction over the Kubernetes API
//!
//! The [`ResourceStore`] trait is the seam between the lifecycle controller
//! and the platform: get/create/patch/delete on the dependent resource
//! kinds, with absence reported as `Ok(None)` rather than an error. The
//! trait allows mocking the platform in tests while using the real client
//! in production.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Service};
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::Value;

#[cfg(test)]
use mockall::automock;

use crate::crd::Jmeter;
use crate::Result;

/// Field manager name used for all operator writes
pub const FIELD_MANAGER: &str = "jmeter-operator";

/// Platform resource operations consumed by the controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch the authoritative Jmeter document
    async fn get_cluster(&self, name: &str, namespace: &str) -> Result<Jmeter>;

    /// List all Jmeter documents across namespaces
    async fn list_clusters(&self) -> Result<Vec<Jmeter>>;

    /// Merge-patch the full `status` sub-document of a Jmeter resource
    async fn patch_cluster_status(
        &self,
        name: &str,
        namespace: &str,
        status: &Value,
    ) -> Result<()>;

    /// Fetch a ConfigMap, `None` if absent
    async fn get_config_map(&self, name: &str, namespace: &str) -> Result<Option<ConfigMap>>;
    /// Create a ConfigMap
    async fn create_config_map(&self, namespace: &str, body: &ConfigMap) -> Result<()>;

    /// Fetch a storage claim, `None` if absent
    async fn get_volume_claim(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<PersistentVolumeClaim>>;
    /// Create a storage claim
    async fn create_volume_claim(
        &self,
        namespace: &str,
        body: &PersistentVolumeClaim,
    ) -> Result<()>;
    /// Delete a storage claim
    async fn delete_volume_claim(&self, name: &str, namespace: &str) -> Result<()>;

    /// Fetch the pod group, `None` if absent
    async fn get_stateful_set(&self, name: &str, namespace: &str) -> Result<Option<StatefulSet>>;
    /// Create the pod group
    async fn create_stateful_set(&self, namespace: &str, body: &StatefulSet) -> Result<()>;
    /// Merge-patch the pod group (replica count, volume claim templates)
    async fn patch_stateful_set(&self, name: &str, namespace: &str, patch: &Value) -> Result<()>;

    /// Fetch the front-end deployment, `None` if absent
    async fn get_deployment(&self, name: &str, namespace: &str) -> Result<Option<Deployment>>;
    /// Create the front-end deployment
    async fn create_deployment(&self, namespace: &str, body: &Deployment) -> Result<()>;

    /// Fetch the network endpoint, `None` if absent
    async fn get_service(&self, name: &str, namespace: &str) -> Result<Option<Service>>;
    /// Create the network endpoint
    async fn create_service(&self, namespace: &str, body: &Service) -> Result<()>;

    /// List pods matching a label selector in a namespace
    async fn list_member_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;
}

/// Real Kubernetes-backed implementation
pub struct KubeResourceStore {
    client: Client,
}

impl KubeResourceStore {
    /// Create a store wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Map a 404 from the API server to an explicit absence signal
fn ok_or_absent<T>(res: kube::Result<T>) -> Result<Option<T>> {
    match res {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ResourceStore for KubeResourceStore {
    async fn get_cluster(&self, name: &str, namespace: &str) -> Result<Jmeter> {
        let api: Api<Jmeter> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn list_clusters(&self) -> Result<Vec<Jmeter>> {
        let api: Api<Jmeter> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn patch_cluster_status(
        &self,
        name: &str,
        namespace: &str,
        status: &Value,
    ) -> Result<()> {
        let api: Api<Jmeter> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn get_config_map(&self, name: &str, namespace: &str) -> Result<Option<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        ok_or_absent(api.get(name).await)
    }

    async fn create_config_map(&self, namespace: &str, body: &ConfigMap) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), body).await?;
        Ok(())
    }

    async fn get_volume_claim(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        ok_or_absent(api.get(name).await)
    }

    async fn create_volume_claim(
        &self,
        namespace: &str,
        body: &PersistentVolumeClaim,
    ) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), body).await?;
        Ok(())
    }

    async fn delete_volume_claim(&self, name: &str, namespace: &str) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &Default::default()).await?;
        Ok(())
    }

    async fn get_stateful_set(&self, name: &str, namespace: &str) -> Result<Option<StatefulSet>> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        ok_or_absent(api.get(name).await)
    }

    async fn create_stateful_set(&self, namespace: &str, body: &StatefulSet) -> Result<()> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), body).await?;
        Ok(())
    }

    async fn patch_stateful_set(&self, name: &str, namespace: &str, patch: &Value) -> Result<()> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn get_deployment(&self, name: &str, namespace: &str) -> Result<Option<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        ok_or_absent(api.get(name).await)
    }

    async fn create_deployment(&self, namespace: &str, body: &Deployment) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), body).await?;
        Ok(())
    }

    async fn get_service(&self, name: &str, namespace: &str) -> Result<Option<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        ok_or_absent(api.get(name).await)
    }

    async fn create_service(&self, namespace: &str, body: &Service) -> Result<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), body).await?;
        Ok(())
    }

    async fn list_member_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(label_selector);
        Ok(api.list(&params).await?.items)
    }
}
