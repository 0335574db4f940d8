//! Lifecycle handlers for the `Jmeter` cluster resource
//!
//! Five entry points, one per trigger kind: creation, command change,
//! instance-count change, health tick, deletion. Each handler takes the
//! latest observed cluster document, re-validates it, and talks to the
//! platform through the capabilities carried by [`Context`].
//!
//! Only the two mutating field-change handlers take the cluster mutex.
//! Creation, the health tick, and deletion are idempotent against the
//! platform and may race freely; status writes are last-write-wins.

use std::sync::Arc;

use futures::future::join_all;
use kube::ResourceExt;
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::config::OperatorConfig;
use crate::crd::{ClusterSpec, Jmeter};
use crate::health;
use crate::merge::merge_patch;
use crate::mutex::ClusterMutex;
use crate::platform::{
    truncate_message, CommandDispatch, NotificationSink, ResourceStore, Severity,
};
use crate::provision::Provisioner;
use crate::{iso_time, Error, Result};

const CREATE_ACTION: &str = "CreateCluster";
const INVALID_ARGUMENT: &str = "InvalidArgument";
const RESOURCES_CREATED: &str = "ResourcesCreated";

/// Shared state for all handlers
pub struct Context {
    store: Arc<dyn ResourceStore>,
    dispatch: Arc<dyn CommandDispatch>,
    events: Arc<dyn NotificationSink>,
    provisioner: Provisioner,
    mutex: ClusterMutex,
}

impl Context {
    /// Wire the handlers to the given platform capabilities
    pub fn new(
        store: Arc<dyn ResourceStore>,
        dispatch: Arc<dyn CommandDispatch>,
        events: Arc<dyn NotificationSink>,
        config: OperatorConfig,
    ) -> Self {
        let provisioner = Provisioner::new(store.clone(), events.clone(), config);
        Self {
            store,
            dispatch,
            events,
            provisioner,
            mutex: ClusterMutex::new(),
        }
    }

    /// Merge a partial status update onto the given document's status and
    /// persist the result
    async fn persist_onto(&self, current: &Jmeter, patch: &Value) -> Result<()> {
        let name = current.name_any();
        let namespace = current.namespace().unwrap_or_default();
        let mut status = match &current.status {
            Some(status) => serde_json::to_value(status)
                .map_err(|e| Error::serialization(e.to_string()))?,
            None => json!({}),
        };
        merge_patch(&mut status, patch)?;
        self.store
            .patch_cluster_status(&name, &namespace, &status)
            .await
    }

    /// Fetch the authoritative document and merge the update onto it
    async fn persist_status(&self, name: &str, namespace: &str, patch: &Value) -> Result<()> {
        let current = self.store.get_cluster(name, namespace).await?;
        self.persist_onto(&current, patch).await
    }

    /// Creation trigger
    ///
    /// Validation failure persists a PENDING status without `createTime`,
    /// posts an error event, and propagates; the cluster stays Unready
    /// until a corrected spec arrives. On success every dependent is
    /// ensured (create-if-absent) and `createTime` is written by the first
    /// pass in which every provisioning step succeeded.
    #[instrument(skip_all, fields(cluster = %cluster.name_any()))]
    pub async fn on_create(&self, cluster: &Jmeter) -> Result<()> {
        let name = cluster.name_any();
        let namespace = cluster.namespace().unwrap_or_default();
        let spec = match ClusterSpec::parse(cluster) {
            Ok(spec) => spec,
            Err(e) => {
                warn!(cluster = %name, error = %e, "rejecting invalid cluster spec");
                let pending = json!({ "cluster": { "status": "PENDING", "onlineInstances": 0 } });
                if let Err(pe) = self.persist_status(&name, &namespace, &pending).await {
                    warn!(cluster = %name, error = %pe, "failed to persist rejection status");
                }
                let message = format!("invalid spec for {}: {}", name, e);
                if let Err(ee) = self
                    .events
                    .post(
                        cluster,
                        Severity::Error,
                        CREATE_ACTION,
                        INVALID_ARGUMENT,
                        truncate_message(&message),
                    )
                    .await
                {
                    warn!(cluster = %name, error = %ee, "failed to post event");
                }
                return Err(e);
            }
        };

        let complete = self.provisioner.ensure_all(cluster, &spec).await?;

        let current = self.store.get_cluster(&name, &namespace).await?;
        let mut pending = json!({ "cluster": { "status": "PENDING", "onlineInstances": 0 } });
        // createTime marks a clean pass; an incomplete pass leaves the
        // cluster Unready so creation is re-delivered and the existence
        // probes finish the job.
        if complete && current.create_time().is_none() {
            pending["cluster"]["createTime"] = Value::String(iso_time());
        }
        self.persist_onto(&current, &pending).await?;

        if !complete {
            warn!(cluster = %name, "provisioning incomplete, awaiting re-delivery");
            return Ok(());
        }

        let message = format!("created cluster resources for {}", name);
        if let Err(e) = self
            .events
            .post(
                cluster,
                Severity::Normal,
                CREATE_ACTION,
                RESOURCES_CREATED,
                &message,
            )
            .await
        {
            warn!(cluster = %name, error = %e, "failed to post event");
        }
        info!(cluster = %name, instances = spec.instances, "cluster provisioned");
        Ok(())
    }

    /// Command field-change trigger
    ///
    /// Guarded by the cluster mutex. The acknowledgment map is persisted
    /// before any member runs the command, then all members execute
    /// concurrently and the handler waits for every outcome.
    #[instrument(skip_all, fields(cluster = %cluster.name_any()))]
    pub async fn on_command_change(&self, cluster: &Jmeter, command: &str) -> Result<()> {
        let name = cluster.name_any();
        let namespace = cluster.namespace().unwrap_or_default();
        if !cluster.is_ready() {
            debug!(cluster = %name, "ignoring command change on unready cluster");
            return Ok(());
        }
        if command.trim().is_empty() {
            debug!(cluster = %name, "ignoring empty command");
            return Ok(());
        }

        let _lock = self.mutex.lock(&namespace, &name)?;
        let spec = ClusterSpec::parse(cluster)?;

        let pods = self
            .store
            .list_member_pods(&namespace, &spec.instance_label())
            .await?;
        let members: Vec<String> = pods
            .iter()
            .filter_map(|p| p.metadata.name.clone())
            .collect();

        let mut acks = Map::new();
        acks.insert("lastProbeTime".to_string(), Value::String(iso_time()));
        for member in &members {
            acks.insert(format!("{}-{}", namespace, member), Value::Bool(true));
        }
        self.persist_status(&name, &namespace, &json!({ "cluster": acks }))
            .await?;

        let outcomes = join_all(members.iter().map(|member| {
            let dispatch = self.dispatch.clone();
            let namespace = namespace.clone();
            let command = command.to_string();
            async move {
                let result = dispatch.run_in_member(&namespace, member, &command).await;
                (member.clone(), result)
            }
        }))
        .await;

        let mut failed = 0;
        for (member, outcome) in outcomes {
            if let Err(e) = outcome {
                failed += 1;
                warn!(cluster = %name, member = %member, error = %e, "command dispatch failed");
            }
        }
        info!(
            cluster = %name,
            members = members.len(),
            failed,
            "command dispatched"
        );
        Ok(())
    }

    /// Instance-count field-change trigger
    ///
    /// Guarded by the cluster mutex. Persists PENDING with the new
    /// requested count; the health tick converges `onlineInstances` to the
    /// observed value afterwards.
    #[instrument(skip_all, fields(cluster = %cluster.name_any()))]
    pub async fn on_instances_change(
        &self,
        cluster: &Jmeter,
        previous: Option<i32>,
    ) -> Result<()> {
        let name = cluster.name_any();
        let namespace = cluster.namespace().unwrap_or_default();
        if !cluster.is_ready() {
            debug!(cluster = %name, "ignoring instance change on unready cluster");
            return Ok(());
        }

        let _lock = self.mutex.lock(&namespace, &name)?;
        let spec = ClusterSpec::parse(cluster)?;
        self.provisioner.set_replicas(cluster, &spec).await?;

        let pending = json!({
            "cluster": { "status": "PENDING", "onlineInstances": spec.instances }
        });
        self.persist_status(&name, &namespace, &pending).await?;
        info!(
            cluster = %name,
            previous = previous.unwrap_or_default(),
            requested = spec.instances,
            "instance count updated"
        );
        Ok(())
    }

    /// Health tick
    ///
    /// Lock-free and unconditional: the derived status and running count
    /// are persisted on every tick, whatever the current state.
    #[instrument(skip_all, fields(cluster = %cluster.name_any()))]
    pub async fn on_timer(&self, cluster: &Jmeter) -> Result<()> {
        let name = cluster.name_any();
        let namespace = cluster.namespace().unwrap_or_default();
        let spec = ClusterSpec::parse(cluster)?;
        let (running, phase) = health::evaluate(self.store.as_ref(), &spec).await?;
        let probe = json!({
            "cluster": {
                "status": phase,
                "onlineInstances": running,
                "lastProbeTime": iso_time(),
            }
        });
        self.persist_status(&name, &namespace, &probe).await
    }

    /// Deletion trigger
    ///
    /// Removes the shared storage claims if they exist. The pod group,
    /// front end, and service cascade through their owner references. A
    /// spec that never validated still gets its claims cleaned up by name.
    #[instrument(skip_all, fields(cluster = %cluster.name_any()))]
    pub async fn on_delete(&self, cluster: &Jmeter) -> Result<()> {
        let name = cluster.name_any();
        let namespace = cluster.namespace().unwrap_or_default();
        let spec = ClusterSpec::parse(cluster).unwrap_or_else(|_| ClusterSpec {
            name: name.clone(),
            namespace: namespace.clone(),
            instances: 0,
            config_storage: None,
            data_storage: None,
            command: None,
        });
        self.provisioner.delete_storage(cluster, &spec).await;
        info!(cluster = %name, "cluster deletion handled");
        Ok(())
    }

    /// The resource store the handlers operate through
    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    #[cfg(test)]
    fn mutex(&self) -> &ClusterMutex {
        &self.mutex
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{MockCommandDispatch, MockNotificationSink, MockResourceStore};
    use crate::MUTEX_RETRY_DELAY;
    use k8s_openapi::api::core::v1::{Pod, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn sample_cluster(name: &str, instances: i32, ready: bool) -> Jmeter {
        let mut doc = json!({
            "apiVersion": "jmeter.zs.com/v1",
            "kind": "Jmeter",
            "metadata": { "name": name, "namespace": "load", "uid": "u-1" },
            "spec": { "instances": instances,
                      "configStorage": {}, "dataStorage": {} },
        });
        if ready {
            doc["status"] = json!({
                "cluster": {
                    "status": "PENDING",
                    "onlineInstances": 0,
                    "createTime": "2026-08-01T00:00:00Z",
                }
            });
        }
        serde_json::from_value(doc).unwrap()
    }

    fn running_pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn context(
        store: MockResourceStore,
        dispatch: MockCommandDispatch,
        events: MockNotificationSink,
    ) -> Context {
        Context::new(
            Arc::new(store),
            Arc::new(dispatch),
            Arc::new(events),
            OperatorConfig::default(),
        )
    }

    fn expect_fetch(store: &mut MockResourceStore, cluster: &Jmeter) {
        let fetched = cluster.clone();
        store
            .expect_get_cluster()
            .returning(move |_, _| Ok(fetched.clone()));
    }

    /// First creation pass provisions everything and stamps createTime.
    #[tokio::test]
    async fn test_creation_provisions_and_stamps_create_time() {
        let cluster = sample_cluster("perf-a", 2, false);
        let mut store = MockResourceStore::new();
        store.expect_get_config_map().returning(|_, _| Ok(None));
        store.expect_create_config_map().returning(|_, _| Ok(()));
        store.expect_get_volume_claim().returning(|_, _| Ok(None));
        store.expect_create_volume_claim().returning(|_, _| Ok(()));
        store.expect_get_stateful_set().returning(|_, _| Ok(None));
        store.expect_create_stateful_set().returning(|_, _| Ok(()));
        store.expect_get_deployment().returning(|_, _| Ok(None));
        store.expect_create_deployment().returning(|_, _| Ok(()));
        store.expect_get_service().returning(|_, _| Ok(None));
        store.expect_create_service().returning(|_, _| Ok(()));
        expect_fetch(&mut store, &cluster);
        store
            .expect_patch_cluster_status()
            .times(1)
            .withf(|name, ns, status| {
                name == "perf-a"
                    && ns == "load"
                    && status["cluster"]["status"] == "PENDING"
                    && status["cluster"]["onlineInstances"] == 0
                    && status["cluster"]["createTime"].is_string()
            })
            .returning(|_, _, _| Ok(()));

        let mut events = MockNotificationSink::new();
        events
            .expect_post()
            .times(1)
            .withf(|_, severity, action, reason, _| {
                *severity == Severity::Normal
                    && action == CREATE_ACTION
                    && reason == RESOURCES_CREATED
            })
            .returning(|_, _, _, _, _| Ok(()));

        context(store, MockCommandDispatch::new(), events)
            .on_create(&cluster)
            .await
            .unwrap();
    }

    /// Re-delivered creation on a provisioned cluster creates nothing and
    /// keeps the original createTime.
    #[tokio::test]
    async fn test_creation_redelivery_is_idempotent() {
        let cluster = sample_cluster("perf-a", 2, true);
        let mut store = MockResourceStore::new();
        store
            .expect_get_config_map()
            .returning(|_, _| Ok(Some(Default::default())));
        store
            .expect_get_volume_claim()
            .returning(|_, _| Ok(Some(Default::default())));
        store
            .expect_get_stateful_set()
            .returning(|_, _| Ok(Some(Default::default())));
        store
            .expect_get_deployment()
            .returning(|_, _| Ok(Some(Default::default())));
        store
            .expect_get_service()
            .returning(|_, _| Ok(Some(Default::default())));
        expect_fetch(&mut store, &cluster);
        store
            .expect_patch_cluster_status()
            .times(1)
            .withf(|_, _, status| {
                status["cluster"]["createTime"] == "2026-08-01T00:00:00Z"
            })
            .returning(|_, _, _| Ok(()));

        let mut events = MockNotificationSink::new();
        events.expect_post().returning(|_, _, _, _, _| Ok(()));

        context(store, MockCommandDispatch::new(), events)
            .on_create(&cluster)
            .await
            .unwrap();
    }

    /// A pass in which a provisioning step failed must not stamp
    /// createTime; the cluster stays Unready so creation is re-delivered
    /// and the missing dependents get another chance.
    #[tokio::test]
    async fn test_incomplete_provisioning_defers_create_time() {
        let cluster = sample_cluster("perf-a", 2, false);
        let mut store = MockResourceStore::new();
        store.expect_get_config_map().returning(|_, _| Ok(None));
        store
            .expect_create_config_map()
            .returning(|_, _| Err(Error::dispatch("api unavailable")));
        store.expect_get_volume_claim().returning(|_, _| Ok(None));
        store.expect_create_volume_claim().returning(|_, _| Ok(()));
        store.expect_get_stateful_set().returning(|_, _| Ok(None));
        store.expect_create_stateful_set().returning(|_, _| Ok(()));
        store.expect_get_deployment().returning(|_, _| Ok(None));
        store.expect_create_deployment().returning(|_, _| Ok(()));
        store.expect_get_service().returning(|_, _| Ok(None));
        store.expect_create_service().returning(|_, _| Ok(()));
        expect_fetch(&mut store, &cluster);
        store
            .expect_patch_cluster_status()
            .times(1)
            .withf(|_, _, status| {
                status["cluster"]["status"] == "PENDING"
                    && status["cluster"].get("createTime").is_none()
            })
            .returning(|_, _, _| Ok(()));

        let mut events = MockNotificationSink::new();
        // the failed step reports itself; no ResourcesCreated event
        events
            .expect_post()
            .times(1)
            .withf(|_, severity, _, _, _| *severity == Severity::Error)
            .returning(|_, _, _, _, _| Ok(()));

        let ctx = context(store, MockCommandDispatch::new(), events);
        ctx.on_create(&cluster).await.unwrap();
    }

    /// Invalid specs persist PENDING without createTime, post an error
    /// event, and fail without retry.
    #[tokio::test]
    async fn test_creation_validation_failure() {
        let cluster = sample_cluster("perf-a", 0, false);
        let mut store = MockResourceStore::new();
        expect_fetch(&mut store, &cluster);
        store
            .expect_patch_cluster_status()
            .times(1)
            .withf(|_, _, status| {
                status["cluster"]["status"] == "PENDING"
                    && status["cluster"]["onlineInstances"] == 0
                    && status["cluster"].get("createTime").is_none()
            })
            .returning(|_, _, _| Ok(()));

        let mut events = MockNotificationSink::new();
        events
            .expect_post()
            .times(1)
            .withf(|_, severity, action, reason, _| {
                *severity == Severity::Error
                    && action == CREATE_ACTION
                    && reason == INVALID_ARGUMENT
            })
            .returning(|_, _, _, _, _| Ok(()));

        let err = context(store, MockCommandDispatch::new(), events)
            .on_create(&cluster)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SpecValidation(_)));
        assert!(!err.is_retryable());
    }

    /// The command runs in every member, with acknowledgments persisted
    /// first.
    #[tokio::test]
    async fn test_command_dispatches_to_all_members() {
        let cluster = sample_cluster("perf-a", 2, true);
        let mut store = MockResourceStore::new();
        store
            .expect_list_member_pods()
            .withf(|ns, label| ns == "load" && label == "app.kubernetes.io/instance=perf-a")
            .returning(|_, _| Ok(vec![running_pod("perf-a-0"), running_pod("perf-a-1")]));
        expect_fetch(&mut store, &cluster);
        store
            .expect_patch_cluster_status()
            .times(1)
            .withf(|_, _, status| {
                status["cluster"]["load-perf-a-0"] == true
                    && status["cluster"]["load-perf-a-1"] == true
                    && status["cluster"]["lastProbeTime"].is_string()
            })
            .returning(|_, _, _| Ok(()));

        let mut dispatch = MockCommandDispatch::new();
        dispatch
            .expect_run_in_member()
            .times(2)
            .withf(|ns, _, command| ns == "load" && command == "sh /opt/config/run.sh")
            .returning(|_, _, _| Ok(()));

        context(store, dispatch, MockNotificationSink::new())
            .on_command_change(&cluster, "sh /opt/config/run.sh")
            .await
            .unwrap();
    }

    /// Command changes on an unready cluster are observed but not applied.
    #[tokio::test]
    async fn test_command_skipped_while_unready() {
        let cluster = sample_cluster("perf-a", 2, false);
        let ctx = context(
            MockResourceStore::new(),
            MockCommandDispatch::new(),
            MockNotificationSink::new(),
        );
        ctx.on_command_change(&cluster, "sh run.sh").await.unwrap();
    }

    /// A held mutex fails the trigger fast with the fixed retry delay.
    #[tokio::test]
    async fn test_command_conflict_is_retryable() {
        let cluster = sample_cluster("perf-a", 2, true);
        let ctx = context(
            MockResourceStore::new(),
            MockCommandDispatch::new(),
            MockNotificationSink::new(),
        );
        assert!(ctx
            .mutex()
            .try_acquire("load/perf-a-mutex", "other-handler")
            .is_none());

        let err = ctx
            .on_command_change(&cluster, "sh run.sh")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ResourceConflict { .. }));
        assert_eq!(err.retry_after(), Some(MUTEX_RETRY_DELAY));
    }

    /// Scaling patches the pod group and records the new requested count.
    #[tokio::test]
    async fn test_instances_change_scales_and_persists() {
        let cluster = sample_cluster("perf-a", 4, true);
        let mut store = MockResourceStore::new();
        store
            .expect_get_stateful_set()
            .returning(|_, _| Ok(Some(Default::default())));
        store
            .expect_patch_stateful_set()
            .times(1)
            .withf(|name, _, patch| name == "perf-a" && patch["spec"]["replicas"] == 4)
            .returning(|_, _, _| Ok(()));
        expect_fetch(&mut store, &cluster);
        store
            .expect_patch_cluster_status()
            .times(1)
            .withf(|_, _, status| {
                status["cluster"]["status"] == "PENDING"
                    && status["cluster"]["onlineInstances"] == 4
            })
            .returning(|_, _, _| Ok(()));

        context(store, MockCommandDispatch::new(), MockNotificationSink::new())
            .on_instances_change(&cluster, Some(2))
            .await
            .unwrap();
    }

    /// The health tick persists whatever it observes.
    #[tokio::test]
    async fn test_timer_persists_partial_health() {
        let cluster = sample_cluster("perf-a", 3, true);
        let mut store = MockResourceStore::new();
        store
            .expect_list_member_pods()
            .returning(|_, _| Ok(vec![running_pod("perf-a-0"), running_pod("perf-a-1")]));
        expect_fetch(&mut store, &cluster);
        store
            .expect_patch_cluster_status()
            .times(1)
            .withf(|_, _, status| {
                status["cluster"]["status"] == "PENDING"
                    && status["cluster"]["onlineInstances"] == 2
                    && status["cluster"]["lastProbeTime"].is_string()
            })
            .returning(|_, _, _| Ok(()));

        context(store, MockCommandDispatch::new(), MockNotificationSink::new())
            .on_timer(&cluster)
            .await
            .unwrap();
    }

    /// Deletion removes only the claims that exist.
    #[tokio::test]
    async fn test_delete_removes_existing_storage() {
        let cluster = sample_cluster("perf-a", 2, true);
        let mut store = MockResourceStore::new();
        store
            .expect_get_volume_claim()
            .withf(|name, _| name == "perf-a-share-config")
            .returning(|_, _| Ok(Some(Default::default())));
        store
            .expect_get_volume_claim()
            .withf(|name, _| name == "perf-a-share-data")
            .returning(|_, _| Ok(None));
        store
            .expect_delete_volume_claim()
            .times(1)
            .withf(|name, _| name == "perf-a-share-config")
            .returning(|_, _| Ok(()));

        context(store, MockCommandDispatch::new(), MockNotificationSink::new())
            .on_delete(&cluster)
            .await
            .unwrap();
    }
}
