//! Cluster health derivation
//!
//! A cluster is ONLINE exactly when every requested member pod reports a
//! `Running` phase. Anything less, including an empty pod list, keeps the
//! cluster PENDING. The prober only observes; persisting the derived state
//! is the caller's job.

use tracing::debug;

use crate::crd::{ClusterPhase, ClusterSpec};
use crate::platform::ResourceStore;
use crate::Result;

/// Count running members and derive the cluster phase
pub async fn evaluate(
    store: &dyn ResourceStore,
    spec: &ClusterSpec,
) -> Result<(i32, ClusterPhase)> {
    let pods = store
        .list_member_pods(&spec.namespace, &spec.instance_label())
        .await?;
    let running = pods
        .iter()
        .filter(|pod| {
            pod.status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .map(|phase| phase == "Running")
                .unwrap_or(false)
        })
        .count() as i32;
    let phase = if running == spec.instances {
        ClusterPhase::Online
    } else {
        ClusterPhase::Pending
    };
    debug!(
        cluster = %spec.name,
        running,
        requested = spec.instances,
        phase = %phase,
        "probed member pods"
    );
    Ok((running, phase))
}
