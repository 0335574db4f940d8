//! Command dispatch transport
//!
//! Executes a shell command inside a named cluster member. The real
//! implementation runs `/bin/sh -c <command>` through the Kubernetes exec
//! subresource against the worker container.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::template::WORKER_CONTAINER;
use crate::{Error, Result};

/// Transport executing a command inside one cluster member
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandDispatch: Send + Sync {
    /// Run `command` inside the worker container of `pod`, waiting for
    /// completion
    async fn run_in_member(&self, namespace: &str, pod: &str, command: &str) -> Result<()>;
}

/// Pod-exec backed dispatch
pub struct PodExecDispatch {
    client: Client,
}

impl PodExecDispatch {
    /// Create a dispatcher wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CommandDispatch for PodExecDispatch {
    async fn run_in_member(&self, namespace: &str, pod: &str, command: &str) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = AttachParams::default()
            .container(WORKER_CONTAINER)
            .stdin(false)
            .stdout(true)
            .stderr(true);

        let mut attached = pods
            .exec(pod, ["/bin/sh", "-c", command], &params)
            .await
            .map_err(|e| Error::dispatch(format!("exec in {namespace}/{pod} failed: {e}")))?;

        if let Some(status) = attached.take_status() {
            let outcome = status.await;
            debug!(pod, ?outcome, "member command finished");
        }
        attached
            .join()
            .await
            .map_err(|e| Error::dispatch(format!("exec in {namespace}/{pod} failed: {e}")))
    }
}
