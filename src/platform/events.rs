//! Operator-visible audit trail
//!
//! Lifecycle notifications are posted as namespaced core/v1 Events against
//! the cluster object, in addition to process logs. Messages longer than
//! 1024 characters are truncated by the sink.

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, EventSource};
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::{Client, Resource};

#[cfg(test)]
use mockall::automock;

use crate::crd::Jmeter;
use crate::Result;

/// Maximum length of a posted event message
pub const MAX_EVENT_MESSAGE_LEN: usize = 1024;

/// Component name reported on posted events
const REPORTING_COMPONENT: &str = "jmeter.zs.com/jmeter-operator";

/// Severity of a lifecycle notification
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    /// Informational lifecycle progress
    Normal,
    /// Degraded but recoverable condition
    Warning,
    /// Failed operation requiring attention
    Error,
}

impl Severity {
    /// The Kubernetes event `type` string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Warning => "Warning",
            Self::Error => "Error",
        }
    }
}

/// Sink accepting lifecycle notifications for the audit trail
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Post a notification against the given cluster object
    async fn post(
        &self,
        cluster: &Jmeter,
        severity: Severity,
        action: &str,
        reason: &str,
        message: &str,
    ) -> Result<()>;
}

/// Truncate a message to the sink's limit
pub fn truncate_message(message: &str) -> &str {
    match message.char_indices().nth(MAX_EVENT_MESSAGE_LEN) {
        Some((idx, _)) => &message[..idx],
        None => message,
    }
}

/// Real sink posting core/v1 Events through the API server
pub struct EventPoster {
    client: Client,
    host: Option<String>,
}

impl EventPoster {
    /// Create a poster wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            host: std::env::var("HOSTNAME").ok(),
        }
    }

    fn object_ref(cluster: &Jmeter) -> ObjectReference {
        ObjectReference {
            api_version: Some(format!(
                "{}/{}",
                Jmeter::group(&()),
                Jmeter::version(&())
            )),
            kind: Some(Jmeter::kind(&()).into_owned()),
            name: cluster.metadata.name.clone(),
            namespace: cluster.metadata.namespace.clone(),
            resource_version: cluster.metadata.resource_version.clone(),
            uid: cluster.metadata.uid.clone(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl NotificationSink for EventPoster {
    async fn post(
        &self,
        cluster: &Jmeter,
        severity: Severity,
        action: &str,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        let namespace = cluster
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());

        let event = Event {
            metadata: ObjectMeta {
                generate_name: Some("jmeter-operator-evt-".to_string()),
                namespace: Some(namespace.clone()),
                ..Default::default()
            },
            action: Some(action.to_string()),
            event_time: Some(MicroTime(Utc::now())),
            involved_object: Self::object_ref(cluster),
            message: Some(truncate_message(message).to_string()),
            reason: Some(reason.to_string()),
            reporting_component: Some(REPORTING_COMPONENT.to_string()),
            reporting_instance: self.host.clone(),
            source: Some(EventSource {
                component: Some("jmeter-operator".to_string()),
                host: self.host.clone(),
            }),
            type_: Some(severity.as_str().to_string()),
            ..Default::default()
        };

        let api: Api<Event> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), &event).await?;
        Ok(())
    }
}
