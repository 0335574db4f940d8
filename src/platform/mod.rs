//! Abstract platform capabilities and their kube-backed implementations
//!
//! The controller consumes the platform through three seams: the resource
//! store, the command dispatch transport, and the notification sink. Each is
//! a trait (mockable in tests) with one production implementation.

mod dispatch;
mod events;
mod store;

pub use dispatch::{CommandDispatch, PodExecDispatch};
pub use events::{truncate_message, EventPoster, NotificationSink, Severity, MAX_EVENT_MESSAGE_LEN};
pub use store::{KubeResourceStore, ResourceStore, FIELD_MANAGER};

#[cfg(test)]
pub use dispatch::MockCommandDispatch;
#[cfg(test)]
pub use events::MockNotificationSink;
#[cfg(test)]
pub use store::MockResourceStore;
