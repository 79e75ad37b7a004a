//! Publishing of Kubernetes events on the owning cluster object.
//!
//! Reconcilers talk to the [`EventRecorder`] capability; production code
//! wires in [`KubeEventRecorder`], tests capture events in memory.

use async_trait::async_trait;
use kube::{
    Resource,
    runtime::events::{Recorder, Reporter},
};
use snafu::{ResultExt, Snafu};
use tracing::warn;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to publish event"))]
    PublishEvent { source: kube::Error },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

/// A user-visible event, surfaced on the owning cluster object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub type_: EventType,
    /// What was being done, e.g. `Restart`.
    pub action: String,
    /// Short machine-readable reason, e.g. `RestartScheduled`.
    pub reason: String,
    /// Human-readable description.
    pub message: String,
}

impl Event {
    pub fn normal(
        action: impl Into<String>,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: EventType::Normal,
            action: action.into(),
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn warning(
        action: impl Into<String>,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: EventType::Warning,
            action: action.into(),
            reason: reason.into(),
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn publish(&self, event: Event) -> Result<()>;
}

/// Publishes an event, logging instead of failing when the API call does:
/// events are diagnostics, never worth aborting a reconciliation for.
pub(crate) async fn emit<R>(recorder: &R, event: Event)
where
    R: EventRecorder + ?Sized,
{
    if let Err(error) = recorder.publish(event).await {
        warn!(
            error = &error as &dyn std::error::Error,
            "failed to publish event"
        );
    }
}

/// [`EventRecorder`] backed by the Kubernetes events API, reporting against
/// one object.
pub struct KubeEventRecorder {
    recorder: Recorder,
}

impl KubeEventRecorder {
    pub fn new<T>(client: kube::Client, controller: &str, object: &T) -> Self
    where
        T: Resource<DynamicType = ()>,
    {
        let recorder = Recorder::new(
            client,
            Reporter {
                controller: controller.to_string(),
                instance: None,
            },
            object.object_ref(&()),
        );

        Self { recorder }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn publish(&self, event: Event) -> Result<()> {
        let type_ = match event.type_ {
            EventType::Normal => kube::runtime::events::EventType::Normal,
            EventType::Warning => kube::runtime::events::EventType::Warning,
        };

        self.recorder
            .publish(kube::runtime::events::Event {
                type_,
                reason: event.reason,
                note: Some(event.message),
                action: event.action,
                secondary: None,
            })
            .await
            .context(PublishEventSnafu)
    }
}
