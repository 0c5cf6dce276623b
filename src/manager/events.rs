//! # Event Recording
//!
//! Reconcilers publish Kubernetes Events through an [`EventRecorder`] handed
//! out by the Manager. Publishing is fire-and-forget: failures are logged and
//! never fail a reconcile.

use crate::client::ClientError;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::core::DynamicObject;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

/// One event as handed to a sink
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub reporter: String,
    pub regarding: ObjectReference,
    pub warning: bool,
    pub reason: String,
    pub action: String,
    pub note: Option<String>,
}

/// Destination for recorded events
#[async_trait]
pub trait EventSink: Send + Sync + fmt::Debug {
    async fn publish(&self, event: RecordedEvent) -> Result<(), ClientError>;
}

/// Sink writing `events.k8s.io` Events through `kube::runtime::events::Recorder`
pub struct KubeEventSink {
    client: Client,
    recorders: Mutex<HashMap<String, Recorder>>,
}

impl fmt::Debug for KubeEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeEventSink").finish_non_exhaustive()
    }
}

impl KubeEventSink {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            recorders: Mutex::new(HashMap::new()),
        }
    }

    /// One recorder per reporter so repeated events are folded into series
    fn recorder(&self, reporter: &str) -> Recorder {
        let mut recorders = self.recorders.lock().unwrap_or_else(PoisonError::into_inner);
        recorders
            .entry(reporter.to_string())
            .or_insert_with(|| {
                Recorder::new(
                    self.client.clone(),
                    Reporter {
                        controller: reporter.to_string(),
                        instance: std::env::var("POD_NAME").ok(),
                    },
                )
            })
            .clone()
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, event: RecordedEvent) -> Result<(), ClientError> {
        let recorder = self.recorder(&event.reporter);
        let payload = Event {
            type_: if event.warning {
                EventType::Warning
            } else {
                EventType::Normal
            },
            reason: event.reason,
            note: event.note,
            action: event.action,
            secondary: None,
        };
        recorder.publish(&payload, &event.regarding).await?;
        Ok(())
    }
}

/// Sink keeping every event in memory
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryEventSink {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn publish(&self, event: RecordedEvent) -> Result<(), ClientError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
        Ok(())
    }
}

/// Well-known event reasons
pub mod reasons {
    pub const INSTALLED: &str = "Installed";
    pub const INSTALLATION_FAILED: &str = "InstallationFailed";
    pub const DELETING: &str = "Deleting";
}

/// Events on behalf of one named reporter
#[derive(Clone)]
pub struct EventRecorder {
    reporter: String,
    sink: Arc<dyn EventSink>,
}

impl fmt::Debug for EventRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRecorder")
            .field("reporter", &self.reporter)
            .finish_non_exhaustive()
    }
}

impl EventRecorder {
    pub fn new(reporter: &str, sink: Arc<dyn EventSink>) -> Self {
        Self {
            reporter: reporter.to_string(),
            sink,
        }
    }

    pub fn reporter(&self) -> &str {
        &self.reporter
    }

    pub async fn normal(&self, object: &DynamicObject, reason: &str, note: impl Into<String>) {
        self.publish(object, false, reason, note.into()).await;
    }

    pub async fn warning(&self, object: &DynamicObject, reason: &str, note: impl Into<String>) {
        self.publish(object, true, reason, note.into()).await;
    }

    async fn publish(&self, object: &DynamicObject, warning: bool, reason: &str, note: String) {
        let event = RecordedEvent {
            reporter: self.reporter.clone(),
            regarding: reference_to(object),
            warning,
            reason: reason.to_string(),
            action: "Reconcile".to_string(),
            note: Some(note),
        };
        if let Err(e) = self.sink.publish(event).await {
            warn!(reason, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

fn reference_to(object: &DynamicObject) -> ObjectReference {
    ObjectReference {
        api_version: object.types.as_ref().map(|t| t.api_version.clone()),
        kind: object.types.as_ref().map(|t| t.kind.clone()),
        name: object.metadata.name.clone(),
        namespace: object.metadata.namespace.clone(),
        uid: object.metadata.uid.clone(),
        resource_version: object.metadata.resource_version.clone(),
        ..ObjectReference::default()
    }
}
