use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};

use super::{KubeClientInfo, Workload};

pub const EVENT_REASON_ADDED: &str = "AddedInterface";

/// Per-attachment event reporting. Best-effort by contract: a sink failure
/// never changes a command's outcome, and a missing sink drops events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn added_interface(&self, workload: &Workload, note: String);
}

#[async_trait]
impl EventSink for KubeClientInfo {
    async fn added_interface(&self, workload: &Workload, note: String) {
        let reference = ObjectReference {
            api_version: Some("v1".to_string()),
            kind: Some("Pod".to_string()),
            name: Some(workload.name.clone()),
            namespace: Some(workload.namespace.clone()),
            uid: workload.uid.clone(),
            ..Default::default()
        };
        let reporter = Reporter {
            controller: "weft-cni".to_string(),
            instance: None,
        };
        let recorder = Recorder::new(self.client.clone(), reporter, reference);
        let event = Event {
            type_: EventType::Normal,
            reason: EVENT_REASON_ADDED.to_string(),
            note: Some(note),
            action: "Add".to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            tracing::warn!(
                pod = %format!("{}/{}", workload.namespace, workload.name),
                error = %e,
                "failed to publish attachment event"
            );
        }
    }
}
