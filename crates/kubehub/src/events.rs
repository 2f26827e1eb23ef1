use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use keel_store::{EventSink, Report, ReportType};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Publishes reports as core/v1 Events through the kube recorder.
#[derive(Clone)]
pub struct KubeEventSink {
    client: Client,
    reporter: Reporter,
}

impl KubeEventSink {
    pub fn new(client: Client, controller: &str) -> Self {
        let instance = std::env::var("POD_NAME").ok();
        Self { client, reporter: Reporter { controller: controller.to_string(), instance } }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, regarding: ObjectReference, report: Report) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), regarding.clone());
        let type_ = match report.type_ {
            ReportType::Normal => EventType::Normal,
            ReportType::Warning => EventType::Warning,
        };
        let event = Event {
            type_,
            reason: report.reason.clone(),
            note: Some(report.note),
            action: report.action,
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!(
                reason = %report.reason,
                ns = regarding.namespace.as_deref().unwrap_or_default(),
                name = regarding.name.as_deref().unwrap_or_default(),
                error = %e,
                "failed to publish event"
            );
        }
    }
}
