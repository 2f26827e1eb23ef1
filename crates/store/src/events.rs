use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportType {
    Normal,
    Warning,
}

/// A user-visible event attached to the object it concerns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub type_: ReportType,
    pub reason: String,
    pub note: String,
    pub action: String,
}

impl Report {
    pub fn warning(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self { type_: ReportType::Warning, reason: reason.into(), note: note.into(), action: action.into() }
    }

    pub fn normal(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self { type_: ReportType::Normal, reason: reason.into(), note: note.into(), action: action.into() }
    }
}

/// Event publication never fails the caller; sinks log their own errors.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, regarding: ObjectReference, report: Report);
}
