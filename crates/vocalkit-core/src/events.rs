use serde::Serialize;

use crate::workflow::WorkflowResult;

/// Closed set of notifications crossing from the worker side to the UI side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    UpdateProgress,
    InstallStarted,
    InstallProgress,
    InstallSkipped,
    InstallFailed,
    WorkflowResult,
    TimerHour,
    TimerMinute,
    TimerSecond,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::UpdateProgress => "UPDATE_PROGRESS",
            EventKind::InstallStarted => "INSTALL_STARTED",
            EventKind::InstallProgress => "INSTALL_PROGRESS",
            EventKind::InstallSkipped => "INSTALL_SKIPPED",
            EventKind::InstallFailed => "INSTALL_FAILED",
            EventKind::WorkflowResult => "WORKFLOW_RESULT",
            EventKind::TimerHour => "TIMER_HOUR",
            EventKind::TimerMinute => "TIMER_MINUTE",
            EventKind::TimerSecond => "TIMER_SECOND",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum EventValue {
    Text(String),
    Fraction(f64),
    Workflow(WorkflowResult),
    Count(u64),
}

/// A published notification. Fields are read-only once built; every
/// subscriber receives its own copy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    name: EventKind,
    task_id: Option<String>,
    old_value: Option<EventValue>,
    new_value: Option<EventValue>,
}

impl Event {
    pub fn new(
        name: EventKind,
        old_value: Option<EventValue>,
        new_value: Option<EventValue>,
    ) -> Self {
        Self {
            name,
            task_id: None,
            old_value,
            new_value,
        }
    }

    /// Tags the event with the invocation that produced it.
    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn progress(status: impl Into<String>, fraction: f64) -> Self {
        Self::new(
            EventKind::UpdateProgress,
            Some(EventValue::Text(status.into())),
            Some(EventValue::Fraction(fraction)),
        )
    }

    pub fn install_started() -> Self {
        Self::new(EventKind::InstallStarted, None, None)
    }

    pub fn install_progress(line: impl Into<String>, fraction: f64) -> Self {
        Self::new(
            EventKind::InstallProgress,
            Some(EventValue::Text(line.into())),
            Some(EventValue::Fraction(fraction)),
        )
    }

    pub fn install_skipped() -> Self {
        Self::new(EventKind::InstallSkipped, None, None)
    }

    pub fn install_failed(detail: impl Into<String>) -> Self {
        Self::new(
            EventKind::InstallFailed,
            Some(EventValue::Text(detail.into())),
            None,
        )
    }

    pub fn workflow_result(detail: Option<String>, result: WorkflowResult) -> Self {
        Self::new(
            EventKind::WorkflowResult,
            detail.map(EventValue::Text),
            Some(EventValue::Workflow(result)),
        )
    }

    pub fn timer(kind: EventKind, value: u64) -> Self {
        Self::new(kind, None, Some(EventValue::Count(value)))
    }

    pub fn kind(&self) -> EventKind {
        self.name
    }

    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    pub fn old_value(&self) -> Option<&EventValue> {
        self.old_value.as_ref()
    }

    pub fn new_value(&self) -> Option<&EventValue> {
        self.new_value.as_ref()
    }

    /// Progress fraction carried in the new value, if any.
    pub fn fraction(&self) -> Option<f64> {
        match self.new_value {
            Some(EventValue::Fraction(f)) => Some(f),
            _ => None,
        }
    }

    /// Status string, install line or failure detail carried in the old value.
    pub fn text(&self) -> Option<&str> {
        match &self.old_value {
            Some(EventValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn workflow(&self) -> Option<WorkflowResult> {
        match (self.name, &self.new_value) {
            (EventKind::WorkflowResult, Some(EventValue::Workflow(r))) => Some(*r),
            _ => None,
        }
    }

    pub fn count(&self) -> Option<u64> {
        match self.new_value {
            Some(EventValue::Count(n)) => Some(n),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_event_carries_status_and_fraction() {
        let ev = Event::progress("Parsing dependency requirements...", 0.48).with_task_id("t-1");
        assert_eq!(ev.kind(), EventKind::UpdateProgress);
        assert_eq!(ev.text(), Some("Parsing dependency requirements..."));
        assert_eq!(ev.fraction(), Some(0.48));
        assert_eq!(ev.task_id(), Some("t-1"));
        assert_eq!(ev.workflow(), None);
    }

    #[test]
    fn workflow_event_without_detail_has_no_old_value() {
        let ev = Event::workflow_result(None, WorkflowResult::Success);
        assert!(ev.old_value().is_none());
        assert_eq!(ev.workflow(), Some(WorkflowResult::Success));
    }

    #[test]
    fn event_serializes_with_screaming_kind() {
        let ev = Event::workflow_result(Some("bad take".to_string()), WorkflowResult::Invalid);
        let v = serde_json::to_value(&ev).expect("serialize");
        assert_eq!(v["name"], "WORKFLOW_RESULT");
        assert_eq!(v["old_value"]["type"], "text");
        assert_eq!(v["new_value"]["value"], "INVALID");
        assert_eq!(EventKind::WorkflowResult.as_str(), "WORKFLOW_RESULT");
    }
}
