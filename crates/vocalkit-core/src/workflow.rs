use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU8, Ordering},
        Mutex,
    },
};

use serde::Serialize;

use crate::events::Event;

/// Terminal classification of one analysis run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowResult {
    /// The script exited 0 and never reported an unusable sample.
    Success,
    /// The script could not run or exited non-zero.
    Failed,
    /// The run was stopped before it finished.
    Cancelled,
    /// The script found no usable voice signal in the sample.
    Invalid,
}

/// What the UI should offer the user next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Remedy {
    ShowResults,
    ReselectFile,
    Rerecord,
}

impl WorkflowResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowResult::Success => "SUCCESS",
            WorkflowResult::Failed => "FAILED",
            WorkflowResult::Cancelled => "CANCELLED",
            WorkflowResult::Invalid => "INVALID",
        }
    }

    pub fn remedy(&self) -> Remedy {
        match self {
            WorkflowResult::Success => Remedy::ShowResults,
            WorkflowResult::Failed | WorkflowResult::Cancelled => Remedy::ReselectFile,
            WorkflowResult::Invalid => Remedy::Rerecord,
        }
    }

    fn code(self) -> u8 {
        match self {
            WorkflowResult::Success => 1,
            WorkflowResult::Failed => 2,
            WorkflowResult::Cancelled => 3,
            WorkflowResult::Invalid => 4,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(WorkflowResult::Success),
            2 => Some(WorkflowResult::Failed),
            3 => Some(WorkflowResult::Cancelled),
            4 => Some(WorkflowResult::Invalid),
            _ => None,
        }
    }
}

const PENDING: u8 = 0;

/// Single-assignment cell for the terminal result of one invocation.
///
/// The first `try_resolve` wins; later calls observe the stored result and
/// return `false`, so a racing mid-stream INVALID and an exit-code result can
/// never both be published.
#[derive(Debug, Default)]
pub struct TerminalLatch {
    state: AtomicU8,
}

impl TerminalLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_resolve(&self, result: WorkflowResult) -> bool {
        self.state
            .compare_exchange(PENDING, result.code(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn outcome(&self) -> Option<WorkflowResult> {
        WorkflowResult::from_code(self.state.load(Ordering::Acquire))
    }

    pub fn is_resolved(&self) -> bool {
        self.outcome().is_some()
    }
}

/// How many recently finished task ids a [`ResultGate`] remembers.
pub const RECENT_TASKS: usize = 64;

/// Consumer-side guard: admits the first terminal event per task id and
/// suppresses any repeat for the same invocation. Only the last
/// `capacity` task ids are remembered.
#[derive(Debug)]
pub struct ResultGate {
    recent: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl Default for ResultGate {
    fn default() -> Self {
        Self::with_capacity(RECENT_TASKS)
    }
}

impl ResultGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            recent: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    /// Returns the result when `event` is the first terminal event of its task.
    /// Events without a task id are always admitted.
    pub fn admit(&self, event: &Event) -> Option<WorkflowResult> {
        let result = event.workflow()?;
        let Some(task_id) = event.task_id() else {
            return Some(result);
        };
        let mut recent = self.recent.lock().unwrap_or_else(|p| p.into_inner());
        if recent.iter().any(|id| id == task_id) {
            return None;
        }
        if recent.len() == self.capacity {
            recent.pop_front();
        }
        recent.push_back(task_id.to_string());
        Some(result)
    }

    pub fn remembered(&self) -> usize {
        self.recent.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}
