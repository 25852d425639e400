use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::models::time::{option_unix_millis, unix_millis};
use crate::models::{CoreError, CoreErrorKind};

/// Structured arguments handed verbatim to the inference backend.
pub type TaskParameters = BTreeMap<String, serde_json::Value>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    WebSearch,
    DataExtraction,
    FormFilling,
    PageSummary,
    Translation,
    Custom,
}

impl TaskType {
    pub const ALL: [TaskType; 6] = [
        TaskType::WebSearch,
        TaskType::DataExtraction,
        TaskType::FormFilling,
        TaskType::PageSummary,
        TaskType::Translation,
        TaskType::Custom,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::WebSearch => "web-search",
            TaskType::DataExtraction => "data-extraction",
            TaskType::FormFilling => "form-filling",
            TaskType::PageSummary => "page-summary",
            TaskType::Translation => "translation",
            TaskType::Custom => "custom",
        }
    }
}

impl Display for TaskType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = CoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|task_type| task_type.as_str() == raw)
            .ok_or_else(|| {
                CoreError::new(
                    CoreErrorKind::InvalidInput,
                    format!("unknown task type '{raw}'"),
                )
            })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    /// Reserved; no transition currently enters it.
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Paused,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::Cancelled)
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Pending, Cancelled)
                | (Paused, Cancelled)
                | (Failed, Pending)
                | (Cancelled, Pending)
        )
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = CoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == raw)
            .ok_or_else(|| {
                CoreError::new(
                    CoreErrorKind::InvalidInput,
                    format!("unknown task status '{raw}'"),
                )
            })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub description: String,
    pub parameters: TaskParameters,
    pub status: TaskStatus,
    pub progress: f64,
    pub result: Option<String>,
    pub error: Option<String>,
    #[serde(with = "unix_millis")]
    pub created_at: SystemTime,
    #[serde(with = "option_unix_millis")]
    pub completed_at: Option<SystemTime>,
}

impl Task {
    pub fn new(
        id: TaskId,
        task_type: TaskType,
        description: impl Into<String>,
        parameters: TaskParameters,
        created_at: SystemTime,
    ) -> Self {
        Self {
            id,
            task_type,
            description: description.into(),
            parameters,
            status: TaskStatus::Pending,
            progress: 0.0,
            result: None,
            error: None,
            created_at,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn mark_running(&mut self) -> Result<(), CoreError> {
        self.transition(TaskStatus::Running)?;
        Ok(())
    }

    /// Adds a progress delta, clamped to `[0.0, 1.0]`. Non-finite deltas are ignored.
    pub fn apply_progress(&mut self, delta: f64) -> Result<(), CoreError> {
        self.transition(TaskStatus::Running)?;
        if delta.is_finite() {
            self.progress = (self.progress + delta).clamp(0.0, 1.0);
        }
        Ok(())
    }

    pub fn complete(&mut self, result: Option<String>, now: SystemTime) -> Result<(), CoreError> {
        self.transition(TaskStatus::Completed)?;
        self.progress = 1.0;
        self.result = result;
        self.error = None;
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>, now: SystemTime) -> Result<(), CoreError> {
        self.transition(TaskStatus::Failed)?;
        self.result = None;
        self.error = Some(message.into());
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn cancel(&mut self, now: SystemTime) -> Result<(), CoreError> {
        self.transition(TaskStatus::Cancelled)?;
        self.result = None;
        self.error = None;
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn reset_for_retry(&mut self) -> Result<(), CoreError> {
        self.transition(TaskStatus::Pending)?;
        self.progress = 0.0;
        self.result = None;
        self.error = None;
        self.completed_at = None;
        Ok(())
    }

    fn transition(&mut self, next: TaskStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError {
                task: Some(self.id),
                task_type: Some(self.task_type),
                kind: CoreErrorKind::InvalidTransition,
                message: format!(
                    "task '{}' cannot transition from '{}' to '{next}'",
                    self.id, self.status
                ),
            });
        }
        self.status = next;
        Ok(())
    }
}
