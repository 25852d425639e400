use serde::Serialize;
use thiserror::Error;

use crate::models::{TaskId, TaskType};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreErrorKind {
    InvalidInput,
    NotConfigured,
    FeatureDisabled,
    InvalidTransition,
    InferenceFailure,
    Cancelled,
    StorageFailure,
    Internal,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Error)]
#[error("{kind:?}: {message}")]
pub struct CoreError {
    pub task: Option<TaskId>,
    pub task_type: Option<TaskType>,
    pub kind: CoreErrorKind,
    pub message: String,
}

impl CoreError {
    pub fn new(kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            task: None,
            task_type: None,
            kind,
            message: message.into(),
        }
    }

    /// Attributes the error to a task, keeping any attribution already present.
    pub fn for_task(self, task: TaskId, task_type: Option<TaskType>) -> Self {
        Self {
            task: self.task.or(Some(task)),
            task_type: self.task_type.or(task_type),
            kind: self.kind,
            message: self.message,
        }
    }
}
