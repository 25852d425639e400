use serde::Serialize;

use crate::models::{CoreError, CoreErrorKind, Task, TaskId, TaskStatistics, TaskStatus};
use crate::orchestration::OrchestrationResult;

/// In-memory view of every known task, most recent first.
///
/// Plain data: the [`ExecutionCoordinator`](crate::orchestration::ExecutionCoordinator)
/// owns the only instance in a running system and is its only writer.
#[derive(Clone, Debug, Default)]
pub struct TaskRegistry {
    tasks: Vec<Task>,
    current_task_id: Option<TaskId>,
    last_error: Option<CoreError>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySnapshot {
    pub tasks: Vec<Task>,
    pub current_task_id: Option<TaskId>,
    pub is_processing: bool,
    pub error: Option<CoreError>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from persisted records, newest first; duplicate ids keep the first seen.
    pub fn from_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        let mut ordered: Vec<Task> = Vec::new();
        for task in tasks {
            if !ordered.iter().any(|existing| existing.id == task.id) {
                ordered.push(task);
            }
        }
        ordered.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Self {
            tasks: ordered,
            current_task_id: None,
            last_error: None,
        }
    }

    pub fn insert(&mut self, task: Task) -> OrchestrationResult<()> {
        if self.contains(task.id) {
            return Err(CoreError {
                task: Some(task.id),
                task_type: Some(task.task_type),
                kind: CoreErrorKind::InvalidInput,
                message: format!("task id '{}' is already registered", task.id),
            });
        }
        self.tasks.insert(0, task);
        Ok(())
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.tasks.iter().any(|task| task.id == task_id)
    }

    pub fn get(&self, task_id: TaskId) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == task_id)
    }

    pub fn get_mut(&mut self, task_id: TaskId) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|task| task.id == task_id)
    }

    pub fn remove(&mut self, task_id: TaskId) -> Option<Task> {
        let index = self.tasks.iter().position(|task| task.id == task_id)?;
        if self.current_task_id == Some(task_id) {
            self.current_task_id = None;
        }
        Some(self.tasks.remove(index))
    }

    pub fn clear(&mut self) {
        self.tasks.clear();
        self.current_task_id = None;
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn with_status(&self, status: TaskStatus) -> Vec<Task> {
        self.tasks
            .iter()
            .filter(|task| task.status == status)
            .cloned()
            .collect()
    }

    pub fn running(&self) -> Vec<Task> {
        self.with_status(TaskStatus::Running)
    }

    pub fn completed(&self) -> Vec<Task> {
        self.with_status(TaskStatus::Completed)
    }

    pub fn failed(&self) -> Vec<Task> {
        self.with_status(TaskStatus::Failed)
    }

    /// Always derived from current task states, never cached.
    pub fn is_processing(&self) -> bool {
        self.tasks
            .iter()
            .any(|task| task.status == TaskStatus::Running)
    }

    pub fn current_task_id(&self) -> Option<TaskId> {
        self.current_task_id
    }

    pub fn set_current_task_id(&mut self, task_id: Option<TaskId>) -> OrchestrationResult<()> {
        if let Some(task_id) = task_id
            && !self.contains(task_id)
        {
            return Err(unknown_task(task_id));
        }
        self.current_task_id = task_id;
        Ok(())
    }

    pub fn last_error(&self) -> Option<&CoreError> {
        self.last_error.as_ref()
    }

    pub fn set_error(&mut self, error: CoreError) {
        self.last_error = Some(error);
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    pub fn statistics(&self) -> TaskStatistics {
        TaskStatistics::from_tasks(&self.tasks)
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            tasks: self.tasks.clone(),
            current_task_id: self.current_task_id,
            is_processing: self.is_processing(),
            error: self.last_error.clone(),
        }
    }
}

pub(crate) fn unknown_task(task_id: TaskId) -> CoreError {
    CoreError {
        task: Some(task_id),
        task_type: None,
        kind: CoreErrorKind::InvalidInput,
        message: format!("unknown task id '{task_id}'"),
    }
}
