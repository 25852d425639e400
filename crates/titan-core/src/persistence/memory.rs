use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::models::{AiSettings, CoreError, CoreErrorKind, Task, TaskId};
use crate::persistence::{PersistenceResult, SettingsStore, TaskStore};

/// Process-local store for tests and sessions that opt out of durability.
#[derive(Default)]
pub struct InMemoryTaskStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    tasks: BTreeMap<TaskId, Task>,
    high_water: u64,
    settings: Option<AiSettings>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        let store = Self::default();
        if let Ok(mut state) = store.state.lock() {
            for task in tasks {
                state.high_water = state.high_water.max(task.id.0);
                state.tasks.insert(task.id, task);
            }
        }
        store
    }

    pub fn get(&self, task_id: TaskId) -> Option<Task> {
        self.lock_state()
            .ok()
            .and_then(|state| state.tasks.get(&task_id).cloned())
    }

    pub fn len(&self) -> usize {
        self.lock_state().map(|state| state.tasks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_state(&self) -> PersistenceResult<MutexGuard<'_, MemoryState>> {
        self.state.lock().map_err(|_| {
            CoreError::new(CoreErrorKind::StorageFailure, "in-memory task store mutex poisoned")
        })
    }
}

impl TaskStore for InMemoryTaskStore {
    fn put(&self, task: &Task) -> PersistenceResult<()> {
        let mut state = self.lock_state()?;
        state.high_water = state.high_water.max(task.id.0);
        state.tasks.insert(task.id, task.clone());
        Ok(())
    }

    fn delete(&self, task_id: TaskId) -> PersistenceResult<()> {
        self.lock_state()?.tasks.remove(&task_id);
        Ok(())
    }

    fn list_all(&self) -> PersistenceResult<Vec<Task>> {
        Ok(self.lock_state()?.tasks.values().cloned().collect())
    }

    fn delete_all(&self) -> PersistenceResult<()> {
        self.lock_state()?.tasks.clear();
        Ok(())
    }

    fn next_task_id(&self) -> PersistenceResult<u64> {
        Ok(self.lock_state()?.high_water.saturating_add(1))
    }
}

impl SettingsStore for InMemoryTaskStore {
    fn load_settings(&self) -> PersistenceResult<Option<AiSettings>> {
        Ok(self.lock_state()?.settings.clone())
    }

    fn save_settings(&self, settings: &AiSettings) -> PersistenceResult<()> {
        self.lock_state()?.settings = Some(settings.clone());
        Ok(())
    }
}
