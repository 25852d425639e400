pub mod memory;

pub use memory::InMemoryTaskStore;

use crate::models::{AiSettings, CoreError, Task, TaskId};

pub type PersistenceResult<T> = Result<T, CoreError>;

pub trait MigrationStore: Send + Sync {
    fn current_version(&self) -> PersistenceResult<i64>;

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()>;
}

/// Durable mirror of the task registry. Pure CRUD keyed by task id.
pub trait TaskStore: Send + Sync {
    /// Inserts or replaces the record with the same id.
    fn put(&self, task: &Task) -> PersistenceResult<()>;

    fn delete(&self, task_id: TaskId) -> PersistenceResult<()>;

    fn list_all(&self) -> PersistenceResult<Vec<Task>>;

    fn delete_all(&self) -> PersistenceResult<()>;

    /// Smallest id never handed out before, deleted records included.
    fn next_task_id(&self) -> PersistenceResult<u64>;
}

pub trait SettingsStore: Send + Sync {
    fn load_settings(&self) -> PersistenceResult<Option<AiSettings>>;

    fn save_settings(&self, settings: &AiSettings) -> PersistenceResult<()>;
}
