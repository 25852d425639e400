pub mod coordinator;
mod journal;
pub mod registry;
pub mod sweeper;

pub use coordinator::{ExecutionCoordinator, INTERRUPTED_MESSAGE};
pub use registry::{RegistrySnapshot, TaskRegistry};
pub use sweeper::{RetentionPolicy, RetentionSweeper, SweeperHandle};

use crate::models::{CoreError, Task, TaskId};

pub type OrchestrationResult<T> = Result<T, CoreError>;

/// Change notifications published after each registry mutation.
///
/// Events mirror the in-memory registry: a task update is published even when the
/// matching store write failed, followed by an [`RegistryEvent::Error`].
#[derive(Clone, Debug, PartialEq)]
pub enum RegistryEvent {
    TaskUpserted(Task),
    TaskRemoved(TaskId),
    Cleared,
    Error(CoreError),
}
