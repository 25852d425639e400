use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::models::{CoreError, CoreErrorKind, Task, TaskId, TaskType};
use crate::orchestration::OrchestrationResult;
use crate::persistence::TaskStore;

/// Orders store writes per task without holding the registry lock.
///
/// Every in-memory mutation stages a write under the registry lock and receives
/// the task's next revision. The write itself happens after the registry lock is
/// released, behind a per-task lock that remembers the last revision the store
/// accepted. A write that arrives after a newer one has landed is skipped, so
/// the store only ever moves forward.
#[derive(Default)]
pub(crate) struct WriteJournal {
    tasks: HashMap<TaskId, TaskLedger>,
}

struct TaskLedger {
    revision: u64,
    written: Arc<Mutex<u64>>,
}

pub(crate) enum WriteOp {
    Put(Box<Task>),
    Delete,
}

/// A write staged under the registry lock, committed after it is released.
pub(crate) struct StagedWrite {
    task_id: TaskId,
    task_type: Option<TaskType>,
    revision: u64,
    written: Arc<Mutex<u64>>,
    op: WriteOp,
}

/// Removal of every task the journal knows about, committed with one `delete_all`.
pub(crate) struct StagedClear {
    ledgers: Vec<(u64, Arc<Mutex<u64>>)>,
}

impl WriteJournal {
    pub(crate) fn stage_put(&mut self, task: &Task) -> StagedWrite {
        self.stage(task.id, Some(task.task_type), WriteOp::Put(Box::new(task.clone())))
    }

    /// Stages a delete and forgets the task; ids are never handed out twice.
    pub(crate) fn stage_delete(&mut self, task_id: TaskId) -> StagedWrite {
        let staged = self.stage(task_id, None, WriteOp::Delete);
        self.tasks.remove(&task_id);
        staged
    }

    pub(crate) fn stage_clear(&mut self) -> StagedClear {
        let ledgers = self
            .tasks
            .drain()
            .map(|(_, ledger)| (ledger.revision + 1, ledger.written))
            .collect();
        StagedClear { ledgers }
    }

    /// True when nothing has been staged for `task_id` since `revision`.
    pub(crate) fn is_latest(&self, task_id: TaskId, revision: u64) -> bool {
        self.tasks
            .get(&task_id)
            .is_some_and(|ledger| ledger.revision == revision)
    }

    fn stage(&mut self, task_id: TaskId, task_type: Option<TaskType>, op: WriteOp) -> StagedWrite {
        let ledger = self.tasks.entry(task_id).or_insert_with(|| TaskLedger {
            revision: 0,
            written: Arc::new(Mutex::new(0)),
        });
        ledger.revision += 1;
        StagedWrite {
            task_id,
            task_type,
            revision: ledger.revision,
            written: ledger.written.clone(),
            op,
        }
    }
}

impl StagedWrite {
    pub(crate) fn revision(&self) -> u64 {
        self.revision
    }

    /// Applies the write unless a newer revision already reached the store.
    ///
    /// The per-task guard moves into the blocking closure, so an aborted caller
    /// cannot let a later write overtake one that is still running.
    pub(crate) async fn commit(self, store: Arc<dyn TaskStore>) -> OrchestrationResult<()> {
        let Self {
            task_id,
            task_type,
            revision,
            written,
            op,
        } = self;

        let mut guard = written.lock_owned().await;
        if *guard >= revision {
            tracing::trace!(task_id = task_id.0, revision, "skipping superseded store write");
            return Ok(());
        }

        run_blocking(Some(task_id), move || {
            let outcome = match &op {
                WriteOp::Put(task) => store.put(task),
                WriteOp::Delete => store.delete(task_id),
            };
            if outcome.is_ok() {
                *guard = revision;
            }
            outcome
        })
        .await
        .map_err(|error| error.for_task(task_id, task_type))
    }
}

impl StagedClear {
    pub(crate) async fn commit(self, store: Arc<dyn TaskStore>) -> OrchestrationResult<()> {
        let mut guards: Vec<(u64, OwnedMutexGuard<u64>)> = Vec::with_capacity(self.ledgers.len());
        for (revision, written) in self.ledgers {
            guards.push((revision, written.lock_owned().await));
        }

        run_blocking(None, move || {
            store.delete_all()?;
            for (revision, guard) in &mut guards {
                **guard = (**guard).max(*revision);
            }
            Ok(())
        })
        .await
    }
}

pub(crate) async fn run_blocking<T, F>(
    task_id: Option<TaskId>,
    operation: F,
) -> OrchestrationResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> OrchestrationResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(operation)
        .await
        .map_err(|join_error| CoreError {
            task: task_id,
            task_type: None,
            kind: CoreErrorKind::Internal,
            message: format!("task persistence join failure: {join_error}"),
        })?
}
