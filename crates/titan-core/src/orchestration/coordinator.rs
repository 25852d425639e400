use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::{Mutex, broadcast};
use tokio::task::AbortHandle;

use crate::inference::{InferenceClient, InferenceEvent};
use crate::models::{
    AiSettings, ConfigurationGate, CoreError, CoreErrorKind, SettingsHandle, Task, TaskId,
    TaskParameters, TaskStatistics, TaskStatus, TaskType,
};
use crate::orchestration::journal::{StagedWrite, WriteJournal, run_blocking};
use crate::orchestration::registry::{RegistrySnapshot, TaskRegistry, unknown_task};
use crate::orchestration::sweeper::RetentionPolicy;
use crate::orchestration::{OrchestrationResult, RegistryEvent};
use crate::persistence::TaskStore;

pub const INTERRUPTED_MESSAGE: &str = "execution interrupted before completion";

const EVENT_CAPACITY: usize = 256;

/// Owns the task registry and every in-flight execution.
///
/// Mutations are applied to the registry under one async lock and stage a store
/// write there. The write runs after the lock is released, ordered per task by
/// the write journal, so a slow store never holds up reads or other tasks. Each
/// running task is driven by its own spawned pump that relays stream events back
/// through the same lock and waits for its write before taking the next event.
#[derive(Clone)]
pub struct ExecutionCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    state: Mutex<CoordinatorState>,
    store: Arc<dyn TaskStore>,
    inference: Arc<dyn InferenceClient>,
    settings: SettingsHandle,
    gate: Arc<dyn ConfigurationGate>,
    events: broadcast::Sender<RegistryEvent>,
}

struct CoordinatorState {
    registry: TaskRegistry,
    active: HashMap<TaskId, ActiveExecution>,
    journal: WriteJournal,
    next_task_id: u64,
    next_generation: u64,
}

struct ActiveExecution {
    generation: u64,
    abort: AbortHandle,
}

enum Outcome {
    Completed(Option<String>),
    Failed(String),
}

impl CoordinatorState {
    fn is_current(&self, task_id: TaskId, generation: u64) -> bool {
        self.active
            .get(&task_id)
            .is_some_and(|execution| execution.generation == generation)
    }
}

impl ExecutionCoordinator {
    /// Rehydrates the registry from `store`, gating execution on `settings`.
    pub async fn load(
        store: Arc<dyn TaskStore>,
        inference: Arc<dyn InferenceClient>,
        settings: SettingsHandle,
    ) -> OrchestrationResult<Self> {
        let gate: Arc<dyn ConfigurationGate> = Arc::new(settings.clone());
        Self::load_with_gate(store, inference, settings, gate).await
    }

    pub async fn load_with_gate(
        store: Arc<dyn TaskStore>,
        inference: Arc<dyn InferenceClient>,
        settings: SettingsHandle,
        gate: Arc<dyn ConfigurationGate>,
    ) -> OrchestrationResult<Self> {
        let reader = store.clone();
        let (tasks, stored_next_id) = run_blocking(None, move || {
            Ok((reader.list_all()?, reader.next_task_id()?))
        })
        .await?;

        let mut registry = TaskRegistry::from_tasks(tasks);

        // no stream survives a restart, so anything left running is failed
        let now = SystemTime::now();
        let interrupted: Vec<TaskId> = registry.running().iter().map(|task| task.id).collect();
        for task_id in &interrupted {
            let Some(task) = registry.get_mut(*task_id) else {
                continue;
            };
            task.fail(INTERRUPTED_MESSAGE, now)?;
            let updated = task.clone();
            let writer = store.clone();
            let task_id = *task_id;
            run_blocking(Some(task_id), move || {
                writer
                    .put(&updated)
                    .map_err(|error| error.for_task(task_id, Some(updated.task_type)))
            })
            .await?;
        }

        let next_task_id = registry
            .tasks()
            .iter()
            .map(|task| task.id.0.saturating_add(1))
            .max()
            .unwrap_or(1)
            .max(stored_next_id)
            .max(1);

        tracing::info!(
            tasks = registry.len(),
            interrupted = interrupted.len(),
            next_task_id,
            "task registry rehydrated"
        );

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            inner: Arc::new(CoordinatorInner {
                state: Mutex::new(CoordinatorState {
                    registry,
                    active: HashMap::new(),
                    journal: WriteJournal::default(),
                    next_task_id,
                    next_generation: 0,
                }),
                store,
                inference,
                settings,
                gate,
                events,
            }),
        })
    }

    /// Registers a pending task, persists it, focuses it, then executes it.
    ///
    /// The returned value is the task as first registered (`pending`). Only a failed
    /// write of that first record is an `Err`; execution problems are reported
    /// through the task or the registry error.
    pub async fn create_task(
        &self,
        task_type: TaskType,
        description: impl Into<String>,
        parameters: TaskParameters,
    ) -> OrchestrationResult<Task> {
        let (task, write) = {
            let mut state = self.inner.state.lock().await;
            let task_id = TaskId(state.next_task_id);
            state.next_task_id = state.next_task_id.saturating_add(1);

            let task = Task::new(
                task_id,
                task_type,
                description,
                parameters,
                SystemTime::now(),
            );
            state.registry.insert(task.clone())?;
            let write = state.journal.stage_put(&task);
            (task, write)
        };

        let revision = write.revision();
        if let Err(error) = self.inner.write_through(write).await {
            let mut state = self.inner.state.lock().await;
            if state.journal.is_latest(task.id, revision) {
                state.registry.remove(task.id);
            }
            return Err(error);
        }

        {
            let mut state = self.inner.state.lock().await;
            if state.registry.contains(task.id) {
                state.registry.set_current_task_id(Some(task.id))?;
            }
            self.inner.emit(RegistryEvent::TaskUpserted(task.clone()));
        }

        tracing::info!(
            task_id = task.id.0,
            task_type = %task.task_type,
            "task created"
        );

        if let Err(error) = self.execute(task.id).await {
            tracing::warn!(
                task_id = task.id.0,
                kind = ?error.kind,
                message = %error.message,
                "created task could not be started"
            );
        }
        Ok(task)
    }

    /// Starts streaming execution of a pending task.
    ///
    /// A no-op when the task already has an active execution or is not pending. When
    /// the backend is not configured (or the task type is switched off) a registry
    /// level error is recorded and nothing is scheduled.
    pub async fn execute(&self, task_id: TaskId) -> OrchestrationResult<()> {
        let mut state = self.inner.state.lock().await;
        let task = state
            .registry
            .get(task_id)
            .cloned()
            .ok_or_else(|| unknown_task(task_id))?;

        if state.active.contains_key(&task_id) {
            tracing::debug!(task_id = task_id.0, "task already has an active execution");
            return Ok(());
        }
        if task.status != TaskStatus::Pending {
            tracing::debug!(
                task_id = task_id.0,
                status = %task.status,
                "only pending tasks can be executed"
            );
            return Ok(());
        }

        if !self.inner.gate.is_configured() {
            self.inner.surface_error(
                &mut state,
                CoreError {
                    task: Some(task_id),
                    task_type: Some(task.task_type),
                    kind: CoreErrorKind::NotConfigured,
                    message: "AI backend is not configured; add an API key in settings"
                        .to_string(),
                },
            );
            return Ok(());
        }
        if !self.inner.gate.is_enabled(task.task_type) {
            self.inner.surface_error(
                &mut state,
                CoreError {
                    task: Some(task_id),
                    task_type: Some(task.task_type),
                    kind: CoreErrorKind::FeatureDisabled,
                    message: format!("'{}' tasks are disabled in settings", task.task_type),
                },
            );
            return Ok(());
        }

        let mut running = task.clone();
        running.mark_running()?;
        if let Some(slot) = state.registry.get_mut(task_id) {
            *slot = running.clone();
        }
        let write = state.journal.stage_put(&running);
        drop(state);

        let revision = write.revision();
        if let Err(error) = self.inner.write_through(write).await {
            let mut state = self.inner.state.lock().await;
            if state.journal.is_latest(task_id, revision)
                && let Some(slot) = state.registry.get_mut(task_id)
            {
                *slot = task;
            }
            return Err(error);
        }

        let mut state = self.inner.state.lock().await;
        if !state.journal.is_latest(task_id, revision) || state.active.contains_key(&task_id) {
            tracing::debug!(task_id = task_id.0, "task changed before its execution started");
            return Ok(());
        }
        self.inner.emit(RegistryEvent::TaskUpserted(running.clone()));

        let generation = state.next_generation;
        state.next_generation = state.next_generation.wrapping_add(1);

        // the pump blocks on this lock before touching state, so the entry below
        // is always registered before its first event is applied
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            inner.run_execution(running, generation).await;
        });
        state.active.insert(
            task_id,
            ActiveExecution {
                generation,
                abort: handle.abort_handle(),
            },
        );

        tracing::info!(task_id = task_id.0, task_type = %task.task_type, "task execution started");
        Ok(())
    }

    /// Stops a task's subscription and marks it cancelled. Terminal tasks are left alone.
    pub async fn cancel(&self, task_id: TaskId) -> OrchestrationResult<()> {
        let (had_execution, write) = {
            let mut state = self.inner.state.lock().await;
            let status = state
                .registry
                .get(task_id)
                .map(|task| task.status)
                .ok_or_else(|| unknown_task(task_id))?;
            if status.is_terminal() {
                tracing::debug!(task_id = task_id.0, status = %status, "cancel ignored for terminal task");
                return Ok(());
            }

            let execution = state.active.remove(&task_id);
            if let Some(execution) = &execution {
                execution.abort.abort();
            }

            let task = state
                .registry
                .get_mut(task_id)
                .ok_or_else(|| unknown_task(task_id))?;
            task.cancel(SystemTime::now())?;
            let updated = task.clone();

            let write = state.journal.stage_put(&updated);
            self.inner.emit(RegistryEvent::TaskUpserted(updated));
            (execution.is_some(), write)
        };

        tracing::info!(task_id = task_id.0, "task cancelled");
        let stored = self.inner.write_through(write).await;
        if had_execution {
            self.inner.request_backend_cancel(task_id).await;
        }
        stored
    }

    /// Resets a failed or cancelled task to pending and executes it again.
    pub async fn retry(&self, task_id: TaskId) -> OrchestrationResult<()> {
        let (previous, reset, write) = {
            let mut state = self.inner.state.lock().await;
            let previous = state
                .registry
                .get(task_id)
                .cloned()
                .ok_or_else(|| unknown_task(task_id))?;
            if !previous.status.is_retryable() {
                tracing::debug!(
                    task_id = task_id.0,
                    status = %previous.status,
                    "retry ignored for task that has not failed or been cancelled"
                );
                return Ok(());
            }

            let mut reset = previous.clone();
            reset.reset_for_retry()?;
            if let Some(slot) = state.registry.get_mut(task_id) {
                *slot = reset.clone();
            }
            let write = state.journal.stage_put(&reset);
            (previous, reset, write)
        };

        let revision = write.revision();
        if let Err(error) = self.inner.write_through(write).await {
            let mut state = self.inner.state.lock().await;
            if state.journal.is_latest(task_id, revision)
                && let Some(slot) = state.registry.get_mut(task_id)
            {
                *slot = previous;
            }
            return Err(error);
        }
        self.inner.emit(RegistryEvent::TaskUpserted(reset));

        tracing::info!(task_id = task_id.0, "task retry requested");
        self.execute(task_id).await
    }

    /// Removes a task from the registry and the store, stopping any execution first.
    pub async fn delete_task(&self, task_id: TaskId) -> OrchestrationResult<()> {
        let (had_execution, write) = {
            let mut state = self.inner.state.lock().await;
            if !state.registry.contains(task_id) {
                return Err(unknown_task(task_id));
            }

            let execution = state.active.remove(&task_id);
            if let Some(execution) = &execution {
                execution.abort.abort();
            }
            state.registry.remove(task_id);

            let write = state.journal.stage_delete(task_id);
            self.inner.emit(RegistryEvent::TaskRemoved(task_id));
            (execution.is_some(), write)
        };

        tracing::info!(task_id = task_id.0, "task deleted");
        let stored = self.inner.write_through(write).await;
        if had_execution {
            self.inner.request_backend_cancel(task_id).await;
        }
        stored
    }

    /// Cancels every active subscription, then empties the registry and the store.
    pub async fn clear_all(&self) -> OrchestrationResult<()> {
        let (cancelled, clear) = {
            let mut state = self.inner.state.lock().await;
            let cancelled: Vec<TaskId> = state
                .active
                .drain()
                .map(|(task_id, execution)| {
                    execution.abort.abort();
                    task_id
                })
                .collect();
            state.registry.clear();

            let clear = state.journal.stage_clear();
            self.inner.emit(RegistryEvent::Cleared);
            (cancelled, clear)
        };

        tracing::info!(cancelled = cancelled.len(), "task registry cleared");
        let stored = clear.commit(self.inner.store.clone()).await;
        if let Err(error) = &stored {
            let mut state = self.inner.state.lock().await;
            self.inner.surface_error(&mut state, error.clone());
        }
        for task_id in cancelled {
            self.inner.request_backend_cancel(task_id).await;
        }
        stored
    }

    /// Evicts completed/failed tasks older than the configured retention window.
    pub async fn sweep_expired(&self, now: SystemTime) -> OrchestrationResult<Vec<TaskId>> {
        let policy = RetentionPolicy::from_settings(&self.inner.settings.get());
        self.sweep_with(&policy, now).await
    }

    pub async fn sweep_with(
        &self,
        policy: &RetentionPolicy,
        now: SystemTime,
    ) -> OrchestrationResult<Vec<TaskId>> {
        let (expired, writes) = {
            let mut state = self.inner.state.lock().await;
            let expired = policy.expired_ids(state.registry.tasks(), now);
            let mut writes = Vec::with_capacity(expired.len());
            for task_id in &expired {
                state.registry.remove(*task_id);
                writes.push(state.journal.stage_delete(*task_id));
                self.inner.emit(RegistryEvent::TaskRemoved(*task_id));
            }
            (expired, writes)
        };

        let mut first_error = None;
        for write in writes {
            if let Err(error) = self.inner.write_through(write).await {
                first_error.get_or_insert(error);
            }
        }

        if !expired.is_empty() {
            tracing::info!(removed = expired.len(), "expired tasks swept");
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(expired),
        }
    }

    pub async fn tasks(&self) -> Vec<Task> {
        self.inner.state.lock().await.registry.tasks().to_vec()
    }

    pub async fn task(&self, task_id: TaskId) -> Option<Task> {
        self.inner.state.lock().await.registry.get(task_id).cloned()
    }

    pub async fn running_tasks(&self) -> Vec<Task> {
        self.inner.state.lock().await.registry.running()
    }

    pub async fn completed_tasks(&self) -> Vec<Task> {
        self.inner.state.lock().await.registry.completed()
    }

    pub async fn failed_tasks(&self) -> Vec<Task> {
        self.inner.state.lock().await.registry.failed()
    }

    pub async fn statistics(&self) -> TaskStatistics {
        self.inner.state.lock().await.registry.statistics()
    }

    pub async fn is_processing(&self) -> bool {
        self.inner.state.lock().await.registry.is_processing()
    }

    pub async fn current_task_id(&self) -> Option<TaskId> {
        self.inner.state.lock().await.registry.current_task_id()
    }

    pub async fn set_current_task(&self, task_id: Option<TaskId>) -> OrchestrationResult<()> {
        self.inner
            .state
            .lock()
            .await
            .registry
            .set_current_task_id(task_id)
    }

    pub async fn last_error(&self) -> Option<CoreError> {
        self.inner.state.lock().await.registry.last_error().cloned()
    }

    pub async fn clear_error(&self) {
        self.inner.state.lock().await.registry.clear_error();
    }

    pub async fn snapshot(&self) -> RegistrySnapshot {
        self.inner.state.lock().await.registry.snapshot()
    }

    pub async fn active_execution_count(&self) -> usize {
        self.inner.state.lock().await.active.len()
    }

    pub async fn has_active_execution(&self, task_id: TaskId) -> bool {
        self.inner.state.lock().await.active.contains_key(&task_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.inner.settings
    }

    /// Persists `settings` and makes them visible to the next `execute`.
    pub fn update_settings(&self, settings: AiSettings) -> OrchestrationResult<()> {
        self.inner.settings.update(settings)
    }
}

impl CoordinatorInner {
    async fn run_execution(self: Arc<Self>, task: Task, generation: u64) {
        let task_id = task.id;
        let mut stream = match self.inference.open_stream(&task).await {
            Ok(stream) => stream,
            Err(error) => {
                self.finish(task_id, generation, Outcome::Failed(error.message))
                    .await;
                return;
            }
        };

        let mut fragments = String::new();
        while let Some(event) = stream.next().await {
            match event {
                InferenceEvent::Progress {
                    delta,
                    partial_result,
                } => {
                    if let Some(fragment) = partial_result {
                        fragments.push_str(&fragment);
                    }
                    if !self.apply_progress(task_id, generation, delta).await {
                        return;
                    }
                }
                InferenceEvent::Completed { result } => {
                    self.finish(task_id, generation, Outcome::Completed(Some(result)))
                        .await;
                    return;
                }
                InferenceEvent::Failed { message } => {
                    self.finish(task_id, generation, Outcome::Failed(message))
                        .await;
                    return;
                }
            }
        }

        let result = (!fragments.is_empty()).then_some(fragments);
        self.finish(task_id, generation, Outcome::Completed(result))
            .await;
    }

    /// Returns `false` once the execution has been superseded and the pump should stop.
    async fn apply_progress(&self, task_id: TaskId, generation: u64, delta: f64) -> bool {
        let write = {
            let mut state = self.state.lock().await;
            if !state.is_current(task_id, generation) {
                tracing::debug!(task_id = task_id.0, "dropping update for superseded execution");
                return false;
            }
            let Some(task) = state.registry.get_mut(task_id) else {
                return false;
            };
            if let Err(error) = task.apply_progress(delta) {
                tracing::warn!(task_id = task_id.0, message = %error.message, "progress update rejected");
                return false;
            }
            let updated = task.clone();
            let write = state.journal.stage_put(&updated);
            self.emit(RegistryEvent::TaskUpserted(updated));
            write
        };

        // a failed write is recorded on the registry; the in-memory view keeps the update
        let _ = self.write_through(write).await;
        true
    }

    async fn finish(&self, task_id: TaskId, generation: u64, outcome: Outcome) {
        let mut state = self.state.lock().await;
        if !state.is_current(task_id, generation) {
            tracing::debug!(task_id = task_id.0, "dropping outcome of superseded execution");
            return;
        }
        state.active.remove(&task_id);

        let Some(task) = state.registry.get_mut(task_id) else {
            return;
        };
        let now = SystemTime::now();
        let transition = match outcome {
            Outcome::Completed(result) => task.complete(result, now),
            Outcome::Failed(message) => task.fail(message, now),
        };
        if let Err(error) = transition {
            tracing::warn!(task_id = task_id.0, message = %error.message, "terminal transition rejected");
            return;
        }
        let updated = task.clone();
        let write = state.journal.stage_put(&updated);
        self.emit(RegistryEvent::TaskUpserted(updated.clone()));
        drop(state);

        match updated.status {
            TaskStatus::Failed => tracing::warn!(
                task_id = task_id.0,
                task_type = %updated.task_type,
                message = updated.error.as_deref().unwrap_or_default(),
                "task execution failed"
            ),
            _ => tracing::info!(
                task_id = task_id.0,
                task_type = %updated.task_type,
                "task execution completed"
            ),
        }

        let _ = self.write_through(write).await;
    }

    /// Commits a staged write and records a failure on the registry.
    async fn write_through(&self, write: StagedWrite) -> OrchestrationResult<()> {
        let stored = write.commit(self.store.clone()).await;
        if let Err(error) = &stored {
            let mut state = self.state.lock().await;
            self.surface_error(&mut state, error.clone());
        }
        stored
    }

    fn surface_error(&self, state: &mut CoordinatorState, error: CoreError) {
        tracing::error!(
            task_id = error.task.map(|task_id| task_id.0),
            kind = ?error.kind,
            message = %error.message,
            "task registry error"
        );
        state.registry.set_error(error.clone());
        self.emit(RegistryEvent::Error(error));
    }

    async fn request_backend_cancel(&self, task_id: TaskId) {
        if let Err(error) = self.inference.cancel(task_id).await {
            tracing::warn!(
                task_id = task_id.0,
                kind = ?error.kind,
                message = %error.message,
                "backend cancellation request failed"
            );
        }
    }

    fn emit(&self, event: RegistryEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}
