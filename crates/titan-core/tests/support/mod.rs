#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;

use titan_core::inference::{InferenceClient, InferenceFuture, InferenceSender, InferenceStream};
use titan_core::models::{
    AiSettings, CoreError, CoreErrorKind, SettingsHandle, Task, TaskId, TaskStatus,
};
use titan_core::orchestration::ExecutionCoordinator;
use titan_core::persistence::{InMemoryTaskStore, PersistenceResult, TaskStore};

/// Hands every opened stream's sender to the test so events can be driven by hand.
pub struct ManualInference {
    opened: mpsc::UnboundedSender<(TaskId, InferenceSender)>,
    cancels: Mutex<Vec<TaskId>>,
    open_error: Option<String>,
}

pub struct OpenedStreams {
    receiver: mpsc::UnboundedReceiver<(TaskId, InferenceSender)>,
}

impl ManualInference {
    pub fn new() -> (Arc<Self>, OpenedStreams) {
        Self::build(None)
    }

    pub fn refusing(message: &str) -> (Arc<Self>, OpenedStreams) {
        Self::build(Some(message.to_string()))
    }

    fn build(open_error: Option<String>) -> (Arc<Self>, OpenedStreams) {
        let (opened, receiver) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                opened,
                cancels: Mutex::new(Vec::new()),
                open_error,
            }),
            OpenedStreams { receiver },
        )
    }

    pub fn cancelled(&self) -> Vec<TaskId> {
        self.cancels.lock().unwrap().clone()
    }
}

impl InferenceClient for ManualInference {
    fn open_stream<'a>(&'a self, task: &'a Task) -> InferenceFuture<'a, InferenceStream> {
        Box::pin(async move {
            if let Some(message) = &self.open_error {
                return Err(CoreError::new(CoreErrorKind::InferenceFailure, message.clone()));
            }
            let (sender, stream) = InferenceStream::channel(16);
            let _ = self.opened.send((task.id, sender));
            Ok(stream)
        })
    }

    fn cancel(&self, task_id: TaskId) -> InferenceFuture<'_, ()> {
        self.cancels.lock().unwrap().push(task_id);
        Box::pin(async { Ok(()) })
    }
}

impl OpenedStreams {
    pub async fn next(&mut self) -> (TaskId, InferenceSender) {
        tokio::time::timeout(Duration::from_secs(2), self.receiver.recv())
            .await
            .expect("timed out waiting for a stream to open")
            .expect("inference client dropped")
    }

    pub fn try_next(&mut self) -> Option<(TaskId, InferenceSender)> {
        self.receiver.try_recv().ok()
    }
}

/// Delegates to an in-memory store until `fail_writes` is switched on or the
/// put budget runs out.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: InMemoryTaskStore,
    pub fail_writes: AtomicBool,
    put_budget: Mutex<Option<usize>>,
}

impl FlakyStore {
    pub fn failing() -> Self {
        let store = Self::default();
        store.fail_writes.store(true, Ordering::SeqCst);
        store
    }

    /// Accepts the first `puts` writes, then fails every put after them.
    pub fn failing_after_puts(puts: usize) -> Self {
        let store = Self::default();
        *store.put_budget.lock().unwrap() = Some(puts);
        store
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> PersistenceResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CoreError::new(
                CoreErrorKind::StorageFailure,
                "simulated disk failure",
            ));
        }
        Ok(())
    }
}

impl TaskStore for FlakyStore {
    fn put(&self, task: &Task) -> PersistenceResult<()> {
        self.check()?;
        if let Some(budget) = self.put_budget.lock().unwrap().as_mut() {
            if *budget == 0 {
                return Err(CoreError::new(
                    CoreErrorKind::StorageFailure,
                    "simulated disk full",
                ));
            }
            *budget -= 1;
        }
        self.inner.put(task)
    }

    fn delete(&self, task_id: TaskId) -> PersistenceResult<()> {
        self.check()?;
        self.inner.delete(task_id)
    }

    fn list_all(&self) -> PersistenceResult<Vec<Task>> {
        self.inner.list_all()
    }

    fn delete_all(&self) -> PersistenceResult<()> {
        self.check()?;
        self.inner.delete_all()
    }

    fn next_task_id(&self) -> PersistenceResult<u64> {
        self.inner.next_task_id()
    }
}

/// Blocks progress writes for one task to stand in for a slow disk.
#[derive(Default)]
pub struct SlowStore {
    pub inner: InMemoryTaskStore,
    stalled: Mutex<Option<(TaskId, Duration)>>,
}

impl SlowStore {
    pub fn stall_progress_of(&self, task_id: TaskId, delay: Duration) {
        *self.stalled.lock().unwrap() = Some((task_id, delay));
    }
}

impl TaskStore for SlowStore {
    fn put(&self, task: &Task) -> PersistenceResult<()> {
        let stalled = *self.stalled.lock().unwrap();
        if let Some((task_id, delay)) = stalled
            && task.id == task_id
            && task.status == TaskStatus::Running
            && task.progress > 0.0
        {
            std::thread::sleep(delay);
        }
        self.inner.put(task)
    }

    fn delete(&self, task_id: TaskId) -> PersistenceResult<()> {
        self.inner.delete(task_id)
    }

    fn list_all(&self) -> PersistenceResult<Vec<Task>> {
        self.inner.list_all()
    }

    fn delete_all(&self) -> PersistenceResult<()> {
        self.inner.delete_all()
    }

    fn next_task_id(&self) -> PersistenceResult<u64> {
        self.inner.next_task_id()
    }
}

pub fn configured_settings() -> SettingsHandle {
    SettingsHandle::new(AiSettings {
        api_key: Some("sk-test".to_string()),
        ..AiSettings::default()
    })
}

pub async fn wait_for_task(
    coordinator: &ExecutionCoordinator,
    task_id: TaskId,
    predicate: impl Fn(&Task) -> bool,
) -> Task {
    for _ in 0..400 {
        if let Some(task) = coordinator.task(task_id).await
            && predicate(&task)
        {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "task {task_id} never reached the expected state; last seen {:?}",
        coordinator.task(task_id).await
    );
}

/// Polls `condition` until it holds; store writes land shortly after the registry changes.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never held");
}

pub async fn wait_for_error(coordinator: &ExecutionCoordinator) -> CoreError {
    for _ in 0..400 {
        if let Some(error) = coordinator.last_error().await {
            return error;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no registry error was recorded");
}

pub fn test_db_path(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("titan-{test_name}-{nanos}.sqlite3"))
}
