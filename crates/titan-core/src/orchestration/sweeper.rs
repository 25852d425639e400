use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::models::{AiSettings, Task, TaskId, TaskStatus};
use crate::orchestration::ExecutionCoordinator;

/// Age-based eviction rule for finished tasks.
///
/// Only completed and failed tasks with a completion time are eligible; cancelled
/// tasks are kept until the user removes them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetentionPolicy {
    window: Duration,
}

impl RetentionPolicy {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    pub fn from_settings(settings: &AiSettings) -> Self {
        Self::new(settings.retention_window())
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn is_expired(&self, task: &Task, now: SystemTime) -> bool {
        if !matches!(task.status, TaskStatus::Completed | TaskStatus::Failed) {
            return false;
        }
        task.completed_at
            .and_then(|completed_at| now.duration_since(completed_at).ok())
            .is_some_and(|age| age > self.window)
    }

    pub fn expired_ids(&self, tasks: &[Task], now: SystemTime) -> Vec<TaskId> {
        tasks
            .iter()
            .filter(|task| self.is_expired(task, now))
            .map(|task| task.id)
            .collect()
    }
}

/// Periodically runs [`ExecutionCoordinator::sweep_expired`] on a background task.
pub struct RetentionSweeper;

#[derive(Clone, Copy, Debug)]
enum Cadence {
    Fixed(Duration),
    FromSettings,
}

impl Cadence {
    fn period(self, coordinator: &ExecutionCoordinator) -> Duration {
        let period = match self {
            Self::Fixed(interval) => interval,
            Self::FromSettings => coordinator.settings().get().sweep_interval(),
        };
        period.max(Duration::from_millis(1))
    }
}

impl RetentionSweeper {
    /// Sweeps every `interval`; the first sweep happens one `interval` after spawning.
    pub fn spawn(coordinator: ExecutionCoordinator, interval: Duration) -> SweeperHandle {
        Self::spawn_with_cadence(coordinator, Cadence::Fixed(interval))
    }

    /// Sweeps on the coordinator's `sweep_interval_secs`, re-read after every sweep so
    /// a settings change applies from the next cycle.
    pub fn spawn_with_settings(coordinator: ExecutionCoordinator) -> SweeperHandle {
        Self::spawn_with_cadence(coordinator, Cadence::FromSettings)
    }

    fn spawn_with_cadence(coordinator: ExecutionCoordinator, cadence: Cadence) -> SweeperHandle {
        let shutdown = Arc::new(Notify::new());
        let signal = shutdown.clone();

        let join = tokio::spawn(async move {
            loop {
                let period = cadence.period(&coordinator);
                tokio::select! {
                    _ = signal.notified() => break,
                    _ = tokio::time::sleep(period) => {
                        if let Err(error) = coordinator.sweep_expired(SystemTime::now()).await {
                            tracing::warn!(
                                kind = ?error.kind,
                                message = %error.message,
                                "retention sweep incomplete"
                            );
                        }
                    }
                }
            }
            tracing::debug!("retention sweeper stopped");
        });

        tracing::debug!(?cadence, "retention sweeper started");
        SweeperHandle {
            shutdown,
            join: Some(join),
        }
    }
}

/// Stops the sweeper when shut down or dropped.
pub struct SweeperHandle {
    shutdown: Arc<Notify>,
    join: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    pub async fn shutdown(mut self) {
        self.shutdown.notify_one();
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}
