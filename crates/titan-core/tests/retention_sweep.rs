mod support;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use titan_core::models::{
    AiSettings, SettingsHandle, Task, TaskId, TaskParameters, TaskStatus, TaskType,
};
use titan_core::orchestration::{ExecutionCoordinator, RetentionSweeper};
use titan_core::persistence::InMemoryTaskStore;

use support::{ManualInference, eventually};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

fn finished(id: u64, status: TaskStatus, age: Duration, now: SystemTime) -> Task {
    let mut task = Task::new(
        TaskId(id),
        TaskType::PageSummary,
        format!("finished {id}"),
        TaskParameters::new(),
        now - age - Duration::from_secs(60),
    );
    task.status = status;
    task.progress = 1.0;
    task.completed_at = Some(now - age);
    task
}

async fn coordinator_over(store: Arc<InMemoryTaskStore>) -> ExecutionCoordinator {
    let (inference, _streams) = ManualInference::new();
    ExecutionCoordinator::load(store, inference, SettingsHandle::new(AiSettings::default()))
        .await
        .unwrap()
}

#[tokio::test]
async fn sweep_removes_only_expired_finished_tasks() {
    let now = SystemTime::now();
    let store = Arc::new(InMemoryTaskStore::with_tasks([
        finished(1, TaskStatus::Completed, 8 * DAY, now),
        finished(2, TaskStatus::Failed, 8 * DAY, now),
        finished(3, TaskStatus::Cancelled, 8 * DAY, now),
        finished(4, TaskStatus::Completed, 6 * DAY, now),
    ]));
    let coordinator = coordinator_over(store.clone()).await;

    let mut removed = coordinator.sweep_expired(now).await.unwrap();
    removed.sort();
    assert_eq!(removed, vec![TaskId(1), TaskId(2)]);

    let mut remaining: Vec<TaskId> = coordinator.tasks().await.iter().map(|task| task.id).collect();
    remaining.sort();
    assert_eq!(remaining, vec![TaskId(3), TaskId(4)]);
    assert!(store.get(TaskId(1)).is_none());
    assert!(store.get(TaskId(2)).is_none());
    assert_eq!(store.len(), 2);

    assert!(coordinator.sweep_expired(now).await.unwrap().is_empty());
}

#[tokio::test]
async fn sweep_honors_configured_retention() {
    let now = SystemTime::now();
    let store = Arc::new(InMemoryTaskStore::with_tasks([finished(
        1,
        TaskStatus::Completed,
        2 * DAY,
        now,
    )]));
    let coordinator = coordinator_over(store).await;

    assert!(coordinator.sweep_expired(now).await.unwrap().is_empty());

    coordinator
        .update_settings(AiSettings {
            retention_days: 1,
            ..AiSettings::default()
        })
        .unwrap();
    assert_eq!(coordinator.sweep_expired(now).await.unwrap(), vec![TaskId(1)]);
}

#[tokio::test]
async fn background_sweeper_evicts_and_shuts_down() {
    let now = SystemTime::now();
    let store = Arc::new(InMemoryTaskStore::with_tasks([
        finished(1, TaskStatus::Completed, 30 * DAY, now),
        finished(2, TaskStatus::Completed, DAY, now),
    ]));
    let coordinator = coordinator_over(store.clone()).await;

    let sweeper = RetentionSweeper::spawn(coordinator.clone(), Duration::from_millis(10));

    let mut swept = false;
    for _ in 0..200 {
        if coordinator.task(TaskId(1)).await.is_none() {
            swept = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(swept, "sweeper never evicted the expired task");
    assert!(coordinator.task(TaskId(2)).await.is_some());
    eventually(|| store.len() == 1).await;

    sweeper.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn settings_driven_sweeper_picks_up_a_new_interval() {
    let now = SystemTime::now();
    let store = Arc::new(InMemoryTaskStore::with_tasks([finished(
        1,
        TaskStatus::Completed,
        2 * DAY,
        now,
    )]));
    let (inference, _streams) = ManualInference::new();
    let settings = SettingsHandle::new(AiSettings {
        sweep_interval_secs: 10,
        ..AiSettings::default()
    });
    let coordinator = ExecutionCoordinator::load(store, inference, settings)
        .await
        .unwrap();
    let sweeper = RetentionSweeper::spawn_with_settings(coordinator.clone());

    // the first cycle is already waiting on the old interval; the next one uses the new
    tokio::time::sleep(Duration::from_secs(11)).await;
    coordinator
        .update_settings(AiSettings {
            sweep_interval_secs: 1_000,
            ..AiSettings::default()
        })
        .unwrap();
    tokio::time::sleep(Duration::from_secs(14)).await;
    coordinator
        .update_settings(AiSettings {
            sweep_interval_secs: 1_000,
            retention_days: 1,
            ..AiSettings::default()
        })
        .unwrap();

    tokio::time::sleep(Duration::from_secs(500)).await;
    assert!(
        coordinator.task(TaskId(1)).await.is_some(),
        "sweeper kept the old ten second interval"
    );

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert!(coordinator.task(TaskId(1)).await.is_none());

    sweeper.shutdown().await;
}
