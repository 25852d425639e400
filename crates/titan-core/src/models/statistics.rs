use std::time::Duration;

use serde::Serialize;

use crate::models::time::duration_millis;
use crate::models::{Task, TaskStatus};

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatistics {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// `completed / total`, or 0 for an empty registry.
    pub success_rate: f64,
    /// Mean of `completed_at - created_at` over completed tasks only.
    #[serde(with = "duration_millis")]
    pub average_completion_time: Duration,
}

impl TaskStatistics {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut stats = Self::default();
        let mut completion_total = Duration::ZERO;
        let mut completion_samples: u32 = 0;

        for task in tasks {
            stats.total += 1;
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Paused => stats.paused += 1,
                TaskStatus::Completed => {
                    stats.completed += 1;
                    if let Some(completed_at) = task.completed_at {
                        // clock skew yields a zero-length sample rather than an error
                        let elapsed = completed_at
                            .duration_since(task.created_at)
                            .unwrap_or(Duration::ZERO);
                        completion_total = completion_total.saturating_add(elapsed);
                        completion_samples = completion_samples.saturating_add(1);
                    }
                }
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }

        if stats.total > 0 {
            stats.success_rate = stats.completed as f64 / stats.total as f64;
        }
        if completion_samples > 0 {
            stats.average_completion_time = completion_total / completion_samples;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;
    use crate::models::{TaskId, TaskParameters, TaskType};

    fn task(id: u64, status: TaskStatus, created: u64, completed: Option<u64>) -> Task {
        let mut task = Task::new(
            TaskId(id),
            TaskType::PageSummary,
            "summary",
            TaskParameters::new(),
            at(created),
        );
        task.status = status;
        task.completed_at = completed.map(at);
        task
    }

    fn at(seconds: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(seconds)
    }

    #[test]
    fn empty_registry_has_zero_rates() {
        let stats = TaskStatistics::from_tasks(&[]);
        assert_eq!(stats.total, 0);
        assert_eq!(stats.success_rate, 0.0);
        assert_eq!(stats.average_completion_time, Duration::ZERO);
    }

    #[test]
    fn averages_only_completed_tasks() {
        let tasks = vec![
            task(1, TaskStatus::Completed, 100, Some(110)),
            task(2, TaskStatus::Completed, 100, Some(130)),
            task(3, TaskStatus::Failed, 100, Some(500)),
            task(4, TaskStatus::Running, 100, None),
        ];
        let stats = TaskStatistics::from_tasks(&tasks);

        assert_eq!(stats.total, 4);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.success_rate, 0.5);
        assert_eq!(stats.average_completion_time, Duration::from_secs(20));
    }
}
