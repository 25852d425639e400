//! Contract for the external inference backend.
//!
//! A backend turns a task into a lazy stream of [`InferenceEvent`]s. The stream is a
//! bounded channel: the coordinator owns the receiving half, and dropping it is how
//! a subscription is cancelled. Producers should watch [`InferenceSender::is_closed`]
//! and stop work once the subscriber is gone.

pub mod local;

pub use local::LocalInferenceClient;

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::models::{CoreError, Task, TaskId};

pub type InferenceResult<T> = Result<T, CoreError>;

pub type InferenceFuture<'a, T> = Pin<Box<dyn Future<Output = InferenceResult<T>> + Send + 'a>>;

pub const DEFAULT_STREAM_CAPACITY: usize = 32;

#[derive(Clone, Debug, PartialEq)]
pub enum InferenceEvent {
    Progress {
        delta: f64,
        partial_result: Option<String>,
    },
    Completed {
        result: String,
    },
    Failed {
        message: String,
    },
}

impl InferenceEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InferenceEvent::Progress { .. })
    }
}

/// Flat update shape used by wire transports; an error wins over a final result.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceUpdate {
    #[serde(default)]
    pub progress_delta: f64,
    pub partial_result: Option<String>,
    pub final_result: Option<String>,
    pub error_message: Option<String>,
}

impl From<InferenceUpdate> for InferenceEvent {
    fn from(update: InferenceUpdate) -> Self {
        if let Some(message) = update.error_message {
            InferenceEvent::Failed { message }
        } else if let Some(result) = update.final_result {
            InferenceEvent::Completed { result }
        } else {
            InferenceEvent::Progress {
                delta: update.progress_delta,
                partial_result: update.partial_result,
            }
        }
    }
}

pub struct InferenceStream {
    receiver: mpsc::Receiver<InferenceEvent>,
}

impl InferenceStream {
    pub fn channel(capacity: usize) -> (InferenceSender, InferenceStream) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (InferenceSender { sender }, InferenceStream { receiver })
    }

    pub fn from_receiver(receiver: mpsc::Receiver<InferenceEvent>) -> Self {
        Self { receiver }
    }

    /// `None` once every sender is gone: the natural end of the stream.
    pub async fn next(&mut self) -> Option<InferenceEvent> {
        self.receiver.recv().await
    }
}

#[derive(Clone, Debug)]
pub struct InferenceSender {
    sender: mpsc::Sender<InferenceEvent>,
}

impl InferenceSender {
    /// Returns `false` when the subscriber has gone away.
    pub async fn send(&self, event: InferenceEvent) -> bool {
        self.sender.send(event).await.is_ok()
    }

    pub async fn progress(&self, delta: f64, partial_result: Option<String>) -> bool {
        self.send(InferenceEvent::Progress {
            delta,
            partial_result,
        })
        .await
    }

    pub async fn complete(&self, result: impl Into<String>) -> bool {
        self.send(InferenceEvent::Completed {
            result: result.into(),
        })
        .await
    }

    pub async fn fail(&self, message: impl Into<String>) -> bool {
        self.send(InferenceEvent::Failed {
            message: message.into(),
        })
        .await
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub async fn closed(&self) {
        self.sender.closed().await
    }
}

pub trait InferenceClient: Send + Sync {
    /// Opens a streaming execution for `task`. Errors here fail the task.
    fn open_stream<'a>(&'a self, task: &'a Task) -> InferenceFuture<'a, InferenceStream>;

    /// Best-effort request to stop server-side work; must be idempotent.
    fn cancel(&self, task_id: TaskId) -> InferenceFuture<'_, ()>;
}
