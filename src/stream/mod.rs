//! Per-task streaming transport
//!
//! Each task owns one bounded channel identified by the caller-supplied task
//! id. Envelopes are self-describing (`type`, `timestamp`, `task_id`) and
//! strictly FIFO; a slow consumer blocks emission, which suspends the
//! producing orchestrator. The registry supports idempotent reattachment: a
//! client reconnecting with the same task id either claims the live receiver
//! or learns the task already finished — work is never restarted.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Depth of each task's channel. Small enough that an unread backlog
/// suspends the producer instead of growing unboundedly.
pub const CHANNEL_CAPACITY: usize = 32;

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Processing,
    Completed,
    Error,
}

/// One intermediate card the client can render before the task completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelPreview {
    pub title: String,
    pub items: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_path: Option<String>,
}

/// Message payloads, discriminated by `type` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageKind {
    /// Lifecycle marker for a pipeline stage.
    Stage {
        stage: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        progress: Option<f32>,
    },
    /// Structured mid-pipeline result.
    Data { stage: String, data: Value },
    /// Intermediate result cards (research mode only).
    PanelPreview { previews: Vec<PanelPreview> },
    ResearchStart { message: String },
    ResearchStep { step: String, message: String },
    ResearchPanel { previews: Vec<PanelPreview> },
    ResearchAnalysis { content: String },
    ResearchComplete { success: bool, report: String },
    ResearchError {
        error_code: String,
        error_message: String,
    },
    /// Recoverable or fatal error.
    Error {
        error_code: String,
        error_message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        stage: Option<String>,
    },
    /// Terminal message; exactly one of `complete` or `error` ends a task.
    Complete {
        success: bool,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_time: Option<f64>,
    },
}

/// Self-describing envelope delivered to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    pub task_id: String,
}

/// Producer half of a task's channel. Emissions await channel capacity; once
/// the consumer is gone they become no-ops so the task can still run to
/// completion with its output discarded.
#[derive(Clone)]
pub struct TaskEmitter {
    task_id: String,
    sender: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
}

impl TaskEmitter {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Cancellation token observed by the producing orchestrator.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Emit one envelope. Returns silently if the consumer disconnected.
    pub async fn emit(&self, kind: MessageKind) {
        let envelope = Envelope {
            kind,
            timestamp: Utc::now(),
            task_id: self.task_id.clone(),
        };
        if self.sender.send(envelope).await.is_err() {
            debug!(task_id = %self.task_id, "consumer gone, discarding stream message");
        }
    }

    pub async fn stage(&self, stage: &str, message: &str, progress: Option<f32>) {
        self.emit(MessageKind::Stage {
            stage: stage.to_string(),
            message: message.to_string(),
            progress,
        })
        .await;
    }

    pub async fn data(&self, stage: &str, data: Value) {
        self.emit(MessageKind::Data {
            stage: stage.to_string(),
            data,
        })
        .await;
    }

    pub async fn error(&self, error_code: &str, error_message: &str, stage: Option<String>) {
        self.emit(MessageKind::Error {
            error_code: error_code.to_string(),
            error_message: error_message.to_string(),
            stage,
        })
        .await;
    }

    pub async fn complete(&self, success: bool, message: &str, total_time: Option<f64>) {
        self.emit(MessageKind::Complete {
            success,
            message: message.to_string(),
            total_time,
        })
        .await;
    }
}

/// What an attaching client gets back.
pub enum Attach {
    /// The task is live; the caller now owns the consumer half.
    Live(mpsc::Receiver<Envelope>),
    /// The task already reached a terminal state.
    Finished(TaskState),
    /// Another consumer currently holds the receiver.
    Busy,
    /// No task with this id.
    Unknown,
}

struct TaskEntry {
    state: TaskState,
    emitter: TaskEmitter,
    /// Consumer half, present while no client is attached.
    receiver: Mutex<Option<mpsc::Receiver<Envelope>>>,
}

/// Registry of live and recently finished tasks, keyed by the opaque
/// caller-supplied task id.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: Arc<DashMap<String, Arc<TaskEntry>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new task and return its emitter. Returns `None` if the id
    /// is already in use — the caller must treat the submission as a
    /// duplicate, never restart work.
    pub fn create(&self, task_id: &str) -> Option<TaskEmitter> {
        if self.tasks.contains_key(task_id) {
            return None;
        }
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let emitter = TaskEmitter {
            task_id: task_id.to_string(),
            sender,
            cancel: CancellationToken::new(),
        };
        self.tasks.insert(
            task_id.to_string(),
            Arc::new(TaskEntry {
                state: TaskState::Pending,
                emitter: emitter.clone(),
                receiver: Mutex::new(Some(receiver)),
            }),
        );
        Some(emitter)
    }

    /// Attach a consumer to a task's channel.
    pub async fn attach(&self, task_id: &str) -> Attach {
        let Some(entry) = self.tasks.get(task_id).map(|e| e.clone()) else {
            return Attach::Unknown;
        };
        match entry.state {
            TaskState::Completed | TaskState::Error => Attach::Finished(entry.state),
            _ => match entry.receiver.lock().await.take() {
                Some(receiver) => Attach::Live(receiver),
                None => Attach::Busy,
            },
        }
    }

    /// Return a receiver after the consumer detaches, so a later client can
    /// reattach to the still-running task.
    pub async fn release(&self, task_id: &str, receiver: mpsc::Receiver<Envelope>) {
        if let Some(entry) = self.tasks.get(task_id).map(|e| e.clone()) {
            *entry.receiver.lock().await = Some(receiver);
        }
    }

    /// Request cancellation of a running task.
    pub fn cancel(&self, task_id: &str) {
        if let Some(entry) = self.tasks.get(task_id) {
            entry.emitter.cancel.cancel();
        }
    }

    /// Current state of a task, if known.
    pub fn state(&self, task_id: &str) -> Option<TaskState> {
        self.tasks.get(task_id).map(|e| e.state)
    }

    /// Advance a task's lifecycle state.
    pub fn set_state(&self, task_id: &str, state: TaskState) {
        if let Some(mut entry) = self.tasks.get_mut(task_id) {
            let updated = Arc::new(TaskEntry {
                state,
                emitter: entry.emitter.clone(),
                receiver: Mutex::new(None),
            });
            // Preserve an unclaimed receiver across the state change.
            if let Ok(mut slot) = entry.receiver.try_lock() {
                if let Some(receiver) = slot.take() {
                    if let Ok(mut new_slot) = updated.receiver.try_lock() {
                        *new_slot = Some(receiver);
                    }
                }
            }
            *entry.value_mut() = updated;
        }
    }

    /// Drop a task entry entirely (used by tests and periodic cleanup).
    pub fn remove(&self, task_id: &str) {
        self.tasks.remove(task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_envelope_wire_shape() {
        let registry = TaskRegistry::new();
        let emitter = registry.create("t-1").unwrap();
        let Attach::Live(mut receiver) = registry.attach("t-1").await else {
            panic!("expected live attach");
        };
        emitter.stage("rag", "retrieving routes", Some(0.2)).await;
        let envelope = receiver.recv().await.unwrap();
        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(wire["type"], "stage");
        assert_eq!(wire["stage"], "rag");
        assert_eq!(wire["task_id"], "t-1");
        assert!(wire["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_messages_are_fifo() {
        let registry = TaskRegistry::new();
        let emitter = registry.create("t-2").unwrap();
        let Attach::Live(mut receiver) = registry.attach("t-2").await else {
            panic!("expected live attach");
        };
        emitter.stage("intent", "a", None).await;
        emitter.data("intent", json!({"intent": "simple_query"})).await;
        emitter.complete(true, "done", Some(0.8)).await;

        let first = receiver.recv().await.unwrap();
        let second = receiver.recv().await.unwrap();
        let third = receiver.recv().await.unwrap();
        assert!(matches!(first.kind, MessageKind::Stage { .. }));
        assert!(matches!(second.kind, MessageKind::Data { .. }));
        assert!(matches!(third.kind, MessageKind::Complete { .. }));
        assert!(first.timestamp <= second.timestamp);
        assert!(second.timestamp <= third.timestamp);
    }

    #[tokio::test]
    async fn test_duplicate_task_id_is_rejected() {
        let registry = TaskRegistry::new();
        assert!(registry.create("t-3").is_some());
        assert!(registry.create("t-3").is_none());
    }

    #[tokio::test]
    async fn test_attach_after_completion_reports_finished() {
        let registry = TaskRegistry::new();
        registry.create("t-4").unwrap();
        registry.set_state("t-4", TaskState::Completed);
        assert!(matches!(
            registry.attach("t-4").await,
            Attach::Finished(TaskState::Completed)
        ));
    }

    #[tokio::test]
    async fn test_release_allows_reattach() {
        let registry = TaskRegistry::new();
        registry.create("t-5").unwrap();
        let Attach::Live(receiver) = registry.attach("t-5").await else {
            panic!("expected live attach");
        };
        assert!(matches!(registry.attach("t-5").await, Attach::Busy));
        registry.release("t-5", receiver).await;
        assert!(matches!(registry.attach("t-5").await, Attach::Live(_)));
    }

    #[tokio::test]
    async fn test_emit_after_consumer_drop_is_silent() {
        let registry = TaskRegistry::new();
        let emitter = registry.create("t-6").unwrap();
        let Attach::Live(receiver) = registry.attach("t-6").await else {
            panic!("expected live attach");
        };
        drop(receiver);
        // Must not hang or panic; the task keeps running with output
        // discarded.
        emitter.stage("fetch", "still working", None).await;
    }

    #[tokio::test]
    async fn test_cancel_trips_the_token() {
        let registry = TaskRegistry::new();
        let emitter = registry.create("t-7").unwrap();
        let token = emitter.cancellation();
        assert!(!token.is_cancelled());
        registry.cancel("t-7");
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_attach_unknown_task() {
        let registry = TaskRegistry::new();
        assert!(matches!(registry.attach("nope").await, Attach::Unknown));
    }
}
