//! WebSocket sessions
//!
//! One endpoint serves both pipelines. The first client frame selects the
//! generator (`mode`) and binds the session to a task id; the server then
//! streams envelopes until a terminal message. The generator runs detached:
//! if the socket drops mid-task the work is cancelled at its next suspension
//! point, but an already-running generator is never restarted by a
//! reconnect — the client either reattaches to the live channel or is told
//! the task already finished.

use super::AppContext;
use crate::extraction::PlanStatus;
use crate::pipeline::ProcessOptions;
use crate::router::{ModeHint, RoutedMode};
use crate::stream::{Attach, Envelope, MessageKind, TaskEmitter, TaskState};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// First frame sent by the client.
#[derive(Debug, Deserialize)]
struct OpenRequest {
    query: String,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default = "default_true")]
    use_cache: bool,
}

fn default_true() -> bool {
    true
}

pub async fn websocket(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<AppContext>>,
) -> Response {
    ws.on_upgrade(move |socket| session(socket, ctx))
}

async fn session(mut socket: WebSocket, ctx: Arc<AppContext>) {
    // The session starts with one JSON envelope from the client.
    let open = loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<OpenRequest>(text.as_str()) {
                    Ok(open) => break open,
                    Err(e) => {
                        let _ = send_json(
                            &mut socket,
                            &json!({
                                "type": "error",
                                "error_code": "internal",
                                "error_message": format!("invalid open frame: {e}"),
                            }),
                        )
                        .await;
                        return;
                    }
                }
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            _ => return,
        }
    };

    let task_id = open
        .task_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // Idempotent attachment: an existing task is joined, never restarted.
    match ctx.registry.state(&task_id) {
        Some(TaskState::Completed | TaskState::Error) => {
            let _ = send_json(
                &mut socket,
                &json!({
                    "type": "complete",
                    "task_id": task_id,
                    "success": ctx.registry.state(&task_id) == Some(TaskState::Completed),
                    "message": "already completed",
                }),
            )
            .await;
            return;
        }
        Some(_) => {
            match ctx.registry.attach(&task_id).await {
                Attach::Live(receiver) => {
                    debug!(task_id, "client reattached to running task");
                    forward_until_terminal(socket, ctx, task_id, receiver).await;
                }
                Attach::Busy => {
                    let _ = send_json(
                        &mut socket,
                        &json!({
                            "type": "error",
                            "task_id": task_id,
                            "error_code": "internal",
                            "error_message": "another client is attached to this task",
                        }),
                    )
                    .await;
                }
                _ => {}
            }
            return;
        }
        None => {}
    }

    let Some(emitter) = ctx.registry.create(&task_id) else {
        // Lost a create race; treat as duplicate submission.
        return;
    };
    let Attach::Live(receiver) = ctx.registry.attach(&task_id).await else {
        return;
    };

    let mode = ctx
        .intent_router
        .route(&open.query, ModeHint::parse(open.mode.as_deref()))
        .await;
    info!(task_id, ?mode, query = %open.query, "streaming task started");
    ctx.registry.set_state(&task_id, TaskState::Processing);

    // Detached generator: it finishes even if the socket goes away, with
    // output discarded past that point.
    let generator_ctx = ctx.clone();
    let generator_query = open.query.clone();
    tokio::spawn(async move {
        match mode {
            RoutedMode::Research => {
                run_research_generator(generator_ctx, generator_query, emitter).await
            }
            RoutedMode::Simple => {
                run_simple_generator(generator_ctx, generator_query, open.use_cache, emitter).await
            }
        }
    });

    forward_until_terminal(socket, ctx, task_id, receiver).await;
}

/// Pump envelopes to the socket until a terminal message or disconnect.
async fn forward_until_terminal(
    mut socket: WebSocket,
    ctx: Arc<AppContext>,
    task_id: String,
    mut receiver: mpsc::Receiver<Envelope>,
) {
    loop {
        tokio::select! {
            envelope = receiver.recv() => {
                let Some(envelope) = envelope else { break };
                let terminal = is_terminal(&envelope.kind);
                let payload = match serde_json::to_string(&envelope) {
                    Ok(payload) => payload,
                    Err(_) => continue,
                };
                if socket.send(Message::Text(payload.into())).await.is_err() {
                    // Transport gone: cancel and let a reconnect reattach.
                    ctx.registry.cancel(&task_id);
                    ctx.registry.release(&task_id, receiver).await;
                    return;
                }
                if terminal {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                        debug!(task_id, "client closed transport, cancelling task");
                        ctx.registry.cancel(&task_id);
                        ctx.registry.release(&task_id, receiver).await;
                        return;
                    }
                    _ => continue,
                }
            }
        }
    }
    let _ = socket.send(Message::Close(None)).await;
}

/// A task's message sequence ends in exactly one `complete` or `error`.
fn is_terminal(kind: &MessageKind) -> bool {
    matches!(kind, MessageKind::Complete { .. } | MessageKind::Error { .. })
}

/// Generator for simple-mode streaming sessions.
async fn run_simple_generator(
    ctx: Arc<AppContext>,
    query: String,
    use_cache: bool,
    emitter: TaskEmitter,
) {
    let task_id = emitter.task_id().to_string();
    let cancel = emitter.cancellation();
    let started = std::time::Instant::now();

    emitter.stage("intent", "Classifying the request", Some(0.1)).await;
    emitter
        .data("intent", json!({ "intent_type": "simple_query" }))
        .await;
    emitter.stage("rag", "Matching data sources", Some(0.3)).await;

    let options = ProcessOptions {
        use_cache,
        ..ProcessOptions::default()
    };
    let result = tokio::select! {
        result = ctx.simple.process(&query, &options) => result,
        _ = cancel.cancelled() => {
            emitter.error("cancelled", "The request was cancelled.", None).await;
            ctx.registry.set_state(&task_id, TaskState::Error);
            return;
        }
    };

    emitter.stage("fetch", "Fetching data", Some(0.8)).await;
    match result.status {
        PlanStatus::Error => {
            let code = result
                .metadata
                .error_code
                .clone()
                .unwrap_or_else(|| "internal".to_string());
            emitter.error(&code, &result.message, Some("fetch".to_string())).await;
            ctx.registry.set_state(&task_id, TaskState::Error);
        }
        _ => {
            emitter
                .data(
                    "fetch",
                    json!({
                        "status": result.status,
                        "generated_path": result.metadata.generated_path,
                        "source": result.metadata.source,
                        "records": result.data.as_ref().map(|d| d.records.len()).unwrap_or(0),
                    }),
                )
                .await;
            emitter.stage("summary", "Done", Some(1.0)).await;
            emitter
                .complete(
                    true,
                    &result.message,
                    Some(started.elapsed().as_secs_f64()),
                )
                .await;
            ctx.registry.set_state(&task_id, TaskState::Completed);
        }
    }
    record_task(&ctx, &task_id, &query).await;
}

/// Generator for research-mode streaming sessions.
async fn run_research_generator(ctx: Arc<AppContext>, query: String, emitter: TaskEmitter) {
    let task_id = emitter.task_id().to_string();
    let started = std::time::Instant::now();

    let Some(research) = ctx.research.clone() else {
        // The router prevents this; guard anyway rather than panic.
        warn!(task_id, "research generator invoked while subsystem disabled");
        emitter
            .error("internal", "Research is not available.", None)
            .await;
        ctx.registry.set_state(&task_id, TaskState::Error);
        return;
    };

    let state = research.research(&query, &emitter).await;
    let success = state.error.is_none();
    emitter
        .complete(
            success,
            if success {
                "Research complete."
            } else {
                "Research ended with an error."
            },
            Some(started.elapsed().as_secs_f64()),
        )
        .await;
    ctx.registry.set_state(
        &task_id,
        if success {
            TaskState::Completed
        } else {
            TaskState::Error
        },
    );
    if let Some(report) = &state.report {
        let _ = ctx
            .subscription_store
            .record_task(&task_id, &query, "completed", Some(report))
            .await;
    } else {
        record_task(&ctx, &task_id, &query).await;
    }
}

async fn record_task(ctx: &Arc<AppContext>, task_id: &str, query: &str) {
    let status = match ctx.registry.state(task_id) {
        Some(TaskState::Completed) => "completed",
        Some(TaskState::Error) => "error",
        _ => "processing",
    };
    if let Err(e) = ctx
        .subscription_store
        .record_task(task_id, query, status, None)
        .await
    {
        warn!(task_id, error = %e, "failed to persist task record");
    }
}

async fn send_json(socket: &mut WebSocket, value: &serde_json::Value) -> Result<(), axum::Error> {
    socket
        .send(Message::Text(value.to_string().into()))
        .await
}
