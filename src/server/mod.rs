//! HTTP surface: REST endpoints plus the streaming WebSocket
//!
//! `POST /chat` answers simple queries inline; when a request needs the
//! research pipeline the response instead points the client at the WebSocket
//! endpoint with `requires_streaming = true`, and the caller-supplied task id
//! correlates the two surfaces.

use crate::catalog::store::CatalogStore;
use crate::config::Config;
use crate::error::OmniError;
use crate::extraction::PlanStatus;
use crate::fetch::FetchExecutor;
use crate::pipeline::{ProcessOptions, ResearchOrchestrator, SimpleOrchestrator};
use crate::router::{IntentRouter, ModeHint, RoutedMode};
use crate::stream::TaskRegistry;
use crate::subscription::{SubscriptionDraft, SubscriptionService, SubscriptionStore};
use crate::vector::VectorStore;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub mod ws;

/// Shared application state handed to every handler.
pub struct AppContext {
    pub config: Config,
    pub catalog: Arc<CatalogStore>,
    pub simple: Arc<SimpleOrchestrator>,
    /// Absent when the research subsystem is disabled at boot.
    pub research: Option<Arc<ResearchOrchestrator>>,
    pub intent_router: Arc<IntentRouter>,
    pub subscriptions: Arc<SubscriptionService>,
    pub subscription_store: Arc<SubscriptionStore>,
    pub fetcher: Arc<FetchExecutor>,
    pub vectors: Arc<VectorStore>,
    pub registry: TaskRegistry,
}

/// Build the axum application.
pub fn app(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/chat", post(chat))
        .route("/refresh", post(refresh))
        .route("/subscriptions", get(list_subscriptions).post(create_subscription))
        .route(
            "/subscriptions/{id}",
            get(get_subscription)
                .put(update_subscription)
                .delete(delete_subscription),
        )
        .route("/health", get(health))
        .route("/ws", get(ws::websocket))
        .with_state(ctx)
}

/// Run the server until ctrl-c.
pub async fn serve(ctx: Arc<AppContext>) -> Result<(), OmniError> {
    let addr = ctx.config.server.bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "server listening");
    axum::serve(listener, app(ctx))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;
    Ok(())
}

/// Wire shape of `POST /chat`.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub query: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub filter_datasource: Option<String>,
    #[serde(default = "default_true")]
    pub use_cache: bool,
    #[serde(default)]
    pub client_task_id: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Wire shape of `POST /chat` responses.
#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub success: bool,
    pub intent_type: String,
    pub message: String,
    pub data: Value,
    pub metadata: Value,
}

async fn chat(
    State(ctx): State<Arc<AppContext>>,
    Json(request): Json<ChatRequest>,
) -> Json<ChatResponse> {
    let hint = ModeHint::parse(request.mode.as_deref());
    let mode = ctx.intent_router.route(&request.query, hint).await;

    if mode == RoutedMode::Research {
        // Research runs over the streaming channel; the REST body is a
        // placeholder pointing at it.
        let task_id = request
            .client_task_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        return Json(ChatResponse {
            success: true,
            intent_type: "complex_research".to_string(),
            message: "This request needs streaming; connect to the websocket endpoint."
                .to_string(),
            data: Value::Null,
            metadata: json!({
                "requires_streaming": true,
                "websocket_endpoint": ctx.config.server.websocket_path,
                "task_id": task_id,
            }),
        });
    }

    let options = ProcessOptions {
        use_cache: request.use_cache,
        ..ProcessOptions::default()
    };
    let result = ctx.simple.process(&request.query, &options).await;
    let mut metadata = serde_json::to_value(&result.metadata).unwrap_or_default();
    metadata["requires_streaming"] = Value::Bool(false);
    Json(ChatResponse {
        success: result.status != PlanStatus::Error,
        intent_type: "simple_query".to_string(),
        message: result.message,
        data: result
            .data
            .map(|d| serde_json::to_value(d).unwrap_or_default())
            .unwrap_or(Value::Null),
        metadata,
    })
}

/// Wire shape of `POST /refresh`.
#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_metadata: RefreshMetadata,
    #[serde(default)]
    pub layout_snapshot: Option<Value>,
}

/// The stored plan a refresh re-executes.
#[derive(Debug, Deserialize)]
pub struct RefreshMetadata {
    pub route_id: String,
    #[serde(default)]
    pub parameters: IndexMap<String, String>,
    #[serde(default = "default_true")]
    pub use_cache: bool,
}

async fn refresh(
    State(ctx): State<Arc<AppContext>>,
    Json(request): Json<RefreshRequest>,
) -> Json<ChatResponse> {
    let meta = request.refresh_metadata;
    let result = ctx
        .simple
        .refresh(&meta.route_id, &meta.parameters, meta.use_cache)
        .await;
    Json(ChatResponse {
        success: result.status != PlanStatus::Error,
        intent_type: "refresh".to_string(),
        message: result.message,
        data: result
            .data
            .map(|d| serde_json::to_value(d).unwrap_or_default())
            .unwrap_or(Value::Null),
        metadata: serde_json::to_value(&result.metadata).unwrap_or_default(),
    })
}

/// Subscription CRUD -----------------------------------------------------

async fn list_subscriptions(State(ctx): State<Arc<AppContext>>) -> Response {
    match ctx.subscriptions.list().await {
        Ok(subscriptions) => Json(subscriptions).into_response(),
        Err(e) => error_response(e),
    }
}

async fn create_subscription(
    State(ctx): State<Arc<AppContext>>,
    Json(draft): Json<SubscriptionDraft>,
) -> Response {
    match ctx.subscriptions.create(draft).await {
        Ok(subscription) => (StatusCode::CREATED, Json(subscription)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_subscription(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<i64>,
) -> Response {
    match ctx.subscriptions.get(id).await {
        Ok(Some(subscription)) => Json(subscription).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error_code": "internal", "error_message": "not found" })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn update_subscription(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<i64>,
    Json(draft): Json<SubscriptionDraft>,
) -> Response {
    match ctx.subscriptions.update(id, draft).await {
        Ok(subscription) => Json(subscription).into_response(),
        Err(e) => error_response(e),
    }
}

async fn delete_subscription(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<i64>,
) -> Response {
    match ctx.subscriptions.delete(id).await {
        Ok(subscription) => Json(subscription).into_response(),
        Err(e) => error_response(e),
    }
}

async fn health(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    let primary_healthy = ctx.fetcher.primary_healthy().await;
    Json(json!({
        "status": "ok",
        "catalog_routes": ctx.catalog.len(),
        "indexed_routes": ctx.vectors.count(crate::retrieval::ROUTE_COLLECTION),
        "indexed_subscriptions": ctx.vectors.count(crate::subscription::SUBSCRIPTION_COLLECTION),
        "feed_primary_healthy": primary_healthy,
        "research_enabled": ctx.research.is_some(),
    }))
}

/// Translate an internal error into a safe HTTP payload.
fn error_response(error: OmniError) -> Response {
    let status = match &error {
        OmniError::Subscription { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        OmniError::NoRoute | OmniError::UnresolvedEntity { .. } => StatusCode::OK,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({
            "error_code": error.error_code(),
            "error_message": error.user_message(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_request_defaults() {
        let request: ChatRequest =
            serde_json::from_str(r#"{"query": "看看 行业101 的投稿"}"#).unwrap();
        assert!(request.use_cache);
        assert!(request.mode.is_none());
        assert!(request.client_task_id.is_none());
        assert!(request.filter_datasource.is_none());
    }

    #[test]
    fn test_refresh_request_shape() {
        let request: RefreshRequest = serde_json::from_str(
            r#"{
                "refresh_metadata": {
                    "route_id": "bilibili-user-video",
                    "parameters": {"uid": "1566847"}
                },
                "layout_snapshot": {"cards": []}
            }"#,
        )
        .unwrap();
        assert_eq!(request.refresh_metadata.route_id, "bilibili-user-video");
        assert_eq!(request.refresh_metadata.parameters["uid"], "1566847");
        assert!(request.refresh_metadata.use_cache);
    }

    #[test]
    fn test_error_response_hides_internals() {
        let response = error_response(OmniError::internal("stack trace here"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
