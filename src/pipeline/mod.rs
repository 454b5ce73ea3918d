//! Query-to-result orchestration
//!
//! The simple orchestrator runs the single-shot pipeline
//! (retrieve → extract → resolve → fetch); the research orchestrator drives
//! the multi-step plan/dispatch/reflect/synthesize graph on top of it. Both
//! produce a `QueryResult` whose metadata makes every decision auditable:
//! the plan, the resolution status channel, the generated path, the cache
//! indicators, and the fetch origin.

use crate::catalog::RouteDefinition;
use crate::extraction::{PlanStatus, QueryPlan};
use crate::fetch::{FetchOrigin, FetchResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod research;
pub mod simple;

pub use research::{ResearchOrchestrator, ResearchState, StashEntry};
pub use simple::{ProcessOptions, SimpleOrchestrator};

/// Metadata accompanying every pipeline result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultMetadata {
    /// The extractor's plan, when one was produced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<QueryPlan>,
    /// Per-parameter resolution flags from the entity resolver.
    #[serde(default)]
    pub resolution_status: HashMap<String, bool>,
    /// Filled path. Present only when every referenced identifier is an
    /// authentic resolution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_path: Option<String>,
    /// Which origin served the fetch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<FetchOrigin>,
    /// Whether the payload came from cache.
    #[serde(default)]
    pub from_cache: bool,
    /// Machine-readable error code on failure paths.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

/// The orchestrators' output contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub status: PlanStatus,
    /// Stable, user-safe message.
    pub message: String,
    /// The originating route definition, when one was selected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteDefinition>,
    /// Fetched payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<FetchResult>,
    pub metadata: ResultMetadata,
}

/// Seam between the research dispatcher and the single-shot pipeline.
#[async_trait]
pub trait QueryProcessor: Send + Sync {
    async fn process(&self, query: &str, options: &ProcessOptions) -> QueryResult;
}

#[async_trait]
impl QueryProcessor for SimpleOrchestrator {
    async fn process(&self, query: &str, options: &ProcessOptions) -> QueryResult {
        SimpleOrchestrator::process(self, query, options).await
    }
}

impl QueryResult {
    /// A clarification result with a user-facing message.
    pub fn needs_clarification(message: impl Into<String>) -> Self {
        Self {
            status: PlanStatus::NeedsClarification,
            message: message.into(),
            route: None,
            data: None,
            metadata: ResultMetadata::default(),
        }
    }

    /// An error result carrying the stable error code.
    pub fn error(error: &crate::error::OmniError) -> Self {
        Self {
            status: PlanStatus::Error,
            message: error.user_message(),
            route: None,
            data: None,
            metadata: ResultMetadata {
                error_code: Some(error.error_code().to_string()),
                ..ResultMetadata::default()
            },
        }
    }

    /// Whether the pipeline produced data.
    pub fn is_success(&self) -> bool {
        self.status == PlanStatus::Success
    }
}
