//! Omnibox - a natural-language gateway to heterogeneous feed data sources
//!
//! This library hosts the query-to-result orchestration pipeline: semantic
//! route retrieval, LLM-driven parameter extraction, subscription-based
//! entity resolution, health-gated fetch execution, and two execution modes
//! (single-shot and multi-step research) with streaming progress delivery.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extraction;
pub mod fetch;
pub mod llm;
pub mod pipeline;
pub mod resolver;
pub mod retrieval;
pub mod router;
pub mod server;
pub mod stream;
pub mod subscription;
pub mod vector;

// Re-export commonly used types
pub use cache::CacheRegistry;
pub use catalog::{CatalogStore, ParameterType, RouteDefinition};
pub use config::Config;
pub use error::OmniError;
pub use extraction::{ParameterExtractor, PlanStatus, QueryPlan};
pub use fetch::{FetchExecutor, FetchOrigin, FetchResult};
pub use pipeline::{
    ProcessOptions, QueryResult, ResearchOrchestrator, SimpleOrchestrator,
};
pub use resolver::{EntityResolver, ResolutionOutcome};
pub use retrieval::SemanticRetriever;
pub use router::{IntentRouter, ModeHint, RoutedMode};
pub use stream::{TaskEmitter, TaskRegistry};
pub use subscription::{Subscription, SubscriptionService, SubscriptionStore};

/// The main result type used throughout the application
pub type Result<T> = std::result::Result<T, OmniError>;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "omnibox";
