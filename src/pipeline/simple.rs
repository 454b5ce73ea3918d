//! Single-shot pipeline: retrieve → extract → resolve → fetch
//!
//! Failure semantics: every step may demote or fail the result, but nothing
//! is ever silently upgraded to success. The path template is filled only
//! when every required identifier carries a `true` resolution flag; a path
//! is never fabricated from unresolved inputs.

use super::{QueryResult, ResultMetadata};
use crate::catalog::store::CatalogStore;
use crate::error::OmniError;
use crate::extraction::{ParameterExtractor, PlanStatus};
use crate::fetch::Fetcher;
use crate::resolver::EntityResolver;
use crate::retrieval::RouteRetriever;
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Per-request options.
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    /// Candidate count for retrieval.
    pub top_k: usize,
    /// Whether payload/completion caches may serve this request.
    pub use_cache: bool,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            top_k: 3,
            use_cache: true,
        }
    }
}

/// The single-shot orchestrator.
pub struct SimpleOrchestrator {
    retriever: Arc<dyn RouteRetriever>,
    extractor: ParameterExtractor,
    resolver: EntityResolver,
    fetcher: Arc<dyn Fetcher>,
    catalog: Arc<CatalogStore>,
}

impl SimpleOrchestrator {
    pub fn new(
        retriever: Arc<dyn RouteRetriever>,
        extractor: ParameterExtractor,
        resolver: EntityResolver,
        fetcher: Arc<dyn Fetcher>,
        catalog: Arc<CatalogStore>,
    ) -> Self {
        Self {
            retriever,
            extractor,
            resolver,
            fetcher,
            catalog,
        }
    }

    /// Run the full pipeline for one query.
    pub async fn process(&self, query: &str, options: &ProcessOptions) -> QueryResult {
        let query = query.trim();
        if query.is_empty() {
            // Boundary: no LLM call for an empty query.
            return QueryResult::needs_clarification("Please enter a query.");
        }

        let retrieved = match self.retriever.retrieve(query, options.top_k).await {
            Ok(retrieved) => retrieved,
            Err(e) => return self.log_and_fail(query, e),
        };
        if retrieved.is_empty() {
            let mut result = QueryResult::needs_clarification(
                "I couldn't find a data source matching that request. Could you rephrase it?",
            );
            result.metadata.error_code = Some("no_route".to_string());
            return result;
        }

        let plan = match self.extractor.extract(query, &retrieved).await {
            Ok(plan) => plan,
            Err(e) => return self.log_and_fail(query, e),
        };

        if plan.status == PlanStatus::NeedsClarification {
            let message = plan
                .reasoning
                .clone()
                .unwrap_or_else(|| "Could you be more specific about what to look up?".to_string());
            let mut result = QueryResult::needs_clarification(message);
            result.metadata.plan = Some(plan);
            return result;
        }

        // PlanStatus::Success from here on; the extractor validated the
        // route id against the candidate set.
        let route = match plan
            .route_id
            .as_deref()
            .and_then(|id| retrieved.iter().map(|r| &r.route).find(|r| r.id == id))
        {
            Some(route) => route.clone(),
            None => {
                return self.log_and_fail(
                    query,
                    OmniError::internal("validated plan lost its route"),
                )
            }
        };

        let outcome = match self.resolver.resolve(&route, &plan.parameters).await {
            Ok(outcome) => outcome,
            Err(e) => return self.log_and_fail(query, e),
        };

        // Promotion gate: every required identifier must be an authentic
        // resolution. Key presence alone is not enough.
        let failed: Vec<String> = route
            .required_identifiers
            .iter()
            .filter(|name| !outcome.status.get(*name).copied().unwrap_or(false))
            .cloned()
            .collect();
        if !failed.is_empty() {
            let error = OmniError::unresolved(failed.clone());
            warn!(query, failed = ?failed, "demoting plan: unresolved required identifiers");
            let mut result = QueryResult::needs_clarification(error.user_message());
            result.metadata.plan = Some(plan);
            result.metadata.resolution_status = outcome.status;
            result.metadata.error_code = Some(error.error_code().to_string());
            return result;
        }

        let path = match route.fill_path(&outcome.values) {
            Ok(path) => path,
            Err(_) => {
                // A slot the extractor never filled; ask rather than guess.
                let mut result = QueryResult::needs_clarification(
                    "The request is missing a required value; could you spell it out?",
                );
                result.metadata.plan = Some(plan);
                result.metadata.resolution_status = outcome.status;
                return result;
            }
        };

        let mut plan = plan;
        plan.generated_path = Some(path.clone());

        match self.fetcher.fetch(&path, options.use_cache).await {
            Ok(data) => {
                info!(query, path = %path, records = data.records.len(), origin = ?data.origin, "pipeline complete");
                QueryResult {
                    status: PlanStatus::Success,
                    message: format!("Fetched {} records from {}", data.records.len(), data.title),
                    metadata: ResultMetadata {
                        resolution_status: outcome.status,
                        generated_path: Some(path),
                        source: Some(data.origin),
                        from_cache: data.from_cache,
                        plan: Some(plan),
                        error_code: None,
                    },
                    route: Some(route),
                    data: Some(data),
                }
            }
            Err(e) => {
                // Fetch failures surface as errors, never as success.
                let mut result = self.log_and_fail(query, e);
                result.metadata.plan = Some(plan);
                result.metadata.resolution_status = outcome.status;
                result.route = Some(route);
                result
            }
        }
    }

    /// Re-execute a stored plan, bypassing retrieval and extraction. The
    /// resolution and fetch semantics are identical to `process`.
    pub async fn refresh(
        &self,
        route_id: &str,
        parameters: &IndexMap<String, String>,
        use_cache: bool,
    ) -> QueryResult {
        let Some(route) = self.catalog.route(route_id) else {
            return self.log_and_fail(
                route_id,
                OmniError::catalog(format!("unknown route: {route_id}")),
            );
        };

        let outcome = match self.resolver.resolve(&route, parameters).await {
            Ok(outcome) => outcome,
            Err(e) => return self.log_and_fail(route_id, e),
        };
        let failed: Vec<String> = route
            .required_identifiers
            .iter()
            .filter(|name| !outcome.status.get(*name).copied().unwrap_or(false))
            .cloned()
            .collect();
        if !failed.is_empty() {
            let error = OmniError::unresolved(failed);
            let mut result = QueryResult::needs_clarification(error.user_message());
            result.metadata.resolution_status = outcome.status;
            result.metadata.error_code = Some(error.error_code().to_string());
            return result;
        }

        let path = match route.fill_path(&outcome.values) {
            Ok(path) => path,
            Err(e) => return self.log_and_fail(route_id, e),
        };
        match self.fetcher.fetch(&path, use_cache).await {
            Ok(data) => QueryResult {
                status: PlanStatus::Success,
                message: format!("Fetched {} records from {}", data.records.len(), data.title),
                metadata: ResultMetadata {
                    resolution_status: outcome.status,
                    generated_path: Some(path),
                    source: Some(data.origin),
                    from_cache: data.from_cache,
                    plan: None,
                    error_code: None,
                },
                route: Some(route),
                data: Some(data),
            },
            Err(e) => {
                let mut result = self.log_and_fail(route_id, e);
                result.route = Some(route);
                result
            }
        }
    }

    fn log_and_fail(&self, context: &str, error: OmniError) -> QueryResult {
        warn!(context, category = error.category(), error = %error, "pipeline step failed");
        QueryResult::error(&error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheRegistry;
    use crate::config::CacheConfig;
    use crate::fetch::{FetchOrigin, FetchResult};
    use crate::llm::{ChatMessage, Completion, CompletionOptions, LlmClient, LlmError};
    use crate::resolver::NameSearcher;
    use crate::retrieval::RetrievedRoute;
    use crate::subscription::{Subscription, SubscriptionDraft, SubscriptionStore};
    use async_trait::async_trait;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct ScriptedRetriever {
        routes: Vec<RetrievedRoute>,
    }

    #[async_trait]
    impl RouteRetriever for ScriptedRetriever {
        async fn retrieve(&self, _q: &str, _k: usize) -> Result<Vec<RetrievedRoute>, OmniError> {
            Ok(self.routes.clone())
        }
    }

    struct ScriptedLlm {
        responses: Mutex<Vec<String>>,
        calls: Mutex<usize>,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<&str>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into_iter().rev().map(String::from).collect()),
                calls: Mutex::new(0),
            })
        }

        fn call_count(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        fn provider_name(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _options: &CompletionOptions,
        ) -> Result<Completion, LlmError> {
            *self.calls.lock().unwrap() += 1;
            Ok(Completion {
                content: self.responses.lock().unwrap().pop().unwrap_or_default(),
                finish_reason: "stop".to_string(),
            })
        }
    }

    struct NoSearcher;

    #[async_trait]
    impl NameSearcher for NoSearcher {
        async fn search(
            &self,
            _p: &str,
            _e: &str,
            _n: &str,
        ) -> Result<Option<(Subscription, f32)>, OmniError> {
            Ok(None)
        }
    }

    struct ScriptedFetcher {
        records: usize,
        origin: FetchOrigin,
        fail: bool,
        paths: Mutex<Vec<String>>,
    }

    impl ScriptedFetcher {
        fn ok(records: usize, origin: FetchOrigin) -> Arc<Self> {
            Arc::new(Self {
                records,
                origin,
                fail: false,
                paths: Mutex::new(Vec::new()),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                records: 0,
                origin: FetchOrigin::Primary,
                fail: true,
                paths: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(&self, path: &str, _use_cache: bool) -> Result<FetchResult, OmniError> {
            self.paths.lock().unwrap().push(path.to_string());
            if self.fail {
                return Err(OmniError::fetch("both bases exhausted"));
            }
            Ok(FetchResult {
                title: "feed".to_string(),
                records: (0..self.records).map(|i| json!({ "n": i })).collect(),
                origin: self.origin,
                from_cache: false,
            })
        }
    }

    async fn subscription_store() -> Arc<SubscriptionStore> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SubscriptionStore::with_pool(pool).await.unwrap();
        store
            .create(SubscriptionDraft {
                display_name: "行业101".to_string(),
                aliases: Vec::new(),
                platform: "bilibili".to_string(),
                entity_type: "user".to_string(),
                identifiers: HashMap::from([("uid".to_string(), "1566847".to_string())]),
                supported_actions: vec!["video".to_string()],
            })
            .await
            .unwrap();
        Arc::new(store)
    }

    async fn orchestrator(
        llm: Arc<ScriptedLlm>,
        fetcher: Arc<ScriptedFetcher>,
        routes: Vec<RetrievedRoute>,
    ) -> SimpleOrchestrator {
        let caches = CacheRegistry::new(&CacheConfig::default());
        let store = subscription_store().await;
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(CatalogStore::open(dir.path().join("c.json")).unwrap());
        SimpleOrchestrator::new(
            Arc::new(ScriptedRetriever { routes }),
            ParameterExtractor::new(llm, caches.clone(), 0.1),
            EntityResolver::new(store, Arc::new(NoSearcher), caches),
            fetcher,
            catalog,
        )
    }

    fn candidates() -> Vec<RetrievedRoute> {
        vec![RetrievedRoute {
            route: crate::catalog::test_route(),
            score: 0.9,
        }]
    }

    const RESOLVED_PLAN: &str = r#"{"status":"success","route_id":"bilibili-user-video","parameters":{"uid":"行业101"},"reasoning":"uploads"}"#;

    #[tokio::test]
    async fn test_resolved_entity_end_to_end() {
        let llm = ScriptedLlm::new(vec![RESOLVED_PLAN]);
        let fetcher = ScriptedFetcher::ok(3, FetchOrigin::Primary);
        let orchestrator = orchestrator(llm, fetcher.clone(), candidates()).await;

        let result = orchestrator
            .process("看看 up 主 行业101 的投稿视频", &ProcessOptions::default())
            .await;
        assert!(result.is_success());
        assert_eq!(
            result.metadata.generated_path.as_deref(),
            Some("/bilibili/user/video/1566847")
        );
        assert!(result.metadata.resolution_status["uid"]);
        assert_eq!(result.data.unwrap().records.len(), 3);
        assert_eq!(
            fetcher.paths.lock().unwrap()[0],
            "/bilibili/user/video/1566847"
        );
    }

    #[tokio::test]
    async fn test_unresolved_entity_demotes_and_names_parameter() {
        let plan = r#"{"status":"success","route_id":"bilibili-user-video","parameters":{"uid":"不存在的名字"}}"#;
        let llm = ScriptedLlm::new(vec![plan]);
        let fetcher = ScriptedFetcher::ok(3, FetchOrigin::Primary);
        let orchestrator = orchestrator(llm, fetcher.clone(), candidates()).await;

        let result = orchestrator
            .process("看看 up 主 不存在的名字 的视频", &ProcessOptions::default())
            .await;
        assert_eq!(result.status, PlanStatus::NeedsClarification);
        assert_eq!(result.metadata.resolution_status.get("uid"), Some(&false));
        assert!(result.metadata.generated_path.is_none());
        assert!(result.message.contains("uid"));
        assert_eq!(
            result.metadata.error_code.as_deref(),
            Some("unresolved_entity")
        );
        // No path means no fetch.
        assert!(fetcher.paths.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_numeric_identifier_bypasses_resolution() {
        let plan = r#"{"status":"success","route_id":"bilibili-user-video","parameters":{"uid":"1566847"}}"#;
        let llm = ScriptedLlm::new(vec![plan]);
        let fetcher = ScriptedFetcher::ok(1, FetchOrigin::Primary);
        let orchestrator = orchestrator(llm, fetcher, candidates()).await;

        let result = orchestrator
            .process("uid 1566847 的投稿", &ProcessOptions::default())
            .await;
        assert!(result.is_success());
        assert_eq!(
            result.metadata.generated_path.as_deref(),
            Some("/bilibili/user/video/1566847")
        );
    }

    #[tokio::test]
    async fn test_empty_query_makes_no_llm_call() {
        let llm = ScriptedLlm::new(vec![]);
        let fetcher = ScriptedFetcher::ok(0, FetchOrigin::Primary);
        let orchestrator = orchestrator(llm.clone(), fetcher, candidates()).await;

        let result = orchestrator.process("   ", &ProcessOptions::default()).await;
        assert_eq!(result.status, PlanStatus::NeedsClarification);
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_no_candidates_is_no_route() {
        let llm = ScriptedLlm::new(vec![]);
        let fetcher = ScriptedFetcher::ok(0, FetchOrigin::Primary);
        let orchestrator = orchestrator(llm.clone(), fetcher, Vec::new()).await;

        let result = orchestrator
            .process("something unroutable", &ProcessOptions::default())
            .await;
        assert_eq!(result.status, PlanStatus::NeedsClarification);
        assert_eq!(result.metadata.error_code.as_deref(), Some("no_route"));
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_surfaced_not_swallowed() {
        let llm = ScriptedLlm::new(vec![RESOLVED_PLAN]);
        let orchestrator = orchestrator(llm, ScriptedFetcher::failing(), candidates()).await;

        let result = orchestrator
            .process("看看 up 主 行业101 的投稿视频", &ProcessOptions::default())
            .await;
        assert_eq!(result.status, PlanStatus::Error);
        assert_eq!(result.metadata.error_code.as_deref(), Some("fetch_failed"));
        assert!(!result.message.contains("exhausted"));
    }

    #[tokio::test]
    async fn test_fallback_origin_is_recorded() {
        let llm = ScriptedLlm::new(vec![RESOLVED_PLAN]);
        let fetcher = ScriptedFetcher::ok(2, FetchOrigin::Fallback);
        let orchestrator = orchestrator(llm, fetcher, candidates()).await;

        let result = orchestrator
            .process("看看 up 主 行业101 的投稿视频", &ProcessOptions::default())
            .await;
        assert!(result.is_success());
        assert_eq!(result.metadata.source, Some(FetchOrigin::Fallback));
        assert!(!result.data.unwrap().records.is_empty());
    }

    #[tokio::test]
    async fn test_extractor_clarification_passes_through() {
        let plan = r#"{"status":"needs_clarification","reasoning":"which platform do you mean?"}"#;
        let llm = ScriptedLlm::new(vec![plan]);
        let fetcher = ScriptedFetcher::ok(0, FetchOrigin::Primary);
        let orchestrator = orchestrator(llm, fetcher, candidates()).await;

        let result = orchestrator
            .process("最新内容", &ProcessOptions::default())
            .await;
        assert_eq!(result.status, PlanStatus::NeedsClarification);
        assert!(result.message.contains("platform"));
    }

    #[tokio::test]
    async fn test_refresh_bypasses_extraction() {
        let llm = ScriptedLlm::new(vec![]);
        let fetcher = ScriptedFetcher::ok(2, FetchOrigin::Primary);
        let caches = CacheRegistry::new(&CacheConfig::default());
        let store = subscription_store().await;
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(CatalogStore::open(dir.path().join("c.json")).unwrap());
        catalog
            .rebuild(vec![crate::catalog::enrich::RawRouteEntry {
                id: "bilibili-user-video".to_string(),
                name: "uploads".to_string(),
                path_template: "/bilibili/user/video/:uid".to_string(),
                platform: Some("bilibili".to_string()),
                entity_type: Some("user".to_string()),
                parameters: crate::catalog::test_route().parameters,
                required_identifiers: vec!["uid".to_string()],
                description: "uploads".to_string(),
            }])
            .unwrap();
        let orchestrator = SimpleOrchestrator::new(
            Arc::new(ScriptedRetriever { routes: Vec::new() }),
            ParameterExtractor::new(llm.clone(), caches.clone(), 0.1),
            EntityResolver::new(store, Arc::new(NoSearcher), caches),
            fetcher,
            catalog,
        );

        let mut parameters = IndexMap::new();
        parameters.insert("uid".to_string(), "行业101".to_string());
        let result = orchestrator
            .refresh("bilibili-user-video", &parameters, true)
            .await;
        assert!(result.is_success());
        assert_eq!(
            result.metadata.generated_path.as_deref(),
            Some("/bilibili/user/video/1566847")
        );
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_refresh_unknown_route_errors() {
        let llm = ScriptedLlm::new(vec![]);
        let fetcher = ScriptedFetcher::ok(0, FetchOrigin::Primary);
        let orchestrator = orchestrator(llm, fetcher, Vec::new()).await;
        let result = orchestrator.refresh("ghost", &IndexMap::new(), true).await;
        assert_eq!(result.status, PlanStatus::Error);
    }
}
