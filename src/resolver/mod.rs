//! Entity resolution: human-friendly names to platform identifiers
//!
//! For each parameter tagged `entity_ref`, the extracted value is resolved
//! against the user's subscriptions: exact name/alias match first, then
//! semantic search over subscription embeddings, both filtered by the
//! (platform, entity-type) scope taken from the route schema. The resolver
//! returns two channels: the effective values and a per-parameter boolean
//! status. A status of `true` means the value is an authentic identifier,
//! never a fallback copy of the input; downstream code must gate path
//! generation on the status channel, not on key presence.

use crate::cache::CacheRegistry;
use crate::catalog::{ParameterType, RouteDefinition};
use crate::embedding::TextEmbedder;
use crate::error::OmniError;
use crate::subscription::{Subscription, SubscriptionStore, SUBSCRIPTION_COLLECTION};
use crate::vector::VectorStore;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Minimum similarity for a semantic subscription match.
pub const SEMANTIC_THRESHOLD: f32 = 0.7;

/// The resolver's two-channel result.
#[derive(Debug, Clone, Default)]
pub struct ResolutionOutcome {
    /// Effective parameter values, resolution applied where it succeeded.
    pub values: IndexMap<String, String>,
    /// Per-parameter flag: `true` iff the value is an authentic identifier.
    pub status: HashMap<String, bool>,
}

impl ResolutionOutcome {
    /// Names of parameters that failed resolution, in declaration order.
    pub fn failed_parameters(&self) -> Vec<String> {
        self.values
            .keys()
            .filter(|name| !self.status.get(*name).copied().unwrap_or(false))
            .cloned()
            .collect()
    }
}

/// Semantic lookup seam, separated from the resolver so orchestrator tests
/// can script it.
#[async_trait]
pub trait NameSearcher: Send + Sync {
    /// Best semantic match for `name` within a (platform, entity_type)
    /// scope, with its similarity score.
    async fn search(
        &self,
        platform: &str,
        entity_type: &str,
        name: &str,
    ) -> Result<Option<(Subscription, f32)>, OmniError>;
}

/// Production searcher over the subscription vector collection.
pub struct SemanticNameSearcher {
    embedder: TextEmbedder,
    vectors: Arc<VectorStore>,
}

impl SemanticNameSearcher {
    pub fn new(embedder: TextEmbedder, vectors: Arc<VectorStore>) -> Self {
        Self { embedder, vectors }
    }
}

#[async_trait]
impl NameSearcher for SemanticNameSearcher {
    async fn search(
        &self,
        platform: &str,
        entity_type: &str,
        name: &str,
    ) -> Result<Option<(Subscription, f32)>, OmniError> {
        let vector = self.embedder.embed_one(name).await?;
        let platform = platform.to_string();
        let entity_type = entity_type.to_string();
        let filter = move |metadata: &serde_json::Value| {
            metadata["platform"] == platform.as_str()
                && metadata["entity_type"] == entity_type.as_str()
        };
        let hits = self
            .vectors
            .search(SUBSCRIPTION_COLLECTION, &vector, 1, Some(&filter));
        match hits.into_iter().next() {
            Some(hit) => {
                let subscription: Subscription = serde_json::from_value(hit.metadata)?;
                Ok(Some((subscription, hit.score)))
            }
            None => Ok(None),
        }
    }
}

/// Resolves extracted parameter values against subscriptions.
pub struct EntityResolver {
    store: Arc<SubscriptionStore>,
    searcher: Arc<dyn NameSearcher>,
    caches: CacheRegistry,
}

impl EntityResolver {
    pub fn new(
        store: Arc<SubscriptionStore>,
        searcher: Arc<dyn NameSearcher>,
        caches: CacheRegistry,
    ) -> Self {
        Self {
            store,
            searcher,
            caches,
        }
    }

    /// Resolve every extracted parameter for `route`.
    pub async fn resolve(
        &self,
        route: &RouteDefinition,
        parameters: &IndexMap<String, String>,
    ) -> Result<ResolutionOutcome, OmniError> {
        let mut outcome = ResolutionOutcome::default();
        for (name, value) in parameters {
            let descriptor = route.parameter(name);
            let (effective, resolved) = match descriptor.and_then(|d| d.parameter_type) {
                Some(ParameterType::Literal) | Some(ParameterType::Enum) => {
                    // Used verbatim; the resolver is never consulted.
                    (value.clone(), true)
                }
                Some(ParameterType::EntityRef) => {
                    let entity_field = descriptor
                        .and_then(|d| d.entity_field.as_deref())
                        .unwrap_or(name);
                    self.resolve_entity_ref(route, name, entity_field, value)
                        .await?
                }
                None => {
                    warn!(
                        route = %route.id,
                        parameter = %name,
                        "schema-incomplete: parameter has no type tag, applying value heuristic"
                    );
                    if is_pure_digits(value) {
                        (value.clone(), true)
                    } else if contains_cjk(value) {
                        self.resolve_entity_ref(route, name, name, value).await?
                    } else {
                        (value.clone(), true)
                    }
                }
            };
            outcome.values.insert(name.clone(), effective);
            outcome.status.insert(name.clone(), resolved);
        }
        Ok(outcome)
    }

    /// Resolve one entity_ref value. Returns the effective value and whether
    /// it is an authentic identifier.
    async fn resolve_entity_ref(
        &self,
        route: &RouteDefinition,
        name: &str,
        entity_field: &str,
        value: &str,
    ) -> Result<(String, bool), OmniError> {
        // A value that is already an identifier needs no lookup.
        if is_pure_digits(value) {
            return Ok((value.to_string(), true));
        }

        let cache_key = format!("{}:{}:{}", route.platform, route.entity_type, value);
        if let Some(cached) = self.caches.resolutions.get(&cache_key) {
            if let Some(identifier) = cached[entity_field].as_str() {
                debug!(parameter = name, value, "resolution served from cache");
                return Ok((identifier.to_string(), true));
            }
        }

        // Exact name/alias match within the schema's scope.
        if let Some(subscription) = self
            .store
            .find_by_name(&route.platform, &route.entity_type, value)
            .await?
        {
            if let Some(identifier) = subscription.identifiers.get(entity_field) {
                self.cache_resolution(&cache_key, &subscription);
                return Ok((identifier.clone(), true));
            }
        }

        // Semantic fallback, gated on the similarity threshold.
        if let Some((subscription, score)) = self
            .searcher
            .search(&route.platform, &route.entity_type, value)
            .await?
        {
            if score >= SEMANTIC_THRESHOLD {
                if let Some(identifier) = subscription.identifiers.get(entity_field) {
                    debug!(parameter = name, value, score, "semantic resolution accepted");
                    self.cache_resolution(&cache_key, &subscription);
                    return Ok((identifier.clone(), true));
                }
            } else {
                debug!(parameter = name, value, score, "semantic match below threshold");
            }
        }

        // Unresolved: pass the original through, flagged false. No path may
        // be generated from this value.
        Ok((value.to_string(), false))
    }

    fn cache_resolution(&self, key: &str, subscription: &Subscription) {
        self.caches
            .set_resolution(key, json!(subscription.identifiers));
    }
}

/// True when the value consists solely of ASCII digits.
fn is_pure_digits(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_digit())
}

/// True when the value contains CJK unified ideographs.
fn contains_cjk(value: &str) -> bool {
    value.chars().any(|c| {
        matches!(c,
            '\u{4E00}'..='\u{9FFF}' | '\u{3400}'..='\u{4DBF}' | '\u{F900}'..='\u{FAFF}'
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheRegistry;
    use crate::config::CacheConfig;
    use crate::subscription::SubscriptionDraft;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::Mutex;

    /// Scripted semantic searcher.
    struct ScriptedSearcher {
        result: Mutex<Option<(Subscription, f32)>>,
        calls: Mutex<usize>,
    }

    impl ScriptedSearcher {
        fn new(result: Option<(Subscription, f32)>) -> Arc<Self> {
            Arc::new(Self {
                result: Mutex::new(result),
                calls: Mutex::new(0),
            })
        }

        fn call_count(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl NameSearcher for ScriptedSearcher {
        async fn search(
            &self,
            _platform: &str,
            _entity_type: &str,
            _name: &str,
        ) -> Result<Option<(Subscription, f32)>, OmniError> {
            *self.calls.lock().unwrap() += 1;
            Ok(self.result.lock().unwrap().clone())
        }
    }

    async fn store_with_subscription() -> Arc<SubscriptionStore> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SubscriptionStore::with_pool(pool).await.unwrap();
        store
            .create(SubscriptionDraft {
                display_name: "行业101".to_string(),
                aliases: vec!["行业一零一".to_string()],
                platform: "bilibili".to_string(),
                entity_type: "user".to_string(),
                identifiers: HashMap::from([("uid".to_string(), "1566847".to_string())]),
                supported_actions: vec!["video".to_string()],
            })
            .await
            .unwrap();
        Arc::new(store)
    }

    fn subscription(uid: &str) -> Subscription {
        Subscription {
            id: 1,
            display_name: "行业101".to_string(),
            aliases: Vec::new(),
            platform: "bilibili".to_string(),
            entity_type: "user".to_string(),
            identifiers: HashMap::from([("uid".to_string(), uid.to_string())]),
            supported_actions: Vec::new(),
        }
    }

    fn resolver(
        store: Arc<SubscriptionStore>,
        searcher: Arc<ScriptedSearcher>,
    ) -> EntityResolver {
        EntityResolver::new(store, searcher, CacheRegistry::new(&CacheConfig::default()))
    }

    fn params(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_exact_match_resolves_with_true_status() {
        let store = store_with_subscription().await;
        let searcher = ScriptedSearcher::new(None);
        let route = crate::catalog::test_route();
        let outcome = resolver(store, searcher.clone())
            .resolve(&route, &params(&[("uid", "行业101")]))
            .await
            .unwrap();
        assert_eq!(outcome.values["uid"], "1566847");
        assert!(outcome.status["uid"]);
        // Exact match short-circuits the semantic step.
        assert_eq!(searcher.call_count(), 0);
    }

    #[tokio::test]
    async fn test_alias_match_resolves() {
        let store = store_with_subscription().await;
        let route = crate::catalog::test_route();
        let outcome = resolver(store, ScriptedSearcher::new(None))
            .resolve(&route, &params(&[("uid", "行业一零一")]))
            .await
            .unwrap();
        assert_eq!(outcome.values["uid"], "1566847");
        assert!(outcome.status["uid"]);
    }

    #[tokio::test]
    async fn test_semantic_fallback_above_threshold() {
        let store = store_with_subscription().await;
        let searcher = ScriptedSearcher::new(Some((subscription("1566847"), 0.82)));
        let route = crate::catalog::test_route();
        let outcome = resolver(store, searcher)
            .resolve(&route, &params(&[("uid", "行业101的频道")]))
            .await
            .unwrap();
        assert_eq!(outcome.values["uid"], "1566847");
        assert!(outcome.status["uid"]);
    }

    #[tokio::test]
    async fn test_semantic_below_threshold_is_unresolved() {
        let store = store_with_subscription().await;
        let searcher = ScriptedSearcher::new(Some((subscription("1566847"), 0.55)));
        let route = crate::catalog::test_route();
        let outcome = resolver(store, searcher)
            .resolve(&route, &params(&[("uid", "不存在的名字")]))
            .await
            .unwrap();
        // Two-channel contract: the value is present but flagged unresolved.
        assert_eq!(outcome.values["uid"], "不存在的名字");
        assert!(!outcome.status["uid"]);
        assert_eq!(outcome.failed_parameters(), vec!["uid"]);
    }

    #[tokio::test]
    async fn test_pure_digit_value_bypasses_lookup() {
        let store = store_with_subscription().await;
        let searcher = ScriptedSearcher::new(None);
        let route = crate::catalog::test_route();
        let outcome = resolver(store, searcher.clone())
            .resolve(&route, &params(&[("uid", "1566847")]))
            .await
            .unwrap();
        assert_eq!(outcome.values["uid"], "1566847");
        assert!(outcome.status["uid"]);
        assert_eq!(searcher.call_count(), 0);
    }

    #[tokio::test]
    async fn test_literal_parameters_never_reach_the_resolver() {
        let store = store_with_subscription().await;
        let searcher = ScriptedSearcher::new(None);
        let mut route = crate::catalog::test_route();
        route.parameters[0].parameter_type = Some(ParameterType::Literal);
        let outcome = resolver(store, searcher.clone())
            .resolve(&route, &params(&[("uid", "行业101")]))
            .await
            .unwrap();
        // Passed through verbatim; neither lookup path runs.
        assert_eq!(outcome.values["uid"], "行业101");
        assert!(outcome.status["uid"]);
        assert_eq!(searcher.call_count(), 0);
    }

    #[tokio::test]
    async fn test_untagged_parameter_uses_heuristic() {
        let store = store_with_subscription().await;
        let mut route = crate::catalog::test_route();
        route.parameters[0].parameter_type = None;

        // Digits: already resolved.
        let outcome = resolver(store.clone(), ScriptedSearcher::new(None))
            .resolve(&route, &params(&[("uid", "1566847")]))
            .await
            .unwrap();
        assert!(outcome.status["uid"]);

        // CJK: requires resolution, and here it succeeds via exact match.
        let outcome = resolver(store, ScriptedSearcher::new(None))
            .resolve(&route, &params(&[("uid", "行业101")]))
            .await
            .unwrap();
        assert_eq!(outcome.values["uid"], "1566847");
        assert!(outcome.status["uid"]);
    }

    #[tokio::test]
    async fn test_resolution_cache_is_scoped_and_hit() {
        let store = store_with_subscription().await;
        let caches = CacheRegistry::new(&CacheConfig::default());
        let resolver = EntityResolver::new(store, ScriptedSearcher::new(None), caches.clone());
        let route = crate::catalog::test_route();

        resolver
            .resolve(&route, &params(&[("uid", "行业101")]))
            .await
            .unwrap();
        assert!(caches.resolutions.get("bilibili:user:行业101").is_some());

        // A subscription mutation in this scope must drop the entry.
        caches.invalidate_resolutions("bilibili", "user");
        assert!(caches.resolutions.get("bilibili:user:行业101").is_none());
    }

    #[test]
    fn test_cjk_and_digit_detection() {
        assert!(is_pure_digits("1566847"));
        assert!(!is_pure_digits("15a66847"));
        assert!(!is_pure_digits(""));
        assert!(contains_cjk("行业101"));
        assert!(!contains_cjk("fireship"));
    }
}
