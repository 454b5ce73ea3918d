//! User subscriptions: named mappings from familiar labels to platform
//! identifiers
//!
//! Subscriptions live in SQLite and are mirrored into a vector collection so
//! the resolver can fall back to semantic lookup. Every mutation re-embeds
//! the affected entry (idempotent upsert keyed by subscription id) and
//! invalidates the resolution cache for its (platform, entity_type) scope.

use crate::cache::CacheRegistry;
use crate::embedding::TextEmbedder;
use crate::error::OmniError;
use crate::vector::{VectorEntry, VectorStore};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// Collection name holding subscription embeddings.
pub const SUBSCRIPTION_COLLECTION: &str = "subscriptions";

/// A user-curated mapping from a human-friendly name to identifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub display_name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub platform: String,
    pub entity_type: String,
    /// Mapping from entity-field key (e.g. "uid") to identifier value.
    pub identifiers: HashMap<String, String>,
    #[serde(default)]
    pub supported_actions: Vec<String>,
}

/// Fields for creating or replacing a subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionDraft {
    pub display_name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub platform: String,
    pub entity_type: String,
    pub identifiers: HashMap<String, String>,
    #[serde(default)]
    pub supported_actions: Vec<String>,
}

impl Subscription {
    /// Whether `name` matches the display name or any alias, case-folded.
    pub fn matches_name(&self, name: &str) -> bool {
        let needle = name.trim().to_lowercase();
        self.display_name.to_lowercase() == needle
            || self.aliases.iter().any(|a| a.to_lowercase() == needle)
    }

    /// Canonical serialization of the identifier map, used for the
    /// uniqueness constraint.
    fn identity_key(identifiers: &HashMap<String, String>) -> String {
        let mut pairs: Vec<(&String, &String)> = identifiers.iter().collect();
        pairs.sort();
        pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }
}

/// SQLite-backed subscription storage.
pub struct SubscriptionStore {
    pool: SqlitePool,
}

impl SubscriptionStore {
    /// Connect and bootstrap the schema, creating the database file and its
    /// parent directory on first run.
    pub async fn connect(database_url: &str) -> Result<Self, OmniError> {
        if let Some(path) = database_url.strip_prefix("sqlite://") {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// Build the store over an existing pool (tests use in-memory SQLite).
    pub async fn with_pool(pool: SqlitePool) -> Result<Self, OmniError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS subscriptions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                display_name TEXT NOT NULL,
                aliases TEXT NOT NULL DEFAULT '[]',
                platform TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                identifiers TEXT NOT NULL,
                identity_key TEXT NOT NULL,
                supported_actions TEXT NOT NULL DEFAULT '[]',
                UNIQUE(platform, entity_type, identity_key)
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS task_records (
                task_id TEXT PRIMARY KEY,
                query TEXT NOT NULL,
                status TEXT NOT NULL,
                summary TEXT,
                completed_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    fn row_to_subscription(row: &sqlx::sqlite::SqliteRow) -> Result<Subscription, OmniError> {
        Ok(Subscription {
            id: row.get("id"),
            display_name: row.get("display_name"),
            aliases: serde_json::from_str(row.get::<String, _>("aliases").as_str())?,
            platform: row.get("platform"),
            entity_type: row.get("entity_type"),
            identifiers: serde_json::from_str(row.get::<String, _>("identifiers").as_str())?,
            supported_actions: serde_json::from_str(
                row.get::<String, _>("supported_actions").as_str(),
            )?,
        })
    }

    /// Insert a subscription. Fails if (platform, entity_type, identifiers)
    /// already exists.
    pub async fn create(&self, draft: SubscriptionDraft) -> Result<Subscription, OmniError> {
        self.check_alias_collisions(&draft, None).await?;
        let identity_key = Subscription::identity_key(&draft.identifiers);
        let result = sqlx::query(
            "INSERT INTO subscriptions
             (display_name, aliases, platform, entity_type, identifiers, identity_key, supported_actions)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&draft.display_name)
        .bind(serde_json::to_string(&draft.aliases)?)
        .bind(&draft.platform)
        .bind(&draft.entity_type)
        .bind(serde_json::to_string(&draft.identifiers)?)
        .bind(&identity_key)
        .bind(serde_json::to_string(&draft.supported_actions)?)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => OmniError::subscription(
                "a subscription with the same platform, entity type, and identifiers already exists",
            ),
            other => OmniError::Database(other),
        })?;
        self.get(result.last_insert_rowid())
            .await?
            .ok_or_else(|| OmniError::internal("inserted subscription vanished"))
    }

    /// Replace a subscription's fields.
    pub async fn update(
        &self,
        id: i64,
        draft: SubscriptionDraft,
    ) -> Result<Subscription, OmniError> {
        self.check_alias_collisions(&draft, Some(id)).await?;
        let identity_key = Subscription::identity_key(&draft.identifiers);
        let affected = sqlx::query(
            "UPDATE subscriptions SET
             display_name = ?, aliases = ?, platform = ?, entity_type = ?,
             identifiers = ?, identity_key = ?, supported_actions = ?
             WHERE id = ?",
        )
        .bind(&draft.display_name)
        .bind(serde_json::to_string(&draft.aliases)?)
        .bind(&draft.platform)
        .bind(&draft.entity_type)
        .bind(serde_json::to_string(&draft.identifiers)?)
        .bind(&identity_key)
        .bind(serde_json::to_string(&draft.supported_actions)?)
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if affected == 0 {
            return Err(OmniError::subscription(format!("no subscription with id {id}")));
        }
        self.get(id)
            .await?
            .ok_or_else(|| OmniError::internal("updated subscription vanished"))
    }

    /// Delete by id, returning the removed row.
    pub async fn delete(&self, id: i64) -> Result<Subscription, OmniError> {
        let existing = self
            .get(id)
            .await?
            .ok_or_else(|| OmniError::subscription(format!("no subscription with id {id}")))?;
        sqlx::query("DELETE FROM subscriptions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(existing)
    }

    /// Fetch one subscription by id.
    pub async fn get(&self, id: i64) -> Result<Option<Subscription>, OmniError> {
        let row = sqlx::query("SELECT * FROM subscriptions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::row_to_subscription(&r)).transpose()
    }

    /// List every subscription.
    pub async fn list(&self) -> Result<Vec<Subscription>, OmniError> {
        let rows = sqlx::query("SELECT * FROM subscriptions ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_subscription).collect()
    }

    /// List subscriptions scoped to a platform and entity type.
    pub async fn list_scope(
        &self,
        platform: &str,
        entity_type: &str,
    ) -> Result<Vec<Subscription>, OmniError> {
        let rows =
            sqlx::query("SELECT * FROM subscriptions WHERE platform = ? AND entity_type = ?")
                .bind(platform)
                .bind(entity_type)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(Self::row_to_subscription).collect()
    }

    /// Exact name/alias lookup within a (platform, entity_type) scope.
    pub async fn find_by_name(
        &self,
        platform: &str,
        entity_type: &str,
        name: &str,
    ) -> Result<Option<Subscription>, OmniError> {
        Ok(self
            .list_scope(platform, entity_type)
            .await?
            .into_iter()
            .find(|s| s.matches_name(name)))
    }

    /// Aliases must not collide across entity types on the same platform.
    async fn check_alias_collisions(
        &self,
        draft: &SubscriptionDraft,
        exclude_id: Option<i64>,
    ) -> Result<(), OmniError> {
        let rows = sqlx::query("SELECT * FROM subscriptions WHERE platform = ?")
            .bind(&draft.platform)
            .fetch_all(&self.pool)
            .await?;
        let mut names: Vec<String> = draft.aliases.clone();
        names.push(draft.display_name.clone());
        for row in &rows {
            let existing = Self::row_to_subscription(row)?;
            if Some(existing.id) == exclude_id || existing.entity_type == draft.entity_type {
                continue;
            }
            for name in &names {
                if existing.matches_name(name) {
                    return Err(OmniError::subscription(format!(
                        "alias '{}' already names a {} on {}",
                        name, existing.entity_type, existing.platform
                    )));
                }
            }
        }
        Ok(())
    }

    /// Persist a completed task summary.
    pub async fn record_task(
        &self,
        task_id: &str,
        query: &str,
        status: &str,
        summary: Option<&str>,
    ) -> Result<(), OmniError> {
        sqlx::query(
            "INSERT OR REPLACE INTO task_records (task_id, query, status, summary, completed_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(query)
        .bind(status)
        .bind(summary)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Mirrors subscriptions into the vector store for semantic lookup.
pub struct SubscriptionIndexer {
    embedder: TextEmbedder,
    vectors: Arc<VectorStore>,
}

impl SubscriptionIndexer {
    pub fn new(embedder: TextEmbedder, vectors: Arc<VectorStore>) -> Self {
        Self { embedder, vectors }
    }

    fn document(subscription: &Subscription) -> String {
        let mut parts = vec![subscription.display_name.clone()];
        parts.extend(subscription.aliases.iter().cloned());
        parts.join(" | ")
    }

    /// Upsert one subscription's embedding. Idempotent by subscription id.
    pub async fn reindex(&self, subscription: &Subscription) -> Result<(), OmniError> {
        let vector = self
            .embedder
            .embed_one(&Self::document(subscription))
            .await?;
        self.vectors.upsert(
            SUBSCRIPTION_COLLECTION,
            vec![VectorEntry {
                id: subscription.id.to_string(),
                vector,
                metadata: serde_json::to_value(subscription)?,
            }],
        )?;
        debug!(id = subscription.id, name = %subscription.display_name, "subscription re-embedded");
        Ok(())
    }

    /// Drop one subscription from the index.
    pub fn remove(&self, id: i64) -> Result<(), OmniError> {
        self.vectors
            .remove(SUBSCRIPTION_COLLECTION, &[id.to_string()])
    }

    /// Rebuild the whole collection atomically.
    pub async fn reindex_all(&self, subscriptions: &[Subscription]) -> Result<(), OmniError> {
        let texts: Vec<String> = subscriptions.iter().map(Self::document).collect();
        let vectors = self.embedder.embed_batch(texts).await?;
        let entries = subscriptions
            .iter()
            .zip(vectors)
            .map(|(s, vector)| {
                Ok(VectorEntry {
                    id: s.id.to_string(),
                    vector,
                    metadata: serde_json::to_value(s)?,
                })
            })
            .collect::<Result<Vec<_>, OmniError>>()?;
        self.vectors.replace_collection(SUBSCRIPTION_COLLECTION, entries)?;
        info!(subscriptions = subscriptions.len(), "subscription index rebuilt");
        Ok(())
    }
}

/// CRUD facade wiring the store, the index, and cache invalidation together.
/// The server handlers talk to this, never to the parts directly.
pub struct SubscriptionService {
    store: Arc<SubscriptionStore>,
    indexer: SubscriptionIndexer,
    caches: CacheRegistry,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<SubscriptionStore>,
        indexer: SubscriptionIndexer,
        caches: CacheRegistry,
    ) -> Self {
        Self {
            store,
            indexer,
            caches,
        }
    }

    pub async fn create(&self, draft: SubscriptionDraft) -> Result<Subscription, OmniError> {
        let subscription = self.store.create(draft).await?;
        self.after_mutation(&subscription).await?;
        Ok(subscription)
    }

    pub async fn update(
        &self,
        id: i64,
        draft: SubscriptionDraft,
    ) -> Result<Subscription, OmniError> {
        let before = self.store.get(id).await?;
        let subscription = self.store.update(id, draft).await?;
        // The old scope may differ from the new one; invalidate both.
        if let Some(before) = before {
            self.caches
                .invalidate_resolutions(&before.platform, &before.entity_type);
        }
        self.after_mutation(&subscription).await?;
        Ok(subscription)
    }

    pub async fn delete(&self, id: i64) -> Result<Subscription, OmniError> {
        let subscription = self.store.delete(id).await?;
        self.indexer.remove(subscription.id)?;
        self.caches
            .invalidate_resolutions(&subscription.platform, &subscription.entity_type);
        Ok(subscription)
    }

    pub async fn get(&self, id: i64) -> Result<Option<Subscription>, OmniError> {
        self.store.get(id).await
    }

    pub async fn list(&self) -> Result<Vec<Subscription>, OmniError> {
        self.store.list().await
    }

    async fn after_mutation(&self, subscription: &Subscription) -> Result<(), OmniError> {
        self.indexer.reindex(subscription).await?;
        self.caches
            .invalidate_resolutions(&subscription.platform, &subscription.entity_type);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> SubscriptionStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SubscriptionStore::with_pool(pool).await.unwrap()
    }

    fn draft(name: &str, uid: &str) -> SubscriptionDraft {
        SubscriptionDraft {
            display_name: name.to_string(),
            aliases: vec![format!("{name}-alias")],
            platform: "bilibili".to_string(),
            entity_type: "user".to_string(),
            identifiers: HashMap::from([("uid".to_string(), uid.to_string())]),
            supported_actions: vec!["video".to_string()],
        }
    }

    #[tokio::test]
    async fn test_create_and_get_roundtrip() {
        let store = memory_store().await;
        let created = store.create(draft("行业101", "1566847")).await.unwrap();
        let fetched = store.get(created.id).await.unwrap().unwrap();
        assert_eq!(fetched, created);
        assert_eq!(fetched.identifiers["uid"], "1566847");
    }

    #[tokio::test]
    async fn test_duplicate_identity_rejected() {
        let store = memory_store().await;
        store.create(draft("行业101", "1566847")).await.unwrap();
        let result = store.create(draft("同一个人", "1566847")).await;
        assert!(matches!(result, Err(OmniError::Subscription { .. })));
    }

    #[tokio::test]
    async fn test_same_identifier_on_other_entity_type_allowed() {
        let store = memory_store().await;
        store.create(draft("行业101", "1566847")).await.unwrap();
        let mut other = draft("某专栏", "1566847");
        other.entity_type = "column".to_string();
        other.aliases.clear();
        assert!(store.create(other).await.is_ok());
    }

    #[tokio::test]
    async fn test_alias_collision_across_entity_types_rejected() {
        let store = memory_store().await;
        store.create(draft("行业101", "1566847")).await.unwrap();
        let mut column = draft("行业101", "99");
        column.entity_type = "column".to_string();
        let result = store.create(column).await;
        assert!(matches!(result, Err(OmniError::Subscription { .. })));
    }

    #[tokio::test]
    async fn test_find_by_name_and_alias() {
        let store = memory_store().await;
        store.create(draft("行业101", "1566847")).await.unwrap();
        let by_name = store
            .find_by_name("bilibili", "user", "行业101")
            .await
            .unwrap();
        assert!(by_name.is_some());
        let by_alias = store
            .find_by_name("bilibili", "user", "行业101-alias")
            .await
            .unwrap();
        assert!(by_alias.is_some());
        let wrong_scope = store
            .find_by_name("bilibili", "column", "行业101")
            .await
            .unwrap();
        assert!(wrong_scope.is_none());
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let store = memory_store().await;
        let created = store.create(draft("行业101", "1566847")).await.unwrap();
        let mut changed = draft("行业101", "1566847");
        changed.display_name = "行业一零一".to_string();
        let updated = store.update(created.id, changed).await.unwrap();
        assert_eq!(updated.display_name, "行业一零一");

        store.delete(created.id).await.unwrap();
        assert!(store.get(created.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_missing_id_errors() {
        let store = memory_store().await;
        let result = store.update(42, draft("x", "1")).await;
        assert!(matches!(result, Err(OmniError::Subscription { .. })));
    }

    #[tokio::test]
    async fn test_task_record_upsert() {
        let store = memory_store().await;
        store
            .record_task("t-1", "查询", "completed", Some("3 items"))
            .await
            .unwrap();
        // Same id again must not fail.
        store
            .record_task("t-1", "查询", "completed", Some("4 items"))
            .await
            .unwrap();
    }

    #[test]
    fn test_matches_name_is_case_insensitive() {
        let subscription = Subscription {
            id: 1,
            display_name: "Fireship".to_string(),
            aliases: vec!["fire ship".to_string()],
            platform: "youtube".to_string(),
            entity_type: "channel".to_string(),
            identifiers: HashMap::new(),
            supported_actions: Vec::new(),
        };
        assert!(subscription.matches_name("fireship"));
        assert!(subscription.matches_name("FIRE SHIP"));
        assert!(!subscription.matches_name("fires"));
    }

    #[test]
    fn test_identity_key_is_order_independent() {
        let a = HashMap::from([
            ("owner".to_string(), "tokio-rs".to_string()),
            ("repo".to_string(), "tokio".to_string()),
        ]);
        let mut b = HashMap::new();
        b.insert("repo".to_string(), "tokio".to_string());
        b.insert("owner".to_string(), "tokio-rs".to_string());
        assert_eq!(
            Subscription::identity_key(&a),
            Subscription::identity_key(&b)
        );
    }
}
