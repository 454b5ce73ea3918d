//! Fetch execution against the backend feed service
//!
//! Issues HTTP GETs for generated paths. The primary base is guarded by a
//! short-TTL health probe; on timeout or repeated 5xx the executor fails over
//! to the fallback base. Every result records which origin served it.
//! Records come back unmodified; shaping them is the adapter layer's job.

use crate::cache::CacheRegistry;
use crate::config::{FeedConfig, TimeoutConfig};
use crate::error::OmniError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Which base URL served a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchOrigin {
    Primary,
    Fallback,
}

/// A fetched feed payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResult {
    pub title: String,
    /// Heterogeneously shaped records, passed through untouched.
    pub records: Vec<Value>,
    pub origin: FetchOrigin,
    pub from_cache: bool,
}

/// Fetch seam used by the orchestrators.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch a generated path, optionally consulting the payload cache.
    async fn fetch(&self, path: &str, use_cache: bool) -> Result<FetchResult, OmniError>;
}

/// Cached outcome of the primary health probe.
struct HealthState {
    healthy: bool,
    checked_at: Instant,
}

/// Probe results are reused for this long before re-probing.
const HEALTH_TTL: Duration = Duration::from_secs(30);

/// Executor over the primary/fallback feed bases.
pub struct FetchExecutor {
    client: Client,
    config: FeedConfig,
    health_timeout: Duration,
    caches: CacheRegistry,
    health: Mutex<Option<HealthState>>,
}

impl FetchExecutor {
    pub fn new(config: FeedConfig, timeouts: &TimeoutConfig, caches: CacheRegistry) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeouts.fetch())
                .build()
                .unwrap_or_else(|_| Client::new()),
            config,
            health_timeout: timeouts.health(),
            caches,
            health: Mutex::new(None),
        }
    }

    /// Probe the primary base with a short timeout, reusing a recent result.
    pub async fn primary_healthy(&self) -> bool {
        if let Some(state) = self
            .health
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
        {
            if state.checked_at.elapsed() < HEALTH_TTL {
                return state.healthy;
            }
        }
        let healthy = self.probe_primary().await;
        *self
            .health
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(HealthState {
            healthy,
            checked_at: Instant::now(),
        });
        healthy
    }

    async fn probe_primary(&self) -> bool {
        let request = self
            .client
            .get(format!("{}/", self.config.primary_base))
            .timeout(self.health_timeout)
            .send();
        match request.await {
            Ok(response) => {
                let healthy = !response.status().is_server_error();
                debug!(healthy, "primary feed service probed");
                healthy
            }
            Err(e) => {
                warn!(error = %e, "primary feed service probe failed");
                false
            }
        }
    }

    fn mark_primary_unhealthy(&self) {
        *self
            .health
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(HealthState {
            healthy: false,
            checked_at: Instant::now(),
        });
    }

    /// Fetch a generated path, consulting the payload cache first.
    async fn fetch_inner(&self, path: &str, use_cache: bool) -> Result<FetchResult, OmniError> {
        if use_cache {
            if let Some(cached) = self.caches.payloads.get(path) {
                if let Ok(mut result) = serde_json::from_value::<FetchResult>(cached) {
                    result.from_cache = true;
                    debug!(path, "fetch served from payload cache");
                    return Ok(result);
                }
            }
        }

        let result = self.fetch_uncached(path).await?;
        if let Ok(value) = serde_json::to_value(&result) {
            self.caches.set_payload(path, value);
        }
        Ok(result)
    }

    async fn fetch_uncached(&self, path: &str) -> Result<FetchResult, OmniError> {
        let mut last_error: Option<String> = None;

        if self.primary_healthy().await {
            match self
                .fetch_from_base(&self.config.primary_base, path, FetchOrigin::Primary)
                .await
            {
                Ok(result) => return Ok(result),
                Err(e) => {
                    warn!(path, error = %e, "primary fetch exhausted, failing over");
                    self.mark_primary_unhealthy();
                    last_error = Some(e.to_string());
                }
            }
        } else {
            warn!(path, "primary feed service unhealthy, using fallback");
        }

        match self
            .fetch_from_base(&self.config.fallback_base, path, FetchOrigin::Fallback)
            .await
        {
            Ok(result) => Ok(result),
            Err(e) => Err(OmniError::fetch(format!(
                "primary: {}; fallback: {}",
                last_error.unwrap_or_else(|| "skipped (unhealthy)".to_string()),
                e
            ))),
        }
    }

    /// GET `base + path` with bounded retries on timeout and 5xx.
    async fn fetch_from_base(
        &self,
        base: &str,
        path: &str,
        origin: FetchOrigin,
    ) -> Result<FetchResult, OmniError> {
        let url = format!("{}{}", base.trim_end_matches('/'), path);
        let mut last_error: Option<String> = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(250 * attempt as u64)).await;
            }
            match self.client.get(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    let payload: Value = response.json().await?;
                    return Ok(parse_feed(payload, origin));
                }
                Ok(response) if response.status().is_server_error() => {
                    last_error = Some(format!("upstream returned {}", response.status()));
                }
                Ok(response) => {
                    // 4xx is not transient; retrying cannot help.
                    return Err(OmniError::fetch(format!(
                        "upstream returned {}",
                        response.status()
                    )));
                }
                Err(e) if e.is_timeout() => {
                    last_error = Some("request timed out".to_string());
                }
                Err(e) => {
                    last_error = Some(e.to_string());
                }
            }
        }
        Err(OmniError::fetch(
            last_error.unwrap_or_else(|| "no attempts made".to_string()),
        ))
    }
}

#[async_trait]
impl Fetcher for FetchExecutor {
    async fn fetch(&self, path: &str, use_cache: bool) -> Result<FetchResult, OmniError> {
        self.fetch_inner(path, use_cache).await
    }
}

/// Shape a raw feed payload into a `FetchResult`. Only the envelope fields
/// are interpreted; records stay opaque.
fn parse_feed(payload: Value, origin: FetchOrigin) -> FetchResult {
    let title = payload["title"].as_str().unwrap_or("Untitled feed").to_string();
    let records = payload["item"]
        .as_array()
        .cloned()
        .unwrap_or_default();
    FetchResult {
        title,
        records,
        origin,
        from_cache: false,
    }
}
