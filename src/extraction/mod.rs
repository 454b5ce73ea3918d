//! LLM-driven parameter extraction
//!
//! Given the user query and the retrieved candidate routes, prompts the LLM
//! for a structured call plan: which route to use and what values fill its
//! parameters. Output is strict JSON; a parse or validation failure earns one
//! retry with a narrowed prompt before the call is marked failed.

use crate::cache::{fingerprint, CacheRegistry};
use crate::error::OmniError;
use crate::llm::{ChatMessage, CompletionOptions, LlmClient};
use crate::retrieval::RetrievedRoute;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// At most this many candidates are shown to the model.
pub const MAX_CANDIDATES: usize = 5;

/// Per-candidate serialization budget in characters.
pub const CANDIDATE_BUDGET: usize = 2000;

/// Outcome classification of an extraction or pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Success,
    NeedsClarification,
    Error,
}

/// The extractor's structured output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPlan {
    pub status: PlanStatus,
    /// Identifier of the selected route, when one was chosen.
    #[serde(default)]
    pub route_id: Option<String>,
    /// Extracted parameter values, in extraction order.
    #[serde(default)]
    pub parameters: IndexMap<String, String>,
    /// Model reasoning, surfaced on clarification and error paths.
    #[serde(default)]
    pub reasoning: Option<String>,
    /// Filled path template. Present only after successful resolution.
    #[serde(default)]
    pub generated_path: Option<String>,
}

impl QueryPlan {
    /// A clarification plan with a message for the user.
    pub fn needs_clarification(reasoning: impl Into<String>) -> Self {
        Self {
            status: PlanStatus::NeedsClarification,
            route_id: None,
            parameters: IndexMap::new(),
            reasoning: Some(reasoning.into()),
            generated_path: None,
        }
    }
}

/// What the model is asked to emit.
#[derive(Debug, Deserialize)]
struct RawPlan {
    status: String,
    #[serde(default)]
    route_id: Option<String>,
    #[serde(default)]
    parameters: IndexMap<String, String>,
    #[serde(default)]
    reasoning: Option<String>,
}

/// LLM-backed parameter extractor.
pub struct ParameterExtractor {
    llm: Arc<dyn LlmClient>,
    caches: CacheRegistry,
    temperature: f32,
}

const SYSTEM_PROMPT: &str = r#"You are a routing assistant for a feed data gateway.
Given a user query and a list of candidate route definitions, choose the single
best route and extract its parameter values from the query.

Respond with ONLY a JSON object of this exact shape:
{
  "status": "success" | "needs_clarification",
  "route_id": "<id of the chosen route, or null>",
  "parameters": { "<name>": "<value>" },
  "reasoning": "<one or two sentences>"
}

Rules:
- Pick a route only if the query clearly matches it; otherwise use status
  "needs_clarification" and explain what is missing.
- For parameters typed "entity_ref" it is legitimate to emit a human-friendly
  name exactly as the user wrote it (e.g. a channel or uploader name); it will
  be resolved to an identifier later. Do not invent identifiers.
- For "literal" and "enum" parameters emit the value verbatim.
- Never output a parameter that the chosen route does not declare."#;

impl ParameterExtractor {
    pub fn new(llm: Arc<dyn LlmClient>, caches: CacheRegistry, temperature: f32) -> Self {
        Self {
            llm,
            caches,
            temperature,
        }
    }

    /// Produce a query plan for `query` over the candidate routes.
    pub async fn extract(
        &self,
        query: &str,
        candidates: &[RetrievedRoute],
    ) -> Result<QueryPlan, OmniError> {
        if candidates.is_empty() {
            return Ok(QueryPlan::needs_clarification(
                "no candidate routes were retrieved for the query",
            ));
        }
        let candidates = &candidates[..candidates.len().min(MAX_CANDIDATES)];

        let digest: Vec<&str> = candidates.iter().map(|c| c.route.id.as_str()).collect();
        let cache_key = fingerprint(&[query, &digest.join(",")]);
        if let Some(cached) = self.caches.completions.get(&cache_key) {
            if let Ok(plan) = self.parse_and_validate(&cached, candidates) {
                debug!(query, "extraction served from completion cache");
                return Ok(plan);
            }
        }

        let user_prompt = build_user_prompt(query, candidates);
        let options = CompletionOptions {
            temperature: self.temperature,
            ..CompletionOptions::default()
        };

        let messages = vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(user_prompt.clone()),
        ];
        let completion = self.llm.complete(&messages, &options).await?;

        match self.parse_and_validate(&completion.content, candidates) {
            Ok(plan) => {
                self.caches.set_completion(&cache_key, completion.content);
                Ok(plan)
            }
            Err(first_failure) => {
                warn!(query, error = %first_failure, "extraction output invalid, retrying narrowed");
                let narrowed = vec![
                    ChatMessage::system(SYSTEM_PROMPT),
                    ChatMessage::user(user_prompt),
                    ChatMessage::assistant(completion.content),
                    ChatMessage::user(format!(
                        "That response was invalid ({first_failure}). Emit ONLY the \
                         JSON object described in the instructions, with no prose \
                         and no code fences."
                    )),
                ];
                let retry = self.llm.complete(&narrowed, &options).await?;
                match self.parse_and_validate(&retry.content, candidates) {
                    Ok(plan) => {
                        self.caches.set_completion(&cache_key, retry.content);
                        Ok(plan)
                    }
                    Err(e) => Err(OmniError::extraction(
                        format!("unparseable extraction output after retry: {e}"),
                        extract_reasoning(&retry.content),
                    )),
                }
            }
        }
    }

    /// Parse the model output and validate it against the candidate set.
    fn parse_and_validate(
        &self,
        content: &str,
        candidates: &[RetrievedRoute],
    ) -> Result<QueryPlan, OmniError> {
        let json = extract_json_object(content)
            .ok_or_else(|| OmniError::extraction("no JSON object in output", None))?;
        let raw: RawPlan = serde_json::from_str(json)?;

        let status = match raw.status.as_str() {
            "success" => PlanStatus::Success,
            "needs_clarification" => PlanStatus::NeedsClarification,
            other => {
                return Err(OmniError::extraction(
                    format!("unknown plan status: {other}"),
                    raw.reasoning,
                ))
            }
        };

        if status == PlanStatus::NeedsClarification {
            return Ok(QueryPlan {
                status,
                route_id: raw.route_id,
                parameters: raw.parameters,
                reasoning: raw.reasoning,
                generated_path: None,
            });
        }

        let route_id = raw
            .route_id
            .ok_or_else(|| OmniError::extraction("success plan without route_id", None))?;
        let route = candidates
            .iter()
            .map(|c| &c.route)
            .find(|r| r.id == route_id)
            .ok_or_else(|| {
                OmniError::extraction(format!("route {route_id} is not a candidate"), None)
            })?;

        for name in raw.parameters.keys() {
            if route.parameter(name).is_none() {
                return Err(OmniError::extraction(
                    format!("parameter {name} is not declared by route {route_id}"),
                    None,
                ));
            }
        }

        Ok(QueryPlan {
            status,
            route_id: Some(route_id),
            parameters: raw.parameters,
            reasoning: raw.reasoning,
            generated_path: None,
        })
    }
}

/// Build the user prompt: query plus budget-capped candidate definitions.
fn build_user_prompt(query: &str, candidates: &[RetrievedRoute]) -> String {
    let mut prompt = format!("User query:\n{query}\n\nCandidate routes:\n");
    for candidate in candidates {
        prompt.push_str(&candidate.route.to_prompt_json(CANDIDATE_BUDGET));
        prompt.push('\n');
    }
    prompt
}

/// Pull the first top-level JSON object out of model output, tolerating code
/// fences and surrounding prose.
fn extract_json_object(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in content[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&content[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Salvage a reasoning string from unparseable output, if any.
fn extract_reasoning(content: &str) -> Option<String> {
    let json = extract_json_object(content)?;
    let value: serde_json::Value = serde_json::from_str(json).ok()?;
    value["reasoning"].as_str().map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheRegistry;
    use crate::config::CacheConfig;
    use crate::llm::{Completion, LlmError};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted LLM returning canned responses in order.
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
            let content = self
                .responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| "{}".to_string());
            Ok(Completion {
                content,
                finish_reason: "stop".to_string(),
            })
        }
    }

    fn candidates() -> Vec<RetrievedRoute> {
        vec![RetrievedRoute {
            route: crate::catalog::test_route(),
            score: 0.9,
        }]
    }

    fn extractor(llm: Arc<ScriptedLlm>) -> ParameterExtractor {
        ParameterExtractor::new(llm, CacheRegistry::new(&CacheConfig::default()), 0.1)
    }

    #[tokio::test]
    async fn test_successful_extraction() {
        let llm = ScriptedLlm::new(vec![
            r#"{"status":"success","route_id":"bilibili-user-video","parameters":{"uid":"行业101"},"reasoning":"matches uploads"}"#,
        ]);
        let plan = extractor(llm.clone())
            .extract("看看 up 主 行业101 的投稿视频", &candidates())
            .await
            .unwrap();
        assert_eq!(plan.status, PlanStatus::Success);
        assert_eq!(plan.route_id.as_deref(), Some("bilibili-user-video"));
        assert_eq!(plan.parameters["uid"], "行业101");
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_candidates_short_circuits_without_llm_call() {
        let llm = ScriptedLlm::new(vec![]);
        let plan = extractor(llm.clone()).extract("query", &[]).await.unwrap();
        assert_eq!(plan.status, PlanStatus::NeedsClarification);
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_parse_failure_retries_once_then_errors() {
        let llm = ScriptedLlm::new(vec!["not json at all", "still not json"]);
        let result = extractor(llm.clone()).extract("query", &candidates()).await;
        assert!(matches!(result, Err(OmniError::ExtractionFailed { .. })));
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn test_retry_recovers_from_fenced_output() {
        let llm = ScriptedLlm::new(vec![
            "no object here",
            r#"```json
{"status":"success","route_id":"bilibili-user-video","parameters":{"uid":"1566847"}}
```"#,
        ]);
        let plan = extractor(llm.clone())
            .extract("uid 1566847 的投稿", &candidates())
            .await
            .unwrap();
        assert_eq!(plan.status, PlanStatus::Success);
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_route_is_rejected() {
        let bad = r#"{"status":"success","route_id":"made-up","parameters":{}}"#;
        let llm = ScriptedLlm::new(vec![bad, bad]);
        let result = extractor(llm).extract("query", &candidates()).await;
        assert!(matches!(result, Err(OmniError::ExtractionFailed { .. })));
    }

    #[tokio::test]
    async fn test_undeclared_parameter_is_rejected() {
        let bad = r#"{"status":"success","route_id":"bilibili-user-video","parameters":{"nope":"1"}}"#;
        let llm = ScriptedLlm::new(vec![bad, bad]);
        let result = extractor(llm).extract("query", &candidates()).await;
        assert!(matches!(result, Err(OmniError::ExtractionFailed { .. })));
    }

    #[tokio::test]
    async fn test_needs_clarification_passes_through() {
        let llm = ScriptedLlm::new(vec![
            r#"{"status":"needs_clarification","reasoning":"no route matches cooking recipes"}"#,
        ]);
        let plan = extractor(llm).extract("菜谱", &candidates()).await.unwrap();
        assert_eq!(plan.status, PlanStatus::NeedsClarification);
        assert!(plan.reasoning.unwrap().contains("cooking"));
    }

    #[tokio::test]
    async fn test_completion_cache_avoids_second_call() {
        let response = r#"{"status":"success","route_id":"bilibili-user-video","parameters":{"uid":"1566847"}}"#;
        let llm = ScriptedLlm::new(vec![response]);
        let extractor = extractor(llm.clone());
        let first = extractor.extract("uid 1566847", &candidates()).await.unwrap();
        let second = extractor.extract("uid 1566847", &candidates()).await.unwrap();
        assert_eq!(first.route_id, second.route_id);
        assert_eq!(llm.call_count(), 1);
    }

    #[test]
    fn test_extract_json_object_handles_nesting_and_strings() {
        let content = r#"prose {"a": {"b": "}"}, "c": 1} trailing"#;
        let json = extract_json_object(content).unwrap();
        let value: serde_json::Value = serde_json::from_str(json).unwrap();
        assert_eq!(value["c"], 1);
    }

    #[test]
    fn test_prompt_caps_candidates() {
        let many: Vec<RetrievedRoute> = (0..10)
            .map(|i| {
                let mut route = crate::catalog::test_route();
                route.id = format!("route-{i}");
                RetrievedRoute { route, score: 0.5 }
            })
            .collect();
        let prompt = build_user_prompt("q", &many[..MAX_CANDIDATES.min(many.len())]);
        assert_eq!(prompt.matches("route-").count(), MAX_CANDIDATES);
    }
}
