//! Intent routing between the simple and research pipelines
//!
//! Explicit mode hints dispatch directly. `auto` asks an LLM classifier;
//! `complex_research` above the confidence threshold routes to research.
//! When the research subsystem is disabled at boot, every research request
//! falls through to the simple pipeline with a warning — a missing research
//! orchestrator is never dereferenced.

use crate::error::OmniError;
use crate::llm::{ChatMessage, CompletionOptions, LlmClient};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Confidence required before an auto-detected research intent is honored.
pub const RESEARCH_CONFIDENCE_THRESHOLD: f32 = 0.6;

/// Caller-supplied routing preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModeHint {
    Simple,
    Research,
    #[default]
    Auto,
}

impl ModeHint {
    /// Parse a wire-level mode string; unknown values mean `Auto`.
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("simple") => Self::Simple,
            Some("research") => Self::Research,
            _ => Self::Auto,
        }
    }
}

/// Which pipeline will run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutedMode {
    Simple,
    Research,
}

/// Classifier output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentClassification {
    pub intent: String,
    pub confidence: f32,
}

const CLASSIFIER_PROMPT: &str = r#"Classify a query against feed data sources.
"simple_query" means one concrete lookup (latest posts of an account, issues of a
repository). "complex_research" means the answer needs multiple lookups plus
analysis or comparison. Respond with ONLY a JSON object:
{"intent": "simple_query" | "complex_research", "confidence": 0.0-1.0}"#;

/// Routes queries to a pipeline.
pub struct IntentRouter {
    llm: Arc<dyn LlmClient>,
    research_enabled: bool,
}

impl IntentRouter {
    pub fn new(llm: Arc<dyn LlmClient>, research_enabled: bool) -> Self {
        Self {
            llm,
            research_enabled,
        }
    }

    /// Whether research requests can currently be honored.
    pub fn research_enabled(&self) -> bool {
        self.research_enabled
    }

    /// Decide which pipeline handles the query.
    pub async fn route(&self, query: &str, hint: ModeHint) -> RoutedMode {
        let wanted = match hint {
            ModeHint::Simple => return RoutedMode::Simple,
            ModeHint::Research => RoutedMode::Research,
            ModeHint::Auto => match self.classify(query).await {
                Ok(classification) => {
                    debug!(
                        query,
                        intent = %classification.intent,
                        confidence = classification.confidence,
                        "intent classified"
                    );
                    if classification.intent == "complex_research"
                        && classification.confidence >= RESEARCH_CONFIDENCE_THRESHOLD
                    {
                        RoutedMode::Research
                    } else {
                        RoutedMode::Simple
                    }
                }
                Err(e) => {
                    warn!(query, error = %e, "intent classification failed, defaulting to simple");
                    RoutedMode::Simple
                }
            },
        };

        if wanted == RoutedMode::Research && !self.research_enabled {
            warn!(query, "research subsystem disabled, falling through to simple pipeline");
            return RoutedMode::Simple;
        }
        wanted
    }

    /// Run the LLM intent classifier.
    pub async fn classify(&self, query: &str) -> Result<IntentClassification, OmniError> {
        let completion = self
            .llm
            .complete(
                &[
                    ChatMessage::system(CLASSIFIER_PROMPT),
                    ChatMessage::user(query.to_string()),
                ],
                &CompletionOptions::default(),
            )
            .await?;
        Ok(serde_json::from_str(completion.content.trim())?)
    }
}
