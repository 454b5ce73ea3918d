//! Multi-step research orchestration
//!
//! A cooperative state machine over four nodes: the planner proposes
//! sub-queries, the dispatcher runs each through the single-shot pipeline and
//! stashes the results, the reflector decides whether another round is
//! needed, and the synthesizer writes the final report. Node transitions go
//! through one scheduler loop with a bounded cycle budget; cancellation is
//! observed at every suspension point.

use super::{ProcessOptions, QueryProcessor};
use crate::error::OmniError;
use crate::extraction::PlanStatus;
use crate::llm::{ChatMessage, CompletionOptions, LlmClient};
use crate::stream::{MessageKind, PanelPreview, TaskEmitter};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Maximum planner/reflector rounds before the task is forced to synthesize.
pub const MAX_CYCLES: usize = 3;

/// Maximum sub-queries dispatched per round.
pub const MAX_SUBQUERIES: usize = 4;

/// One named dataset accumulated during a research task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StashEntry {
    pub name: String,
    pub query: String,
    pub title: String,
    pub items: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_path: Option<String>,
}

/// Timestamped execution log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepEntry {
    pub at: DateTime<Utc>,
    pub node: String,
    pub detail: String,
}

/// Node phases of the task state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Planning,
    Running,
    Reflecting,
    Synthesizing,
    Completed,
}

/// Graph-scoped state, exclusively owned by the orchestrator for the task's
/// duration. Nodes read it and return deltas; mutation happens in the
/// scheduler loop between nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchState {
    pub query: String,
    pub history: Vec<String>,
    pub stash: Vec<StashEntry>,
    pub steps: Vec<StepEntry>,
    pub report: Option<String>,
    pub error: Option<String>,
}

impl ResearchState {
    fn new(query: &str) -> Self {
        Self {
            query: query.to_string(),
            history: Vec::new(),
            stash: Vec::new(),
            steps: Vec::new(),
            report: None,
            error: None,
        }
    }

    fn log(&mut self, node: &str, detail: impl Into<String>) {
        self.steps.push(StepEntry {
            at: Utc::now(),
            node: node.to_string(),
            detail: detail.into(),
        });
    }

    /// Compact stash description for prompts.
    fn stash_summary(&self) -> String {
        if self.stash.is_empty() {
            return "(no data gathered yet)".to_string();
        }
        self.stash
            .iter()
            .map(|entry| {
                format!(
                    "- {} (\"{}\"): {} items from query \"{}\"",
                    entry.name,
                    entry.title,
                    entry.items.len(),
                    entry.query
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// What the planner decided.
#[derive(Debug, Deserialize)]
struct PlannerDecision {
    action: String,
    #[serde(default)]
    sub_queries: Vec<String>,
}

/// What the reflector decided.
#[derive(Debug, Deserialize)]
struct ReflectorDecision {
    need_more: bool,
    #[serde(default)]
    sub_queries: Vec<String>,
}

/// The multi-step orchestrator.
pub struct ResearchOrchestrator {
    llm: Arc<dyn LlmClient>,
    processor: Arc<dyn QueryProcessor>,
    max_cycles: usize,
}

const PLANNER_PROMPT: &str = r#"You plan data gathering for a research question over
feed data sources. Given the question, prior conversation, and the data already
gathered, respond with ONLY a JSON object:
{"action": "dispatch", "sub_queries": ["<self-contained data query>", ...]}
or, when the gathered data already covers the question:
{"action": "synthesize"}
Each sub-query must name a concrete account, repository, or topic to fetch; emit
at most 4."#;

const REFLECTOR_PROMPT: &str = r#"You review freshly gathered datasets for a research
question and decide whether more data is needed. Respond with ONLY a JSON object:
{"need_more": true, "sub_queries": ["<query>", ...]} or {"need_more": false}"#;

impl ResearchOrchestrator {
    pub fn new(llm: Arc<dyn LlmClient>, processor: Arc<dyn QueryProcessor>) -> Self {
        Self {
            llm,
            processor,
            max_cycles: MAX_CYCLES,
        }
    }

    /// Override the cycle budget.
    pub fn with_max_cycles(mut self, max_cycles: usize) -> Self {
        self.max_cycles = max_cycles.max(1);
        self
    }

    /// Execute a research task, streaming node events through `emitter`.
    /// Returns the final state; callers persist or discard it.
    pub async fn research(&self, query: &str, emitter: &TaskEmitter) -> ResearchState {
        let cancel = emitter.cancellation();
        let mut state = ResearchState::new(query);
        let mut phase = Phase::Planning;
        let mut pending: Vec<String> = Vec::new();
        let mut cycles = 0usize;
        let mut reflector_failures = 0usize;

        emitter
            .emit(MessageKind::ResearchStart {
                message: format!("Researching: {query}"),
            })
            .await;

        loop {
            if cancel.is_cancelled() {
                state.error = Some("cancelled".to_string());
                state.log("scheduler", "cancelled by client");
                emitter
                    .emit(MessageKind::ResearchError {
                        error_code: "cancelled".to_string(),
                        error_message: "The request was cancelled.".to_string(),
                    })
                    .await;
                return state;
            }

            match phase {
                Phase::Planning => {
                    cycles += 1;
                    if cycles > self.max_cycles {
                        debug!(cycles, "cycle budget exhausted, forcing synthesis");
                        state.log("scheduler", "cycle budget exhausted");
                        phase = Phase::Synthesizing;
                        continue;
                    }
                    match self.plan(&state).await {
                        Ok(decision) if decision.action == "dispatch"
                            && !decision.sub_queries.is_empty() =>
                        {
                            let mut sub_queries = decision.sub_queries;
                            sub_queries.truncate(MAX_SUBQUERIES);
                            state.log("planner", format!("dispatching {} sub-queries", sub_queries.len()));
                            emitter
                                .emit(MessageKind::ResearchStep {
                                    step: "plan".to_string(),
                                    message: format!(
                                        "Planned {} data queries",
                                        sub_queries.len()
                                    ),
                                })
                                .await;
                            pending = sub_queries;
                            phase = Phase::Running;
                        }
                        Ok(_) => {
                            state.log("planner", "decided to synthesize");
                            phase = Phase::Synthesizing;
                        }
                        Err(e) => {
                            return self.fail(state, emitter, &e, "planner").await;
                        }
                    }
                }
                Phase::Running => {
                    for sub_query in std::mem::take(&mut pending) {
                        if cancel.is_cancelled() {
                            break;
                        }
                        self.dispatch(&mut state, &sub_query, emitter).await;
                    }
                    phase = Phase::Reflecting;
                }
                Phase::Reflecting => match self.reflect(&state).await {
                    Ok(decision) if decision.need_more && !decision.sub_queries.is_empty() => {
                        reflector_failures = 0;
                        let mut sub_queries = decision.sub_queries;
                        sub_queries.truncate(MAX_SUBQUERIES);
                        state.log("reflector", format!("requested {} more sub-queries", sub_queries.len()));
                        pending = sub_queries;
                        cycles += 1;
                        if cycles > self.max_cycles {
                            state.log("scheduler", "cycle budget exhausted");
                            phase = Phase::Synthesizing;
                        } else {
                            phase = Phase::Running;
                        }
                    }
                    Ok(_) => {
                        reflector_failures = 0;
                        state.log("reflector", "data sufficient");
                        phase = Phase::Synthesizing;
                    }
                    Err(e) => {
                        reflector_failures += 1;
                        if reflector_failures >= 2 {
                            return self.fail(state, emitter, &e, "reflector").await;
                        }
                        warn!(error = %e, "reflector failed, retrying once");
                        state.log("reflector", "transient failure, retrying");
                    }
                },
                Phase::Synthesizing => match self.synthesize(&state).await {
                    Ok(report) => {
                        emitter
                            .emit(MessageKind::ResearchAnalysis {
                                content: report.clone(),
                            })
                            .await;
                        emitter
                            .emit(MessageKind::ResearchComplete {
                                success: true,
                                report: report.clone(),
                            })
                            .await;
                        state.report = Some(report);
                        state.log("synthesizer", "report produced");
                        phase = Phase::Completed;
                    }
                    Err(e) => {
                        return self.fail(state, emitter, &e, "synthesizer").await;
                    }
                },
                Phase::Completed => {
                    info!(
                        query,
                        datasets = state.stash.len(),
                        steps = state.steps.len(),
                        "research task complete"
                    );
                    return state;
                }
            }
        }
    }

    /// Planner node: decide the next batch of sub-queries or move to
    /// synthesis.
    async fn plan(&self, state: &ResearchState) -> Result<PlannerDecision, OmniError> {
        let user = format!(
            "Research question:\n{}\n\nConversation so far:\n{}\n\nData gathered:\n{}",
            state.query,
            if state.history.is_empty() {
                "(none)".to_string()
            } else {
                state.history.join("\n")
            },
            state.stash_summary(),
        );
        let completion = self
            .llm
            .complete(
                &[ChatMessage::system(PLANNER_PROMPT), ChatMessage::user(user)],
                &CompletionOptions::default(),
            )
            .await?;
        Ok(serde_json::from_str(completion.content.trim())?)
    }

    /// Dispatcher node: run one sub-query through the simple pipeline and
    /// stash the result. A clarification outcome earns one reformulation;
    /// a second one abandons the branch.
    async fn dispatch(&self, state: &mut ResearchState, sub_query: &str, emitter: &TaskEmitter) {
        emitter
            .emit(MessageKind::ResearchStep {
                step: "fetch".to_string(),
                message: format!("Fetching: {sub_query}"),
            })
            .await;

        let options = ProcessOptions::default();
        let mut result = self.processor.process(sub_query, &options).await;

        if result.status == PlanStatus::NeedsClarification {
            // Reformulate once with the failure hint folded in, then give up
            // on the branch.
            let hint = result
                .metadata
                .plan
                .as_ref()
                .and_then(|p| p.reasoning.clone())
                .unwrap_or_else(|| "be more specific".to_string());
            let reformulated = format!("{sub_query} ({hint})");
            debug!(sub_query, reformulated, "sub-query needs clarification, reformulating");
            state.log("dispatcher", format!("reformulating: {sub_query}"));
            result = self.processor.process(&reformulated, &options).await;
        }

        match result.status {
            PlanStatus::Success => {
                let data = result.data.unwrap_or_else(|| crate::fetch::FetchResult {
                    title: "empty".to_string(),
                    records: Vec::new(),
                    origin: crate::fetch::FetchOrigin::Primary,
                    from_cache: false,
                });
                let name = format!("dataset_{}", state.stash.len() + 1);
                let preview = PanelPreview {
                    title: data.title.clone(),
                    items: data.records.iter().take(5).cloned().collect(),
                    generated_path: result.metadata.generated_path.clone(),
                };
                state.stash.push(StashEntry {
                    name: name.clone(),
                    query: sub_query.to_string(),
                    title: data.title,
                    items: data.records,
                    generated_path: result.metadata.generated_path,
                });
                state.log("dispatcher", format!("stashed {name} for: {sub_query}"));
                emitter
                    .emit(MessageKind::PanelPreview {
                        previews: vec![preview.clone()],
                    })
                    .await;
                emitter
                    .emit(MessageKind::ResearchPanel {
                        previews: vec![preview],
                    })
                    .await;
            }
            PlanStatus::NeedsClarification => {
                warn!(sub_query, "abandoning branch after failed reformulation");
                state.log("dispatcher", format!("abandoned branch: {sub_query}"));
            }
            PlanStatus::Error => {
                warn!(sub_query, "sub-query failed, continuing with remaining branches");
                state.log("dispatcher", format!("branch errored: {sub_query}"));
            }
        }
    }

    /// Reflector node: inspect the stash and decide whether to loop.
    async fn reflect(&self, state: &ResearchState) -> Result<ReflectorDecision, OmniError> {
        let user = format!(
            "Research question:\n{}\n\nDatasets gathered:\n{}",
            state.query,
            state.stash_summary(),
        );
        let completion = self
            .llm
            .complete(
                &[
                    ChatMessage::system(REFLECTOR_PROMPT),
                    ChatMessage::user(user),
                ],
                &CompletionOptions::default(),
            )
            .await?;
        Ok(serde_json::from_str(completion.content.trim())?)
    }

    /// Synthesizer node: produce the final report over the stash.
    async fn synthesize(&self, state: &ResearchState) -> Result<String, OmniError> {
        if state.stash.is_empty() {
            return Ok(format!(
                "No data could be gathered for \"{}\". The sources may be \
                 unavailable or the question may need to name specific accounts.",
                state.query
            ));
        }
        let mut user = format!(
            "Write a concise report answering:\n{}\n\nDatasets:\n",
            state.query
        );
        for entry in &state.stash {
            user.push_str(&format!("\n## {} ({})\n", entry.name, entry.title));
            for item in entry.items.iter().take(10) {
                let line = serde_json::to_string(item).unwrap_or_default();
                let line: String = line.chars().take(300).collect();
                user.push_str(&line);
                user.push('\n');
            }
        }
        let options = CompletionOptions {
            json_mode: false,
            max_tokens: Some(1500),
            ..CompletionOptions::default()
        };
        let completion = self
            .llm
            .complete(
                &[
                    ChatMessage::system(
                        "You summarize gathered feed data into a clear, factual report \
                         in the language of the question.",
                    ),
                    ChatMessage::user(user),
                ],
                &options,
            )
            .await?;
        Ok(completion.content)
    }

    async fn fail(
        &self,
        mut state: ResearchState,
        emitter: &TaskEmitter,
        error: &OmniError,
        node: &str,
    ) -> ResearchState {
        warn!(node, category = error.category(), error = %error, "research task failed");
        state.error = Some(error.error_code().to_string());
        state.log(node, format!("failed: {}", error.error_code()));
        emitter
            .emit(MessageKind::ResearchError {
                error_code: error.error_code().to_string(),
                error_message: error.user_message(),
            })
            .await;
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Completion, LlmError};
    use crate::pipeline::{QueryResult, ResultMetadata};
    use crate::stream::{Attach, TaskRegistry};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct ScriptedLlm {
        responses: Mutex<Vec<Result<String, ()>>>,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<Result<&str, ()>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(
                    responses
                        .into_iter()
                        .rev()
                        .map(|r| r.map(String::from))
                        .collect(),
                ),
            })
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
            match self.responses.lock().unwrap().pop() {
                Some(Ok(content)) => Ok(Completion {
                    content,
                    finish_reason: "stop".to_string(),
                }),
                _ => Err(LlmError::Timeout { timeout_ms: 1 }),
            }
        }
    }

    /// Processor returning one canned result per call.
    struct ScriptedProcessor {
        results: Mutex<Vec<QueryResult>>,
        queries: Mutex<Vec<String>>,
    }

    impl ScriptedProcessor {
        fn new(results: Vec<QueryResult>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into_iter().rev().collect()),
                queries: Mutex::new(Vec::new()),
            })
        }

        fn seen_queries(&self) -> Vec<String> {
            self.queries.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl QueryProcessor for ScriptedProcessor {
        async fn process(&self, query: &str, _options: &ProcessOptions) -> QueryResult {
            self.queries.lock().unwrap().push(query.to_string());
            self.results
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| QueryResult::needs_clarification("out of script"))
        }
    }

    fn success_result(records: usize) -> QueryResult {
        QueryResult {
            status: PlanStatus::Success,
            message: "ok".to_string(),
            route: None,
            data: Some(crate::fetch::FetchResult {
                title: "feed".to_string(),
                records: (0..records).map(|i| json!({ "n": i })).collect(),
                origin: crate::fetch::FetchOrigin::Primary,
                from_cache: false,
            }),
            metadata: ResultMetadata {
                generated_path: Some("/bilibili/user/video/1566847".to_string()),
                ..ResultMetadata::default()
            },
        }
    }

    async fn run(
        llm: Arc<ScriptedLlm>,
        processor: Arc<ScriptedProcessor>,
        task_id: &str,
    ) -> (ResearchState, Vec<MessageKind>) {
        let registry = TaskRegistry::new();
        let emitter = registry.create(task_id).unwrap();
        let Attach::Live(mut receiver) = registry.attach(task_id).await else {
            panic!("expected live attach");
        };
        let orchestrator = ResearchOrchestrator::new(llm, processor);
        let state = orchestrator.research("看看 行业101 最近的方向", &emitter).await;
        // Drop every sender so the drain below terminates.
        drop(emitter);
        registry.remove(task_id);
        let mut kinds = Vec::new();
        while let Some(envelope) = receiver.recv().await {
            kinds.push(envelope.kind);
        }
        (state, kinds)
    }

    #[tokio::test]
    async fn test_plan_dispatch_synthesize_happy_path() {
        let llm = ScriptedLlm::new(vec![
            Ok(r#"{"action":"dispatch","sub_queries":["行业101 的投稿视频"]}"#),
            Ok(r#"{"need_more": false}"#),
            Ok("行业101 最近专注于行业分析视频。"),
        ]);
        let processor = ScriptedProcessor::new(vec![success_result(3)]);
        let (state, kinds) = run(llm, processor, "r-1").await;

        assert_eq!(state.stash.len(), 1);
        assert_eq!(state.stash[0].name, "dataset_1");
        assert!(state.report.as_ref().unwrap().contains("行业101"));
        assert!(state.error.is_none());

        assert!(matches!(kinds.first(), Some(MessageKind::ResearchStart { .. })));
        assert!(kinds
            .iter()
            .any(|k| matches!(k, MessageKind::PanelPreview { .. })));
        let last = kinds.last().unwrap();
        assert!(matches!(
            last,
            MessageKind::ResearchComplete { success: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_reflector_loop_gathers_more_data() {
        let llm = ScriptedLlm::new(vec![
            Ok(r#"{"action":"dispatch","sub_queries":["q1"]}"#),
            Ok(r#"{"need_more": true, "sub_queries": ["q2"]}"#),
            Ok(r#"{"need_more": false}"#),
            Ok("report"),
        ]);
        let processor = ScriptedProcessor::new(vec![success_result(1), success_result(2)]);
        let (state, _) = run(llm, processor.clone(), "r-2").await;

        assert_eq!(state.stash.len(), 2);
        assert_eq!(processor.seen_queries(), vec!["q1", "q2"]);
    }

    #[tokio::test]
    async fn test_clarification_branch_reformulates_once_then_abandons() {
        let llm = ScriptedLlm::new(vec![
            Ok(r#"{"action":"dispatch","sub_queries":["模糊的查询"]}"#),
            Ok(r#"{"need_more": false}"#),
            Ok("report"),
        ]);
        let clarification = QueryResult::needs_clarification("which account?");
        let processor =
            ScriptedProcessor::new(vec![clarification.clone(), clarification]);
        let (state, _) = run(llm, processor.clone(), "r-3").await;

        // One original attempt plus exactly one reformulation, then the
        // branch is dropped without data.
        assert_eq!(processor.seen_queries().len(), 2);
        assert!(processor.seen_queries()[1].contains("模糊的查询"));
        assert!(state.stash.is_empty());
        // The task still completes with a no-data report.
        assert!(state.report.is_some());
    }

    #[tokio::test]
    async fn test_reflector_error_retries_once_then_fails_task() {
        let llm = ScriptedLlm::new(vec![
            Ok(r#"{"action":"dispatch","sub_queries":["q1"]}"#),
            Err(()), // reflector attempt 1
            Err(()), // reflector attempt 2
        ]);
        let processor = ScriptedProcessor::new(vec![success_result(1)]);
        let (state, kinds) = run(llm, processor, "r-4").await;

        assert!(state.error.is_some());
        assert!(kinds
            .iter()
            .any(|k| matches!(k, MessageKind::ResearchError { .. })));
        assert!(!kinds
            .iter()
            .any(|k| matches!(k, MessageKind::ResearchComplete { .. })));
    }

    #[tokio::test]
    async fn test_cycle_budget_bounds_the_loop() {
        // Reflector always wants more; the budget must force synthesis.
        let llm = ScriptedLlm::new(vec![
            Ok(r#"{"action":"dispatch","sub_queries":["q"]}"#),
            Ok(r#"{"need_more": true, "sub_queries": ["q"]}"#),
            Ok(r#"{"need_more": true, "sub_queries": ["q"]}"#),
            Ok(r#"{"need_more": true, "sub_queries": ["q"]}"#),
            Ok(r#"{"need_more": true, "sub_queries": ["q"]}"#),
            Ok("report"),
        ]);
        let processor = ScriptedProcessor::new(vec![
            success_result(1),
            success_result(1),
            success_result(1),
            success_result(1),
            success_result(1),
        ]);
        let (state, _) = run(llm, processor, "r-5").await;

        assert!(state.report.is_some());
        assert!(state.stash.len() <= MAX_CYCLES);
        assert!(state
            .steps
            .iter()
            .any(|s| s.detail.contains("budget exhausted")));
    }

    #[tokio::test]
    async fn test_cancellation_unwinds_with_cancelled_error() {
        let llm = ScriptedLlm::new(vec![Ok(
            r#"{"action":"dispatch","sub_queries":["q1"]}"#,
        )]);
        let processor = ScriptedProcessor::new(vec![success_result(1)]);
        let registry = TaskRegistry::new();
        let emitter = registry.create("r-6").unwrap();
        let Attach::Live(mut receiver) = registry.attach("r-6").await else {
            panic!("expected live attach");
        };
        // Cancel before the scheduler even starts.
        registry.cancel("r-6");
        let orchestrator = ResearchOrchestrator::new(llm, processor);
        let state = orchestrator.research("query", &emitter).await;
        drop(emitter);
        registry.remove("r-6");

        assert_eq!(state.error.as_deref(), Some("cancelled"));
        let mut saw_cancelled = false;
        while let Some(envelope) = receiver.recv().await {
            if let MessageKind::ResearchError { error_code, .. } = envelope.kind {
                saw_cancelled = error_code == "cancelled";
            }
        }
        assert!(saw_cancelled);
    }

    #[tokio::test]
    async fn test_steps_are_timestamped_in_order() {
        let llm = ScriptedLlm::new(vec![
            Ok(r#"{"action":"dispatch","sub_queries":["q1"]}"#),
            Ok(r#"{"need_more": false}"#),
            Ok("report"),
        ]);
        let processor = ScriptedProcessor::new(vec![success_result(1)]);
        let (state, _) = run(llm, processor, "r-7").await;
        assert!(state.steps.len() >= 3);
        for pair in state.steps.windows(2) {
            assert!(pair[0].at <= pair[1].at);
        }
    }
}
