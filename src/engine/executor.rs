//! The execution engine - one autonomous task, from server discovery to a
//! final answer.
//!
//! Rounds are strictly sequential. Within a round the requested tool calls
//! fan out to their sessions with bounded concurrency and are all joined
//! before the next backend call. Sessions are closed on every exit path.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt, TryStreamExt};
use mockable::DefaultClock;
use serde_json::Value;

use super::arguments::recover_arguments;
use super::conversation::{BackendCall, CallSettings, ConversationState};
use super::errors::EngineError;
use super::types::{
    EngineState, ExecutionRequest, ExecutionResult, TerminalReason, ToolCallRequest,
    TranscriptEntry,
};
use crate::config::{ConversationMode, RelayConfig};
use crate::gateway::resilience::SharedClock;
use crate::gateway::{BackendResponse, BreakerRegistry, GatewayClient, GatewayError, LlmBackend};
use crate::mcp_client::types::ToolCallOutcome;
use crate::mcp_client::{
    select_servers, ConnectPolicy, McpError, ServerDescriptor, ServerSearch, SessionConnector,
    SessionManager, StdioConnector,
};
use crate::models::{
    AcceleratorSlot, LmsAccelerator, ModelAccelerator, ModelError, ModelSource, ModelStateManager,
};
use crate::schema_bridge::{to_dialect, DialectStrategy};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Consecutive empty backend turns tolerated before the run is abandoned.
const MAX_EMPTY_RESPONSES: u32 = 2;

const EMPTY_RESPONSE_NUDGE: &str = "You returned an empty response. Answer the task \
     or call the appropriate tool now.";

// ─── ExecutionEngine ─────────────────────────────────────────────────────────

pub struct ExecutionEngine {
    config: RelayConfig,
    backend: Arc<dyn LlmBackend>,
    models: Arc<ModelStateManager>,
    connector: Arc<dyn SessionConnector>,
    dialects: Arc<dyn DialectStrategy>,
}

/// Per-run values after request overrides are applied.
struct RunPlan {
    mode: ConversationMode,
    max_rounds: u32,
    max_tokens: u32,
}

impl ExecutionEngine {
    pub fn new(
        config: RelayConfig,
        backend: Arc<dyn LlmBackend>,
        models: Arc<ModelStateManager>,
        connector: Arc<dyn SessionConnector>,
    ) -> Self {
        let dialects: Arc<dyn DialectStrategy> = Arc::new(config.dialects);
        Self {
            config,
            backend,
            models,
            connector,
            dialects,
        }
    }

    /// Replace the configured mode → dialect table.
    pub fn with_dialects(mut self, dialects: Arc<dyn DialectStrategy>) -> Self {
        self.dialects = dialects;
        self
    }

    /// Wire the production collaborators: HTTP gateway, `lms` accelerator
    /// (checked lazily), stdio tool servers, wall clock.
    pub fn from_config(config: RelayConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let clock: SharedClock = Arc::new(DefaultClock);
        let breakers = Arc::new(BreakerRegistry::new(
            config.circuit_breaker.clone(),
            Arc::clone(&clock),
        ));
        let client = Arc::new(GatewayClient::new(&config, breakers, Arc::clone(&clock))?);
        let lms: Arc<dyn ModelAccelerator> = Arc::new(LmsAccelerator::locate(Arc::clone(&clock)));
        let accelerator = AcceleratorSlot::new(Some(lms));
        let source: Arc<dyn ModelSource> = client.clone();
        let models = Arc::new(ModelStateManager::new(
            source,
            accelerator,
            &config.models,
            clock,
        ));

        tracing::info!(
            base_url = client.base_url(),
            request_timeout_ms = client.request_timeout().as_millis() as u64,
            "execution engine ready"
        );
        Ok(Self::new(config, client, models, Arc::new(StdioConnector)))
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn models(&self) -> &ModelStateManager {
        &self.models
    }

    // ─── Discovery ───────────────────────────────────────────────────────

    /// Every enabled tool server. Never fails: a missing or unreadable
    /// config yields an empty list and a warning.
    pub fn list_available_servers(&self, explicit_override: Option<&Path>) -> Vec<ServerDescriptor> {
        servers_from(&ServerSearch::from_environment(explicit_override))
    }

    // ─── Execution ───────────────────────────────────────────────────────

    /// Run `request` to a terminal state.
    ///
    /// Failures before the first backend call (config, discovery, connect,
    /// model) are returned as `Err`. Failures inside the loop end the run
    /// with `TerminalReason::Error` and the partial transcript.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, EngineError> {
        enter(EngineState::Init);
        let plan = self.plan(&request)?;

        enter(EngineState::Discover);
        let search = ServerSearch::from_environment(request.servers_config.as_deref());
        let descriptors = discover(&search, &request.server_names)?;

        enter(EngineState::Connect);
        let policy = if descriptors.len() == 1 {
            ConnectPolicy::FailFast
        } else {
            ConnectPolicy::Degraded
        };
        let mut sessions =
            SessionManager::open(&descriptors, policy, self.connector.as_ref()).await?;
        sessions.set_call_timeout(Duration::from_secs(self.config.engine.tool_timeout_secs));
        tracing::info!(
            servers = sessions.session_count(),
            tools = sessions.catalog().len(),
            "tool servers connected"
        );

        let result = self.run_connected(&request, &plan, &sessions).await;
        sessions.close_all().await;
        result
    }

    /// [`execute`](Self::execute) under a wall-clock ceiling. On expiry the
    /// run is dropped, which kills every tool-server process it started.
    pub async fn execute_with_deadline(
        &self,
        request: ExecutionRequest,
        ceiling: Duration,
    ) -> Result<ExecutionResult, EngineError> {
        match tokio::time::timeout(ceiling, self.execute(request)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(ceiling_ms = ceiling.as_millis() as u64, "execution deadline exceeded");
                Err(EngineError::DeadlineExceeded {
                    ceiling_ms: ceiling.as_millis() as u64,
                })
            }
        }
    }

    fn plan(&self, request: &ExecutionRequest) -> Result<RunPlan, EngineError> {
        if request.task.trim().is_empty() {
            return Err(EngineError::InvalidRequest {
                reason: "task is empty".into(),
            });
        }
        let engine = &self.config.engine;
        let max_rounds = request.max_rounds.unwrap_or(engine.max_rounds);
        if max_rounds == 0 {
            return Err(EngineError::InvalidRequest {
                reason: "max_rounds must be at least 1".into(),
            });
        }
        Ok(RunPlan {
            mode: request.mode.unwrap_or(engine.mode),
            max_rounds,
            max_tokens: request.max_tokens.unwrap_or(engine.max_tokens),
        })
    }

    async fn run_connected(
        &self,
        request: &ExecutionRequest,
        plan: &RunPlan,
        sessions: &SessionManager,
    ) -> Result<ExecutionResult, EngineError> {
        enter(EngineState::ValidateModel);
        let model = self.resolve_model(request.model.as_deref()).await?;
        self.models.validate(&model).await?;
        self.models.ensure_available(&model).await?;

        let dialect = self.dialects.dialect_for(plan.mode);
        let tool_schemas = to_dialect(sessions.catalog(), dialect);
        let settings = CallSettings {
            model: &model,
            max_tokens: plan.max_tokens,
            tool_schemas: &tool_schemas,
            resend_tools_each_round: self.config.engine.resend_tools_each_round,
        };
        tracing::info!(
            model = %model,
            mode = ?plan.mode,
            dialect = ?dialect,
            max_rounds = plan.max_rounds,
            "starting execution"
        );

        let mut state = ConversationState::new(
            plan.mode,
            self.config.engine.system_prompt.as_deref(),
            &request.task,
        );
        let mut run = RunLog::new(model.clone());

        loop {
            if run.rounds >= plan.max_rounds {
                tracing::warn!(rounds = run.rounds, "round ceiling reached");
                return Ok(run.finish(TerminalReason::MaxRounds, None));
            }

            enter(EngineState::CallBackend);
            run.rounds += 1;
            let round = run.rounds;
            let response = match self.call_backend(&state, &settings).await {
                Ok(response) => response,
                Err(e) => return Ok(run.fail(e.into())),
            };
            if plan.mode == ConversationMode::Stateful && response.continuation_token.is_none() {
                let broken = GatewayError::Decode {
                    reason: format!("stateful response in round {round} carried no continuation token"),
                };
                return Ok(run.fail(broken.into()));
            }
            tracing::info!(
                round,
                text_len = response.text.as_deref().map_or(0, str::len),
                tool_calls = response.tool_calls.len(),
                history = state.history_len(),
                "backend turn"
            );
            if response.text.is_some() {
                run.last_text = response.text.clone();
            }

            // Tool calls win over any text sent alongside them.
            if response.tool_calls.is_empty() {
                if let Some(text) = response.text.clone().filter(|t| !t.trim().is_empty()) {
                    return Ok(run.finish(TerminalReason::Completed, Some(text)));
                }

                run.empty_streak += 1;
                run.transcript.push(TranscriptEntry::EmptyResponse { round });
                tracing::warn!(
                    round,
                    empty_count = run.empty_streak,
                    max_empty = MAX_EMPTY_RESPONSES,
                    "backend returned neither text nor tool calls"
                );
                if run.empty_streak >= MAX_EMPTY_RESPONSES {
                    return Ok(run.fail(EngineError::EmptyResponses {
                        count: run.empty_streak,
                    }));
                }
                state.nudge(&response, EMPTY_RESPONSE_NUDGE);
                continue;
            }
            run.empty_streak = 0;

            enter(EngineState::ExecuteTools);
            let calls: Vec<ToolCallRequest> = response
                .tool_calls
                .iter()
                .map(|raw| ToolCallRequest {
                    call_id: raw.call_id.clone(),
                    tool_name: raw.name.clone(),
                    arguments_payload: raw.arguments_payload.clone(),
                    parsed_arguments: recover_arguments(
                        &raw.call_id,
                        &raw.name,
                        &raw.arguments_payload,
                    ),
                })
                .collect();
            run.transcript.push(TranscriptEntry::Assistant {
                round,
                text: response.text.clone(),
                tool_calls: calls.clone(),
            });
            state.record_assistant_turn(&response, &calls);

            let outcomes = match self.execute_tools(sessions, &calls, round).await {
                Ok(outcomes) => outcomes,
                Err(e) => return Ok(run.fail(e.into())),
            };
            state.record_tool_results(&outcomes);
            run.transcript.extend(
                outcomes
                    .into_iter()
                    .map(|outcome| TranscriptEntry::ToolResult { round, outcome }),
            );
        }
    }

    /// Request → config default → first available → first listed.
    async fn resolve_model(&self, requested: Option<&str>) -> Result<String, EngineError> {
        if let Some(model) = requested.or(self.config.engine.default_model.as_deref()) {
            return Ok(model.to_string());
        }
        let models = self.models.list_models(false).await?;
        let chosen = models
            .iter()
            .find(|m| m.is_available())
            .or_else(|| models.first())
            .map(|m| m.id.clone())
            .ok_or(ModelError::NoModels)?;
        tracing::info!(model = %chosen, "no model requested, picked one from the backend");
        Ok(chosen)
    }

    async fn call_backend(
        &self,
        state: &ConversationState,
        settings: &CallSettings<'_>,
    ) -> Result<BackendResponse, GatewayError> {
        match state.next_call(settings) {
            BackendCall::Stateless(request) => self.backend.complete_stateless(&request).await,
            BackendCall::Stateful(request) => self.backend.complete_stateful(&request).await,
        }
    }

    /// Dispatch one round's calls, at most `tool_concurrency` at a time.
    /// Results come back in call order.
    async fn execute_tools(
        &self,
        sessions: &SessionManager,
        calls: &[ToolCallRequest],
        round: u32,
    ) -> Result<Vec<ToolCallOutcome>, McpError> {
        let started = Instant::now();
        let concurrency = self.config.engine.tool_concurrency.max(1);
        let outcomes: Vec<ToolCallOutcome> = stream::iter(calls.iter().map(|call| {
            sessions.dispatch(
                &call.call_id,
                &call.tool_name,
                Value::Object(call.parsed_arguments.clone()),
            )
        }))
        .buffered(concurrency)
        .try_collect()
        .await?;

        tracing::info!(
            round,
            calls = outcomes.len(),
            failed = outcomes.iter().filter(|o| o.is_error).count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "tool round complete"
        );
        Ok(outcomes)
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn enter(state: EngineState) {
    tracing::debug!(state = state.name(), "engine state");
}

fn servers_from(search: &ServerSearch) -> Vec<ServerDescriptor> {
    match search.resolve() {
        Ok(servers) => servers,
        Err(e) => {
            tracing::warn!(error = %e, "no tool servers available");
            Vec::new()
        }
    }
}

/// Resolve the config and pick the requested servers; none requested
/// means every enabled one.
fn discover(search: &ServerSearch, names: &[String]) -> Result<Vec<ServerDescriptor>, McpError> {
    let available = search.resolve()?;
    if names.is_empty() {
        return Ok(available);
    }
    select_servers(&available, names)
}

/// Accumulates the observable record of one run.
struct RunLog {
    model: String,
    rounds: u32,
    empty_streak: u32,
    last_text: Option<String>,
    transcript: Vec<TranscriptEntry>,
}

impl RunLog {
    fn new(model: String) -> Self {
        Self {
            model,
            rounds: 0,
            empty_streak: 0,
            last_text: None,
            transcript: Vec::new(),
        }
    }

    fn finish(&mut self, reason: TerminalReason, final_text: Option<String>) -> ExecutionResult {
        enter(EngineState::Terminal(reason));
        tracing::info!(rounds = self.rounds, reason = ?reason, "execution finished");
        ExecutionResult {
            final_text: final_text.or_else(|| self.last_text.take()),
            rounds_used: self.rounds,
            terminal_reason: reason,
            error: None,
            model: self.model.clone(),
            transcript: std::mem::take(&mut self.transcript),
        }
    }

    fn fail(&mut self, error: EngineError) -> ExecutionResult {
        tracing::error!(
            rounds = self.rounds,
            component = error.component(),
            error = %error,
            "execution failed"
        );
        let mut result = self.finish(TerminalReason::Error, None);
        result.error = Some(error.to_structured());
        result
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
