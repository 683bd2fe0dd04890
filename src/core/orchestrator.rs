//! 单轮编排器：驱动 Planner → City Resolver → Tool Orchestrator → Composer → Validator
//!
//! 每个节点返回一个 NodeEvent，阶段跳转统一经过 `Phase::next`。
//! 截止时间在每个节点之前检查，LLM 调用用 `timeout_at` 约束；工具编排节点不被打断。
//! 取消只在节点边界生效：已发出的工具调用会跑完，结果被丢弃。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::TurnLimits;
use crate::core::state::{route_after_validation, NodeEvent, Phase, ValidationRoute, WorkflowState};
use crate::core::{AgentError, RecoveryAction, RecoveryEngine, ValidationVerdict};
use crate::memory::Message;
use crate::nodes::{
    fallback_answer, node, CityDecision, CityResolver, Clarification, Composer, Critic, Emitter,
    EventSink, EventType, Gatherer, Planner, ProgressEvent,
};
use crate::tools::{ToolId, ToolParams};

/// 一轮的输入
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub conversation_id: String,
    /// 本轮之前的对话历史（只读快照）
    pub history: Arc<[Message]>,
    pub utterance: String,
    /// 本轮之前已连续追问城市的次数
    pub clarification_streak: u32,
}

impl TurnRequest {
    pub fn new(
        conversation_id: impl Into<String>,
        history: Arc<[Message]>,
        utterance: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            history,
            utterance: utterance.into(),
            clarification_streak: 0,
        }
    }

    pub fn with_clarification_streak(mut self, streak: u32) -> Self {
        self.clarification_streak = streak;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionCall {
    pub tool: ToolId,
    pub parameters: ToolParams,
    /// 成功时为 payload，失败时为 `{"error": ...}`
    pub result: Value,
}

/// 对外的轮结果：thinking 为序列化的 Plan
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnResult {
    pub thinking: String,
    pub function_calls: Vec<FunctionCall>,
    pub response: String,
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub state: WorkflowState,
    pub result: TurnResult,
    /// 本轮以追问城市结束
    pub clarification: Option<Clarification>,
    /// 截止时间到，回答为尽力而为
    pub interrupted: bool,
}

impl TurnOutcome {
    pub fn is_clarification(&self) -> bool {
        self.clarification.is_some()
    }
}

/// 单轮引擎；无状态，可被多个会话共享
pub struct TurnEngine {
    planner: Planner,
    resolver: CityResolver,
    gatherer: Gatherer,
    composer: Composer,
    critic: Critic,
    recovery: RecoveryEngine,
    max_validation_loops: u32,
    turn_deadline: Duration,
}

fn node_for(phase: Phase) -> &'static str {
    match phase {
        Phase::Planning => node::PLANNER,
        Phase::ConfirmingCity => node::CITY_RESOLVER,
        Phase::GatheringInfo => node::TOOL_ORCHESTRATOR,
        Phase::Composing => node::COMPOSER,
        Phase::Validating => node::VALIDATOR,
        _ => node::WORKFLOW,
    }
}

fn advance(state: &mut WorkflowState, event: &NodeEvent) -> Result<(), AgentError> {
    let next = state.phase.next(event).ok_or_else(|| {
        AgentError::InvalidTransition(format!("{:?} --{:?}-->", state.phase, event))
    })?;
    tracing::debug!(from = ?state.phase, to = ?next, "Phase transition");
    state.phase = next;
    Ok(())
}

fn build_result(state: &WorkflowState, response: String) -> TurnResult {
    TurnResult {
        thinking: state
            .plan
            .as_ref()
            .and_then(|p| serde_json::to_string(p).ok())
            .unwrap_or_default(),
        function_calls: state
            .invocations
            .iter()
            .map(|inv| FunctionCall {
                tool: inv.tool_id,
                parameters: inv.parameters.clone(),
                result: match (&inv.payload, &inv.error) {
                    (Some(payload), _) => payload.clone(),
                    (None, Some(err)) => serde_json::json!({ "error": err }),
                    (None, None) => Value::Null,
                },
            })
            .collect(),
        response,
    }
}

impl TurnEngine {
    pub fn new(
        planner: Planner,
        resolver: CityResolver,
        gatherer: Gatherer,
        composer: Composer,
        critic: Critic,
        recovery: RecoveryEngine,
        limits: &TurnLimits,
    ) -> Self {
        Self {
            planner,
            resolver,
            gatherer,
            composer,
            critic,
            recovery,
            max_validation_loops: limits.max_validation_loops,
            turn_deadline: limits.turn_deadline,
        }
    }

    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    /// 跑完一轮。只有生成失败、取消与非法跳转返回 Err；其余失败都被吸收进回答。
    pub async fn run_turn(
        &self,
        request: TurnRequest,
        sink: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        let emitter = Emitter::new(sink, cancel.clone());
        let deadline = Instant::now() + self.turn_deadline;
        let streak = request.clarification_streak;
        let mut state = WorkflowState::new(request.conversation_id, request.history, request.utterance);
        let mut clarification = None;

        tracing::info!(conversation_id = %state.conversation_id, "Turn started");
        emitter.emit(
            ProgressEvent::new(EventType::ProcessingStart, node::WORKFLOW).with_message("Processing request"),
        );

        while !state.phase.is_terminal() {
            if cancel.is_cancelled() {
                tracing::info!(conversation_id = %state.conversation_id, phase = ?state.phase, "Turn cancelled");
                advance(&mut state, &NodeEvent::Fatal)?;
                return Err(AgentError::Cancelled);
            }
            if Instant::now() >= deadline {
                return self.interrupt(state, &emitter);
            }

            let phase = state.phase;
            let step = match phase {
                Phase::Planning => self.plan_node(&mut state, &emitter, deadline).await,
                Phase::ConfirmingCity => Ok(self.city_node(&mut state, &emitter, streak, &mut clarification)),
                Phase::GatheringInfo => self.gather_node(&mut state, &emitter).await,
                Phase::Composing => self.compose_node(&mut state, &emitter, deadline).await,
                Phase::Validating => self.validate_node(&mut state, &emitter, deadline).await,
                Phase::Terminal | Phase::AwaitingUser | Phase::Failed => break,
            };

            let event = match step {
                Ok(event) => event,
                Err(err) => match self.recovery.on_turn_error(&err) {
                    RecoveryAction::Finalize => return self.interrupt(state, &emitter),
                    _ => return self.fail(state, &emitter, phase, err),
                },
            };
            if let Err(err) = advance(&mut state, &event) {
                return self.fail(state, &emitter, phase, err);
            }
        }

        let response = match &clarification {
            Some(c) => c.question.clone(),
            None => state.draft_response.clone().unwrap_or_default(),
        };
        let result = build_result(&state, response);
        if clarification.is_none() {
            emitter.emit(
                ProgressEvent::new(EventType::FinalResponse, node::WORKFLOW).with_message(result.response.clone()),
            );
        }
        emitter.emit(completed_event(&result));
        tracing::info!(
            conversation_id = %state.conversation_id,
            phase = ?state.phase,
            tools = state.invocations.len(),
            validation_loops = state.validation_loop_count,
            llm_tokens = self.composer.token_usage().2,
            "Turn finished"
        );

        Ok(TurnOutcome {
            state,
            result,
            clarification,
            interrupted: false,
        })
    }

    async fn plan_node(
        &self,
        state: &mut WorkflowState,
        emitter: &Emitter,
        deadline: Instant,
    ) -> Result<NodeEvent, AgentError> {
        emitter.start(node::PLANNER);
        let outcome = timeout_at(deadline, self.planner.plan(&state.history, &state.utterance))
            .await
            .map_err(|_| AgentError::TurnDeadlineExceeded)?;

        if let Some(err) = &outcome.last_error {
            tracing::warn!(error = %err, attempts = outcome.attempts, "Planner fell back to default plan");
        }
        let data = serde_json::to_value(&outcome.plan).ok();
        let message = match &outcome.plan.target_city {
            Some(city) => format!("Planned {} tool(s) for {}", outcome.plan.tools_to_use.len(), city),
            None => format!("Planned {} tool(s)", outcome.plan.tools_to_use.len()),
        };
        tracing::info!(
            city = ?outcome.plan.target_city,
            confirmed = outcome.plan.city_confirmed,
            tools = outcome.plan.tools_to_use.len(),
            "Plan ready"
        );
        state.plan = Some(outcome.plan);
        emitter.complete(node::PLANNER, message, data);
        Ok(NodeEvent::Planned)
    }

    fn city_node(
        &self,
        state: &mut WorkflowState,
        emitter: &Emitter,
        streak: u32,
        clarification: &mut Option<Clarification>,
    ) -> NodeEvent {
        emitter.start(node::CITY_RESOLVER);
        let decision = match &state.plan {
            Some(plan) => self.resolver.resolve(plan, streak),
            None => CityDecision::Proceed(None),
        };
        match decision {
            CityDecision::Proceed(city) => {
                let message = match &city {
                    Some(c) => format!("City confirmed: {}", c),
                    None => "No city information needed".to_string(),
                };
                emitter.complete(node::CITY_RESOLVER, message, None);
                NodeEvent::CityConfirmed
            }
            CityDecision::Clarify(c) => {
                tracing::info!(city_loop_count = c.city_loop_count, retriable = c.retriable, "Asking for city");
                state.city_loop_count = c.city_loop_count;
                emitter.complete(
                    node::CITY_RESOLVER,
                    c.question.clone(),
                    serde_json::to_value(&c).ok(),
                );
                *clarification = Some(c);
                NodeEvent::CityUnresolved
            }
        }
    }

    async fn gather_node(&self, state: &mut WorkflowState, emitter: &Emitter) -> Result<NodeEvent, AgentError> {
        emitter.start(node::TOOL_ORCHESTRATOR);
        let plan = state
            .plan
            .as_ref()
            .ok_or_else(|| AgentError::InvalidTransition("gathering without a plan".to_string()))?;
        let invocations = self.gatherer.gather(plan, &state.invocations).await;
        state.invocations = invocations;

        let ok = state.invocations.iter().filter(|i| i.is_success()).count();
        for inv in state.invocations.iter().filter(|i| i.is_failed()) {
            tracing::warn!(
                tool = %inv.tool_id,
                attempts = inv.attempts,
                error = inv.error.as_deref().unwrap_or_default(),
                "Tool unavailable, degrading answer"
            );
        }
        emitter.complete(
            node::TOOL_ORCHESTRATOR,
            format!("{}/{} tool(s) succeeded", ok, state.invocations.len()),
            serde_json::to_value(&state.invocations).ok(),
        );
        Ok(NodeEvent::Gathered)
    }

    async fn compose_node(
        &self,
        state: &mut WorkflowState,
        emitter: &Emitter,
        deadline: Instant,
    ) -> Result<NodeEvent, AgentError> {
        emitter.start(node::COMPOSER);
        let plan = state
            .plan
            .as_ref()
            .ok_or_else(|| AgentError::InvalidTransition("composing without a plan".to_string()))?;
        let draft = timeout_at(
            deadline,
            self.composer.compose(
                &state.history,
                &state.utterance,
                plan,
                &state.invocations,
                state.feedback.as_deref(),
            ),
        )
        .await
        .map_err(|_| AgentError::TurnDeadlineExceeded)??;

        emitter.complete(
            node::COMPOSER,
            "Draft ready",
            Some(serde_json::json!({ "draft": draft })),
        );
        state.draft_response = Some(draft);
        Ok(NodeEvent::Composed)
    }

    async fn validate_node(
        &self,
        state: &mut WorkflowState,
        emitter: &Emitter,
        deadline: Instant,
    ) -> Result<NodeEvent, AgentError> {
        emitter.start(node::VALIDATOR);
        let (Some(plan), Some(draft)) = (state.plan.as_ref(), state.draft_response.as_deref()) else {
            return Err(AgentError::InvalidTransition("validating without a draft".to_string()));
        };
        let review = timeout_at(
            deadline,
            self.critic.review(&state.utterance, draft, plan, &state.invocations),
        )
        .await
        .map_err(|_| AgentError::TurnDeadlineExceeded)?;

        state.validation_verdict = review.verdict;
        let route = route_after_validation(
            review.verdict,
            state.validation_loop_count,
            self.max_validation_loops,
            state.has_retryable_failures(),
        );

        match route {
            ValidationRoute::Finalize if review.verdict == ValidationVerdict::Incomplete => {
                let err = AgentError::ValidationBoundExceeded(state.validation_loop_count);
                tracing::warn!(error = %err, missing = ?review.missing, "Finalizing best draft");
            }
            ValidationRoute::Finalize => {}
            ValidationRoute::Regather | ValidationRoute::Recompose => {
                state.validation_loop_count += 1;
                if let Some(plan) = state.plan.as_mut() {
                    plan.iteration += 1;
                }
                state.feedback = review.note.clone();
                tracing::info!(loop_count = state.validation_loop_count, ?route, "Draft incomplete, looping back");
            }
        }

        let message = match route {
            ValidationRoute::Finalize => format!("Verdict: {:?}", review.verdict).to_lowercase(),
            ValidationRoute::Regather => "Incomplete, retrying failed tools".to_string(),
            ValidationRoute::Recompose => "Incomplete, recomposing".to_string(),
        };
        emitter.complete(
            node::VALIDATOR,
            message,
            Some(serde_json::json!({
                "verdict": review.verdict,
                "missing": review.missing,
                "validation_loop_count": state.validation_loop_count,
            })),
        );
        Ok(NodeEvent::Validated(route))
    }

    /// 截止时间到：发 error，再以已有草稿或确定性摘要收尾
    fn interrupt(&self, mut state: WorkflowState, emitter: &Emitter) -> Result<TurnOutcome, AgentError> {
        let err = AgentError::TurnDeadlineExceeded;
        tracing::warn!(conversation_id = %state.conversation_id, phase = ?state.phase, "{}", err);
        emitter.error(node_for(state.phase), err.to_string());

        let response = state
            .draft_response
            .clone()
            .unwrap_or_else(|| fallback_answer(state.plan.as_ref(), &state.invocations));
        state.draft_response = Some(response.clone());
        advance(&mut state, &NodeEvent::Interrupted)?;

        let result = build_result(&state, response);
        emitter.emit(ProgressEvent::new(EventType::FinalResponse, node::WORKFLOW).with_message(result.response.clone()));
        emitter.emit(completed_event(&result));
        Ok(TurnOutcome {
            state,
            result,
            clarification: None,
            interrupted: true,
        })
    }

    fn fail(
        &self,
        state: WorkflowState,
        emitter: &Emitter,
        phase: Phase,
        err: AgentError,
    ) -> Result<TurnOutcome, AgentError> {
        tracing::error!(conversation_id = %state.conversation_id, ?phase, error = %err, "Turn failed");
        emitter.error(node_for(phase), err.to_string());
        Err(err)
    }
}

fn completed_event(result: &TurnResult) -> ProgressEvent {
    let event = ProgressEvent::new(EventType::Completed, node::WORKFLOW);
    match serde_json::to_value(result) {
        Ok(data) => event.with_data(data),
        Err(_) => event,
    }
}
