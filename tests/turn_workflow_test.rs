//! 单轮工作流集成测试：脚本化 LLM + 内存替身工具

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use citywise::config::AppConfig;
use citywise::core::{
    AgentError, EngineBuilder, Phase, ToolError, TurnEngine, TurnRequest, ValidationVerdict,
};
use citywise::llm::{LlmClient, MockLlmClient, ScriptedLlmClient};
use citywise::memory::{ConversationMemory, Message};
use citywise::nodes::{fallback_answer, CollectingSink, EventType};
use citywise::tools::{InvocationStatus, Tool, ToolId, ToolParams, ToolRegistry};
use citywise::ConversationService;

enum Behavior {
    Ok(Value),
    /// 前 n 次返回错误，之后成功
    FailTimes(u32, ToolError, Value),
    Hang,
    /// 睡眠后成功
    Slow(Duration, Value),
    /// 调用时取消本轮
    CancelTurn(CancellationToken, Value),
}

struct FakeTool {
    id: ToolId,
    behavior: Behavior,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Tool for FakeTool {
    fn id(&self) -> ToolId {
        self.id
    }

    fn description(&self) -> &str {
        "test double"
    }

    async fn invoke(&self, _params: &ToolParams) -> Result<Value, ToolError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Ok(v) => Ok(v.clone()),
            Behavior::FailTimes(k, err, v) => {
                if n < *k {
                    Err(err.clone())
                } else {
                    Ok(v.clone())
                }
            }
            Behavior::Hang => std::future::pending().await,
            Behavior::Slow(d, v) => {
                tokio::time::sleep(*d).await;
                Ok(v.clone())
            }
            Behavior::CancelTurn(token, v) => {
                token.cancel();
                Ok(v.clone())
            }
        }
    }
}

fn weather_payload() -> Value {
    json!({"city": "Paris", "temperature": 18.5, "description": "light rain", "humidity": 70})
}

fn time_payload() -> Value {
    json!({"timezone": "Europe/Paris", "formatted_time": "2024-05-01 14:05", "utc_offset": "+02:00"})
}

fn facts_payload() -> Value {
    json!({"title": "Paris", "extract": "Paris is the capital and most populous city of France."})
}

fn default_payload(id: ToolId) -> Value {
    match id {
        ToolId::Weather => weather_payload(),
        ToolId::Time => time_payload(),
        ToolId::CityFacts => facts_payload(),
    }
}

/// 注册三个工具；overrides 中的工具使用指定行为，其余直接成功
struct Tools {
    registry: ToolRegistry,
    calls: Vec<(ToolId, Arc<AtomicU32>)>,
}

impl Tools {
    fn new(overrides: Vec<(ToolId, Behavior)>) -> Self {
        let mut overrides = overrides;
        let mut registry = ToolRegistry::new();
        let mut calls = Vec::new();
        for id in ToolId::ALL {
            let behavior = match overrides.iter().position(|(t, _)| *t == id) {
                Some(i) => overrides.remove(i).1,
                None => Behavior::Ok(default_payload(id)),
            };
            let counter = Arc::new(AtomicU32::new(0));
            calls.push((id, counter.clone()));
            registry.register(FakeTool {
                id,
                behavior,
                calls: counter,
            });
        }
        Self { registry, calls }
    }

    fn calls(&self, id: ToolId) -> u32 {
        self.calls
            .iter()
            .find(|(t, _)| *t == id)
            .map(|(_, c)| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn total_calls(&self) -> u32 {
        ToolId::ALL.iter().map(|id| self.calls(*id)).sum()
    }
}

fn test_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.tools.tool_timeout_ms = 100;
    cfg.tools.backoff_base_ms = 10;
    cfg.tools.backoff_max_ms = 40;
    cfg
}

fn engine(cfg: AppConfig, llm: Arc<dyn LlmClient>, tools: &Tools) -> TurnEngine {
    EngineBuilder::new(cfg)
        .with_llm(llm)
        .with_registry(tools.registry.clone())
        .with_prompt_files(false)
        .build()
}

fn request(utterance: &str) -> TurnRequest {
    TurnRequest::new("conv-1", Arc::from(Vec::<Message>::new()), utterance)
}

fn plan_json(city: Option<&str>, confirmed: bool, tools: &[&str]) -> String {
    json!({
        "target_city": city,
        "needs_city_info": true,
        "city_confirmed": confirmed,
        "tools_to_use": tools,
        "rationale": "test"
    })
    .to_string()
}

fn node_pair(node: &str) -> [(EventType, String); 2] {
    [
        (EventType::ProcessingStart, node.to_string()),
        (EventType::NodeComplete, node.to_string()),
    ]
}

#[tokio::test(start_paused = true)]
async fn test_scenario_trip_to_paris() {
    let tools = Tools::new(vec![]);
    let engine = engine(test_config(), Arc::new(MockLlmClient), &tools);
    let sink = Arc::new(CollectingSink::new());

    let outcome = engine
        .run_turn(request("I'm planning a trip to Paris"), sink.clone(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.state.phase, Phase::Terminal);
    assert_eq!(outcome.state.validation_verdict, ValidationVerdict::Complete);
    assert_eq!(outcome.state.invocations.len(), 3);
    assert!(outcome.state.invocations.iter().all(|i| i.is_success()));
    assert_eq!(tools.total_calls(), 3);

    let response = outcome.result.response.to_lowercase();
    assert!(response.contains("weather"));
    assert!(response.contains("time"));
    assert!(response.contains("facts"));
    assert_eq!(outcome.result.function_calls.len(), 3);
    let thinking: Value = serde_json::from_str(&outcome.result.thinking).unwrap();
    assert_eq!(thinking["target_city"], "Paris");

    let mut expected = vec![(EventType::ProcessingStart, "workflow".to_string())];
    for node in ["planner", "city_resolver", "tool_orchestrator", "composer", "validator"] {
        expected.extend(node_pair(node));
    }
    expected.push((EventType::FinalResponse, "workflow".to_string()));
    expected.push((EventType::Completed, "workflow".to_string()));
    assert_eq!(sink.trace(), expected);

    let completed = sink.events().pop().unwrap();
    assert_eq!(completed.status, "completed");
    assert_eq!(completed.data.unwrap()["response"], outcome.result.response);
}

#[tokio::test(start_paused = true)]
async fn test_scenario_ambiguous_city_asks_once() {
    let tools = Tools::new(vec![]);
    let engine = engine(test_config(), Arc::new(MockLlmClient), &tools);
    let sink = Arc::new(CollectingSink::new());

    let outcome = engine
        .run_turn(request("tell me about a city"), sink.clone(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.state.phase, Phase::AwaitingUser);
    assert_eq!(tools.total_calls(), 0);
    assert!(outcome.state.invocations.is_empty());
    let clarification = outcome.clarification.unwrap();
    assert_eq!(clarification.question.matches('?').count(), 1);
    assert_eq!(outcome.state.city_loop_count, 1);
    assert_eq!(outcome.result.response, clarification.question);

    let trace = sink.trace();
    assert!(!trace.iter().any(|(t, _)| *t == EventType::FinalResponse));
    assert!(!trace.iter().any(|(_, n)| n == "tool_orchestrator"));
    assert_eq!(trace.last().unwrap().0, EventType::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_scenario_weather_timeout_degrades_answer() {
    let tools = Tools::new(vec![(ToolId::Weather, Behavior::Hang)]);
    let engine = engine(test_config(), Arc::new(MockLlmClient), &tools);
    let sink = Arc::new(CollectingSink::new());

    let outcome = engine
        .run_turn(request("What's the weather and time in Tokyo?"), sink.clone(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.state.phase, Phase::Terminal);
    let weather = outcome
        .state
        .invocations
        .iter()
        .find(|i| i.tool_id == ToolId::Weather)
        .unwrap();
    assert_eq!(weather.status, InvocationStatus::Failed);
    assert_eq!(weather.error.as_deref(), Some("timeout"));
    assert_eq!(weather.attempts, 3);
    assert_eq!(tools.calls(ToolId::Weather), 3);
    assert!(outcome
        .result
        .response
        .contains("Note: weather information is currently unavailable (timeout)."));

    // 工具编排节点一次性带出全部记录
    let batch = sink
        .events()
        .into_iter()
        .find(|e| e.event_type == EventType::NodeComplete && e.node_name == "tool_orchestrator")
        .and_then(|e| e.data)
        .unwrap();
    let records = batch.as_array().unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().any(|r| r["status"] == "failed" && r["error"] == "timeout"));
    assert_eq!(sink.trace().last().unwrap().0, EventType::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_recover_within_attempts() {
    let tools = Tools::new(vec![(
        ToolId::Weather,
        Behavior::FailTimes(2, ToolError::Upstream("HTTP 502".into()), weather_payload()),
    )]);
    let engine = engine(test_config(), Arc::new(MockLlmClient), &tools);

    let outcome = engine
        .run_turn(request("weather in Paris"), Arc::new(CollectingSink::new()), CancellationToken::new())
        .await
        .unwrap();

    let weather = &outcome.state.invocations[0];
    assert_eq!(weather.tool_id, ToolId::Weather);
    assert_eq!(weather.status, InvocationStatus::Success);
    assert_eq!(weather.attempts, 3);
    assert!(!outcome.result.response.contains("unavailable"));
}

#[tokio::test(start_paused = true)]
async fn test_validation_loop_is_bounded() {
    let tools = Tools::new(vec![]);
    let llm = Arc::new(ScriptedLlmClient::new([
        plan_json(Some("Paris"), true, &["weather"]),
        "Paris is lovely.".to_string(),
        "Paris is lovely.".to_string(),
        "Paris is lovely.".to_string(),
        "never used".to_string(),
    ]));
    let engine = engine(test_config(), llm.clone(), &tools);
    let sink = Arc::new(CollectingSink::new());

    let outcome = engine
        .run_turn(request("weather in Paris"), sink.clone(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.state.phase, Phase::Terminal);
    assert_eq!(outcome.state.validation_loop_count, 2);
    assert_eq!(outcome.state.validation_verdict, ValidationVerdict::Incomplete);
    assert_eq!(outcome.state.plan.as_ref().unwrap().iteration, 2);
    assert_eq!(outcome.result.response, "Paris is lovely.");
    // 规划 1 次 + 生成 3 次；工具只调用一次（成功记录被保留）
    assert_eq!(llm.call_count(), 4);
    assert_eq!(tools.calls(ToolId::Weather), 1);

    let retry = llm.call(2).unwrap();
    let req: Value = serde_json::from_str(&retry.last().unwrap().content).unwrap();
    assert!(req["feedback"].as_str().unwrap().contains("weather"));

    let validations = sink
        .trace()
        .into_iter()
        .filter(|(t, n)| *t == EventType::NodeComplete && n == "validator")
        .count();
    assert_eq!(validations, 3);
}

#[tokio::test(start_paused = true)]
async fn test_retryable_failure_loops_back_to_tools() {
    let tools = Tools::new(vec![(
        ToolId::Weather,
        Behavior::FailTimes(3, ToolError::Upstream("HTTP 503".into()), weather_payload()),
    )]);
    let llm = Arc::new(ScriptedLlmClient::new([
        plan_json(Some("Paris"), true, &["weather", "time"]),
        "Enjoy Paris!".to_string(),
        "It is 14:05 in Paris and the weather is light rain.".to_string(),
    ]));
    let engine = engine(test_config(), llm, &tools);
    let sink = Arc::new(CollectingSink::new());

    let outcome = engine
        .run_turn(request("weather and time in Paris"), sink.clone(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.state.validation_loop_count, 1);
    assert_eq!(outcome.state.validation_verdict, ValidationVerdict::Complete);
    assert!(outcome.state.invocations.iter().all(|i| i.is_success()));
    assert_eq!(outcome.state.invocations.len(), 2);
    assert_eq!(tools.calls(ToolId::Weather), 4);
    assert_eq!(tools.calls(ToolId::Time), 1);

    let gathers = sink
        .trace()
        .into_iter()
        .filter(|(t, n)| *t == EventType::NodeComplete && n == "tool_orchestrator")
        .count();
    assert_eq!(gathers, 2);
}

#[tokio::test(start_paused = true)]
async fn test_composition_failure_is_fatal() {
    let tools = Tools::new(vec![]);
    let llm = Arc::new(ScriptedLlmClient::from_results([
        Ok(plan_json(Some("Paris"), true, &["time"])),
        Err("service unavailable".to_string()),
    ]));
    let engine = engine(test_config(), llm, &tools);
    let sink = Arc::new(CollectingSink::new());

    let err = engine
        .run_turn(request("time in Paris"), sink.clone(), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, AgentError::Composition(_)));
    let trace = sink.trace();
    assert_eq!(trace.last().unwrap(), &(EventType::Error, "composer".to_string()));
    assert!(!trace.iter().any(|(t, _)| *t == EventType::Completed || *t == EventType::FinalResponse));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_plans_fall_back_to_clarification() {
    let tools = Tools::new(vec![]);
    let llm = Arc::new(ScriptedLlmClient::new([
        "I think you want Paris",
        r#"{"target_city": "Paris"}"#,
        r#"{"target_city": "Paris", "needs_city_info": true, "city_confirmed": true, "tools_to_use": ["stocks"]}"#,
    ]));
    let engine = engine(test_config(), llm.clone(), &tools);

    let outcome = engine
        .run_turn(request("Paris?"), Arc::new(CollectingSink::new()), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(llm.call_count(), 3);
    assert_eq!(outcome.state.phase, Phase::AwaitingUser);
    assert!(outcome.clarification.is_some());
    assert_eq!(tools.total_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_turn_deadline_finalizes_best_effort() {
    let mut cfg = test_config();
    cfg.tools.tool_timeout_ms = 10_000;
    cfg.workflow.turn_deadline_secs = 1;
    let tools = Tools::new(vec![(
        ToolId::Time,
        Behavior::Slow(Duration::from_secs(2), time_payload()),
    )]);
    let engine = engine(cfg, Arc::new(MockLlmClient), &tools);
    let sink = Arc::new(CollectingSink::new());

    let outcome = engine
        .run_turn(request("what time is it in Paris"), sink.clone(), CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.interrupted);
    assert_eq!(outcome.state.phase, Phase::Terminal);
    // 工具编排不被打断，结果进入兜底回答
    assert!(outcome.state.invocations[0].is_success());
    assert!(outcome
        .result
        .response
        .starts_with("Here is what I could gather about Paris:"));

    let trace = sink.trace();
    let tail: Vec<_> = trace[trace.len() - 3..].to_vec();
    assert_eq!(
        tail,
        vec![
            (EventType::Error, "composer".to_string()),
            (EventType::FinalResponse, "workflow".to_string()),
            (EventType::Completed, "workflow".to_string()),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_deadline_inside_composer_call_uses_fallback() {
    let mut cfg = test_config();
    cfg.workflow.turn_deadline_secs = 1;
    let tools = Tools::new(vec![]);
    let llm = Arc::new(
        ScriptedLlmClient::new([
            plan_json(Some("Paris"), true, &["weather", "time"]),
            "It is 14:05 in Paris and the weather is light rain.".to_string(),
        ])
        .with_delay(Duration::from_millis(600)),
    );
    let engine = engine(cfg, llm.clone(), &tools);
    let sink = Arc::new(CollectingSink::new());

    let outcome = engine
        .run_turn(request("weather and time in Paris"), sink.clone(), CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.interrupted);
    assert_eq!(outcome.state.phase, Phase::Terminal);
    assert_eq!(llm.call_count(), 2);
    assert!(outcome.state.invocations.iter().all(|i| i.is_success()));
    assert_eq!(
        outcome.result.response,
        fallback_answer(outcome.state.plan.as_ref(), &outcome.state.invocations)
    );

    let trace = sink.trace();
    assert!(!trace.iter().any(|(t, n)| *t == EventType::NodeComplete && n == "composer"));
    assert_eq!(
        trace[trace.len() - 3..].to_vec(),
        vec![
            (EventType::Error, "composer".to_string()),
            (EventType::FinalResponse, "workflow".to_string()),
            (EventType::Completed, "workflow".to_string()),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_disclaimer_does_not_count_as_topic_coverage() {
    let tools = Tools::new(vec![(ToolId::Weather, Behavior::Hang)]);
    let llm = Arc::new(ScriptedLlmClient::new([
        plan_json(Some("Paris"), true, &["weather", "time"]),
        "Paris is lovely.".to_string(),
        "Paris is lovely, and it is 14:05 there.".to_string(),
    ]));
    let engine = engine(test_config(), llm.clone(), &tools);
    let sink = Arc::new(CollectingSink::new());

    let outcome = engine
        .run_turn(request("weather and time in Paris"), sink.clone(), CancellationToken::new())
        .await
        .unwrap();

    // 第一稿只有 "(timeout)" 免责声明提到 time，不算覆盖本地时间
    assert_eq!(outcome.state.validation_loop_count, 1);
    assert_eq!(outcome.state.validation_verdict, ValidationVerdict::Complete);
    assert_eq!(llm.call_count(), 3);
    assert_eq!(tools.calls(ToolId::Time), 1);
    assert_eq!(tools.calls(ToolId::Weather), 6);
    assert!(outcome.result.response.starts_with("Paris is lovely, and it is 14:05 there."));
    assert!(outcome
        .result
        .response
        .contains("Note: weather information is currently unavailable (timeout)."));
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_stops_at_node_boundary() {
    let cancel = CancellationToken::new();
    let tools = Tools::new(vec![(ToolId::Weather, Behavior::CancelTurn(cancel.clone(), weather_payload()))]);
    let engine = engine(test_config(), Arc::new(MockLlmClient), &tools);
    let sink = Arc::new(CollectingSink::new());

    let err = engine
        .run_turn(request("weather in Paris"), sink.clone(), cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, AgentError::Cancelled));
    assert_eq!(tools.calls(ToolId::Weather), 1);
    assert_eq!(
        sink.trace().last().unwrap(),
        &(EventType::ProcessingStart, "tool_orchestrator".to_string())
    );
}

/// 统计同时在途的 LLM 调用数
struct ConcurrencyGauge {
    inflight: AtomicUsize,
    max_seen: AtomicUsize,
}

#[async_trait]
impl LlmClient for ConcurrencyGauge {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let now = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.inflight.fetch_sub(1, Ordering::SeqCst);
        MockLlmClient.complete(messages).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_single_flight_per_conversation() {
    let gauge = Arc::new(ConcurrencyGauge {
        inflight: AtomicUsize::new(0),
        max_seen: AtomicUsize::new(0),
    });
    let tools = Tools::new(vec![]);
    let service = ConversationService::new(engine(test_config(), gauge.clone(), &tools));
    let sink = Arc::new(CollectingSink::new());

    let (a, b) = tokio::join!(
        service.run_turn(request("weather in Paris"), sink.clone()),
        service.run_turn(request("weather in Tokyo"), sink.clone()),
    );
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(gauge.max_seen.load(Ordering::SeqCst), 1);

    let other = TurnRequest::new("conv-2", Arc::from(Vec::<Message>::new()), "weather in Rome");
    let (a, b) = tokio::join!(
        service.run_turn(request("weather in Paris"), sink.clone()),
        service.run_turn(other, sink.clone()),
    );
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(gauge.max_seen.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_clarification_streak_across_turns() {
    let tools = Tools::new(vec![]);
    let service = ConversationService::new(engine(test_config(), Arc::new(MockLlmClient), &tools));
    let sink = Arc::new(CollectingSink::new());
    let mut memory = ConversationMemory::new(20);

    for expected in [1, 2, 2] {
        let outcome = service
            .submit("conv-1", &mut memory, "tell me about a city", sink.clone())
            .await
            .unwrap();
        assert_eq!(outcome.state.city_loop_count, expected);
    }
    assert_eq!(memory.clarification_streak(), 3);

    let outcome = service
        .submit("conv-1", &mut memory, "tell me about a city", sink.clone())
        .await
        .unwrap();
    assert!(!outcome.clarification.unwrap().retriable);

    let outcome = service
        .submit("conv-1", &mut memory, "Paris", sink.clone())
        .await
        .unwrap();
    assert_eq!(outcome.state.phase, Phase::Terminal);
    assert_eq!(memory.clarification_streak(), 0);
    assert_eq!(memory.len(), 10);
    assert_eq!(tools.total_calls(), 3);
}
