//! Planner：意图规划
//!
//! 调用 LLM 得到 Plan JSON，严格校验字段类型与工具集合；不合法时带纠正提示重试（默认 2 次），
//! 仍失败则回退到保守 Plan（需要城市、未确认、不调用工具），让本轮降级为向用户询问城市而不是失败。

use std::collections::BTreeSet;
use std::sync::Arc;

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{AgentError, RecoveryAction, RecoveryEngine};
use crate::llm::LlmClient;
use crate::memory::{Message, Role};
use crate::tools::{ToolId, ToolRegistry};

/// 本轮的结构化意图
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Plan {
    /// 用户询问的城市（英文名），未知时为 null
    pub target_city: Option<String>,
    /// 回答是否需要城市相关信息
    pub needs_city_info: bool,
    /// 城市是否已明确（用户点名了唯一的城市）
    pub city_confirmed: bool,
    /// 需要调用的工具
    pub tools_to_use: BTreeSet<ToolId>,
    /// 简短的规划理由
    #[serde(default)]
    pub rationale: String,
    /// 校验循环回退次数
    #[serde(default)]
    #[schemars(skip)]
    pub iteration: u32,
}

impl Plan {
    /// 保守回退：需要城市、未确认、不调用工具
    pub fn fallback() -> Self {
        Self {
            target_city: None,
            needs_city_info: true,
            city_confirmed: false,
            tools_to_use: BTreeSet::new(),
            rationale: "Fallback plan: the request could not be planned reliably, ask for the city."
                .to_string(),
            iteration: 0,
        }
    }

    /// 需要向用户追问城市
    pub fn needs_clarification(&self) -> bool {
        self.needs_city_info && !self.city_confirmed
    }
}

/// 规划结果
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub plan: Plan,
    /// LLM 调用次数
    pub attempts: u32,
    pub fell_back: bool,
    pub last_error: Option<String>,
}

/// 从 LLM 文本中提取 JSON 对象（```json ... ``` 或首个 { 到最后一个 }）
pub fn extract_json(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

/// 解析并校验 Planner 输出
pub fn parse_plan(output: &str) -> Result<Plan, AgentError> {
    let json = extract_json(output)
        .ok_or_else(|| AgentError::Planning("no JSON object in reply".to_string()))?;
    let value: Value = serde_json::from_str(json)
        .map_err(|e| AgentError::Planning(format!("invalid JSON: {}", e)))?;
    validate_plan(&value)
}

/// 严格校验字段类型；工具名必须属于已知集合
pub fn validate_plan(value: &Value) -> Result<Plan, AgentError> {
    let obj = value
        .as_object()
        .ok_or_else(|| AgentError::Planning("plan must be a JSON object".to_string()))?;

    let target_city = match obj.get("target_city") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Some(other) => {
            return Err(AgentError::Planning(format!(
                "target_city must be a string or null, got {}",
                other
            )))
        }
    };

    let flag = |key: &str| -> Result<bool, AgentError> {
        obj.get(key)
            .and_then(|v| v.as_bool())
            .ok_or_else(|| AgentError::Planning(format!("{} must be a boolean", key)))
    };
    let mut needs_city_info = flag("needs_city_info")?;
    let mut city_confirmed = flag("city_confirmed")?;

    let tools_to_use = match obj.get("tools_to_use") {
        None | Some(Value::Null) => BTreeSet::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .ok_or_else(|| AgentError::Planning(format!("tool id must be a string, got {}", item)))?
                    .parse::<ToolId>()
                    .map_err(|e| AgentError::Planning(e.to_string()))
            })
            .collect::<Result<BTreeSet<_>, _>>()?,
        Some(other) => {
            return Err(AgentError::Planning(format!(
                "tools_to_use must be an array, got {}",
                other
            )))
        }
    };

    let rationale = obj
        .get("rationale")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    // 归一化：工具都需要城市；没有城市名就不算确认
    if !tools_to_use.is_empty() {
        needs_city_info = true;
    }
    if target_city.is_none() {
        city_confirmed = false;
    }

    Ok(Plan {
        target_city,
        needs_city_info,
        city_confirmed,
        tools_to_use,
        rationale,
        iteration: 0,
    })
}

/// Plan 的 JSON Schema，拼入 system prompt
pub fn plan_schema_json() -> String {
    let schema = schema_for!(Plan);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

const DEFAULT_PLANNER_PROMPT: &str = "You are the planning step of a city information assistant.\n\
Decide which information tools are needed to answer the user's latest message.\n\n\
Available tools:\n{tools}\n\n\
Reply with ONLY one JSON object matching this JSON Schema (no prose, no Markdown):\n{schema}\n\n\
Rules:\n\
- Set city_confirmed=true only when exactly one specific city has been named by the user, now or earlier in the conversation.\n\
- If the user wants city information but the city is missing or ambiguous, set needs_city_info=true, city_confirmed=false, tools_to_use=[].\n\
- For greetings or questions unrelated to a city, set needs_city_info=false and tools_to_use=[].\n\
- Use the English city name for target_city.";

/// Planner：持有 LLM、system prompt 与恢复引擎
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
    recovery: RecoveryEngine,
}

impl Planner {
    /// 使用默认 prompt 模板，{tools} 与 {schema} 由注册表与 Plan 类型填充
    pub fn new(llm: Arc<dyn LlmClient>, tools: &ToolRegistry, recovery: RecoveryEngine) -> Self {
        Self::with_template(llm, DEFAULT_PLANNER_PROMPT, tools, recovery)
    }

    pub fn with_template(
        llm: Arc<dyn LlmClient>,
        template: &str,
        tools: &ToolRegistry,
        recovery: RecoveryEngine,
    ) -> Self {
        let system_prompt = template
            .replace("{tools}", &tools.to_schema_json())
            .replace("{schema}", &plan_schema_json());
        Self {
            llm,
            system_prompt,
            recovery,
        }
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    fn build_messages(&self, history: &[Message], utterance: &str, correction: Option<&str>) -> Vec<Message> {
        let mut messages = vec![Message::system(self.system_prompt.clone())];
        messages.extend(history.iter().filter(|m| m.role != Role::System).cloned());
        messages.push(Message::user(utterance));
        if let Some(c) = correction {
            messages.push(Message::user(c));
        }
        messages
    }

    /// 规划本轮；从不失败，最坏情况返回保守 Plan
    pub async fn plan(&self, history: &[Message], utterance: &str) -> PlanOutcome {
        let mut correction: Option<String> = None;
        let mut attempts = 0;

        loop {
            attempts += 1;
            let messages = self.build_messages(history, utterance, correction.as_deref());
            let result = match self.llm.complete(&messages).await {
                Ok(raw) => parse_plan(&raw),
                Err(e) => Err(AgentError::Planning(format!("planner unreachable: {}", e))),
            };

            let err = match result {
                Ok(plan) => {
                    return PlanOutcome {
                        plan,
                        attempts,
                        fell_back: false,
                        last_error: None,
                    }
                }
                Err(e) => e,
            };
            tracing::warn!(attempt = attempts, error = %err, "Planner output rejected");

            match self.recovery.on_planning_error(&err, attempts) {
                RecoveryAction::RetryWithPrompt(prompt) => correction = Some(prompt),
                _ => {
                    tracing::warn!("Planner retries exhausted, using fallback plan");
                    return PlanOutcome {
                        plan: Plan::fallback(),
                        attempts,
                        fell_back: true,
                        last_error: Some(err.to_string()),
                    };
                }
            }
        }
    }
}
