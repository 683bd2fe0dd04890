//! Response Composer：根据工具结果生成回答
//!
//! 请求以 JSON 形式发给 LLM（问题、城市、成功结果、不可用话题、校验反馈）。
//! 生成后逐个检查失败话题是否已说明，缺失的追加固定的免责声明句。

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::core::AgentError;
use crate::llm::LlmClient;
use crate::memory::{Message, Role};
use crate::nodes::Plan;
use crate::tools::{ToolId, ToolInvocation};

const DEFAULT_COMPOSER_PROMPT: &str = "You are a friendly city information assistant.\n\
The user's message arrives as a JSON object with the fields: question, city, results (tool data per topic), \
unavailable (topics whose data could not be retrieved, with the reason) and feedback (notes from a reviewer about \
what the previous answer missed).\n\
Write a concise, natural answer in the user's language that uses every result. \
For each unavailable topic, say plainly that the information is currently unavailable. \
Never invent data that is not in results. Do not mention JSON or tools.";

#[derive(Serialize)]
struct TopicResult<'a> {
    topic: &'static str,
    tool: ToolId,
    data: &'a Value,
}

#[derive(Serialize)]
struct Unavailable<'a> {
    topic: &'static str,
    reason: &'a str,
}

#[derive(Serialize)]
struct ComposeRequest<'a> {
    question: &'a str,
    city: Option<&'a str>,
    results: Vec<TopicResult<'a>>,
    unavailable: Vec<Unavailable<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    feedback: Option<&'a str>,
}

/// 失败话题的固定免责声明
pub fn disclaimer(invocation: &ToolInvocation) -> String {
    format!(
        "Note: {} information is currently unavailable ({}).",
        invocation.tool_id.topic(),
        invocation.error.as_deref().unwrap_or("unknown error")
    )
}

/// 为每个失败调用追加免责声明（已存在则跳过）
pub fn ensure_disclaimers(draft: &str, invocations: &[ToolInvocation]) -> String {
    let mut out = draft.trim().to_string();
    for inv in invocations.iter().filter(|i| i.is_failed()) {
        let line = disclaimer(inv);
        if out.contains(&line) {
            continue;
        }
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(&line);
    }
    out
}

/// 不经 LLM 的兜底回答：成功数据摘要 + 免责声明（截止时间到时使用）
pub fn fallback_answer(plan: Option<&Plan>, invocations: &[ToolInvocation]) -> String {
    let city = plan.and_then(|p| p.target_city.as_deref());
    let mut lines = Vec::new();
    let successes: Vec<_> = invocations.iter().filter(|i| i.is_success()).collect();

    if successes.is_empty() {
        lines.push(match city {
            Some(c) => format!("Sorry, I could not finish gathering information about {} in time.", c),
            None => "Sorry, I could not finish answering in time.".to_string(),
        });
    } else {
        lines.push(match city {
            Some(c) => format!("Here is what I could gather about {}:", c),
            None => "Here is what I could gather:".to_string(),
        });
        for inv in successes {
            let data = inv.payload.as_ref().map(summarize_payload).unwrap_or_default();
            lines.push(format!("- {}: {}", inv.tool_id.topic(), data));
        }
    }
    ensure_disclaimers(&lines.join("\n"), invocations)
}

/// 扁平化 payload 的标量字段：`key: value, ...`
fn summarize_payload(payload: &Value) -> String {
    match payload {
        Value::Object(map) => map
            .iter()
            .filter(|(_, v)| !v.is_object() && !v.is_array() && !v.is_null())
            .map(|(k, v)| match v {
                Value::String(s) => format!("{}: {}", k, s),
                other => format!("{}: {}", k, other),
            })
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

pub struct Composer {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl Composer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self::with_prompt(llm, DEFAULT_COMPOSER_PROMPT)
    }

    pub fn with_prompt(llm: Arc<dyn LlmClient>, prompt: impl Into<String>) -> Self {
        Self {
            llm,
            system_prompt: prompt.into(),
        }
    }

    /// 底层 LLM 的累计 token 用量（Planner 与 Composer 共用同一客户端）
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    fn build_messages(
        &self,
        history: &[Message],
        utterance: &str,
        plan: &Plan,
        invocations: &[ToolInvocation],
        feedback: Option<&str>,
    ) -> Result<Vec<Message>, AgentError> {
        let request = ComposeRequest {
            question: utterance,
            city: plan.target_city.as_deref(),
            results: invocations
                .iter()
                .filter_map(|inv| {
                    inv.payload.as_ref().filter(|_| inv.is_success()).map(|data| TopicResult {
                        topic: inv.tool_id.topic(),
                        tool: inv.tool_id,
                        data,
                    })
                })
                .collect(),
            unavailable: invocations
                .iter()
                .filter(|inv| inv.is_failed())
                .map(|inv| Unavailable {
                    topic: inv.tool_id.topic(),
                    reason: inv.error.as_deref().unwrap_or("unknown error"),
                })
                .collect(),
            feedback,
        };
        let body = serde_json::to_string(&request)
            .map_err(|e| AgentError::Composition(format!("failed to encode request: {}", e)))?;

        let mut messages = vec![Message::system(self.system_prompt.clone())];
        messages.extend(history.iter().filter(|m| m.role != Role::System).cloned());
        messages.push(Message::user(body));
        Ok(messages)
    }

    /// 生成草稿；LLM 不可达或返回空文本为致命错误
    pub async fn compose(
        &self,
        history: &[Message],
        utterance: &str,
        plan: &Plan,
        invocations: &[ToolInvocation],
        feedback: Option<&str>,
    ) -> Result<String, AgentError> {
        let messages = self.build_messages(history, utterance, plan, invocations, feedback)?;
        let reply = self
            .llm
            .complete(&messages)
            .await
            .map_err(AgentError::Composition)?;
        if reply.trim().is_empty() {
            return Err(AgentError::Composition("empty reply".to_string()));
        }
        tracing::debug!(chars = reply.len(), "Draft composed");
        Ok(ensure_disclaimers(&reply, invocations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ToolError;
    use crate::llm::ScriptedLlmClient;
    use crate::tools::{InvocationStatus, ToolParams};

    fn ok(id: ToolId, data: Value) -> ToolInvocation {
        ToolInvocation {
            tool_id: id,
            parameters: ToolParams::new(),
            status: InvocationStatus::Success,
            payload: Some(data),
            error: None,
            attempts: 1,
            retryable: false,
        }
    }

    fn failed(id: ToolId, err: ToolError) -> ToolInvocation {
        ToolInvocation {
            tool_id: id,
            parameters: ToolParams::new(),
            status: InvocationStatus::Failed,
            payload: None,
            error: Some(err.to_string()),
            attempts: 3,
            retryable: err.is_retryable(),
        }
    }

    fn plan() -> Plan {
        Plan {
            target_city: Some("Paris".into()),
            needs_city_info: true,
            city_confirmed: true,
            tools_to_use: ToolId::ALL.into_iter().collect(),
            rationale: String::new(),
            iteration: 0,
        }
    }

    #[test]
    fn test_disclaimer_appended_once() {
        let invs = vec![failed(ToolId::Weather, ToolError::Timeout)];
        let once = ensure_disclaimers("Paris is lovely.", &invs);
        assert!(once.ends_with("Note: weather information is currently unavailable (timeout)."));
        assert_eq!(ensure_disclaimers(&once, &invs), once);
    }

    #[test]
    fn test_fallback_answer() {
        let invs = vec![
            ok(ToolId::Time, serde_json::json!({"formatted_time": "2024-05-01 14:05", "timezone": "Europe/Paris"})),
            failed(ToolId::Weather, ToolError::Timeout),
        ];
        let text = fallback_answer(Some(&plan()), &invs);
        assert!(text.starts_with("Here is what I could gather about Paris:"));
        assert!(text.contains("local time: formatted_time: 2024-05-01 14:05"));
        assert!(text.contains("weather information is currently unavailable"));
    }

    #[tokio::test]
    async fn test_request_lists_results_and_unavailable() {
        let llm = Arc::new(ScriptedLlmClient::new(["Paris is 14:05 right now."]));
        let composer = Composer::new(llm.clone());
        let invs = vec![
            ok(ToolId::Time, serde_json::json!({"formatted_time": "14:05"})),
            failed(ToolId::Weather, ToolError::Timeout),
        ];
        let draft = composer
            .compose(&[], "weather and time in Paris?", &plan(), &invs, Some("mention the time"))
            .await
            .unwrap();
        assert!(draft.contains("weather information is currently unavailable"));

        let sent = llm.call(0).unwrap();
        let req: Value = serde_json::from_str(&sent.last().unwrap().content).unwrap();
        assert_eq!(req["city"], "Paris");
        assert_eq!(req["results"][0]["topic"], "local time");
        assert_eq!(req["unavailable"][0]["reason"], "timeout");
        assert_eq!(req["feedback"], "mention the time");
    }

    #[tokio::test]
    async fn test_llm_failure_is_composition_error() {
        let llm = Arc::new(ScriptedLlmClient::from_results([Err("503".to_string())]));
        let err = Composer::new(llm)
            .compose(&[], "hi", &plan(), &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Composition(_)));
    }
}
