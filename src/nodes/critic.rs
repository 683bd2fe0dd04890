//! Critic：回答覆盖度校验
//!
//! 先做关键词启发式检查（每个成功话题被提及，每个失败话题被说明不可用）；
//! 启发式通过且配置启用时，再用一次轻量 LLM 评审（回复 OK 表示完整）。

use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::config::CriticSection;
use crate::core::ValidationVerdict;
use crate::llm::LlmClient;
use crate::memory::Message;
use crate::nodes::Plan;
use crate::tools::{ToolId, ToolInvocation};

const DEFAULT_CRITIC_PROMPT: &str = "You review answers of a city information assistant.\n\
Question: {question}\n\
Topics the answer must cover: {topics}\n\
Answer:\n{draft}\n\n\
If the answer addresses every topic (or clearly says the information is unavailable), respond with exactly: OK\n\
Otherwise reply with one short sentence describing what is missing.";

/// 表示“不可用”的措辞
const UNAVAILABLE_MARKERS: &[&str] = &[
    "unavailable",
    "not available",
    "could not",
    "couldn't",
    "unable",
    "no data",
    "failed to",
];

/// 各话题的关键词（按词边界匹配，"°" 单独处理）
fn topic_pattern(id: ToolId) -> &'static str {
    match id {
        ToolId::Weather => {
            r"°|\b(?:weather|temperatures?|degrees?|forecasts?|rain(?:y|ing)?|sunny|cloud(?:s|y)?|wind(?:y|s)?|humid(?:ity)?)\b"
        }
        ToolId::Time => r"\b(?:time|o'clock|clock|\d{1,2}:\d{2})\b",
        ToolId::CityFacts => {
            r"\b(?:facts?|population|capital|known for|located|history|famous|founded)\b"
        }
    }
}

struct Patterns {
    weather: Regex,
    time: Regex,
    city_facts: Regex,
    disclaimer: Regex,
}

fn patterns() -> Option<&'static Patterns> {
    static PATTERNS: OnceLock<Option<Patterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Some(Patterns {
                weather: Regex::new(topic_pattern(ToolId::Weather)).ok()?,
                time: Regex::new(topic_pattern(ToolId::Time)).ok()?,
                city_facts: Regex::new(topic_pattern(ToolId::CityFacts)).ok()?,
                disclaimer: Regex::new(r"note: [a-z ]+ information is currently unavailable \([^)\n]*\)\.?").ok()?,
            })
        })
        .as_ref()
}

fn mentions_topic(lower: &str, id: ToolId) -> bool {
    let Some(p) = patterns() else {
        return false;
    };
    match id {
        ToolId::Weather => p.weather.is_match(lower),
        ToolId::Time => p.time.is_match(lower),
        ToolId::CityFacts => p.city_facts.is_match(lower),
    }
}

/// 去掉追加的免责声明句，剩下的正文才算“提及”
fn strip_disclaimers(lower: &str) -> String {
    match patterns() {
        Some(p) => p.disclaimer.replace_all(lower, "").into_owned(),
        None => lower.to_string(),
    }
}

fn acknowledges_unavailable(lower: &str, id: ToolId) -> bool {
    mentions_topic(lower, id) && UNAVAILABLE_MARKERS.iter().any(|m| lower.contains(m))
}

/// 校验结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Review {
    pub verdict: ValidationVerdict,
    /// 未覆盖的话题
    pub missing: Vec<String>,
    /// 给下一次生成的反馈
    pub note: Option<String>,
}

impl Review {
    fn complete() -> Self {
        Self {
            verdict: ValidationVerdict::Complete,
            missing: Vec::new(),
            note: None,
        }
    }
}

/// 启发式覆盖检查：返回未覆盖的话题描述
pub fn coverage_gaps(draft: &str, plan: &Plan, invocations: &[ToolInvocation]) -> Vec<String> {
    let lower = draft.to_lowercase();
    let body = strip_disclaimers(&lower);
    let mut gaps = Vec::new();
    for &id in &plan.tools_to_use {
        let failed = invocations.iter().any(|i| i.tool_id == id && i.is_failed());
        if failed {
            if !acknowledges_unavailable(&lower, id) {
                gaps.push(format!("say that {} information is unavailable", id.topic()));
            }
        } else if !mentions_topic(&body, id) {
            gaps.push(format!("mention the {}", id.topic()));
        }
    }
    gaps
}

pub struct Critic {
    llm: Option<Arc<dyn LlmClient>>,
    prompt_template: String,
}

impl Critic {
    /// 只做启发式检查
    pub fn heuristic() -> Self {
        Self {
            llm: None,
            prompt_template: DEFAULT_CRITIC_PROMPT.to_string(),
        }
    }

    pub fn with_llm(llm: Arc<dyn LlmClient>, prompt_template: Option<String>) -> Self {
        Self {
            llm: Some(llm),
            prompt_template: prompt_template.unwrap_or_else(|| DEFAULT_CRITIC_PROMPT.to_string()),
        }
    }

    /// enabled=false 时不持有 LLM
    pub fn from_config(llm: Arc<dyn LlmClient>, config: &CriticSection) -> Self {
        if config.enabled {
            Self::with_llm(llm, config.prompt_template.clone())
        } else {
            Self::heuristic()
        }
    }

    pub fn uses_llm(&self) -> bool {
        self.llm.is_some()
    }

    pub async fn review(
        &self,
        utterance: &str,
        draft: &str,
        plan: &Plan,
        invocations: &[ToolInvocation],
    ) -> Review {
        let gaps = coverage_gaps(draft, plan, invocations);
        if !gaps.is_empty() {
            return Review {
                verdict: ValidationVerdict::Incomplete,
                note: Some(format!("The previous answer did not {}.", gaps.join(", nor "))),
                missing: gaps,
            };
        }

        let Some(llm) = &self.llm else {
            return Review::complete();
        };

        let topics = plan
            .tools_to_use
            .iter()
            .map(|t| t.topic())
            .collect::<Vec<_>>()
            .join(", ");
        let prompt = self
            .prompt_template
            .replace("{question}", utterance)
            .replace("{topics}", if topics.is_empty() { "none" } else { &topics })
            .replace("{draft}", draft);

        match llm.complete(&[Message::system(prompt)]).await {
            Ok(reply) => {
                let reply = reply.trim();
                if reply.eq_ignore_ascii_case("OK") {
                    Review::complete()
                } else {
                    let note = if reply.is_empty() {
                        "The reviewer could not confirm the answer covers every topic.".to_string()
                    } else {
                        reply.to_string()
                    };
                    Review {
                        verdict: ValidationVerdict::Incomplete,
                        missing: Vec::new(),
                        note: Some(note),
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Critic unavailable, accepting draft");
                Review::complete()
            }
        }
    }
}
