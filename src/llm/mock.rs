//! Mock LLM 客户端（无需 API）
//!
//! - MockLlmClient：离线演示用。规划请求时按已知城市名生成 Plan JSON，生成请求时把工具数据拼成回答，
//!   评审请求直接返回 OK。
//! - ScriptedLlmClient：测试用。按顺序返回预置的回复，并记录每次收到的消息。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::llm::LlmClient;
use crate::memory::{Message, Role};

const KNOWN_CITIES: &[&str] = &[
    "Tokyo", "Osaka", "Kyoto", "Nagoya", "Fukuoka", "Sapporo", "Paris", "London", "New York",
    "Sydney", "Seoul", "Shanghai", "Beijing", "Los Angeles", "Berlin", "Rome", "Madrid",
    "Singapore",
];

/// 日文 / 中文城市名 -> 英文名（工具按英文名查询）
const CITY_ALIASES: &[(&str, &str)] = &[
    ("東京", "Tokyo"),
    ("东京", "Tokyo"),
    ("大阪", "Osaka"),
    ("京都", "Kyoto"),
    ("名古屋", "Nagoya"),
    ("福岡", "Fukuoka"),
    ("札幌", "Sapporo"),
    ("パリ", "Paris"),
    ("ロンドン", "London"),
    ("ソウル", "Seoul"),
    ("上海", "Shanghai"),
    ("北京", "Beijing"),
];

const WEATHER_WORDS: &[&str] = &["weather", "天気", "天气"];
const TIME_WORDS: &[&str] = &["time", "時間", "時刻", "何時", "时间"];
const CITY_INTENT_WORDS: &[&str] = &["city", "weather", "time", "trip", "travel", "visit", "天気", "都市", "旅行"];

fn find_city(lower: &str) -> Option<&'static str> {
    KNOWN_CITIES
        .iter()
        .find(|c| lower.contains(&c.to_lowercase()))
        .copied()
        .or_else(|| {
            CITY_ALIASES
                .iter()
                .find(|(alias, _)| lower.contains(alias))
                .map(|(_, city)| *city)
        })
}

/// 离线 Mock：根据 system prompt 判断是规划、生成还是评审请求
#[derive(Debug, Default)]
pub struct MockLlmClient;

impl MockLlmClient {
    fn plan(&self, messages: &[Message]) -> String {
        let last_user = last_user(messages).unwrap_or_default();
        let lower = last_user.to_lowercase();
        let city = find_city(&lower);

        let mut tools = Vec::new();
        if WEATHER_WORDS.iter().any(|w| lower.contains(w)) {
            tools.push("weather");
        }
        if TIME_WORDS.iter().any(|w| lower.contains(w)) {
            tools.push("time");
        }
        if tools.is_empty() {
            tools = vec!["weather", "time", "city_facts"];
        }

        let plan = match city {
            Some(city) => serde_json::json!({
                "target_city": city,
                "needs_city_info": true,
                "city_confirmed": true,
                "tools_to_use": tools,
                "rationale": format!("The user asks about {city}."),
            }),
            None if CITY_INTENT_WORDS.iter().any(|k| lower.contains(k)) =>
            {
                serde_json::json!({
                    "target_city": null,
                    "needs_city_info": true,
                    "city_confirmed": false,
                    "tools_to_use": [],
                    "rationale": "The user wants city information but did not name a city.",
                })
            }
            None => serde_json::json!({
                "target_city": null,
                "needs_city_info": false,
                "city_confirmed": false,
                "tools_to_use": [],
                "rationale": "General conversation.",
            }),
        };
        plan.to_string()
    }

    fn compose(&self, messages: &[Message]) -> String {
        let request: Value = last_user(messages)
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(Value::Null);

        let mut parts = Vec::new();
        match request.get("city").and_then(|c| c.as_str()) {
            Some(city) => parts.push(format!("Here is what I found about {city}.")),
            None => parts.push("I can help with weather, local time and facts about cities.".to_string()),
        }
        if let Some(results) = request.get("results").and_then(|r| r.as_array()) {
            for r in results {
                let topic = r.get("topic").and_then(|t| t.as_str()).unwrap_or("result");
                let data = r.get("data").map(|d| d.to_string()).unwrap_or_default();
                parts.push(format!("The {topic}: {data}."));
            }
        }
        if let Some(missing) = request.get("unavailable").and_then(|r| r.as_array()) {
            for m in missing {
                let topic = m.get("topic").and_then(|t| t.as_str()).unwrap_or("some");
                parts.push(format!("Sorry, {topic} information is unavailable right now."));
            }
        }
        parts.join(" ")
    }
}

fn last_user(messages: &[Message]) -> Option<String> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.clone())
}

fn system_prompt(messages: &[Message]) -> &str {
    messages
        .iter()
        .find(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .unwrap_or("")
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let system = system_prompt(messages);
        if system.contains("tools_to_use") {
            Ok(self.plan(messages))
        } else if system.contains("respond with exactly: OK") {
            Ok("OK".to_string())
        } else {
            Ok(self.compose(messages))
        }
    }
}

/// 脚本化客户端：按顺序弹出预置回复；耗尽后返回 Err
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    replies: Mutex<VecDeque<Result<String, String>>>,
    calls: Mutex<Vec<Vec<Message>>>,
    delay: Option<Duration>,
}

impl ScriptedLlmClient {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_results(replies.into_iter().map(|r| Ok(r.into())))
    }

    pub fn from_results<I>(replies: I) -> Self
    where
        I: IntoIterator<Item = Result<String, String>>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// 每次回复前等待（用于截止时间测试）
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// 第 n 次调用收到的消息
    pub fn call(&self, n: usize) -> Option<Vec<Message>> {
        self.calls.lock().ok().and_then(|c| c.get(n).cloned())
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(messages.to_vec());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = match self.replies.lock() {
            Ok(mut queue) => queue.pop_front(),
            Err(e) => return Err(e.to_string()),
        };
        next.unwrap_or_else(|| Err("script exhausted".to_string()))
    }
}
