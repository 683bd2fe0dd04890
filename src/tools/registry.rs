//! 工具注册表
//!
//! 所有工具实现 Tool trait（id / description / invoke），由 ToolRegistry 按 ToolId 注册与查找，
//! ToolExecutor 在调用时加超时、重试与退避，并统一产出 ToolInvocation。

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ToolError;

/// 工具参数：字符串到字符串的有序映射（序列化顺序稳定）
pub type ToolParams = BTreeMap<String, String>;

/// 已知工具标识（封闭集合）
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ToolId {
    Weather,
    Time,
    CityFacts,
}

impl ToolId {
    pub const ALL: [ToolId; 3] = [ToolId::Weather, ToolId::Time, ToolId::CityFacts];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolId::Weather => "weather",
            ToolId::Time => "time",
            ToolId::CityFacts => "city_facts",
        }
    }

    /// 面向用户的话题名（用于回答与免责声明）
    pub fn topic(&self) -> &'static str {
        match self {
            ToolId::Weather => "weather",
            ToolId::Time => "local time",
            ToolId::CityFacts => "city facts",
        }
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolId {
    type Err = ToolError;

    /// 大小写不敏感；兼容 WeatherTool / TimeTool / CityFactsTool 等别名
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm: String = s
            .trim()
            .to_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        let norm = norm.strip_suffix("tool").unwrap_or(&norm);
        match norm {
            "weather" => Ok(ToolId::Weather),
            "time" | "localtime" => Ok(ToolId::Time),
            "cityfacts" | "facts" | "cityinfo" => Ok(ToolId::CityFacts),
            _ => Err(ToolError::UnknownTool(s.to_string())),
        }
    }
}

/// 工具 trait：标识、描述（供 LLM 理解）、参数 schema、异步调用
#[async_trait]
pub trait Tool: Send + Sync {
    fn id(&self) -> ToolId;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认只要求 city
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "city": { "type": "string", "description": "City name in English, e.g. Paris" }
            },
            "required": ["city"]
        })
    }

    /// 调用工具；Ok 为结构化 payload
    async fn invoke(&self, params: &ToolParams) -> Result<Value, ToolError>;
}

/// 工具注册表：按 ToolId 存储 Arc<dyn Tool>
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<ToolId, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.id(), tool);
    }

    pub fn get(&self, id: ToolId) -> Option<Arc<dyn Tool>> {
        self.tools.get(&id).cloned()
    }

    pub fn contains(&self, id: ToolId) -> bool {
        self.tools.contains_key(&id)
    }

    /// 已注册工具，按 ToolId 排序
    pub fn tool_ids(&self) -> Vec<ToolId> {
        let mut ids: Vec<ToolId> = self.tools.keys().copied().collect();
        ids.sort();
        ids
    }

    /// 动态生成工具说明 JSON，拼入 Planner 的 system prompt
    pub fn to_schema_json(&self) -> String {
        let tools: Vec<Value> = self
            .tool_ids()
            .into_iter()
            .filter_map(|id| self.tools.get(&id))
            .map(|tool| {
                serde_json::json!({
                    "name": tool.id().as_str(),
                    "description": tool.description(),
                    "parameters": tool.parameters_schema()
                })
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}
