//! 错误类型与恢复动作
//!
//! AgentError 是单轮工作流的错误分类；ToolError 是工具层错误（区分可重试与不可重试）。
//! 与 RecoveryEngine 配合：根据错误决定 RetryWithPrompt / RetryAfter / MarkFailed / FallbackPlan / Abort。

use std::time::Duration;

use thiserror::Error;

/// 单轮工作流中可能出现的错误
///
/// 只有 Composition / Cancelled / InvalidTransition 会终止本轮；其余都在节点内被吸收并降级。
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    /// Planner 输出不合法或 LLM 不可达（重试后回退到保守 Plan，不致命）
    #[error("Planning error: {0}")]
    Planning(String),

    /// 工具调用失败（超时 / 上游错误 / 参数错误），在本地吸收并降级最终回答
    #[error("Tool invocation failed: {0}")]
    ToolInvocation(#[from] ToolError),

    /// 生成回答的 LLM 不可达：本轮唯一对外暴露的致命错误
    #[error("Composition error: {0}")]
    Composition(String),

    /// 校验循环达到上限，强制以当前最佳草稿收尾
    #[error("Validation loop bound exceeded after {0} loops")]
    ValidationBoundExceeded(u32),

    #[error("Turn deadline exceeded")]
    TurnDeadlineExceeded,

    #[error("Turn cancelled")]
    Cancelled,

    #[error("Invalid phase transition: {0}")]
    InvalidTransition(String),
}

/// 工具层错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    /// 单次调用超过超时 T；Display 固定为 "timeout"，直接写入 ToolInvocation.error
    #[error("timeout")]
    Timeout,

    /// 上游 5xx、连接失败等，可重试
    #[error("upstream error: {0}")]
    Upstream(String),

    /// 参数缺失或非法，重试无意义
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// 城市 / 时区查不到，重试无意义
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),
}

impl ToolError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ToolError::Timeout | ToolError::Upstream(_))
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 将纠正提示注入下一次调用，让 LLM 重试（如 JSON 结构错误）
    RetryWithPrompt(String),
    /// 等待后重试同一工具
    RetryAfter(Duration),
    /// 放弃该工具，记录失败原因继续其他工具
    MarkFailed(String),
    /// 放弃规划，使用保守 Plan（询问用户城市）
    FallbackPlan,
    /// 以当前最佳内容收尾
    Finalize,
    /// 终止当前轮
    Abort,
}
