//! 错误恢复引擎
//!
//! 根据 AgentError 类型与已尝试次数返回 RecoveryAction，供 Planner 与工具执行器决定是重试、退避、降级还是终止。

use std::time::Duration;

use crate::core::{AgentError, RecoveryAction, ToolError};

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    /// Planner 最多额外重试次数（不含首次）
    planner_retries: u32,
    /// 工具最大尝试次数 R（含首次）
    max_tool_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(2, 3, Duration::from_millis(250), Duration::from_secs(4))
    }
}

impl RecoveryEngine {
    pub fn new(
        planner_retries: u32,
        max_tool_attempts: u32,
        backoff_base: Duration,
        backoff_max: Duration,
    ) -> Self {
        Self {
            planner_retries,
            max_tool_attempts: max_tool_attempts.max(1),
            backoff_base,
            backoff_max,
        }
    }

    /// 第 attempt 次失败后的退避时长：base * 2^(attempt-1)，上限 backoff_max
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.backoff_max)
    }

    /// 规划阶段：attempt 为已完成的尝试次数（从 1 开始）
    pub fn on_planning_error(&self, err: &AgentError, attempt: u32) -> RecoveryAction {
        if attempt > self.planner_retries {
            return RecoveryAction::FallbackPlan;
        }
        match err {
            AgentError::Planning(raw) => RecoveryAction::RetryWithPrompt(format!(
                "Your previous reply was not a valid plan ({raw}). \
                Reply with exactly one JSON object and nothing else. \
                Required keys: \"target_city\" (string or null), \"needs_city_info\" (boolean), \
                \"city_confirmed\" (boolean), \"tools_to_use\" (array of \"weather\", \"time\", \"city_facts\"), \
                \"rationale\" (string)."
            )),
            _ => RecoveryAction::FallbackPlan,
        }
    }

    /// 工具阶段：attempt 为刚失败的尝试序号（从 1 开始）
    pub fn on_tool_error(&self, err: &ToolError, attempt: u32) -> RecoveryAction {
        if !err.is_retryable() || attempt >= self.max_tool_attempts {
            return RecoveryAction::MarkFailed(err.to_string());
        }
        RecoveryAction::RetryAfter(self.backoff(attempt))
    }

    /// 轮级错误：只有 Composition / Cancelled / InvalidTransition 终止本轮
    pub fn on_turn_error(&self, err: &AgentError) -> RecoveryAction {
        match err {
            AgentError::Composition(_) | AgentError::Cancelled | AgentError::InvalidTransition(_) => {
                RecoveryAction::Abort
            }
            AgentError::TurnDeadlineExceeded | AgentError::ValidationBoundExceeded(_) => {
                RecoveryAction::Finalize
            }
            AgentError::Planning(_) => RecoveryAction::FallbackPlan,
            AgentError::ToolInvocation(e) => RecoveryAction::MarkFailed(e.to_string()),
        }
    }
}
