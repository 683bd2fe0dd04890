//! 单轮工作流状态：WorkflowState 聚合根、阶段枚举与纯函数状态转移
//!
//! 阶段之间的跳转全部经过 `Phase::next(event)`；它不做 IO，也不读时钟，只根据当前阶段与节点产出的事件决定下一阶段。
//!
//! ```text
//! Planning -> ConfirmingCity -> GatheringInfo -> Composing -> Validating -> Terminal
//!                  |                  ^              ^            |
//!                  v                  +--------------+------------+ (有界)
//!             AwaitingUser
//! ```

use std::sync::Arc;

use serde::Serialize;

use crate::memory::Message;
use crate::nodes::Plan;
use crate::tools::ToolInvocation;

/// 工作流阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    ConfirmingCity,
    GatheringInfo,
    Composing,
    Validating,
    Terminal,
    AwaitingUser,
    Failed,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Terminal | Phase::AwaitingUser | Phase::Failed)
    }

    /// 纯状态转移；非法组合返回 None
    pub fn next(self, event: &NodeEvent) -> Option<Phase> {
        use NodeEvent as E;
        use Phase as P;
        match (self, event) {
            (_, E::Fatal) if !self.is_terminal() => Some(P::Failed),
            // 截止时间到：收尾（尽力给出回答）
            (_, E::Interrupted) if !self.is_terminal() => Some(P::Terminal),
            (P::Planning, E::Planned) => Some(P::ConfirmingCity),
            (P::ConfirmingCity, E::CityConfirmed) => Some(P::GatheringInfo),
            (P::ConfirmingCity, E::CityUnresolved) => Some(P::AwaitingUser),
            (P::GatheringInfo, E::Gathered) => Some(P::Composing),
            (P::Composing, E::Composed) => Some(P::Validating),
            (P::Validating, E::Validated(route)) => Some(match route {
                ValidationRoute::Finalize => P::Terminal,
                ValidationRoute::Regather => P::GatheringInfo,
                ValidationRoute::Recompose => P::Composing,
            }),
            _ => None,
        }
    }
}

/// 节点执行完毕后产出的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Planned,
    CityConfirmed,
    CityUnresolved,
    Gathered,
    Composed,
    Validated(ValidationRoute),
    /// 截止时间到，带着已有内容收尾
    Interrupted,
    /// 致命错误（生成失败 / 取消）
    Fatal,
}

/// 校验之后的去向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationRoute {
    Finalize,
    /// 回到工具编排，只重新调用失败的工具
    Regather,
    /// 工具数据已齐，只重新生成回答
    Recompose,
}

/// 校验结论
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationVerdict {
    Pending,
    Complete,
    Incomplete,
}

/// 校验之后的路由决策（纯函数）
///
/// - complete -> 收尾
/// - incomplete 且未达上限 -> 有可重试失败时回到工具编排，否则回到生成
/// - 达到上限 -> 以当前最佳草稿收尾
pub fn route_after_validation(
    verdict: ValidationVerdict,
    validation_loop_count: u32,
    max_validation_loops: u32,
    has_retryable_failures: bool,
) -> ValidationRoute {
    match verdict {
        ValidationVerdict::Incomplete if validation_loop_count < max_validation_loops => {
            if has_retryable_failures {
                ValidationRoute::Regather
            } else {
                ValidationRoute::Recompose
            }
        }
        _ => ValidationRoute::Finalize,
    }
}

/// 单轮工作流的聚合根，只属于这一轮
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowState {
    pub conversation_id: String,
    /// 本轮开始时的历史快照（只读）
    #[serde(skip)]
    pub history: Arc<[Message]>,
    pub utterance: String,
    pub plan: Option<Plan>,
    pub invocations: Vec<ToolInvocation>,
    pub draft_response: Option<String>,
    pub validation_verdict: ValidationVerdict,
    /// 校验给出的缺失话题说明，下一次生成时作为反馈
    pub feedback: Option<String>,
    pub city_loop_count: u32,
    pub validation_loop_count: u32,
    pub phase: Phase,
}

impl WorkflowState {
    pub fn new(
        conversation_id: impl Into<String>,
        history: Arc<[Message]>,
        utterance: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            history,
            utterance: utterance.into(),
            plan: None,
            invocations: Vec::new(),
            draft_response: None,
            validation_verdict: ValidationVerdict::Pending,
            feedback: None,
            city_loop_count: 0,
            validation_loop_count: 0,
            phase: Phase::Planning,
        }
    }

    /// 是否存在可重试的失败调用
    pub fn has_retryable_failures(&self) -> bool {
        self.invocations.iter().any(|i| i.is_failed() && i.retryable)
    }
}
