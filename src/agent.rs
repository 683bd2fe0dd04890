//! 无头对话服务
//!
//! 供 CLI（或 HTTP / SSE 等前端）调用：同一会话单飞执行 TurnEngine，按会话 id 取消，
//! 并可选择把本轮写回调用方持有的 ConversationMemory。

use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::{AgentError, EngineBuilder, SessionSupervisor, TurnEngine, TurnOutcome, TurnRequest};
use crate::memory::ConversationMemory;
use crate::nodes::EventSink;

pub struct ConversationService {
    engine: Arc<TurnEngine>,
    supervisor: SessionSupervisor,
}

impl ConversationService {
    pub fn new(engine: TurnEngine) -> Self {
        Self {
            engine: Arc::new(engine),
            supervisor: SessionSupervisor::new(),
        }
    }

    /// 按配置构建（LLM、工具均来自配置）
    pub fn from_config(cfg: AppConfig) -> Self {
        Self::new(EngineBuilder::new(cfg).build())
    }

    pub fn engine(&self) -> &TurnEngine {
        &self.engine
    }

    /// 跑一轮；同一会话的上一轮结束前会等待
    pub async fn run_turn(
        &self,
        request: TurnRequest,
        sink: Arc<dyn EventSink>,
    ) -> Result<TurnOutcome, AgentError> {
        let permit = self.supervisor.begin_turn(&request.conversation_id).await;
        self.engine.run_turn(request, sink, permit.cancel_token()).await
    }

    /// 基于会话记忆跑一轮，并把结果写回记忆（失败的轮不写入）
    pub async fn submit(
        &self,
        conversation_id: &str,
        memory: &mut ConversationMemory,
        utterance: &str,
        sink: Arc<dyn EventSink>,
    ) -> Result<TurnOutcome, AgentError> {
        let request = TurnRequest::new(conversation_id, memory.snapshot(), utterance)
            .with_clarification_streak(memory.clarification_streak());
        let outcome = self.run_turn(request, sink).await?;
        memory.record_turn(utterance, outcome.result.response.clone(), outcome.is_clarification());
        Ok(outcome)
    }

    /// 取消该会话正在运行的一轮
    pub fn cancel(&self, conversation_id: &str) -> bool {
        self.supervisor.cancel(conversation_id)
    }

    pub fn is_busy(&self, conversation_id: &str) -> bool {
        self.supervisor.is_busy(conversation_id)
    }
}
