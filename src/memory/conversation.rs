//! 短期记忆：对话历史
//!
//! 保留最近 N 轮对话（user/assistant 对），超出时自动剪枝；每轮开始时取一份只读快照交给工作流。
//! 同时记录连续追问城市的次数（clarification streak），供 City Resolver 判断是否已达上限。

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 短期记忆：最近 N 轮对话（每轮含 user + assistant，故实际保留约 max_turns*2 条消息）
#[derive(Clone, Debug)]
pub struct ConversationMemory {
    messages: Vec<Message>,
    max_turns: usize,
    clarification_streak: u32,
}

impl ConversationMemory {
    pub fn new(max_turns: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_turns,
            clarification_streak: 0,
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
        self.prune();
    }

    /// 记录一轮结束：用户输入 + 助手回复；is_clarification 为 true 时累加追问次数，否则清零
    pub fn record_turn(
        &mut self,
        utterance: impl Into<String>,
        reply: impl Into<String>,
        is_clarification: bool,
    ) {
        self.push(Message::user(utterance));
        self.push(Message::assistant(reply));
        if is_clarification {
            self.clarification_streak += 1;
        } else {
            self.clarification_streak = 0;
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// 只读快照：本轮工作流独占一份，不受后续写入影响
    pub fn snapshot(&self) -> Arc<[Message]> {
        Arc::from(self.messages.as_slice())
    }

    pub fn clarification_streak(&self) -> u32 {
        self.clarification_streak
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.clarification_streak = 0;
    }

    /// 超出 max_turns*2 时丢弃最旧的消息，保留最近部分
    fn prune(&mut self) {
        if self.messages.len() > self.max_turns * 2 {
            let keep = self.max_turns * 2;
            self.messages.drain(..self.messages.len() - keep);
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
