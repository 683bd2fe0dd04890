//! 会话监管：同一会话单飞、按会话取消
//!
//! 每个会话一把 tokio Mutex，同一会话的轮次串行，不同会话并行。
//! 每轮开始时换一个新的 CancellationToken，cancel(conversation_id) 只影响正在运行的那一轮。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct SessionSlot {
    turn_lock: Arc<AsyncMutex<()>>,
    /// 当前轮的取消令牌
    cancel: Mutex<Option<CancellationToken>>,
}

/// 持有期间独占该会话；drop 时释放
#[derive(Debug)]
pub struct TurnPermit {
    cancel: CancellationToken,
    slot: Arc<SessionSlot>,
    _guard: OwnedMutexGuard<()>,
}

impl TurnPermit {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for TurnPermit {
    fn drop(&mut self) {
        let mut current = self.slot.cancel.lock().unwrap_or_else(|e| e.into_inner());
        *current = None;
    }
}

/// 会话级生命周期管理
#[derive(Debug, Default)]
pub struct SessionSupervisor {
    sessions: Mutex<HashMap<String, Arc<SessionSlot>>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, conversation_id: &str) -> Arc<SessionSlot> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        // 清理空闲会话（只剩表内引用）
        sessions.retain(|id, slot| id == conversation_id || Arc::strong_count(slot) > 1);
        sessions
            .entry(conversation_id.to_string())
            .or_default()
            .clone()
    }

    /// 等待该会话上一轮结束后开始新一轮
    pub async fn begin_turn(&self, conversation_id: &str) -> TurnPermit {
        let slot = self.slot(conversation_id);
        let guard = slot.turn_lock.clone().lock_owned().await;
        let cancel = CancellationToken::new();
        *slot.cancel.lock().unwrap_or_else(|e| e.into_inner()) = Some(cancel.clone());
        TurnPermit {
            cancel,
            slot,
            _guard: guard,
        }
    }

    /// 取消该会话正在运行的一轮；没有运行中的轮返回 false
    pub fn cancel(&self, conversation_id: &str) -> bool {
        let slot = {
            let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.get(conversation_id).cloned()
        };
        let Some(slot) = slot else {
            return false;
        };
        let current = slot.cancel.lock().unwrap_or_else(|e| e.into_inner());
        match current.as_ref() {
            Some(token) => {
                tracing::info!(conversation_id, "Cancelling turn");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_busy(&self, conversation_id: &str) -> bool {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .get(conversation_id)
            .is_some_and(|slot| slot.turn_lock.try_lock().is_err())
    }

    /// 表内会话数（含等待中的）
    pub fn tracked_sessions(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }
}
