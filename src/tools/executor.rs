//! 工具执行器
//!
//! 持有 ToolRegistry、单次调用超时 T、恢复引擎与进程级工具池。invoke(tool_id, params) 在超时内调用工具，
//! 超时或可重试错误按退避重试，最多 R 次；最终总是返回一条终态的 ToolInvocation，从不向上抛错。
//! 每次尝试输出一行结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::timeout;

use crate::core::{RecoveryAction, RecoveryEngine, TaskScheduler, ToolError};
use crate::tools::{ToolId, ToolParams, ToolRegistry};

/// 调用状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Pending,
    Success,
    Failed,
}

/// 一次工具调用（含重试）的记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool_id: ToolId,
    pub parameters: ToolParams,
    pub status: InvocationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    /// 最后一次失败是否可重试（决定校验循环是否回到工具编排）
    #[serde(default)]
    pub retryable: bool,
}

impl ToolInvocation {
    pub fn pending(tool_id: ToolId, parameters: ToolParams) -> Self {
        Self {
            tool_id,
            parameters,
            status: InvocationStatus::Pending,
            payload: None,
            error: None,
            attempts: 0,
            retryable: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != InvocationStatus::Pending
    }

    pub fn is_success(&self) -> bool {
        self.status == InvocationStatus::Success
    }

    pub fn is_failed(&self) -> bool {
        self.status == InvocationStatus::Failed
    }

    fn succeed(&mut self, payload: Value) {
        self.status = InvocationStatus::Success;
        self.payload = Some(payload);
        self.error = None;
        self.retryable = false;
    }

    fn fail(&mut self, err: &ToolError) {
        self.status = InvocationStatus::Failed;
        self.payload = None;
        self.error = Some(err.to_string());
        self.retryable = err.is_retryable();
    }
}

/// 工具执行器：对每次调用施加超时、重试与退避
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
    recovery: RecoveryEngine,
    pool: Arc<TaskScheduler>,
}

impl ToolExecutor {
    pub fn new(
        registry: ToolRegistry,
        timeout: Duration,
        recovery: RecoveryEngine,
        pool: Arc<TaskScheduler>,
    ) -> Self {
        Self {
            registry,
            timeout,
            recovery,
            pool,
        }
    }

    /// 调用指定工具直到成功或耗尽尝试次数；返回终态记录
    pub async fn invoke(&self, tool_id: ToolId, parameters: ToolParams) -> ToolInvocation {
        let mut invocation = ToolInvocation::pending(tool_id, parameters);

        let Some(tool) = self.registry.get(tool_id) else {
            invocation.fail(&ToolError::UnknownTool(tool_id.to_string()));
            tracing::warn!(tool = %tool_id, "Tool not registered");
            return invocation;
        };

        loop {
            invocation.attempts += 1;
            let attempt = invocation.attempts;

            let started = Instant::now();
            let result = match self.pool.acquire_tool().await {
                Ok(_permit) => timeout(self.timeout, tool.invoke(&invocation.parameters))
                    .await
                    .unwrap_or(Err(ToolError::Timeout)),
                Err(_) => Err(ToolError::Upstream("tool pool closed".to_string())),
            };

            audit(tool_id, attempt, started.elapsed(), &invocation.parameters, &result);

            let err = match result {
                Ok(payload) => {
                    invocation.succeed(payload);
                    return invocation;
                }
                Err(e) => e,
            };

            match self.recovery.on_tool_error(&err, attempt) {
                RecoveryAction::RetryAfter(delay) => {
                    tracing::debug!(tool = %tool_id, attempt, ?delay, "Retrying tool");
                    tokio::time::sleep(delay).await;
                }
                _ => {
                    invocation.fail(&err);
                    tracing::warn!(tool = %tool_id, attempts = attempt, error = %err, "Tool failed");
                    return invocation;
                }
            }
        }
    }
}

fn audit(
    tool_id: ToolId,
    attempt: u32,
    elapsed: Duration,
    params: &ToolParams,
    result: &Result<Value, ToolError>,
) {
    let (ok, outcome) = match result {
        Ok(_) => (true, "ok".to_string()),
        Err(e) => (false, e.to_string()),
    };
    let audit = serde_json::json!({
        "event": "tool_audit",
        "tool": tool_id.as_str(),
        "attempt": attempt,
        "ok": ok,
        "outcome": outcome,
        "duration_ms": elapsed.as_millis() as u64,
        "args_preview": args_preview(params),
    });
    tracing::info!(audit = %audit, "tool");
}

fn args_preview(params: &ToolParams) -> String {
    let s = serde_json::to_string(params).unwrap_or_default();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::Tool;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// 前 fail_times 次返回 err，之后成功
    struct Flaky {
        calls: AtomicU32,
        fail_times: u32,
        err: ToolError,
    }

    #[async_trait]
    impl Tool for Flaky {
        fn id(&self) -> ToolId {
            ToolId::Weather
        }

        fn description(&self) -> &str {
            "flaky"
        }

        async fn invoke(&self, _params: &ToolParams) -> Result<Value, ToolError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                Err(self.err.clone())
            } else {
                Ok(serde_json::json!({"temperature": 21.0}))
            }
        }
    }

    struct Hang;

    #[async_trait]
    impl Tool for Hang {
        fn id(&self) -> ToolId {
            ToolId::Weather
        }

        fn description(&self) -> &str {
            "never returns"
        }

        async fn invoke(&self, _params: &ToolParams) -> Result<Value, ToolError> {
            std::future::pending().await
        }
    }

    fn executor(tool: Arc<dyn Tool>) -> ToolExecutor {
        let mut reg = ToolRegistry::new();
        reg.register_arc(tool);
        ToolExecutor::new(
            reg,
            Duration::from_millis(100),
            RecoveryEngine::new(2, 3, Duration::from_millis(10), Duration::from_millis(50)),
            Arc::new(TaskScheduler::new(4)),
        )
    }

    fn params() -> ToolParams {
        ToolParams::from([("city".to_string(), "Paris".to_string())])
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_then_success() {
        let exec = executor(Arc::new(Flaky {
            calls: AtomicU32::new(0),
            fail_times: 2,
            err: ToolError::Upstream("502".into()),
        }));
        let inv = exec.invoke(ToolId::Weather, params()).await;
        assert_eq!(inv.status, InvocationStatus::Success);
        assert_eq!(inv.attempts, 3);
        assert!(inv.payload.is_some());
        assert!(inv.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_exhausts_attempts() {
        let exec = executor(Arc::new(Hang));
        let inv = exec.invoke(ToolId::Weather, params()).await;
        assert_eq!(inv.status, InvocationStatus::Failed);
        assert_eq!(inv.attempts, 3);
        assert_eq!(inv.error.as_deref(), Some("timeout"));
        assert!(inv.retryable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_fails_fast() {
        let exec = executor(Arc::new(Flaky {
            calls: AtomicU32::new(0),
            fail_times: 10,
            err: ToolError::NotFound("Atlantis".into()),
        }));
        let inv = exec.invoke(ToolId::Weather, params()).await;
        assert_eq!(inv.status, InvocationStatus::Failed);
        assert_eq!(inv.attempts, 1);
        assert!(!inv.retryable);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let exec = executor(Arc::new(Hang));
        let inv = exec.invoke(ToolId::CityFacts, params()).await;
        assert!(inv.is_failed());
        assert_eq!(inv.attempts, 0);
        assert!(inv.error.unwrap().contains("unknown tool"));
    }
}
