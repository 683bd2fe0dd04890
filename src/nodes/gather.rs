//! Tool Orchestrator：并发扇出工具调用并汇总
//!
//! 每个 tools_to_use 条目对应一条 ToolInvocation；所有 future 在返回前 join 完毕，不留后台任务。
//! 校验回退时只重新调用失败的工具，成功的记录原样保留。

use std::sync::Arc;

use futures_util::future::join_all;

use crate::nodes::Plan;
use crate::tools::{ToolExecutor, ToolId, ToolInvocation, ToolParams};

pub struct Gatherer {
    executor: Arc<ToolExecutor>,
}

impl Gatherer {
    pub fn new(executor: Arc<ToolExecutor>) -> Self {
        Self { executor }
    }

    fn params_for(plan: &Plan) -> ToolParams {
        let mut params = ToolParams::new();
        if let Some(city) = &plan.target_city {
            params.insert("city".to_string(), city.clone());
        }
        params
    }

    /// 返回与 tools_to_use 同序、一一对应的终态记录
    pub async fn gather(&self, plan: &Plan, previous: &[ToolInvocation]) -> Vec<ToolInvocation> {
        let params = Self::params_for(plan);

        let kept: Vec<(ToolId, Option<ToolInvocation>)> = plan
            .tools_to_use
            .iter()
            .map(|&id| {
                let done = previous
                    .iter()
                    .find(|inv| inv.tool_id == id && inv.is_success())
                    .cloned();
                (id, done)
            })
            .collect();

        let pending: Vec<ToolId> = kept
            .iter()
            .filter(|(_, done)| done.is_none())
            .map(|(id, _)| *id)
            .collect();
        tracing::info!(
            dispatch = pending.len(),
            kept = kept.len() - pending.len(),
            "Gathering city information"
        );

        let fresh = join_all(
            pending
                .iter()
                .map(|&id| self.executor.invoke(id, params.clone())),
        )
        .await;
        let mut fresh = fresh.into_iter();

        kept.into_iter()
            .filter_map(|(_, done)| done.or_else(|| fresh.next()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{RecoveryEngine, TaskScheduler, ToolError};
    use crate::tools::{InvocationStatus, Tool, ToolRegistry};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Counting {
        id: ToolId,
        calls: Arc<AtomicU32>,
        fail: bool,
    }

    #[async_trait]
    impl Tool for Counting {
        fn id(&self) -> ToolId {
            self.id
        }

        fn description(&self) -> &str {
            "counting double"
        }

        async fn invoke(&self, params: &ToolParams) -> Result<Value, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ToolError::InvalidParameters("bad".into()));
            }
            Ok(serde_json::json!({ "city": params.get("city") }))
        }
    }

    fn gatherer(failing: ToolId) -> (Gatherer, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let mut reg = ToolRegistry::new();
        for id in ToolId::ALL {
            reg.register(Counting {
                id,
                calls: calls.clone(),
                fail: id == failing,
            });
        }
        let exec = ToolExecutor::new(
            reg,
            Duration::from_secs(1),
            RecoveryEngine::default(),
            Arc::new(TaskScheduler::new(4)),
        );
        (Gatherer::new(Arc::new(exec)), calls)
    }

    fn paris(tools: &[ToolId]) -> Plan {
        Plan {
            target_city: Some("Paris".into()),
            needs_city_info: true,
            city_confirmed: true,
            tools_to_use: tools.iter().copied().collect(),
            rationale: String::new(),
            iteration: 0,
        }
    }

    #[tokio::test]
    async fn test_one_record_per_tool_in_order() {
        let (g, calls) = gatherer(ToolId::Time);
        let plan = paris(&ToolId::ALL);
        let out = g.gather(&plan, &[]).await;
        assert_eq!(out.len(), 3);
        assert_eq!(
            out.iter().map(|i| i.tool_id).collect::<Vec<_>>(),
            plan.tools_to_use.iter().copied().collect::<Vec<_>>()
        );
        assert!(out.iter().all(|i| i.is_terminal()));
        assert_eq!(out[0].parameters.get("city").map(String::as_str), Some("Paris"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_regather_only_failed() {
        let (g, calls) = gatherer(ToolId::Time);
        let plan = paris(&ToolId::ALL);
        let first = g.gather(&plan, &[]).await;
        let second = g.gather(&plan, &first).await;
        assert_eq!(second.len(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let time = second.iter().find(|i| i.tool_id == ToolId::Time).unwrap();
        assert_eq!(time.status, InvocationStatus::Failed);
    }

    #[tokio::test]
    async fn test_empty_plan_dispatches_nothing() {
        let (g, calls) = gatherer(ToolId::Time);
        assert!(g.gather(&paris(&[]), &[]).await.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
