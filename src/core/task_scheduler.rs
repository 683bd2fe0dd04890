//! 任务调度：进程级工具池
//!
//! 所有会话的工具调用共享一个 Semaphore，限制同时在途的外部请求数；单轮内的并发度本身不超过请求的工具数。

use std::sync::Arc;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// 任务调度器
#[derive(Debug)]
pub struct TaskScheduler {
    tool_semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl TaskScheduler {
    pub fn new(max_concurrent_tools: usize) -> Self {
        let capacity = max_concurrent_tools.max(1);
        Self {
            tool_semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// 获取工具执行许可（释放许可即归还）
    pub async fn acquire_tool(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        self.tool_semaphore.clone().acquire_owned().await
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 当前空闲许可数
    pub fn available(&self) -> usize {
        self.tool_semaphore.available_permits()
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(16)
    }
}
