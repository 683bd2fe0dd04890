//! 核心编排层：错误与恢复、工作流状态、会话监管、工具池、单轮引擎与构建器

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod session_supervisor;
pub mod state;
pub mod task_scheduler;

pub use builder::EngineBuilder;
pub use error::{AgentError, RecoveryAction, ToolError};
pub use orchestrator::{FunctionCall, TurnEngine, TurnOutcome, TurnRequest, TurnResult};
pub use recovery::RecoveryEngine;
pub use session_supervisor::{SessionSupervisor, TurnPermit};
pub use state::{
    route_after_validation, NodeEvent, Phase, ValidationRoute, ValidationVerdict, WorkflowState,
};
pub use task_scheduler::TaskScheduler;
