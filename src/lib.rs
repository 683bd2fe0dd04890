//! Citywise - 城市问答智能体
//!
//! 模块划分：
//! - **agent**: 无头对话服务（单飞执行、按会话取消、写回会话记忆）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 单轮引擎、状态机、错误与恢复、会话监管、工具池
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock / Scripted）
//! - **memory**: 当前会话的短期对话历史
//! - **nodes**: Planner、City Resolver、Tool Orchestrator、Composer、Critic 与进度事件
//! - **observability**: 日志初始化
//! - **tools**: 天气、当地时间、城市概况工具与执行器

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod nodes;
pub mod observability;
pub mod tools;

pub use agent::ConversationService;
pub use core::{TurnEngine, TurnOutcome, TurnRequest, TurnResult};
