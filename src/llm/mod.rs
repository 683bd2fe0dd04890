//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock / Scripted）

pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

pub use mock::{MockLlmClient, ScriptedLlmClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::LlmClient;

use crate::config::AppConfig;

/// 根据配置与环境变量选择 LLM 后端；model_override 用于 Critic 等独立模型
pub fn create_llm_from_config(cfg: &AppConfig, model_override: Option<&str>) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let has_key = std::env::var("OPENAI_API_KEY").is_ok();

    if provider != "mock" && has_key {
        let model = model_override.unwrap_or(&cfg.llm.model);
        tracing::info!("Using OpenAI-compatible LLM ({})", model);
        Arc::new(OpenAiClient::new(
            cfg.llm.base_url.as_deref(),
            model,
            None,
            cfg.llm.timeouts.request,
        ))
    } else {
        if provider != "mock" {
            tracing::warn!("OPENAI_API_KEY not set, using Mock LLM");
        }
        Arc::new(MockLlmClient)
    }
}
