//! 引擎构建器：统一的初始化逻辑
//!
//! 从 AppConfig 组装 LLM、工具注册表、执行器与五个节点；CLI 与测试共用同一条路径，
//! 测试可以注入脚本化 LLM 与替身工具。

use std::sync::Arc;

use crate::config::{AppConfig, TurnLimits};
use crate::core::{RecoveryEngine, TaskScheduler, TurnEngine};
use crate::llm::{create_llm_from_config, LlmClient};
use crate::nodes::{CityResolver, Composer, Critic, Gatherer, Planner};
use crate::tools::{default_registry, ToolExecutor, ToolRegistry};

/// 依次查找 config/prompts/<name> 与 ../config/prompts/<name>
fn load_prompt(name: &str) -> Option<String> {
    [format!("config/prompts/{}", name), format!("../config/prompts/{}", name)]
        .into_iter()
        .find_map(|p| std::fs::read_to_string(p).ok())
        .filter(|s| !s.trim().is_empty())
}

pub struct EngineBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    critic_llm: Option<Arc<dyn LlmClient>>,
    registry: Option<ToolRegistry>,
    scheduler: Option<Arc<TaskScheduler>>,
    load_prompt_files: bool,
}

impl EngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            critic_llm: None,
            registry: None,
            scheduler: None,
            load_prompt_files: true,
        }
    }

    /// 注入 LLM（Planner / Composer / Critic 共用，除非另设 critic）
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_critic_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.critic_llm = Some(llm);
        self
    }

    pub fn with_registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// 多个引擎共享同一个进程级工具池
    pub fn with_scheduler(mut self, scheduler: Arc<TaskScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// 是否读取 config/prompts/*.txt 覆盖默认 prompt
    pub fn with_prompt_files(mut self, enable: bool) -> Self {
        self.load_prompt_files = enable;
        self
    }

    fn prompt(&self, name: &str) -> Option<String> {
        if self.load_prompt_files {
            load_prompt(name)
        } else {
            None
        }
    }

    pub fn build(self) -> TurnEngine {
        let cfg = &self.config;
        let limits = TurnLimits::from_config(cfg);

        let llm = self
            .llm
            .clone()
            .unwrap_or_else(|| create_llm_from_config(cfg, None));
        let critic_llm = self.critic_llm.clone().unwrap_or_else(|| match &cfg.llm.critic_model {
            Some(model) if self.llm.is_none() => create_llm_from_config(cfg, Some(model)),
            _ => llm.clone(),
        });

        let recovery = RecoveryEngine::new(
            limits.planner_retries,
            limits.max_attempts,
            limits.backoff_base,
            limits.backoff_max,
        );
        let registry = self
            .registry
            .clone()
            .unwrap_or_else(|| default_registry(&cfg.tools));
        let scheduler = self
            .scheduler
            .clone()
            .unwrap_or_else(|| Arc::new(TaskScheduler::new(cfg.tools.max_concurrent_tools)));

        let planner = match self.prompt("planner.txt") {
            Some(template) => Planner::with_template(llm.clone(), &template, &registry, recovery.clone()),
            None => Planner::new(llm.clone(), &registry, recovery.clone()),
        };
        let composer = match self.prompt("composer.txt") {
            Some(prompt) => Composer::with_prompt(llm.clone(), prompt),
            None => Composer::new(llm.clone()),
        };
        let mut critic_cfg = cfg.critic.clone();
        if critic_cfg.prompt_template.is_none() {
            critic_cfg.prompt_template = self.prompt("critic.txt");
        }
        let critic = Critic::from_config(critic_llm, &critic_cfg);

        tracing::info!(
            tools = ?registry.tool_ids(),
            tool_pool = scheduler.capacity(),
            critic_llm = critic.uses_llm(),
            "Turn engine ready"
        );

        let executor = ToolExecutor::new(registry, limits.tool_timeout, recovery.clone(), scheduler);
        TurnEngine::new(
            planner,
            CityResolver::new(limits.max_city_loops),
            Gatherer::new(Arc::new(executor)),
            composer,
            critic,
            recovery,
            &limits,
        )
    }
}
