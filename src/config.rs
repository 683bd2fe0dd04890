//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CITYWISE__*` 覆盖（双下划线表示嵌套，如 `CITYWISE__WORKFLOW__MAX_VALIDATION_LOOPS=3`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
    pub workflow: WorkflowSection,
    pub critic: CriticSection,
}

/// [app] 段：应用名、对话轮数上限
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 对话历史保留轮数（传给每轮的历史快照上限）
    #[serde(default = "default_max_context_turns")]
    pub max_context_turns: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            max_context_turns: default_max_context_turns(),
        }
    }
}

fn default_max_context_turns() -> usize {
    20
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / mock；openai 需要 OPENAI_API_KEY，缺失时回退到 mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// Critic 可使用与 Planner 不同的模型，避免自我认同
    pub critic_model: Option<String>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            critic_model: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

/// [tools] 段：单次调用超时 T、最大尝试次数 R、退避参数、工具池大小
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（毫秒）
    #[serde(default = "default_tool_timeout_ms")]
    pub tool_timeout_ms: u64,
    /// 每个工具的最大尝试次数（含首次）
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// 进程级工具并发上限（跨会话共享）
    #[serde(default = "default_max_concurrent_tools")]
    pub max_concurrent_tools: usize,
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub weather: WeatherSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_ms: default_tool_timeout_ms(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            max_concurrent_tools: default_max_concurrent_tools(),
            http: HttpSection::default(),
            weather: WeatherSection::default(),
        }
    }
}

fn default_tool_timeout_ms() -> u64 {
    8_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    250
}

fn default_backoff_max_ms() -> u64 {
    4_000
}

fn default_max_concurrent_tools() -> usize {
    16
}

/// [tools.http] 段：外部 API 请求的传输层超时与 User-Agent
#[derive(Debug, Clone, Deserialize)]
pub struct HttpSection {
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_http_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_http_timeout_secs() -> u64 {
    15
}

fn default_user_agent() -> String {
    format!("citywise/{}", env!("CARGO_PKG_VERSION"))
}

/// [tools.weather] 段：未配置 api_key 时使用确定性的模拟天气
#[derive(Debug, Clone, Deserialize, Default)]
pub struct WeatherSection {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

/// [workflow] 段：城市确认上限 C_max、校验循环上限 V_max、Planner 重试次数、整轮截止时间
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowSection {
    #[serde(default = "default_max_city_loops")]
    pub max_city_loops: u32,
    #[serde(default = "default_max_validation_loops")]
    pub max_validation_loops: u32,
    #[serde(default = "default_planner_retries")]
    pub planner_retries: u32,
    #[serde(default = "default_turn_deadline_secs")]
    pub turn_deadline_secs: u64,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            max_city_loops: default_max_city_loops(),
            max_validation_loops: default_max_validation_loops(),
            planner_retries: default_planner_retries(),
            turn_deadline_secs: default_turn_deadline_secs(),
        }
    }
}

fn default_max_city_loops() -> u32 {
    2
}

fn default_max_validation_loops() -> u32 {
    2
}

fn default_planner_retries() -> u32 {
    2
}

fn default_turn_deadline_secs() -> u64 {
    90
}

/// [critic] 段：覆盖度启发式之后是否再做一次 LLM 评审
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CriticSection {
    #[serde(default)]
    pub enabled: bool,
    pub prompt_template: Option<String>,
}

/// 单轮工作流的运行参数（由 [tools] 与 [workflow] 两段合成）
#[derive(Debug, Clone)]
pub struct TurnLimits {
    pub tool_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub max_city_loops: u32,
    pub max_validation_loops: u32,
    pub planner_retries: u32,
    pub turn_deadline: Duration,
}

impl Default for TurnLimits {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl TurnLimits {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            tool_timeout: Duration::from_millis(cfg.tools.tool_timeout_ms),
            max_attempts: cfg.tools.max_attempts.max(1),
            backoff_base: Duration::from_millis(cfg.tools.backoff_base_ms),
            backoff_max: Duration::from_millis(cfg.tools.backoff_max_ms),
            max_city_loops: cfg.workflow.max_city_loops.max(1),
            max_validation_loops: cfg.workflow.max_validation_loops,
            planner_retries: cfg.workflow.planner_retries,
            turn_deadline: Duration::from_secs(cfg.workflow.turn_deadline_secs),
        }
    }
}

/// 从 config 目录加载配置，环境变量 CITYWISE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 CITYWISE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("CITYWISE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
