//! 工具箱：天气、当地时间、城市概况，以及带超时/重试的执行器

pub mod city_facts;
pub mod executor;
pub mod local_time;
pub mod registry;
pub mod weather;

use std::time::Duration;

use reqwest::{Client, StatusCode};

pub use city_facts::CityFactsTool;
pub use executor::{InvocationStatus, ToolExecutor, ToolInvocation};
pub use local_time::TimeTool;
pub use registry::{Tool, ToolId, ToolParams, ToolRegistry};
pub use weather::WeatherTool;

use crate::config::{HttpSection, ToolsSection};
use crate::core::ToolError;

/// 按配置注册三个城市工具
pub fn default_registry(cfg: &ToolsSection) -> ToolRegistry {
    let client = http_client(&cfg.http);
    let mut tools = ToolRegistry::new();
    tools.register(WeatherTool::new(client.clone(), &cfg.weather));
    tools.register(TimeTool::new(client.clone()));
    tools.register(CityFactsTool::new(client));
    tools
}

/// 共享 HTTP 客户端：传输层超时与 User-Agent
pub(crate) fn http_client(cfg: &HttpSection) -> Client {
    Client::builder()
        .timeout(Duration::from_secs(cfg.timeout_secs))
        .user_agent(cfg.user_agent.clone())
        .build()
        .unwrap_or_default()
}

/// HTTP 状态码归类：5xx / 429 可重试，404 为查无此项，其余 4xx 视为参数问题
pub(crate) fn classify_status(status: StatusCode, what: &str) -> ToolError {
    if status == StatusCode::NOT_FOUND {
        ToolError::NotFound(what.to_string())
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ToolError::Upstream(format!("HTTP {}", status))
    } else {
        ToolError::InvalidParameters(format!("HTTP {} for {}", status, what))
    }
}

pub(crate) fn classify_transport(err: reqwest::Error) -> ToolError {
    if err.is_timeout() {
        ToolError::Timeout
    } else {
        ToolError::Upstream(format!("Request failed: {}", err))
    }
}

/// 取必填的 city 参数（去首尾空白，空串视为缺失）
pub(crate) fn required_city(params: &ToolParams) -> Result<&str, ToolError> {
    params
        .get("city")
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ToolError::InvalidParameters("missing 'city'".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, "Atlantis"),
            ToolError::NotFound(_)
        ));
        assert!(classify_status(StatusCode::BAD_GATEWAY, "x").is_retryable());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "x").is_retryable());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, "x").is_retryable());
    }

    #[test]
    fn test_required_city() {
        let mut params = ToolParams::new();
        assert!(required_city(&params).is_err());
        params.insert("city".into(), "  ".into());
        assert!(required_city(&params).is_err());
        params.insert("city".into(), " Paris ".into());
        assert_eq!(required_city(&params).unwrap(), "Paris");
    }

    #[test]
    fn test_default_registry_has_all_tools() {
        let reg = default_registry(&ToolsSection::default());
        assert_eq!(reg.tool_ids(), ToolId::ALL.to_vec());
    }
}
