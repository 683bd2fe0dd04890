//! 天气工具
//!
//! 配置了 OpenWeatherMap api_key 时查询当前天气；否则返回按城市名确定的模拟数据，保证离线可用。

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;

use crate::config::WeatherSection;
use crate::core::ToolError;
use crate::tools::{classify_status, classify_transport, required_city, Tool, ToolId, ToolParams};

const OPENWEATHER_BASE: &str = "https://api.openweathermap.org";

/// 天气数据（payload）
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Weather {
    pub city: String,
    pub temperature: f64,
    pub description: String,
    pub humidity: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feels_like: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wind_speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    pub source: &'static str,
}

pub struct WeatherTool {
    client: Client,
    api_key: Option<String>,
    base_url: String,
}

impl WeatherTool {
    pub fn new(client: Client, cfg: &WeatherSection) -> Self {
        Self {
            client,
            api_key: cfg.api_key.clone().filter(|k| !k.is_empty()),
            base_url: cfg
                .base_url
                .clone()
                .unwrap_or_else(|| OPENWEATHER_BASE.to_string()),
        }
    }

    async fn fetch(&self, city: &str, api_key: &str) -> Result<Weather, ToolError> {
        let url = format!("{}/data/2.5/weather", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .get(&url)
            .query(&[("q", city), ("appid", api_key), ("units", "metric")])
            .send()
            .await
            .map_err(classify_transport)?;
        if !resp.status().is_success() {
            return Err(classify_status(resp.status(), city));
        }
        let body: Value = resp.json().await.map_err(classify_transport)?;
        parse_openweather(city, &body)
    }
}

/// 解析 OpenWeatherMap /data/2.5/weather 响应
pub fn parse_openweather(city: &str, body: &Value) -> Result<Weather, ToolError> {
    let main = body
        .get("main")
        .ok_or_else(|| ToolError::Upstream("weather response missing 'main'".to_string()))?;
    let temperature = main
        .get("temp")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| ToolError::Upstream("weather response missing 'main.temp'".to_string()))?;
    let description = body
        .pointer("/weather/0/description")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    Ok(Weather {
        city: body
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or(city)
            .to_string(),
        temperature,
        description,
        humidity: main.get("humidity").and_then(|v| v.as_f64()).unwrap_or(0.0),
        feels_like: main.get("feels_like").and_then(|v| v.as_f64()),
        pressure: main.get("pressure").and_then(|v| v.as_f64()),
        wind_speed: body.pointer("/wind/speed").and_then(|v| v.as_f64()),
        country: body
            .pointer("/sys/country")
            .and_then(|v| v.as_str())
            .map(String::from),
        source: "openweathermap",
    })
}

/// 确定性模拟天气：同一城市总是得到同样的结果
pub fn mock_weather(city: &str) -> Weather {
    let hash: u32 = city
        .to_lowercase()
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
    let conditions = ["clear sky", "few clouds", "overcast clouds", "light rain", "mist"];

    Weather {
        city: city.to_string(),
        temperature: 5.0 + (hash % 250) as f64 / 10.0,
        description: conditions[(hash as usize / 7) % conditions.len()].to_string(),
        humidity: 40.0 + (hash % 50) as f64,
        feels_like: None,
        pressure: None,
        wind_speed: Some(((hash / 13) % 120) as f64 / 10.0),
        country: None,
        source: "mock",
    }
}

#[async_trait]
impl Tool for WeatherTool {
    fn id(&self) -> ToolId {
        ToolId::Weather
    }

    fn description(&self) -> &str {
        "Current weather for a city: temperature (°C), conditions, humidity, wind."
    }

    async fn invoke(&self, params: &ToolParams) -> Result<Value, ToolError> {
        let city = required_city(params)?;
        let weather = match &self.api_key {
            Some(key) => self.fetch(city, key).await?,
            None => mock_weather(city),
        };
        serde_json::to_value(&weather).map_err(|e| ToolError::Upstream(e.to_string()))
    }
}
