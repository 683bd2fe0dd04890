//! 当地时间工具
//!
//! 城市名先映射到 IANA 时区（也可直接传 timezone 参数），再查询 WorldTimeAPI。

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;

use crate::core::ToolError;
use crate::tools::{classify_status, classify_transport, Tool, ToolId, ToolParams};

const WORLDTIME_BASE: &str = "http://worldtimeapi.org/api/timezone";

/// 常见城市的 IANA 时区（小写城市名 -> 时区）
const CITY_TIMEZONES: &[(&str, &str)] = &[
    ("tokyo", "Asia/Tokyo"),
    ("osaka", "Asia/Tokyo"),
    ("kyoto", "Asia/Tokyo"),
    ("nagoya", "Asia/Tokyo"),
    ("fukuoka", "Asia/Tokyo"),
    ("sapporo", "Asia/Tokyo"),
    ("seoul", "Asia/Seoul"),
    ("shanghai", "Asia/Shanghai"),
    ("beijing", "Asia/Shanghai"),
    ("hong kong", "Asia/Hong_Kong"),
    ("singapore", "Asia/Singapore"),
    ("bangkok", "Asia/Bangkok"),
    ("dubai", "Asia/Dubai"),
    ("mumbai", "Asia/Kolkata"),
    ("delhi", "Asia/Kolkata"),
    ("london", "Europe/London"),
    ("paris", "Europe/Paris"),
    ("berlin", "Europe/Berlin"),
    ("madrid", "Europe/Madrid"),
    ("rome", "Europe/Rome"),
    ("amsterdam", "Europe/Amsterdam"),
    ("moscow", "Europe/Moscow"),
    ("istanbul", "Europe/Istanbul"),
    ("cairo", "Africa/Cairo"),
    ("new york", "America/New_York"),
    ("chicago", "America/Chicago"),
    ("los angeles", "America/Los_Angeles"),
    ("san francisco", "America/Los_Angeles"),
    ("toronto", "America/Toronto"),
    ("mexico city", "America/Mexico_City"),
    ("sao paulo", "America/Sao_Paulo"),
    ("sydney", "Australia/Sydney"),
    ("melbourne", "Australia/Melbourne"),
    ("東京", "Asia/Tokyo"),
    ("大阪", "Asia/Tokyo"),
    ("京都", "Asia/Tokyo"),
    ("名古屋", "Asia/Tokyo"),
    ("福岡", "Asia/Tokyo"),
    ("札幌", "Asia/Tokyo"),
    ("横浜", "Asia/Tokyo"),
    ("ソウル", "Asia/Seoul"),
    ("パリ", "Europe/Paris"),
    ("ロンドン", "Europe/London"),
];

/// 当地时间（payload）
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LocalTime {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    pub timezone: String,
    pub local_time: String,
    pub formatted_time: String,
    pub utc_offset: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_dst: Option<bool>,
}

pub fn timezone_for_city(city: &str) -> Option<&'static str> {
    let key = city.trim().to_lowercase();
    CITY_TIMEZONES
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, tz)| *tz)
}

/// 解析 WorldTimeAPI 响应；formatted_time 为 "YYYY-MM-DD HH:MM"
pub fn parse_worldtime(city: Option<&str>, body: &Value) -> Result<LocalTime, ToolError> {
    let datetime = body
        .get("datetime")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::Upstream("time response missing 'datetime'".to_string()))?;
    let parsed = chrono::DateTime::parse_from_rfc3339(datetime)
        .map_err(|e| ToolError::Upstream(format!("bad datetime '{}': {}", datetime, e)))?;

    Ok(LocalTime {
        city: city.map(String::from),
        timezone: body
            .get("timezone")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        local_time: datetime.to_string(),
        formatted_time: parsed.format("%Y-%m-%d %H:%M").to_string(),
        utc_offset: body
            .get("utc_offset")
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(|| parsed.format("%:z").to_string()),
        is_dst: body.get("dst").and_then(|v| v.as_bool()),
    })
}

pub struct TimeTool {
    client: Client,
    base_url: String,
}

impl TimeTool {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            base_url: WORLDTIME_BASE.to_string(),
        }
    }

    /// timezone 参数优先；否则按 city 查表
    fn resolve_timezone(params: &ToolParams) -> Result<String, ToolError> {
        if let Some(tz) = params.get("timezone").filter(|t| !t.trim().is_empty()) {
            return Ok(tz.trim().to_string());
        }
        let city = params
            .get("city")
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ToolError::InvalidParameters("missing 'city' or 'timezone'".to_string()))?;
        timezone_for_city(city)
            .map(String::from)
            .ok_or_else(|| ToolError::NotFound(format!("no known timezone for '{}'", city)))
    }
}

#[async_trait]
impl Tool for TimeTool {
    fn id(&self) -> ToolId {
        ToolId::Time
    }

    fn description(&self) -> &str {
        "Current local time of a city (resolved to an IANA timezone such as Europe/Paris)."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "city": { "type": "string" },
                "timezone": { "type": "string", "description": "IANA timezone, e.g. Asia/Tokyo" }
            },
            "required": []
        })
    }

    async fn invoke(&self, params: &ToolParams) -> Result<Value, ToolError> {
        let timezone = Self::resolve_timezone(params)?;
        let url = format!("{}/{}", self.base_url, timezone);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(classify_transport)?;
        if !resp.status().is_success() {
            return Err(classify_status(resp.status(), &timezone));
        }
        let body: Value = resp.json().await.map_err(classify_transport)?;
        let local = parse_worldtime(params.get("city").map(|c| c.as_str()), &body)?;
        serde_json::to_value(&local).map_err(|e| ToolError::Upstream(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timezone_lookup() {
        assert_eq!(timezone_for_city("Paris"), Some("Europe/Paris"));
        assert_eq!(timezone_for_city(" new york "), Some("America/New_York"));
        assert_eq!(timezone_for_city("Atlantis"), None);
        assert_eq!(timezone_for_city("東京"), Some("Asia/Tokyo"));
        assert_eq!(timezone_for_city("大阪"), Some("Asia/Tokyo"));
    }

    #[test]
    fn test_resolve_timezone_prefers_explicit() {
        let params = ToolParams::from([
            ("city".to_string(), "Paris".to_string()),
            ("timezone".to_string(), "Asia/Tokyo".to_string()),
        ]);
        assert_eq!(TimeTool::resolve_timezone(&params).unwrap(), "Asia/Tokyo");
    }

    #[test]
    fn test_resolve_timezone_unknown_city() {
        let params = ToolParams::from([("city".to_string(), "Atlantis".to_string())]);
        let err = TimeTool::resolve_timezone(&params).unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_parse_worldtime() {
        let body = serde_json::json!({
            "datetime": "2024-05-01T14:05:09.123456+02:00",
            "timezone": "Europe/Paris",
            "utc_offset": "+02:00",
            "dst": true
        });
        let t = parse_worldtime(Some("Paris"), &body).unwrap();
        assert_eq!(t.formatted_time, "2024-05-01 14:05");
        assert_eq!(t.utc_offset, "+02:00");
        assert_eq!(t.is_dst, Some(true));
        assert_eq!(t.city.as_deref(), Some("Paris"));
    }
}
