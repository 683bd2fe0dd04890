//! 城市概况工具：英文维基百科 REST summary
//!
//! 404 视为城市不存在（不重试），5xx 视为上游暂时不可用（可重试）。

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Serialize;
use serde_json::Value;

use crate::core::ToolError;
use crate::tools::{classify_status, classify_transport, required_city, Tool, ToolId, ToolParams};

const WIKIPEDIA_SUMMARY: &str = "https://en.wikipedia.org/api/rest_v1/page/summary";
/// extract 最大字符数
const MAX_EXTRACT_CHARS: usize = 1200;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CityFacts {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub extract: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<(f64, f64)>,
}

pub fn parse_summary(body: &Value) -> Result<CityFacts, ToolError> {
    let extract = body
        .get("extract")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ToolError::Upstream("summary missing 'extract'".to_string()))?;
    let extract = if extract.chars().count() > MAX_EXTRACT_CHARS {
        format!("{}...", extract.chars().take(MAX_EXTRACT_CHARS).collect::<String>())
    } else {
        extract.to_string()
    };
    let coordinates = match (
        body.pointer("/coordinates/lat").and_then(|v| v.as_f64()),
        body.pointer("/coordinates/lon").and_then(|v| v.as_f64()),
    ) {
        (Some(lat), Some(lon)) => Some((lat, lon)),
        _ => None,
    };

    Ok(CityFacts {
        title: body
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        description: body
            .get("description")
            .and_then(|v| v.as_str())
            .map(String::from),
        extract,
        url: body
            .pointer("/content_urls/desktop/page")
            .and_then(|v| v.as_str())
            .map(String::from),
        coordinates,
    })
}

/// 维基百科标题：空格替换为下划线
fn page_title(city: &str) -> String {
    city.split_whitespace().collect::<Vec<_>>().join("_")
}

/// 标题作为单个路径段追加，'/'、'?'、'#' 等会被百分号编码
fn summary_url(base_url: &str, city: &str) -> Result<Url, ToolError> {
    let mut url = Url::parse(base_url).map_err(|e| ToolError::Upstream(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| ToolError::Upstream(format!("base url cannot take a path: {}", base_url)))?
        .pop_if_empty()
        .push(&page_title(city));
    Ok(url)
}

pub struct CityFactsTool {
    client: Client,
    base_url: String,
}

impl CityFactsTool {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            base_url: WIKIPEDIA_SUMMARY.to_string(),
        }
    }
}

#[async_trait]
impl Tool for CityFactsTool {
    fn id(&self) -> ToolId {
        ToolId::CityFacts
    }

    fn description(&self) -> &str {
        "Basic facts about a city from Wikipedia. Use the English city name, e.g. Paris, Tokyo, London."
    }

    async fn invoke(&self, params: &ToolParams) -> Result<Value, ToolError> {
        let city = required_city(params)?;
        let url = summary_url(&self.base_url, city)?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(classify_transport)?;
        if !resp.status().is_success() {
            return Err(classify_status(resp.status(), city));
        }
        let body: Value = resp.json().await.map_err(classify_transport)?;
        let facts = parse_summary(&body)?;
        serde_json::to_value(&facts).map_err(|e| ToolError::Upstream(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_summary() {
        let body = serde_json::json!({
            "title": "Paris",
            "description": "Capital of France",
            "extract": "Paris is the capital and most populous city of France.",
            "coordinates": {"lat": 48.85, "lon": 2.35},
            "content_urls": {"desktop": {"page": "https://en.wikipedia.org/wiki/Paris"}}
        });
        let facts = parse_summary(&body).unwrap();
        assert_eq!(facts.title, "Paris");
        assert_eq!(facts.coordinates, Some((48.85, 2.35)));
        assert_eq!(facts.url.as_deref(), Some("https://en.wikipedia.org/wiki/Paris"));
    }

    #[test]
    fn test_parse_summary_truncates() {
        let long = "a".repeat(MAX_EXTRACT_CHARS + 50);
        let body = serde_json::json!({"title": "X", "extract": long});
        let facts = parse_summary(&body).unwrap();
        assert!(facts.extract.ends_with("..."));
        assert_eq!(facts.extract.chars().count(), MAX_EXTRACT_CHARS + 3);
    }

    #[test]
    fn test_parse_summary_requires_extract() {
        let body = serde_json::json!({"title": "X"});
        assert!(parse_summary(&body).is_err());
    }

    #[test]
    fn test_page_title() {
        assert_eq!(page_title("New  York"), "New_York");
    }

    #[test]
    fn test_summary_url_encodes_title_segment() {
        let url = summary_url(WIKIPEDIA_SUMMARY, "AC/DC?x#y").unwrap();
        assert_eq!(url.as_str(), "https://en.wikipedia.org/api/rest_v1/page/summary/AC%2FDC%3Fx%23y");
        assert!(url.query().is_none());
        assert!(url.fragment().is_none());

        let url = summary_url("https://en.wikipedia.org/api/rest_v1/page/summary/", "São Paulo").unwrap();
        assert_eq!(url.path(), "/api/rest_v1/page/summary/S%C3%A3o_Paulo");
    }
}
