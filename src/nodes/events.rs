//! 进度事件：用于流式/SSE 展示每个节点的开始、完成、最终回复与错误
//!
//! 核心只依赖单方法的 EventSink；投递方式（通道、日志、测试收集）由调用方决定。
//! Emitter 在取消后静默丢弃事件，保证断开的客户端不会再收到任何推送。

use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// 节点名（事件中的 node_name）
pub mod node {
    pub const WORKFLOW: &str = "workflow";
    pub const PLANNER: &str = "planner";
    pub const CITY_RESOLVER: &str = "city_resolver";
    pub const TOOL_ORCHESTRATOR: &str = "tool_orchestrator";
    pub const COMPOSER: &str = "composer";
    pub const VALIDATOR: &str = "validator";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ProcessingStart,
    NodeComplete,
    FinalResponse,
    Completed,
    Error,
}

impl EventType {
    /// 事件对应的 status 字段
    pub fn status(&self) -> &'static str {
        match self {
            EventType::ProcessingStart => "processing",
            EventType::NodeComplete | EventType::FinalResponse | EventType::Completed => "completed",
            EventType::Error => "error",
        }
    }
}

/// 单条进度事件（序列化为 `{event_type, node_name, status, message?, data?, timestamp}`）
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub event_type: EventType,
    pub node_name: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Unix 毫秒
    pub timestamp: i64,
}

impl ProgressEvent {
    pub fn new(event_type: EventType, node_name: impl Into<String>) -> Self {
        Self {
            event_type,
            node_name: node_name.into(),
            status: event_type.status(),
            message: None,
            data: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// 事件接收端：同步、不可失败
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// 推送到 mpsc 通道（供 SSE / WebSocket / CLI 消费）；接收端关闭后静默丢弃
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }
}

/// 写入 tracing 日志
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: ProgressEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => tracing::debug!(event = %json, "progress"),
            Err(e) => tracing::warn!("Failed to serialize progress event: {}", e),
        }
    }
}

/// 收集全部事件（测试与调试用）
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// (event_type, node_name) 序列，便于断言顺序
    pub fn trace(&self) -> Vec<(EventType, String)> {
        self.events()
            .into_iter()
            .map(|e| (e.event_type, e.node_name))
            .collect()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// 同时投递给多个 sink
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: ProgressEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}

/// 单轮内的事件发射器：取消后不再投递
#[derive(Clone)]
pub struct Emitter {
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
}

impl Emitter {
    pub fn new(sink: Arc<dyn EventSink>, cancel: CancellationToken) -> Self {
        Self { sink, cancel }
    }

    pub fn emit(&self, event: ProgressEvent) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.sink.emit(event);
    }

    pub fn start(&self, node_name: &str) {
        self.emit(ProgressEvent::new(EventType::ProcessingStart, node_name));
    }

    pub fn complete(&self, node_name: &str, message: impl Into<String>, data: Option<Value>) {
        let mut event = ProgressEvent::new(EventType::NodeComplete, node_name).with_message(message);
        event.data = data;
        self.emit(event);
    }

    pub fn error(&self, node_name: &str, message: impl Into<String>) {
        self.emit(ProgressEvent::new(EventType::Error, node_name).with_message(message));
    }
}
