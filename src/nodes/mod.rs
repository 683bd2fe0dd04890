//! 工作流节点：规划、城市确认、工具编排、回答生成、覆盖度校验，以及进度事件

pub mod city;
pub mod composer;
pub mod critic;
pub mod events;
pub mod gather;
pub mod planner;

pub use city::{CityDecision, CityResolver, Clarification};
pub use composer::{ensure_disclaimers, fallback_answer, Composer};
pub use critic::{Critic, Review};
pub use events::{
    node, ChannelSink, CollectingSink, Emitter, EventSink, EventType, FanoutSink, ProgressEvent,
    TracingSink,
};
pub use gather::Gatherer;
pub use planner::{Plan, PlanOutcome, Planner};
