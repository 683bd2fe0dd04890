//! City Resolver：城市确认闸门
//!
//! 纯决策，不调用 LLM。Plan 需要城市但未确认时给出一个澄清问题并挂起本轮。

use serde::Serialize;

use crate::nodes::Plan;

/// 向用户追问城市
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Clarification {
    pub question: String,
    /// 本轮之后连续追问的次数（上限 C_max）
    pub city_loop_count: u32,
    /// false 表示已超过追问上限，调用方不应再自动追问
    pub retriable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CityDecision {
    /// 继续：Some(city) 为已确认城市，None 为无需城市信息
    Proceed(Option<String>),
    Clarify(Clarification),
}

#[derive(Debug, Clone, Copy)]
pub struct CityResolver {
    max_city_loops: u32,
}

impl CityResolver {
    pub fn new(max_city_loops: u32) -> Self {
        Self {
            max_city_loops: max_city_loops.max(1),
        }
    }

    /// streak：本轮之前已连续追问的次数
    pub fn resolve(&self, plan: &Plan, streak: u32) -> CityDecision {
        if !plan.needs_clarification() {
            let city = plan.target_city.clone().filter(|_| plan.needs_city_info);
            return CityDecision::Proceed(city);
        }

        let asked = streak.saturating_add(1);
        let retriable = asked <= self.max_city_loops;
        let question = if !retriable {
            "I still can't tell which city you mean. Please reply with a single city name, for example \"Paris\" or \"Tokyo\".".to_string()
        } else {
            match plan.target_city.as_deref() {
                Some(city) => format!("Just to confirm, do you mean {}? Please name the city you are asking about.", city),
                None => "Which city would you like to know about?".to_string(),
            }
        };

        CityDecision::Clarify(Clarification {
            question,
            city_loop_count: asked.min(self.max_city_loops),
            retriable,
        })
    }
}
