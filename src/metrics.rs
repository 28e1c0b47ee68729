//! 指标聚合
//!
//! 计算单个会话的性能汇总，每次重算整行覆盖（幂等）。
//! 注意：这与别处按增量累加的 token/cost 类会话指标刻意不同。

use crate::error::{Error, Result};
use crate::store::{EventStore, MetricInput};
use crate::types::PerformanceMetric;

/// 空闲间隙阈值（毫秒）：达到 5 分钟的事件间隔视为空闲，不计入平均响应
pub const IDLE_GAP_MS: i64 = 5 * 60 * 1000;

/// 指标聚合器
pub struct MetricsAggregator<'a> {
    store: &'a EventStore,
}

impl<'a> MetricsAggregator<'a> {
    pub fn new(store: &'a EventStore) -> Self {
        Self { store }
    }

    /// 重算一个会话的指标并整行覆盖
    ///
    /// 会话没有任何事件时返回 `NotFound`。
    pub fn compute(&self, source_app: &str, session_id: &str) -> Result<PerformanceMetric> {
        let events = self.store.by_session(source_app, session_id)?;
        if events.is_empty() {
            return Err(Error::NotFound(format!(
                "会话没有事件: app={}, session={}",
                source_app, session_id
            )));
        }

        let timestamps: Vec<i64> = events.iter().map(|e| e.timestamp).collect();
        let avg_response_ms = average_gap(&timestamps);

        let outcomes = self.store.tool_outcomes_by_session(source_app, session_id)?;
        let total_tool_uses = outcomes.len() as i64;
        let successes = outcomes.iter().filter(|o| o.success).count() as i64;

        let tool_success_rate = if total_tool_uses > 0 {
            Some(successes as f64 / total_tool_uses as f64)
        } else {
            None
        };

        let total_events = events.len() as i64;
        let tools_per_event = total_tool_uses as f64 / total_events as f64;
        let duration_ms = timestamps.last().unwrap() - timestamps.first().unwrap();

        let metric = self.store.replace_metric(&MetricInput {
            source_app: source_app.to_string(),
            session_id: session_id.to_string(),
            avg_response_ms,
            tools_per_event,
            tool_success_rate,
            duration_ms,
            total_events,
            total_tool_uses,
        })?;

        tracing::debug!(
            "指标重算完成: app={}, session={}, events={}, tools={}",
            source_app,
            session_id,
            total_events,
            total_tool_uses
        );

        Ok(metric)
    }
}

/// 相邻事件间隔的均值，排除 >= IDLE_GAP_MS 的空闲间隙
///
/// 没有任何合格间隔时返回 None。
fn average_gap(timestamps: &[i64]) -> Option<f64> {
    let gaps: Vec<i64> = timestamps
        .windows(2)
        .map(|w| w[1] - w[0])
        .filter(|&d| d < IDLE_GAP_MS)
        .collect();

    if gaps.is_empty() {
        return None;
    }

    Some(gaps.iter().sum::<i64>() as f64 / gaps.len() as f64)
}
