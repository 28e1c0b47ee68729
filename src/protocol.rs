//! IPC 协议定义
//!
//! 通信方式：Unix Socket + JSONL（每条消息一行 JSON + '\n'）

use serde::{Deserialize, Serialize};

use crate::types::{
    DetectedPattern, Event, EventInput, FilterOptions, HitlResponseInput, PerformanceMetric,
    ToolOutcome, ToolOutcomeInput,
};

/// 请求类型（Client → Hub）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// 握手
    Handshake {
        /// 组件名称：hook 脚本 / 前端 / 导出工具
        component: String,
        /// 组件版本（用于日志和诊断）
        version: String,
    },

    /// 摄入事件（唯一写入口；成功后同步广播给订阅者）
    Ingest { event: EventInput },

    /// 最近事件（旧到新）
    Recent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },

    /// 过滤词表
    FilterOptions,

    /// 提交 HITL 响应（先落库，再投递到事件的回调地址）
    RespondHitl {
        event_id: i64,
        response: HitlResponseInput,
    },

    /// 记录工具执行结果（来自 post-tool hook 分析）
    RecordToolOutcome { outcome: ToolOutcomeInput },

    /// 按会话执行模式分析
    AnalyzePatterns {
        source_app: String,
        session_id: String,
    },

    /// 按会话重算性能指标
    ComputeMetrics {
        source_app: String,
        session_id: String,
    },

    /// 订阅实时事件流（先收到 snapshot，再收到后续 event 推送）
    Subscribe,

    /// 取消订阅
    Unsubscribe,

    /// 心跳（保持连接）
    Heartbeat,

    /// 查询
    Query { query_type: QueryType },
}

/// 响应类型（Hub → Client）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    /// 成功
    Ok,

    /// 错误
    Error { code: i32, message: String },

    /// 握手成功
    HandshakeOk {
        /// Hub 版本
        hub_version: String,
    },

    /// 单个事件（摄入 / HITL 响应的结果）
    Event { event: Event },

    /// 事件列表
    Events { events: Vec<Event> },

    /// 过滤词表
    FilterOptions { options: FilterOptions },

    /// 工具执行记录
    ToolOutcome { outcome: ToolOutcome },

    /// 本次分析计入的模式
    Patterns { patterns: Vec<DetectedPattern> },

    /// 刚覆盖写入的指标行
    Metric { metric: PerformanceMetric },

    /// 查询结果
    QueryResult { data: serde_json::Value },
}

/// 推送消息（Hub → 订阅者）
///
/// 线格式固定：`{"type":"initial","data":[...]}` / `{"type":"event","data":{...}}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Push {
    /// 连接时的快照（最近事件，旧到新）
    Initial(Vec<Event>),
    /// 新存储的事件
    Event(Box<Event>),
}

/// 查询类型
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "query")]
pub enum QueryType {
    /// 获取 Hub 状态
    Status,
    /// 获取连接数
    ConnectionCount,
}
