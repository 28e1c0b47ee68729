//! 数据类型定义

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// HITL 状态机状态
///
/// `pending` 之后只能进入一个终态，终态之后不再变化。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitlState {
    Pending,
    Responded,
    Timeout,
    Error,
}

impl FromStr for HitlState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(HitlState::Pending),
            "responded" => Ok(HitlState::Responded),
            "timeout" => Ok(HitlState::Timeout),
            "error" => Ok(HitlState::Error),
            _ => Err(format!("Invalid HITL state: {}", s)),
        }
    }
}

impl fmt::Display for HitlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HitlState::Pending => write!(f, "pending"),
            HitlState::Responded => write!(f, "responded"),
            HitlState::Timeout => write!(f, "timeout"),
            HitlState::Error => write!(f, "error"),
        }
    }
}

impl HitlState {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        !matches!(self, HitlState::Pending)
    }
}

/// HITL 交互类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    /// 自由文本回答
    FreeText,
    /// 允许/拒绝
    Permission,
    /// 多选一
    Choice,
}

/// HITL 请求（由 agent 进程随事件提交）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitlRequest {
    /// 问题文本
    pub prompt: String,
    /// 交互类型
    pub interaction: InteractionKind,
    /// 候选项（Choice 交互用）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    /// 调用方指定的超时（秒），超时后状态转入 timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// 回调地址（agent 监听的 HTTP 端点，用于投递操作者响应）
    pub callback_url: String,
}

/// HITL 状态块（随事件持久化）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitlStatus {
    pub state: HitlState,
    /// 操作者响应原文（与提交内容逐字节一致）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responder: Option<String>,
}

impl HitlStatus {
    /// 初始 pending 状态
    pub fn pending() -> Self {
        Self {
            state: HitlState::Pending,
            response: None,
            responded_at: None,
            responder: None,
        }
    }
}

/// 操作者提交的 HITL 响应
///
/// `response` / `permission` / `choice` 三者至少提供一个。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HitlResponseInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responder: Option<String>,
}

impl HitlResponseInput {
    /// 是否携带了实际回答
    pub fn has_answer(&self) -> bool {
        self.response.is_some() || self.permission.is_some() || self.choice.is_some()
    }
}

/// 事件（存储后，不可变）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub source_app: String,
    pub session_id: String,
    pub event_type: String,
    pub payload: Value,
    /// 毫秒时间戳
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hitl_request: Option<HitlRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hitl_status: Option<HitlStatus>,
}

/// 事件输入（写入用）
///
/// 必填字段缺省时由 serde 填默认值，统一在 `EventStore::append` 里校验，
/// 这样协议层能返回具体的校验错误而不是笼统的解析失败。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventInput {
    #[serde(default)]
    pub source_app: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
    /// 缺省时插入当下时间
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hitl_request: Option<HitlRequest>,
}

/// 工具执行结果记录（来自 post-tool hook 分析）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub id: i64,
    pub source_app: String,
    pub session_id: String,
    pub tool_name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub timestamp: i64,
}

/// 工具执行结果输入（写入用）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolOutcomeInput {
    #[serde(default)]
    pub source_app: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// 检测到的模式（按 (app, session, type, name) 唯一，计数累加）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedPattern {
    pub id: i64,
    pub source_app: String,
    pub session_id: String,
    /// "tool-sequence" | "tool-retry"
    pub pattern_type: String,
    pub pattern_name: String,
    pub description: String,
    pub occurrences: i64,
    pub first_seen: i64,
    pub last_seen: i64,
    /// 首个匹配窗口的工具名序列
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<Vec<String>>,
    /// 模板固定置信度，非统计值
    pub confidence: f64,
}

/// 会话性能汇总（每会话一行，重算时整行覆盖）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetric {
    pub id: i64,
    pub source_app: String,
    pub session_id: String,
    /// 平均事件间隔（毫秒），排除 >= 5 分钟的空闲间隙；无有效间隔时为 None
    pub avg_response_ms: Option<f64>,
    pub tools_per_event: f64,
    /// 成功数 / 工具调用总数；无工具记录时为 None
    pub tool_success_rate: Option<f64>,
    pub duration_ms: i64,
    pub total_events: i64,
    pub total_tool_uses: i64,
    pub computed_at: i64,
}

/// 过滤词表（用于前端筛选控件）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterOptions {
    pub source_apps: Vec<String>,
    /// 最近活跃的会话 ID（最多 100 个）
    pub session_ids: Vec<String>,
    pub event_types: Vec<String>,
}
