//! 数据库 Schema 定义

/// 核心 Schema SQL
pub const SCHEMA_SQL: &str = r#"
-- Events 表（追加写，事件内容不可变；只有 HITL 状态列会迁移）
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_app TEXT NOT NULL,
    session_id TEXT NOT NULL,
    event_type TEXT NOT NULL,           -- "before-tool" | "after-tool" | "user-input" | "stop" | ...
    payload TEXT NOT NULL,              -- 结构化数据 (JSON object)
    timestamp INTEGER NOT NULL,         -- 毫秒时间戳，缺省时插入时赋值
    -- 内嵌 HITL 列
    hitl_request TEXT,                  -- HITL 请求 (JSON)
    hitl_state TEXT,                    -- pending | responded | timeout | error
    hitl_response TEXT,                 -- 操作者响应 (JSON)
    hitl_responded_at INTEGER,          -- 响应时间戳（毫秒）
    hitl_responder TEXT                 -- 响应者标识
);

-- Tool Outcomes 表（来自 post-tool hook 的工具执行分析）
CREATE TABLE IF NOT EXISTS tool_outcomes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_app TEXT NOT NULL,
    session_id TEXT NOT NULL,
    tool_name TEXT NOT NULL,
    success INTEGER NOT NULL,           -- 0 | 1
    error_type TEXT,                    -- permission_error / timeout_error / ...
    error_message TEXT,
    timestamp INTEGER NOT NULL
);

-- Detected Patterns 表（按会话累加，不被引擎删除）
CREATE TABLE IF NOT EXISTS detected_patterns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_app TEXT NOT NULL,
    session_id TEXT NOT NULL,
    pattern_type TEXT NOT NULL,         -- "tool-sequence" | "tool-retry"
    pattern_name TEXT NOT NULL,
    description TEXT NOT NULL,
    occurrences INTEGER NOT NULL DEFAULT 0,
    first_seen INTEGER NOT NULL,
    last_seen INTEGER NOT NULL,
    sample TEXT,                        -- 首个匹配窗口 (JSON array)
    confidence REAL NOT NULL,           -- 模板固定置信度
    UNIQUE(source_app, session_id, pattern_type, pattern_name)
);

-- Performance Metrics 表（每会话一行，整行覆盖）
CREATE TABLE IF NOT EXISTS performance_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_app TEXT NOT NULL,
    session_id TEXT NOT NULL,
    avg_response_ms REAL,               -- 平均事件间隔（排除空闲间隙），无有效间隔时为 NULL
    tools_per_event REAL NOT NULL,
    tool_success_rate REAL,             -- 无工具记录时为 NULL
    duration_ms INTEGER NOT NULL,
    total_events INTEGER NOT NULL,
    total_tool_uses INTEGER NOT NULL,
    computed_at INTEGER NOT NULL,
    UNIQUE(source_app, session_id)
);

-- 索引
CREATE INDEX IF NOT EXISTS idx_events_session ON events(source_app, session_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);
CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);
CREATE INDEX IF NOT EXISTS idx_events_hitl_pending ON events(hitl_state) WHERE hitl_state = 'pending';
CREATE INDEX IF NOT EXISTS idx_tool_outcomes_session ON tool_outcomes(source_app, session_id);
CREATE INDEX IF NOT EXISTS idx_patterns_session ON detected_patterns(source_app, session_id);
"#;

/// 获取完整 Schema
pub fn full_schema() -> String {
    SCHEMA_SQL.to_string()
}
