//! 事件存储
//!
//! 追加写的事件库（唯一写入口 `append`），以及模式/指标/工具结果的持久化。
//! 事件内容一经写入不可变，只有内嵌的 HITL 状态列允许状态机转移。

use crate::config::DbConfig;
use crate::error::{Error, Result};
use crate::migrations;
use crate::schema;
use crate::types::{
    DetectedPattern, Event, EventInput, FilterOptions, HitlResponseInput, HitlState, HitlStatus,
    PerformanceMetric, ToolOutcome, ToolOutcomeInput,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::sync::Arc;

/// 过滤词表中最近会话 ID 的上限
const RECENT_SESSION_LIMIT: i64 = 100;

/// 事件存储
#[derive(Clone)]
pub struct EventStore {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl EventStore {
    /// 连接数据库（先迁移老库，再应用幂等 schema）
    pub fn connect(config: DbConfig) -> Result<Self> {
        // 确保目录存在
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&config.path)?;

        // 单写者 + 并发读：WAL 模式
        conn.pragma_update(None, "journal_mode", "wal")?;

        // 执行数据库迁移（先于 schema，为老数据库补列）
        migrations::run_migrations(&conn)?;

        // 初始化 schema（创建表和索引）
        conn.execute_batch(&schema::full_schema())?;

        tracing::info!("数据库已连接: {:?}", config.path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 获取底层连接 (用于测试)
    #[doc(hidden)]
    pub fn connection(&self) -> &Arc<Mutex<Connection>> {
        &self.conn
    }

    // ==================== Event 操作 ====================

    /// 追加事件（唯一的事件写入口，无更新/删除）
    ///
    /// - 必填字段校验失败返回 `Validation`
    /// - 时间戳缺省时取当下
    /// - 携带 HITL 请求时初始化 pending 状态
    pub fn append(&self, input: EventInput) -> Result<Event> {
        if input.source_app.trim().is_empty() {
            return Err(Error::Validation("source_app 不能为空".into()));
        }
        if input.session_id.trim().is_empty() {
            return Err(Error::Validation("session_id 不能为空".into()));
        }
        if input.event_type.trim().is_empty() {
            return Err(Error::Validation("event_type 不能为空".into()));
        }
        if !input.payload.is_object() {
            return Err(Error::Validation("payload 必须是 JSON object".into()));
        }
        if let Some(ref req) = input.hitl_request {
            if req.callback_url.trim().is_empty() {
                return Err(Error::Validation("HITL 请求缺少 callback_url".into()));
            }
        }

        let timestamp = input.timestamp.unwrap_or_else(current_time_ms);
        let payload_json = serde_json::to_string(&input.payload)?;

        let (hitl_request_json, hitl_state) = match input.hitl_request {
            Some(ref req) => (
                Some(serde_json::to_string(req)?),
                Some(HitlState::Pending.to_string()),
            ),
            None => (None, None),
        };

        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO events (source_app, session_id, event_type, payload, timestamp, hitl_request, hitl_state)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                input.source_app,
                input.session_id,
                input.event_type,
                payload_json,
                timestamp,
                hitl_request_json,
                hitl_state,
            ],
        )?;

        let id = conn.last_insert_rowid();

        Ok(Event {
            id,
            source_app: input.source_app,
            session_id: input.session_id,
            event_type: input.event_type,
            payload: input.payload,
            timestamp,
            hitl_status: input.hitl_request.as_ref().map(|_| HitlStatus::pending()),
            hitl_request: input.hitl_request,
        })
    }

    /// 最近插入的事件（内部按新到旧取，返回时反转为旧到新，便于展示）
    pub fn recent(&self, limit: usize) -> Result<Vec<Event>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM events ORDER BY id DESC LIMIT ?1",
            EVENT_COLUMNS
        ))?;

        let rows = stmt.query_map(params![limit as i64], map_event_row)?;
        let mut events = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        events.reverse();
        Ok(events)
    }

    /// 会话的全部事件，按时间戳升序 —— 所有下游计算依赖的顺序
    pub fn by_session(&self, source_app: &str, session_id: &str) -> Result<Vec<Event>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {} FROM events
            WHERE source_app = ?1 AND session_id = ?2
            ORDER BY timestamp ASC, id ASC
            "#,
            EVENT_COLUMNS
        ))?;

        let rows = stmt.query_map(params![source_app, session_id], map_event_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// 按 ID 获取单个事件
    pub fn get_event(&self, id: i64) -> Result<Option<Event>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM events WHERE id = ?1", EVENT_COLUMNS),
            params![id],
            map_event_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// 过滤词表：去重的 source_app / 最近会话 ID / 事件类型
    pub fn distinct_values(&self) -> Result<FilterOptions> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare("SELECT DISTINCT source_app FROM events ORDER BY source_app")?;
        let source_apps = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT session_id, MAX(id) AS latest
            FROM events
            GROUP BY session_id
            ORDER BY latest DESC
            LIMIT ?1
            "#,
        )?;
        let session_ids = stmt
            .query_map(params![RECENT_SESSION_LIMIT], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare("SELECT DISTINCT event_type FROM events ORDER BY event_type")?;
        let event_types = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(FilterOptions {
            source_apps,
            session_ids,
            event_types,
        })
    }

    /// 事件总数（状态查询用）
    pub fn event_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
            .map_err(Into::into)
    }

    // ==================== HITL 操作 ====================

    /// 记录操作者响应：pending → responded（投递之前先落库）
    ///
    /// - 事件不存在 → `NotFound`
    /// - 事件没有 HITL 请求 → `Validation`
    /// - 状态已终结 → `Conflict`（拒绝二次响应，CAS 保证只转移一次）
    pub fn record_hitl_response(
        &self,
        event_id: i64,
        input: &HitlResponseInput,
    ) -> Result<Event> {
        if !input.has_answer() {
            return Err(Error::Validation(
                "响应必须携带 response / permission / choice 之一".into(),
            ));
        }

        let conn = self.conn.lock();

        let existing: Option<(Option<String>, Option<String>)> = conn
            .query_row(
                "SELECT hitl_request, hitl_state FROM events WHERE id = ?1",
                params![event_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (hitl_request, hitl_state) = match existing {
            Some(pair) => pair,
            None => return Err(Error::NotFound(format!("事件不存在: id={}", event_id))),
        };

        if hitl_request.is_none() {
            return Err(Error::Validation(format!(
                "事件没有 HITL 请求: id={}",
                event_id
            )));
        }

        match hitl_state.as_deref().and_then(|s| s.parse::<HitlState>().ok()) {
            Some(HitlState::Pending) => {}
            Some(state) => {
                return Err(Error::Conflict(format!(
                    "HITL 状态已终结: id={}, state={}",
                    event_id, state
                )));
            }
            None => {
                return Err(Error::Validation(format!(
                    "事件没有 HITL 状态: id={}",
                    event_id
                )));
            }
        }

        let response_json = serde_json::to_string(input)?;
        let now = current_time_ms();

        // CAS：只允许 pending → responded 转移一次
        let updated = conn.execute(
            r#"
            UPDATE events
            SET hitl_state = 'responded', hitl_response = ?1, hitl_responded_at = ?2, hitl_responder = ?3
            WHERE id = ?4 AND hitl_state = 'pending'
            "#,
            params![response_json, now, input.responder, event_id],
        )?;

        if updated == 0 {
            return Err(Error::Conflict(format!(
                "HITL 状态已终结: id={}",
                event_id
            )));
        }

        conn.query_row(
            &format!("SELECT {} FROM events WHERE id = ?1", EVENT_COLUMNS),
            params![event_id],
            map_event_row,
        )
        .map_err(Into::into)
    }

    /// 将超过调用方指定 timeout 的 pending 请求转为 timeout 终态
    ///
    /// 返回本次转移的数量。没有指定 timeout 的请求一直保持 pending。
    pub fn expire_pending_hitl(&self, now_ms: i64) -> Result<usize> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            "SELECT id, timestamp, hitl_request FROM events WHERE hitl_state = 'pending'",
        )?;
        let pending: Vec<(i64, i64, Option<String>)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);

        let mut expired = 0;
        for (id, timestamp, request_json) in pending {
            let timeout_secs = request_json
                .as_deref()
                .and_then(|s| serde_json::from_str::<crate::types::HitlRequest>(s).ok())
                .and_then(|r| r.timeout_secs);

            let Some(timeout_secs) = timeout_secs else {
                continue;
            };

            if now_ms - timestamp >= timeout_secs as i64 * 1000 {
                expired += conn.execute(
                    "UPDATE events SET hitl_state = 'timeout' WHERE id = ?1 AND hitl_state = 'pending'",
                    params![id],
                )?;
            }
        }

        Ok(expired)
    }

    // ==================== Tool Outcome 操作 ====================

    /// 记录一次工具执行结果
    pub fn record_tool_outcome(&self, input: ToolOutcomeInput) -> Result<ToolOutcome> {
        if input.source_app.trim().is_empty() {
            return Err(Error::Validation("source_app 不能为空".into()));
        }
        if input.session_id.trim().is_empty() {
            return Err(Error::Validation("session_id 不能为空".into()));
        }
        if input.tool_name.trim().is_empty() {
            return Err(Error::Validation("tool_name 不能为空".into()));
        }

        let timestamp = input.timestamp.unwrap_or_else(current_time_ms);

        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO tool_outcomes (source_app, session_id, tool_name, success, error_type, error_message, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                input.source_app,
                input.session_id,
                input.tool_name,
                input.success as i64,
                input.error_type,
                input.error_message,
                timestamp,
            ],
        )?;

        Ok(ToolOutcome {
            id: conn.last_insert_rowid(),
            source_app: input.source_app,
            session_id: input.session_id,
            tool_name: input.tool_name,
            success: input.success,
            error_type: input.error_type,
            error_message: input.error_message,
            timestamp,
        })
    }

    /// 会话的工具执行记录，按时间升序
    pub fn tool_outcomes_by_session(
        &self,
        source_app: &str,
        session_id: &str,
    ) -> Result<Vec<ToolOutcome>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, source_app, session_id, tool_name, success, error_type, error_message, timestamp
            FROM tool_outcomes
            WHERE source_app = ?1 AND session_id = ?2
            ORDER BY timestamp ASC, id ASC
            "#,
        )?;

        let rows = stmt.query_map(params![source_app, session_id], |row| {
            let success: i64 = row.get(4)?;
            Ok(ToolOutcome {
                id: row.get(0)?,
                source_app: row.get(1)?,
                session_id: row.get(2)?,
                tool_name: row.get(3)?,
                success: success != 0,
                error_type: row.get(5)?,
                error_message: row.get(6)?,
                timestamp: row.get(7)?,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    // ==================== Pattern 操作 ====================

    /// Upsert 模式记录：首次创建，再次命中时累加计数、刷新 last_seen
    pub fn upsert_pattern(
        &self,
        source_app: &str,
        session_id: &str,
        m: &PatternMatch,
    ) -> Result<DetectedPattern> {
        let now = current_time_ms();
        let sample_json = serde_json::to_string(&m.sample)?;

        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO detected_patterns
                (source_app, session_id, pattern_type, pattern_name, description,
                 occurrences, first_seen, last_seen, sample, confidence)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, ?8, ?9)
            ON CONFLICT(source_app, session_id, pattern_type, pattern_name) DO UPDATE SET
                occurrences = occurrences + excluded.occurrences,
                last_seen = excluded.last_seen
            "#,
            params![
                source_app,
                session_id,
                m.pattern_type,
                m.pattern_name,
                m.description,
                m.occurrences,
                now,
                sample_json,
                m.confidence,
            ],
        )?;

        conn.query_row(
            &format!(
                "SELECT {} FROM detected_patterns \
                 WHERE source_app = ?1 AND session_id = ?2 AND pattern_type = ?3 AND pattern_name = ?4",
                PATTERN_COLUMNS
            ),
            params![source_app, session_id, m.pattern_type, m.pattern_name],
            map_pattern_row,
        )
        .map_err(Into::into)
    }

    /// 会话的全部模式记录
    pub fn patterns_by_session(
        &self,
        source_app: &str,
        session_id: &str,
    ) -> Result<Vec<DetectedPattern>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {} FROM detected_patterns
            WHERE source_app = ?1 AND session_id = ?2
            ORDER BY last_seen DESC
            "#,
            PATTERN_COLUMNS
        ))?;

        let rows = stmt.query_map(params![source_app, session_id], map_pattern_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    // ==================== Metric 操作 ====================

    /// 整行覆盖会话指标（幂等重算；与累加式指标相反，刻意如此）
    pub fn replace_metric(&self, m: &MetricInput) -> Result<PerformanceMetric> {
        let now = current_time_ms();

        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO performance_metrics
                (source_app, session_id, avg_response_ms, tools_per_event, tool_success_rate,
                 duration_ms, total_events, total_tool_uses, computed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(source_app, session_id) DO UPDATE SET
                avg_response_ms = excluded.avg_response_ms,
                tools_per_event = excluded.tools_per_event,
                tool_success_rate = excluded.tool_success_rate,
                duration_ms = excluded.duration_ms,
                total_events = excluded.total_events,
                total_tool_uses = excluded.total_tool_uses,
                computed_at = excluded.computed_at
            "#,
            params![
                m.source_app,
                m.session_id,
                m.avg_response_ms,
                m.tools_per_event,
                m.tool_success_rate,
                m.duration_ms,
                m.total_events,
                m.total_tool_uses,
                now,
            ],
        )?;

        conn.query_row(
            &format!(
                "SELECT {} FROM performance_metrics WHERE source_app = ?1 AND session_id = ?2",
                METRIC_COLUMNS
            ),
            params![m.source_app, m.session_id],
            map_metric_row,
        )
        .map_err(Into::into)
    }

    /// 获取会话指标
    pub fn get_metric(
        &self,
        source_app: &str,
        session_id: &str,
    ) -> Result<Option<PerformanceMetric>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM performance_metrics WHERE source_app = ?1 AND session_id = ?2",
                METRIC_COLUMNS
            ),
            params![source_app, session_id],
            map_metric_row,
        )
        .optional()
        .map_err(Into::into)
    }
}

/// 模式命中（写入用）
#[derive(Debug, Clone)]
pub struct PatternMatch {
    pub pattern_type: String,
    pub pattern_name: String,
    pub description: String,
    /// 本次要累加的次数
    pub occurrences: i64,
    /// 首个匹配窗口的工具名序列
    pub sample: Vec<String>,
    pub confidence: f64,
}

/// 指标输入（写入用，computed_at 由存储层赋值）
#[derive(Debug, Clone)]
pub struct MetricInput {
    pub source_app: String,
    pub session_id: String,
    pub avg_response_ms: Option<f64>,
    pub tools_per_event: f64,
    pub tool_success_rate: Option<f64>,
    pub duration_ms: i64,
    pub total_events: i64,
    pub total_tool_uses: i64,
}

const EVENT_COLUMNS: &str = "id, source_app, session_id, event_type, payload, timestamp, \
     hitl_request, hitl_state, hitl_response, hitl_responded_at, hitl_responder";

const PATTERN_COLUMNS: &str = "id, source_app, session_id, pattern_type, pattern_name, \
     description, occurrences, first_seen, last_seen, sample, confidence";

const METRIC_COLUMNS: &str = "id, source_app, session_id, avg_response_ms, tools_per_event, \
     tool_success_rate, duration_ms, total_events, total_tool_uses, computed_at";

fn map_event_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    let payload_json: String = row.get(4)?;
    let hitl_request_json: Option<String> = row.get(6)?;
    let hitl_state: Option<String> = row.get(7)?;
    let hitl_response_json: Option<String> = row.get(8)?;

    let hitl_status = hitl_state
        .as_deref()
        .and_then(|s| s.parse::<HitlState>().ok())
        .map(|state| HitlStatus {
            state,
            response: hitl_response_json
                .as_deref()
                .and_then(|s| serde_json::from_str(s).ok()),
            responded_at: None,
            responder: None,
        });

    // responded_at / responder 列只在状态块存在时有意义
    let hitl_status = match hitl_status {
        Some(mut status) => {
            status.responded_at = row.get(9)?;
            status.responder = row.get(10)?;
            Some(status)
        }
        None => None,
    };

    Ok(Event {
        id: row.get(0)?,
        source_app: row.get(1)?,
        session_id: row.get(2)?,
        event_type: row.get(3)?,
        payload: serde_json::from_str(&payload_json).unwrap_or(Value::Null),
        timestamp: row.get(5)?,
        hitl_request: hitl_request_json
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok()),
        hitl_status,
    })
}

fn map_pattern_row(row: &Row<'_>) -> rusqlite::Result<DetectedPattern> {
    let sample_json: Option<String> = row.get(9)?;
    Ok(DetectedPattern {
        id: row.get(0)?,
        source_app: row.get(1)?,
        session_id: row.get(2)?,
        pattern_type: row.get(3)?,
        pattern_name: row.get(4)?,
        description: row.get(5)?,
        occurrences: row.get(6)?,
        first_seen: row.get(7)?,
        last_seen: row.get(8)?,
        sample: sample_json
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok()),
        confidence: row.get(10)?,
    })
}

fn map_metric_row(row: &Row<'_>) -> rusqlite::Result<PerformanceMetric> {
    Ok(PerformanceMetric {
        id: row.get(0)?,
        source_app: row.get(1)?,
        session_id: row.get(2)?,
        avg_response_ms: row.get(3)?,
        tools_per_event: row.get(4)?,
        tool_success_rate: row.get(5)?,
        duration_ms: row.get(6)?,
        total_events: row.get(7)?,
        total_tool_uses: row.get(8)?,
        computed_at: row.get(9)?,
    })
}

/// 获取当前时间戳 (毫秒)
pub(crate) fn current_time_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
