//! 集成测试

use agent_event_hub::*;
use serde_json::json;
use tempfile::TempDir;

/// 创建临时数据库
fn setup_db() -> (EventStore, TempDir) {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("test.db");
    let config = DbConfig::local(&db_path);
    let store = EventStore::connect(config).unwrap();
    (store, tmp)
}

/// 最小事件输入
fn event_input(source_app: &str, session_id: &str, event_type: &str) -> EventInput {
    EventInput {
        source_app: source_app.to_string(),
        session_id: session_id.to_string(),
        event_type: event_type.to_string(),
        payload: json!({}),
        ..Default::default()
    }
}

/// after-tool 事件（带工具名和时间戳）
fn tool_event(session_id: &str, tool: &str, timestamp: i64) -> EventInput {
    EventInput {
        source_app: "demo".to_string(),
        session_id: session_id.to_string(),
        event_type: "after-tool".to_string(),
        payload: json!({"tool": tool}),
        timestamp: Some(timestamp),
        ..Default::default()
    }
}

// ==================== 连接测试 ====================

mod connection_tests {
    use super::*;

    #[test]
    fn test_connect_creates_db_file() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("subdir").join("test.db");

        // 目录不存在
        assert!(!db_path.parent().unwrap().exists());

        let config = DbConfig::local(&db_path);
        let _store = EventStore::connect(config).unwrap();

        // 连接后文件应该存在
        assert!(db_path.exists());
    }

    #[test]
    fn test_connect_existing_db() {
        let (store1, tmp) = setup_db();
        store1.append(event_input("demo", "s1", "stop")).unwrap();
        drop(store1);

        // 重新连接同一个数据库，数据还在
        let db_path = tmp.path().join("test.db");
        let config = DbConfig::local(&db_path);
        let store2 = EventStore::connect(config).unwrap();
        assert_eq!(store2.event_count().unwrap(), 1);
    }
}

// ==================== 事件存储测试 ====================

mod store_tests {
    use super::*;

    #[test]
    fn test_append_assigns_increasing_ids() {
        let (store, _tmp) = setup_db();

        let e1 = store.append(event_input("demo", "s1", "before-tool")).unwrap();
        let e2 = store.append(event_input("demo", "s1", "after-tool")).unwrap();
        let e3 = store.append(event_input("demo", "s2", "stop")).unwrap();

        assert!(e1.id < e2.id);
        assert!(e2.id < e3.id);
    }

    #[test]
    fn test_append_rejects_missing_fields() {
        let (store, _tmp) = setup_db();

        let err = store.append(event_input("", "s1", "stop")).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = store.append(event_input("demo", "", "stop")).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = store.append(event_input("demo", "s1", "")).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_append_fills_timestamp() {
        let (store, _tmp) = setup_db();

        let before = chrono::Utc::now().timestamp_millis();
        let event = store.append(event_input("demo", "s1", "stop")).unwrap();
        let after = chrono::Utc::now().timestamp_millis();

        assert!(event.timestamp >= before && event.timestamp <= after);
    }

    #[test]
    fn test_append_with_hitl_starts_pending() {
        let (store, _tmp) = setup_db();

        let mut input = event_input("demo", "s1", "user-input");
        input.hitl_request = Some(HitlRequest {
            prompt: "Continue?".to_string(),
            interaction: InteractionKind::Permission,
            options: None,
            timeout_secs: Some(60),
            callback_url: "http://127.0.0.1:9/hitl".to_string(),
        });

        let event = store.append(input).unwrap();
        let status = event.hitl_status.unwrap();
        assert_eq!(status.state, HitlState::Pending);
        assert!(status.response.is_none());
    }

    #[test]
    fn test_hitl_request_requires_callback_url() {
        let (store, _tmp) = setup_db();

        let mut input = event_input("demo", "s1", "user-input");
        input.hitl_request = Some(HitlRequest {
            prompt: "Continue?".to_string(),
            interaction: InteractionKind::FreeText,
            options: None,
            timeout_secs: None,
            callback_url: "".to_string(),
        });

        let err = store.append(input).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_recent_returns_oldest_first() {
        let (store, _tmp) = setup_db();

        for i in 0..5 {
            store
                .append(event_input("demo", "s1", &format!("type-{}", i)))
                .unwrap();
        }

        let events = store.recent(3).unwrap();
        assert_eq!(events.len(), 3);
        // 最新的 3 条，按旧到新排列
        assert_eq!(events[0].event_type, "type-2");
        assert_eq!(events[2].event_type, "type-4");
        assert!(events[0].id < events[1].id && events[1].id < events[2].id);
    }

    #[test]
    fn test_by_session_ordered_by_timestamp() {
        let (store, _tmp) = setup_db();

        store.append(tool_event("s1", "Read", 3_000)).unwrap();
        store.append(tool_event("s1", "Edit", 1_000)).unwrap();
        store.append(tool_event("s2", "Bash", 2_000)).unwrap();

        let events = store.by_session("demo", "s1").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].timestamp, 1_000);
        assert_eq!(events[1].timestamp, 3_000);
    }

    #[test]
    fn test_distinct_values() {
        let (store, _tmp) = setup_db();

        store.append(event_input("app-a", "s1", "stop")).unwrap();
        store.append(event_input("app-b", "s2", "stop")).unwrap();
        store.append(event_input("app-a", "s1", "before-tool")).unwrap();

        let options = store.distinct_values().unwrap();
        assert_eq!(options.source_apps, vec!["app-a", "app-b"]);
        assert_eq!(options.event_types, vec!["before-tool", "stop"]);
        // 会话按最近活跃排序
        assert_eq!(options.session_ids, vec!["s1", "s2"]);
    }
}

// ==================== HITL 测试 ====================

mod hitl_tests {
    use super::*;

    fn hitl_event(store: &EventStore, timeout_secs: Option<u64>) -> Event {
        let mut input = event_input("demo", "s1", "user-input");
        input.hitl_request = Some(HitlRequest {
            prompt: "Pick one".to_string(),
            interaction: InteractionKind::Choice,
            options: Some(vec!["a".to_string(), "b".to_string()]),
            timeout_secs,
            callback_url: "http://127.0.0.1:9/hitl".to_string(),
        });
        store.append(input).unwrap()
    }

    #[test]
    fn test_respond_transitions_to_responded() {
        let (store, _tmp) = setup_db();
        let event = hitl_event(&store, None);

        let response = HitlResponseInput {
            choice: Some("a".to_string()),
            responder: Some("operator".to_string()),
            ..Default::default()
        };

        let updated = store.record_hitl_response(event.id, &response).unwrap();
        let status = updated.hitl_status.unwrap();
        assert_eq!(status.state, HitlState::Responded);
        assert!(status.responded_at.is_some());
        assert_eq!(status.responder.as_deref(), Some("operator"));

        // 存储的响应内容与提交的逐字段一致（重新读取也一样）
        let submitted = serde_json::to_value(&response).unwrap();
        assert_eq!(status.response, Some(submitted.clone()));

        let reread = store.get_event(event.id).unwrap().unwrap();
        assert_eq!(reread.hitl_status.unwrap().response, Some(submitted));
    }

    #[test]
    fn test_second_response_rejected() {
        let (store, _tmp) = setup_db();
        let event = hitl_event(&store, None);

        let response = HitlResponseInput {
            permission: Some(true),
            ..Default::default()
        };
        store.record_hitl_response(event.id, &response).unwrap();

        // 二次响应被拒，已有响应不变
        let err = store.record_hitl_response(event.id, &response).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn test_respond_unknown_event() {
        let (store, _tmp) = setup_db();

        let response = HitlResponseInput {
            permission: Some(false),
            ..Default::default()
        };
        let err = store.record_hitl_response(999, &response).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_respond_event_without_hitl() {
        let (store, _tmp) = setup_db();
        let event = store.append(event_input("demo", "s1", "stop")).unwrap();

        let response = HitlResponseInput {
            permission: Some(true),
            ..Default::default()
        };
        let err = store.record_hitl_response(event.id, &response).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_empty_response_rejected() {
        let (store, _tmp) = setup_db();
        let event = hitl_event(&store, None);

        let err = store
            .record_hitl_response(event.id, &HitlResponseInput::default())
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_expire_pending_after_timeout() {
        let (store, _tmp) = setup_db();
        let event = hitl_event(&store, Some(10));

        // 超时前不过期
        let expired = store.expire_pending_hitl(event.timestamp + 9_000).unwrap();
        assert_eq!(expired, 0);

        // 到期后转入 timeout
        let expired = store.expire_pending_hitl(event.timestamp + 10_000).unwrap();
        assert_eq!(expired, 1);

        let status = store
            .get_event(event.id)
            .unwrap()
            .unwrap()
            .hitl_status
            .unwrap();
        assert_eq!(status.state, HitlState::Timeout);

        // 过期后响应被拒
        let response = HitlResponseInput {
            permission: Some(true),
            ..Default::default()
        };
        let err = store.record_hitl_response(event.id, &response).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn test_no_timeout_stays_pending() {
        let (store, _tmp) = setup_db();
        let event = hitl_event(&store, None);

        let expired = store
            .expire_pending_hitl(event.timestamp + 86_400_000)
            .unwrap();
        assert_eq!(expired, 0);
    }
}

// ==================== 模式检测测试 ====================

mod pattern_tests {
    use super::*;

    #[test]
    fn test_read_before_edit_detected() {
        let (store, _tmp) = setup_db();

        // Read → Edit → Bash
        store.append(tool_event("s1", "Read", 1_000)).unwrap();
        store.append(tool_event("s1", "Edit", 2_000)).unwrap();
        store.append(tool_event("s1", "Bash", 3_000)).unwrap();

        let detector = PatternDetector::new(&store);
        let patterns = detector.analyze("demo", "s1").unwrap();

        let m = patterns
            .iter()
            .find(|p| p.pattern_name == "read-before-edit")
            .unwrap();
        assert_eq!(m.pattern_type, "tool-sequence");
        assert_eq!(m.occurrences, 1);
        assert_eq!(m.confidence, 0.85);
        assert_eq!(
            m.sample.as_deref(),
            Some(&["Read".to_string(), "Edit".to_string()][..])
        );
    }

    #[test]
    fn test_retry_streak_detected() {
        let (store, _tmp) = setup_db();

        // 同一工具连续 3 次
        for i in 0..3 {
            store
                .append(tool_event("s1", "Bash", 1_000 * (i + 1)))
                .unwrap();
        }

        let detector = PatternDetector::new(&store);
        let patterns = detector.analyze("demo", "s1").unwrap();

        let m = patterns
            .iter()
            .find(|p| p.pattern_type == "tool-retry")
            .unwrap();
        assert_eq!(m.pattern_name, "bash-retry");
        // 首次之外的重复次数
        assert_eq!(m.occurrences, 2);
        assert_eq!(m.confidence, 0.9);
    }

    #[test]
    fn test_rerun_accumulates_occurrences() {
        let (store, _tmp) = setup_db();

        store.append(tool_event("s1", "Read", 1_000)).unwrap();
        store.append(tool_event("s1", "Edit", 2_000)).unwrap();

        let detector = PatternDetector::new(&store);
        detector.analyze("demo", "s1").unwrap();
        detector.analyze("demo", "s1").unwrap();

        // 同一 (app, session, type, name) 只有一行，计数累加
        let patterns = store.patterns_by_session("demo", "s1").unwrap();
        let rows: Vec<_> = patterns
            .iter()
            .filter(|p| p.pattern_name == "read-before-edit")
            .collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].occurrences, 2);
    }

    #[test]
    fn test_ignores_non_tool_events() {
        let (store, _tmp) = setup_db();

        // before-tool 事件不计入序列
        let mut input = event_input("demo", "s1", "before-tool");
        input.payload = json!({"tool": "Read"});
        store.append(input).unwrap();

        store.append(tool_event("s1", "Edit", 2_000)).unwrap();

        let detector = PatternDetector::new(&store);
        let patterns = detector.analyze("demo", "s1").unwrap();
        assert!(patterns.is_empty());
    }

    #[test]
    fn test_tool_name_fallback_key() {
        let (store, _tmp) = setup_db();

        // payload 用 tool_name 键也能识别
        let mut input = event_input("demo", "s1", "after-tool");
        input.payload = json!({"tool_name": "Read"});
        input.timestamp = Some(1_000);
        store.append(input).unwrap();
        store.append(tool_event("s1", "Edit", 2_000)).unwrap();

        let detector = PatternDetector::new(&store);
        let patterns = detector.analyze("demo", "s1").unwrap();
        assert!(patterns.iter().any(|p| p.pattern_name == "read-before-edit"));
    }
}

// ==================== 指标测试 ====================

mod metrics_tests {
    use super::*;

    #[test]
    fn test_compute_basic_metrics() {
        let (store, _tmp) = setup_db();

        store.append(tool_event("s1", "Read", 1_000)).unwrap();
        store.append(tool_event("s1", "Edit", 2_000)).unwrap();
        store.append(tool_event("s1", "Bash", 4_000)).unwrap();

        store
            .record_tool_outcome(ToolOutcomeInput {
                source_app: "demo".to_string(),
                session_id: "s1".to_string(),
                tool_name: "Read".to_string(),
                success: true,
                ..Default::default()
            })
            .unwrap();
        store
            .record_tool_outcome(ToolOutcomeInput {
                source_app: "demo".to_string(),
                session_id: "s1".to_string(),
                tool_name: "Bash".to_string(),
                success: false,
                error_type: Some("command_failed".to_string()),
                ..Default::default()
            })
            .unwrap();

        let aggregator = MetricsAggregator::new(&store);
        let metric = aggregator.compute("demo", "s1").unwrap();

        assert_eq!(metric.total_events, 3);
        assert_eq!(metric.total_tool_uses, 2);
        assert_eq!(metric.avg_response_ms, Some(1_500.0));
        assert_eq!(metric.tool_success_rate, Some(0.5));
        assert_eq!(metric.duration_ms, 3_000);
    }

    #[test]
    fn test_idle_gaps_excluded() {
        let (store, _tmp) = setup_db();

        // 1s 间隔 + 10 分钟空闲 + 1s 间隔
        store.append(tool_event("s1", "Read", 0)).unwrap();
        store.append(tool_event("s1", "Edit", 1_000)).unwrap();
        store.append(tool_event("s1", "Read", 601_000)).unwrap();
        store.append(tool_event("s1", "Edit", 602_000)).unwrap();

        let aggregator = MetricsAggregator::new(&store);
        let metric = aggregator.compute("demo", "s1").unwrap();

        assert_eq!(metric.avg_response_ms, Some(1_000.0));
        // duration 不排除空闲
        assert_eq!(metric.duration_ms, 602_000);
    }

    #[test]
    fn test_single_event_has_no_average() {
        let (store, _tmp) = setup_db();
        store.append(tool_event("s1", "Read", 1_000)).unwrap();

        let aggregator = MetricsAggregator::new(&store);
        let metric = aggregator.compute("demo", "s1").unwrap();

        assert_eq!(metric.avg_response_ms, None);
        assert_eq!(metric.tool_success_rate, None);
        assert_eq!(metric.duration_ms, 0);
    }

    #[test]
    fn test_empty_session_not_found() {
        let (store, _tmp) = setup_db();

        let aggregator = MetricsAggregator::new(&store);
        let err = aggregator.compute("demo", "missing").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_recompute_overwrites_row() {
        let (store, _tmp) = setup_db();

        store.append(tool_event("s1", "Read", 1_000)).unwrap();
        let aggregator = MetricsAggregator::new(&store);
        aggregator.compute("demo", "s1").unwrap();

        store.append(tool_event("s1", "Edit", 2_000)).unwrap();
        let metric = aggregator.compute("demo", "s1").unwrap();

        // 每会话只有一行，重算整行覆盖
        assert_eq!(metric.total_events, 2);
        let stored = store.get_metric("demo", "s1").unwrap().unwrap();
        assert_eq!(stored.total_events, 2);
        assert_eq!(stored.avg_response_ms, Some(1_000.0));
    }
}

// ==================== 工具结果测试 ====================

mod tool_outcome_tests {
    use super::*;

    #[test]
    fn test_record_and_query() {
        let (store, _tmp) = setup_db();

        let outcome = store
            .record_tool_outcome(ToolOutcomeInput {
                source_app: "demo".to_string(),
                session_id: "s1".to_string(),
                tool_name: "Edit".to_string(),
                success: false,
                error_type: Some("file_not_found".to_string()),
                error_message: Some("no such file".to_string()),
                timestamp: Some(42),
            })
            .unwrap();

        assert!(outcome.id > 0);
        assert_eq!(outcome.timestamp, 42);

        let outcomes = store.tool_outcomes_by_session("demo", "s1").unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].error_type.as_deref(), Some("file_not_found"));
    }

    #[test]
    fn test_record_rejects_missing_fields() {
        let (store, _tmp) = setup_db();

        let err = store
            .record_tool_outcome(ToolOutcomeInput::default())
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
