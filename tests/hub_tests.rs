//! Hub 集成测试

#[cfg(feature = "hub")]
mod tests {
    use agent_event_hub::hub::{Hub, HubConfig};
    use agent_event_hub::protocol::{Push, Request, Response};
    use agent_event_hub::types::{EventInput, HitlRequest, HitlResponseInput, InteractionKind};
    use agent_event_hub::HitlState;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::UnixStream;
    use tokio::time::{sleep, timeout};

    /// 创建测试配置
    fn test_config() -> HubConfig {
        let temp_dir = tempdir().unwrap();
        HubConfig {
            data_dir: temp_dir.into_path(),
        }
    }

    /// 启动 Hub 并等待 socket 就绪
    async fn start_hub(config: HubConfig) -> tokio::task::JoinHandle<()> {
        let hub = Arc::new(Hub::new(config).unwrap());
        let handle = tokio::spawn(async move {
            hub.run().await.unwrap();
        });
        sleep(Duration::from_millis(500)).await;
        handle
    }

    /// 测试连接（握手完成后返回）
    struct TestConn {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl TestConn {
        async fn connect(config: &HubConfig) -> Self {
            let stream = UnixStream::connect(config.socket_path()).await.unwrap();
            let (reader, writer) = stream.into_split();
            let mut conn = Self {
                reader: BufReader::new(reader),
                writer,
            };

            let response = conn
                .request(&Request::Handshake {
                    component: "test".to_string(),
                    version: "1.0.0".to_string(),
                })
                .await;
            match response {
                Response::HandshakeOk { hub_version } => assert!(!hub_version.is_empty()),
                other => panic!("Expected HandshakeOk, got {:?}", other),
            }

            conn
        }

        async fn send(&mut self, request: &Request) {
            let json = serde_json::to_string(request).unwrap();
            self.writer
                .write_all(format!("{}\n", json).as_bytes())
                .await
                .unwrap();
        }

        async fn read_line(&mut self) -> String {
            let mut line = String::new();
            timeout(Duration::from_secs(10), self.reader.read_line(&mut line))
                .await
                .expect("read timed out")
                .unwrap();
            line.trim().to_string()
        }

        async fn request(&mut self, request: &Request) -> Response {
            self.send(request).await;
            serde_json::from_str(&self.read_line().await).unwrap()
        }

        async fn read_push(&mut self) -> Push {
            serde_json::from_str(&self.read_line().await).unwrap()
        }
    }

    fn sample_event(event_type: &str) -> EventInput {
        EventInput {
            source_app: "demo".to_string(),
            session_id: "s1".to_string(),
            event_type: event_type.to_string(),
            payload: json!({"tool": "Read"}),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_ingest_returns_stored_event() {
        let config = test_config();
        let hub = start_hub(config.clone()).await;

        let mut conn = TestConn::connect(&config).await;

        let response = conn
            .request(&Request::Ingest {
                event: sample_event("before-tool"),
            })
            .await;

        match response {
            Response::Event { event } => {
                assert!(event.id > 0);
                assert_eq!(event.source_app, "demo");
                assert!(event.timestamp > 0);
            }
            other => panic!("Expected Event, got {:?}", other),
        }

        hub.abort();
    }

    #[tokio::test]
    async fn test_ingest_validation_error() {
        let config = test_config();
        let hub = start_hub(config.clone()).await;

        let mut conn = TestConn::connect(&config).await;

        let response = conn
            .request(&Request::Ingest {
                event: EventInput::default(),
            })
            .await;

        match response {
            Response::Error { code, .. } => assert_eq!(code, 400),
            other => panic!("Expected Error, got {:?}", other),
        }

        hub.abort();
    }

    #[tokio::test]
    async fn test_subscribe_receives_snapshot_then_events() {
        let config = test_config();
        let hub = start_hub(config.clone()).await;

        let mut producer = TestConn::connect(&config).await;

        // 先存一条事件，订阅者应在快照里看到它
        producer
            .request(&Request::Ingest {
                event: sample_event("before-tool"),
            })
            .await;

        let mut subscriber = TestConn::connect(&config).await;
        subscriber.send(&Request::Subscribe).await;

        // 快照先于 Ok 响应到达
        match subscriber.read_push().await {
            Push::Initial(events) => {
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].event_type, "before-tool");
            }
            other => panic!("Expected Initial, got {:?}", other),
        }
        let response: Response = serde_json::from_str(&subscriber.read_line().await).unwrap();
        assert!(matches!(response, Response::Ok));

        // 新事件实时推送
        producer
            .request(&Request::Ingest {
                event: sample_event("after-tool"),
            })
            .await;

        match subscriber.read_push().await {
            Push::Event(event) => assert_eq!(event.event_type, "after-tool"),
            other => panic!("Expected Event, got {:?}", other),
        }

        hub.abort();
    }

    #[tokio::test]
    async fn test_two_subscribers_each_receive_once() {
        let config = test_config();
        let hub = start_hub(config.clone()).await;

        let mut sub1 = TestConn::connect(&config).await;
        let mut sub2 = TestConn::connect(&config).await;

        for sub in [&mut sub1, &mut sub2] {
            sub.send(&Request::Subscribe).await;
            match sub.read_push().await {
                Push::Initial(events) => assert!(events.is_empty()),
                other => panic!("Expected Initial, got {:?}", other),
            }
            let response: Response = serde_json::from_str(&sub.read_line().await).unwrap();
            assert!(matches!(response, Response::Ok));
        }

        let mut producer = TestConn::connect(&config).await;
        producer
            .request(&Request::Ingest {
                event: sample_event("stop"),
            })
            .await;

        // 两个订阅者各收到恰好一条推送
        for sub in [&mut sub1, &mut sub2] {
            match sub.read_push().await {
                Push::Event(event) => assert_eq!(event.event_type, "stop"),
                other => panic!("Expected Event, got {:?}", other),
            }
        }

        hub.abort();
    }

    #[tokio::test]
    async fn test_concurrent_ingest_pushes_in_append_order() {
        let config = test_config();
        let hub = start_hub(config.clone()).await;

        let mut subscriber = TestConn::connect(&config).await;
        subscriber.send(&Request::Subscribe).await;
        match subscriber.read_push().await {
            Push::Initial(events) => assert!(events.is_empty()),
            other => panic!("Expected Initial, got {:?}", other),
        }
        let response: Response = serde_json::from_str(&subscriber.read_line().await).unwrap();
        assert!(matches!(response, Response::Ok));

        async fn producer(config: HubConfig) {
            let mut conn = TestConn::connect(&config).await;
            for _ in 0..25 {
                match conn
                    .request(&Request::Ingest {
                        event: sample_event("stop"),
                    })
                    .await
                {
                    Response::Event { .. } => {}
                    other => panic!("Expected Event, got {:?}", other),
                }
            }
        }

        // 两个连接并发摄入
        tokio::join!(producer(config.clone()), producer(config.clone()));

        // 订阅者看到的事件 id 严格递增，与落库顺序一致
        let mut last_id = 0;
        for _ in 0..50 {
            match subscriber.read_push().await {
                Push::Event(event) => {
                    assert!(
                        event.id > last_id,
                        "push out of order: id={} after id={}",
                        event.id,
                        last_id
                    );
                    last_id = event.id;
                }
                other => panic!("Expected Event, got {:?}", other),
            }
        }

        hub.abort();
    }

    #[tokio::test]
    async fn test_unsubscribed_connection_gets_no_push() {
        let config = test_config();
        let hub = start_hub(config.clone()).await;

        let mut bystander = TestConn::connect(&config).await;

        let mut producer = TestConn::connect(&config).await;
        producer
            .request(&Request::Ingest {
                event: sample_event("stop"),
            })
            .await;

        // 未订阅的连接不收推送
        bystander.send(&Request::Heartbeat).await;
        let response: Response = serde_json::from_str(&bystander.read_line().await).unwrap();
        assert!(matches!(response, Response::Ok));

        hub.abort();
    }

    #[tokio::test]
    async fn test_hitl_response_unreachable_callback() {
        let config = test_config();
        let hub = start_hub(config.clone()).await;

        let mut conn = TestConn::connect(&config).await;

        // 回调地址不可达
        let mut input = sample_event("user-input");
        input.hitl_request = Some(HitlRequest {
            prompt: "Continue?".to_string(),
            interaction: InteractionKind::Permission,
            options: None,
            timeout_secs: None,
            callback_url: "http://127.0.0.1:1/hitl".to_string(),
        });

        let event_id = match conn.request(&Request::Ingest { event: input }).await {
            Response::Event { event } => event.id,
            other => panic!("Expected Event, got {:?}", other),
        };

        let response = conn
            .request(&Request::RespondHitl {
                event_id,
                response: HitlResponseInput {
                    permission: Some(true),
                    responder: Some("operator".to_string()),
                    ..Default::default()
                },
            })
            .await;

        // 投递失败报 502，但响应已落库
        match response {
            Response::Error { code, .. } => assert_eq!(code, 502),
            other => panic!("Expected Error, got {:?}", other),
        }

        match conn.request(&Request::Recent { limit: Some(1) }).await {
            Response::Events { events } => {
                let status = events[0].hitl_status.as_ref().unwrap();
                assert_eq!(status.state, HitlState::Responded);
            }
            other => panic!("Expected Events, got {:?}", other),
        }

        // 二次响应被拒
        let response = conn
            .request(&Request::RespondHitl {
                event_id,
                response: HitlResponseInput {
                    permission: Some(false),
                    ..Default::default()
                },
            })
            .await;
        match response {
            Response::Error { code, .. } => assert_eq!(code, 409),
            other => panic!("Expected Error, got {:?}", other),
        }

        hub.abort();
    }

    #[tokio::test]
    async fn test_analyze_and_metrics_over_protocol() {
        let config = test_config();
        let hub = start_hub(config.clone()).await;

        let mut conn = TestConn::connect(&config).await;

        for (tool, ts) in [("Read", 1_000), ("Edit", 2_000)] {
            let mut input = sample_event("after-tool");
            input.payload = json!({"tool": tool});
            input.timestamp = Some(ts);
            conn.request(&Request::Ingest { event: input }).await;
        }

        match conn
            .request(&Request::AnalyzePatterns {
                source_app: "demo".to_string(),
                session_id: "s1".to_string(),
            })
            .await
        {
            Response::Patterns { patterns } => {
                assert!(patterns.iter().any(|p| p.pattern_name == "read-before-edit"));
            }
            other => panic!("Expected Patterns, got {:?}", other),
        }

        match conn
            .request(&Request::ComputeMetrics {
                source_app: "demo".to_string(),
                session_id: "s1".to_string(),
            })
            .await
        {
            Response::Metric { metric } => {
                assert_eq!(metric.total_events, 2);
                assert_eq!(metric.avg_response_ms, Some(1_000.0));
            }
            other => panic!("Expected Metric, got {:?}", other),
        }

        // 空会话报 404
        match conn
            .request(&Request::ComputeMetrics {
                source_app: "demo".to_string(),
                session_id: "missing".to_string(),
            })
            .await
        {
            Response::Error { code, .. } => assert_eq!(code, 404),
            other => panic!("Expected Error, got {:?}", other),
        }

        hub.abort();
    }

    #[tokio::test]
    async fn test_invalid_json_gets_error_response() {
        let config = test_config();
        let hub = start_hub(config.clone()).await;

        let mut conn = TestConn::connect(&config).await;

        conn.writer.write_all(b"not json\n").await.unwrap();
        let response: Response = serde_json::from_str(&conn.read_line().await).unwrap();
        match response {
            Response::Error { code, .. } => assert_eq!(code, 400),
            other => panic!("Expected Error, got {:?}", other),
        }

        hub.abort();
    }
}
