//! 请求处理器
//!
//! 处理单条客户端请求并返回响应。写路径（摄入、HITL 响应）同步完成
//! 落库后才回包，广播在回包前尽力推送。

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Error;
use crate::hub::broadcaster::{Broadcaster, ConnId};
use crate::hub::correlator::Correlator;
use crate::metrics::MetricsAggregator;
use crate::patterns::PatternDetector;
use crate::protocol::{Push, QueryType, Request, Response};
use crate::store::EventStore;

/// 订阅时快照的事件数
const SNAPSHOT_LIMIT: usize = 50;

/// Hub 版本
const HUB_VERSION: &str = env!("CARGO_PKG_VERSION");

/// 请求处理器
pub struct Handler {
    store: EventStore,
    broadcaster: Arc<Broadcaster>,
    correlator: Correlator,
    /// 摄入临界区：落库和入队必须原子，订阅者才能按落库顺序收到推送
    ingest_lock: Mutex<()>,
}

impl Handler {
    pub fn new(store: EventStore, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            store,
            broadcaster,
            correlator: Correlator::new(),
            ingest_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// 处理单条请求
    pub async fn handle(&self, conn_id: ConnId, request: Request) -> Response {
        match request {
            Request::Handshake { component, version } => {
                tracing::info!(
                    "🤝 Handshake: conn_id={}, component={}, version={}",
                    conn_id,
                    component,
                    version
                );
                Response::HandshakeOk {
                    hub_version: HUB_VERSION.to_string(),
                }
            }

            Request::Ingest { event } => {
                // append 释放库锁后到 broadcast 入队之间不能被并发摄入插队，
                // 否则订阅者队列里的顺序会与落库顺序不一致
                let _ordering = self.ingest_lock.lock();
                match self.store.append(event) {
                    Ok(stored) => {
                        // 回包前广播（best-effort，失败不影响写路径）
                        self.broadcaster.broadcast(&stored);
                        Response::Event { event: stored }
                    }
                    Err(e) => error_response(e),
                }
            }

            Request::Recent { limit } => {
                match self.store.recent(limit.unwrap_or(SNAPSHOT_LIMIT)) {
                    Ok(events) => Response::Events { events },
                    Err(e) => error_response(e),
                }
            }

            Request::FilterOptions => match self.store.distinct_values() {
                Ok(options) => Response::FilterOptions { options },
                Err(e) => error_response(e),
            },

            Request::RespondHitl { event_id, response } => {
                match self.correlator.respond(&self.store, event_id, &response).await {
                    Ok(event) => Response::Event { event },
                    Err(e) => error_response(e),
                }
            }

            Request::RecordToolOutcome { outcome } => {
                match self.store.record_tool_outcome(outcome) {
                    Ok(outcome) => Response::ToolOutcome { outcome },
                    Err(e) => error_response(e),
                }
            }

            Request::AnalyzePatterns {
                source_app,
                session_id,
            } => {
                let detector = PatternDetector::new(&self.store);
                match detector.analyze(&source_app, &session_id) {
                    Ok(patterns) => Response::Patterns { patterns },
                    Err(e) => error_response(e),
                }
            }

            Request::ComputeMetrics {
                source_app,
                session_id,
            } => {
                let aggregator = MetricsAggregator::new(&self.store);
                match aggregator.compute(&source_app, &session_id) {
                    Ok(metric) => Response::Metric { metric },
                    Err(e) => error_response(e),
                }
            }

            Request::Subscribe => {
                // 先推快照，再纳入订阅，之后的新事件走广播
                match self.store.recent(SNAPSHOT_LIMIT) {
                    Ok(events) => {
                        let push = Push::Initial(events);
                        match serde_json::to_string(&push) {
                            Ok(json) => {
                                // 快照送不出去（队列满/已断开）就不算订阅成功
                                if !self.broadcaster.try_send_to(conn_id, format!("{}\n", json)) {
                                    tracing::warn!("快照投递失败，拒绝订阅: conn_id={}", conn_id);
                                    return Response::Error {
                                        code: 500,
                                        message: "快照投递失败".to_string(),
                                    };
                                }
                                self.broadcaster.subscribe(conn_id);
                                Response::Ok
                            }
                            Err(e) => error_response(e.into()),
                        }
                    }
                    Err(e) => error_response(e),
                }
            }

            Request::Unsubscribe => {
                self.broadcaster.unsubscribe(conn_id);
                Response::Ok
            }

            Request::Heartbeat => Response::Ok,

            Request::Query { query_type } => self.handle_query(query_type),
        }
    }

    fn handle_query(&self, query_type: QueryType) -> Response {
        match query_type {
            QueryType::Status => {
                let event_count = match self.store.event_count() {
                    Ok(n) => n,
                    Err(e) => return error_response(e),
                };
                Response::QueryResult {
                    data: serde_json::json!({
                        "version": HUB_VERSION,
                        "event_count": event_count,
                        "connections": self.broadcaster.connection_count(),
                        "subscribers": self.broadcaster.subscriber_count(),
                    }),
                }
            }
            QueryType::ConnectionCount => Response::QueryResult {
                data: serde_json::json!({
                    "connections": self.broadcaster.connection_count(),
                }),
            },
        }
    }
}

/// 错误到线上响应的映射
fn error_response(e: Error) -> Response {
    let code = match &e {
        Error::Validation(_) => 400,
        Error::NotFound(_) => 404,
        Error::Conflict(_) => 409,
        Error::Delivery(_) => 502,
        _ => 500,
    };

    if code == 500 {
        tracing::error!("请求处理失败: {}", e);
    } else {
        tracing::debug!("请求被拒绝: code={}, {}", code, e);
    }

    Response::Error {
        code,
        message: e.to_string(),
    }
}
