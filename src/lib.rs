//! agent-event-hub - 事件摄入、广播与关联引擎
//!
//! 为 agent 可观测性前端、hook 脚本和导出工具提供统一的事件存储与分发层。
//!
//! # 核心功能
//!
//! - **事件摄入**: append-only 事件存储（单写者 + WAL）
//! - **实时广播**: 订阅者按 JSONL 推送接收新事件
//! - **HITL 关联**: 人工响应与挂起请求的关联、回调投递、超时清扫
//! - **模式检测**: 会话内工具序列模板匹配 + 重试循环识别
//! - **指标聚合**: 会话级性能汇总（整行覆盖，幂等重算）
//!
//! # Feature Flags
//!
//! - `hub`: Hub 模式（唯一 Writer + 广播 + 回调投递）
//! - `client`: Hub Client（供 hook 脚本和前端使用）
//!
//! # 架构
//!
//! 所有写入操作统一通过 event-hub 进程处理，其他组件使用 HubClient 通信。
//! 这消除了多组件同时写入 DB 的冲突问题。

pub mod config;
pub mod error;
pub mod metrics;
pub mod migrations;
pub mod patterns;
pub mod protocol;
pub mod schema;
pub mod store;
pub mod types;

#[cfg(feature = "hub")]
pub mod hub;

#[cfg(feature = "client")]
pub mod client;

// Re-exports
pub use config::DbConfig;
pub use error::{Error, Result};
pub use metrics::{MetricsAggregator, IDLE_GAP_MS};
pub use patterns::{PatternDetector, PatternTemplate, TemplateToken, TEMPLATES};
pub use store::{EventStore, MetricInput, PatternMatch};
pub use types::*;

// Protocol types (always available)
pub use protocol::{Push, QueryType, Request, Response};

#[cfg(feature = "hub")]
pub use hub::{cleanup_stale_hub, is_hub_running, Broadcaster, Hub, HubConfig};

#[cfg(feature = "client")]
pub use client::{connect_hub, ClientConfig, HubClient};
