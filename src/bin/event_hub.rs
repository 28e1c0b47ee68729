//! event-hub - 事件摄入与广播 Hub
//!
//! 负责：
//! - 唯一写入者（append-only 事件存储）
//! - 实时事件广播
//! - HITL 响应关联与回调投递
//! - 模式分析、指标重算

use std::sync::Arc;

use agent_event_hub::hub::{cleanup_stale_hub, is_hub_running, Hub, HubConfig};
use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("agent_event_hub=debug".parse()?))
        .init();

    tracing::info!("🚀 event-hub v{}", env!("CARGO_PKG_VERSION"));

    // 解析配置
    let config = HubConfig::default();

    // 检查是否已有 Hub 运行
    if is_hub_running(&config) {
        tracing::error!("❌ Hub is already running, exiting");
        std::process::exit(1);
    }

    // 清理残留状态
    if let Err(e) = cleanup_stale_hub(&config) {
        tracing::warn!("Failed to cleanup stale state: {}", e);
    }

    // 创建并运行 Hub
    let hub = Arc::new(Hub::new(config)?);
    hub.run().await?;

    tracing::info!("👋 event-hub exiting");
    Ok(())
}
