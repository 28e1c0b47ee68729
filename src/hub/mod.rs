//! Hub 服务模块
//!
//! 常驻后台进程：Unix Socket + JSONL 协议，负责事件摄入、实时广播、
//! HITL 响应关联、模式分析和指标重算。

mod broadcaster;
mod correlator;
mod handler;
mod server;

pub use broadcaster::{Broadcaster, ConnId, MessageSender};
pub use correlator::{Correlator, DELIVERY_TIMEOUT};
pub use handler::Handler;
pub use server::{cleanup_stale_hub, is_hub_running, Hub, HubConfig};
