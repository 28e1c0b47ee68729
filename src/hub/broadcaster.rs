//! 事件广播器
//!
//! 显式持有的连接注册表（注入 handler，不做全局状态），把新存储的事件
//! 推送给实时订阅者。每连接一条有界队列，发送 fire-and-forget：
//! 队列满丢消息，对端关闭立即注销。广播失败从不影响写路径。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::protocol::Push;
use crate::types::Event;

/// 连接 ID
pub type ConnId = u64;

/// 消息发送通道
pub type MessageSender = mpsc::Sender<String>;

/// 事件广播器
pub struct Broadcaster {
    /// 连接通道：ConnId → 发送通道
    senders: RwLock<HashMap<ConnId, MessageSender>>,
    /// 订阅了实时事件流的连接
    subscribers: RwLock<HashSet<ConnId>>,
    /// 下一个连接 ID
    next_conn_id: RwLock<ConnId>,
}

impl Broadcaster {
    /// 创建新的广播器
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 注册新连接，返回连接 ID
    pub fn register(&self, sender: MessageSender) -> ConnId {
        let mut next_id = self.next_conn_id.write();
        let conn_id = *next_id;
        *next_id += 1;

        self.senders.write().insert(conn_id, sender);

        tracing::debug!("📡 Connection registered: conn_id={}", conn_id);
        conn_id
    }

    /// 注销连接
    pub fn unregister(&self, conn_id: ConnId) {
        self.senders.write().remove(&conn_id);
        self.subscribers.write().remove(&conn_id);
        tracing::debug!("📡 Connection unregistered: conn_id={}", conn_id);
    }

    /// 订阅实时事件流
    pub fn subscribe(&self, conn_id: ConnId) {
        self.subscribers.write().insert(conn_id);
        tracing::debug!("📡 Subscribed to live feed: conn_id={}", conn_id);
    }

    /// 取消订阅
    pub fn unsubscribe(&self, conn_id: ConnId) {
        self.subscribers.write().remove(&conn_id);
        tracing::debug!("📡 Unsubscribed from live feed: conn_id={}", conn_id);
    }

    /// 把新存储的事件广播给所有订阅者（best-effort，at-most-once）
    ///
    /// 在摄入方收到响应之前同步调用；单个订阅者失败只影响它自己。
    pub fn broadcast(&self, event: &Event) {
        // 序列化一次，所有订阅者复用（JSONL 格式）
        let push = Push::Event(Box::new(event.clone()));
        let message = match serde_json::to_string(&push) {
            Ok(json) => format!("{}\n", json),
            Err(e) => {
                tracing::error!("Failed to serialize event push: {}", e);
                return;
            }
        };

        let targets: Vec<(ConnId, MessageSender)> = {
            let subs = self.subscribers.read();
            let senders = self.senders.read();

            subs.iter()
                .filter_map(|conn_id| senders.get(conn_id).map(|s| (*conn_id, s.clone())))
                .collect()
        };

        if targets.is_empty() {
            tracing::trace!("📡 No subscribers: event_id={}", event.id);
            return;
        }

        tracing::debug!(
            "📡 Broadcasting event: event_id={}, subscribers={}",
            event.id,
            targets.len()
        );

        // 非阻塞发送（fire-and-forget）
        for (conn_id, sender) in targets {
            let msg = message.clone();
            if let Err(e) = sender.try_send(msg) {
                match e {
                    mpsc::error::TrySendError::Full(_) => {
                        tracing::warn!("📡 Channel full, dropping message: conn_id={}", conn_id);
                    }
                    mpsc::error::TrySendError::Closed(_) => {
                        // 对端已断开，立即注销，不重试
                        tracing::debug!("📡 Channel closed, unregistering: conn_id={}", conn_id);
                        self.unregister(conn_id);
                    }
                }
            }
        }
    }

    /// 获取当前连接数
    pub fn connection_count(&self) -> usize {
        self.senders.read().len()
    }

    /// 获取当前订阅者数
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// 发送消息到指定连接
    pub async fn send_to(&self, conn_id: ConnId, message: String) -> bool {
        // 先获取 sender 的 clone，然后释放锁
        let sender = {
            let senders = self.senders.read();
            senders.get(&conn_id).cloned()
        };

        if let Some(sender) = sender {
            sender.send(message).await.is_ok()
        } else {
            false
        }
    }

    /// 尝试发送消息到指定连接（非阻塞）
    pub fn try_send_to(&self, conn_id: ConnId, message: String) -> bool {
        let sender = {
            let senders = self.senders.read();
            senders.get(&conn_id).cloned()
        };

        if let Some(sender) = sender {
            sender.try_send(message).is_ok()
        } else {
            false
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashSet::new()),
            next_conn_id: RwLock::new(1),
        }
    }
}
