//! HITL 响应关联器
//!
//! 把人工响应与挂起的 HITL 事件关联：先落库（record_hitl_response 做
//! CAS 状态迁移），再向事件携带的回调地址投递。落库成功即不可回滚，
//! 投递失败只向提交方报告，不影响已存储的响应。

use std::time::Duration;

use crate::error::{Error, Result};
use crate::store::EventStore;
use crate::types::{Event, HitlResponseInput};

/// 回调投递超时
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// HITL 响应关联器
pub struct Correlator {
    http: reqwest::Client,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// 提交一条 HITL 响应
    ///
    /// 顺序固定：先写库（状态 pending → responded），成功后再投递回调。
    /// 回调失败返回 `Delivery` 错误，但事件状态保持 responded。
    pub async fn respond(
        &self,
        store: &EventStore,
        event_id: i64,
        input: &HitlResponseInput,
    ) -> Result<Event> {
        let event = store.record_hitl_response(event_id, input)?;

        tracing::info!(
            "🤝 HITL response recorded: event_id={}, responder={:?}",
            event_id,
            input.responder
        );

        // 回调地址来自事件自身的 HITL 请求
        let callback_url = event
            .hitl_request
            .as_ref()
            .map(|r| r.callback_url.clone())
            .unwrap_or_default();

        if callback_url.is_empty() {
            return Ok(event);
        }

        self.deliver(&callback_url, &event).await?;
        Ok(event)
    }

    /// 把已记录的响应 POST 到回调地址
    async fn deliver(&self, callback_url: &str, event: &Event) -> Result<()> {
        let response_value = event
            .hitl_status
            .as_ref()
            .and_then(|s| s.response.clone())
            .unwrap_or_default();

        let body = serde_json::json!({
            "event_id": event.id,
            "response": response_value,
        });

        let send = self.http.post(callback_url).json(&body).send();

        match tokio::time::timeout(DELIVERY_TIMEOUT, send).await {
            Ok(Ok(resp)) if resp.status().is_success() => {
                tracing::info!(
                    "🤝 HITL callback delivered: event_id={}, url={}",
                    event.id,
                    callback_url
                );
                Ok(())
            }
            Ok(Ok(resp)) => Err(Error::Delivery(format!(
                "回调返回非成功状态: {} ({})",
                resp.status(),
                callback_url
            ))),
            Ok(Err(e)) => Err(Error::Delivery(format!(
                "回调投递失败: {} ({})",
                e, callback_url
            ))),
            Err(_) => Err(Error::Delivery(format!(
                "回调投递超时 ({}s): {}",
                DELIVERY_TIMEOUT.as_secs(),
                callback_url
            ))),
        }
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}
