//! Hub Client 连接逻辑
//!
//! 连接已运行的 Hub：重试 + 握手 + 后台读取任务。
//! 不负责拉起 Hub 进程，连不上就报错（由部署方保证 Hub 常驻）。

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::protocol::{Push, Request, Response};
use crate::types::{Event, EventInput};

/// Client 配置
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// 数据目录（默认 ~/.event-hub）
    pub data_dir: PathBuf,
    /// 组件名称
    pub component: String,
    /// 组件版本
    pub version: String,
    /// 连接重试次数
    pub connect_retries: u32,
    /// 重试间隔（毫秒）
    pub retry_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".event-hub");

        Self {
            data_dir,
            component: "unknown".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            connect_retries: 3,
            retry_interval_ms: 500,
        }
    }
}

impl ClientConfig {
    /// 创建新的配置
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
            ..Default::default()
        }
    }

    /// Socket 路径
    pub fn socket_path(&self) -> PathBuf {
        self.data_dir.join("hub.sock")
    }
}

/// Hub Client
pub struct HubClient {
    #[allow(dead_code)]
    config: ClientConfig,
    /// 写入端
    writer: OwnedWriteHalf,
    /// 读取通道（响应和推送都经过这里）
    line_rx: mpsc::Receiver<String>,
    /// 等待响应期间收到的推送，留给 recv_push 消费
    pending_pushes: VecDeque<Push>,
}

impl HubClient {
    /// 发送请求并等待响应
    ///
    /// 订阅后推送帧可能先于响应到达，这里把它们暂存，
    /// 由 recv_push 按序取走。
    pub async fn request(&mut self, request: &Request) -> Result<Response> {
        let request_json = serde_json::to_string(request)?;
        self.writer
            .write_all(format!("{}\n", request_json).as_bytes())
            .await?;

        loop {
            let line = self
                .line_rx
                .recv()
                .await
                .ok_or_else(|| anyhow::anyhow!("Connection closed"))?;

            // 推送帧暂存，继续等响应
            if let Ok(push) = serde_json::from_str::<Push>(&line) {
                self.pending_pushes.push_back(push);
                continue;
            }

            let response: Response = serde_json::from_str(&line)?;
            return Ok(response);
        }
    }

    /// 摄入一条事件，返回存储后的完整事件
    pub async fn ingest(&mut self, event: EventInput) -> Result<Event> {
        let response = self.request(&Request::Ingest { event }).await?;

        match response {
            Response::Event { event } => Ok(event),
            Response::Error { code, message } => {
                Err(anyhow::anyhow!("Ingest failed: {} (code={})", message, code))
            }
            _ => Err(anyhow::anyhow!("Unexpected response")),
        }
    }

    /// 订阅实时事件流
    pub async fn subscribe(&mut self) -> Result<()> {
        let response = self.request(&Request::Subscribe).await?;

        match response {
            Response::Ok => Ok(()),
            Response::Error { code, message } => {
                Err(anyhow::anyhow!("Subscribe failed: {} (code={})", message, code))
            }
            _ => Err(anyhow::anyhow!("Unexpected response")),
        }
    }

    /// 取消订阅
    pub async fn unsubscribe(&mut self) -> Result<()> {
        let response = self.request(&Request::Unsubscribe).await?;

        match response {
            Response::Ok => Ok(()),
            Response::Error { code, message } => {
                Err(anyhow::anyhow!("Unsubscribe failed: {} (code={})", message, code))
            }
            _ => Err(anyhow::anyhow!("Unexpected response")),
        }
    }

    /// 接收推送（先消费暂存的帧）
    pub async fn recv_push(&mut self) -> Option<Push> {
        if let Some(push) = self.pending_pushes.pop_front() {
            return Some(push);
        }

        loop {
            let line = self.line_rx.recv().await?;
            if let Ok(push) = serde_json::from_str::<Push>(&line) {
                return Some(push);
            }
            // 非推送帧（不该出现在这里），跳过
            tracing::warn!("丢弃非推送帧: {}", line);
        }
    }
}

/// 连接 Hub
///
/// 连接流程：
/// 1. 尝试连接 socket（按配置重试）
/// 2. 连接成功 → 握手 → 启动后台读取任务
pub async fn connect_hub(config: ClientConfig) -> Result<HubClient> {
    let socket_path = config.socket_path();

    let mut last_err = None;
    for attempt in 1..=config.connect_retries {
        match UnixStream::connect(&socket_path).await {
            Ok(stream) => {
                tracing::debug!("连接 Hub 成功 (attempt={})", attempt);
                return finish_connect(config, stream).await;
            }
            Err(e) => {
                tracing::debug!("连接 Hub 失败 (attempt={}): {}", attempt, e);
                last_err = Some(e);
                if attempt < config.connect_retries {
                    sleep(Duration::from_millis(config.retry_interval_ms)).await;
                }
            }
        }
    }

    Err(anyhow::anyhow!(
        "连接 Hub 失败 ({:?}): {}",
        socket_path,
        last_err.map(|e| e.to_string()).unwrap_or_default()
    ))
}

/// 完成连接（握手 + 启动读取任务）
async fn finish_connect(config: ClientConfig, stream: UnixStream) -> Result<HubClient> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    // 发送握手
    let handshake = Request::Handshake {
        component: config.component.clone(),
        version: config.version.clone(),
    };
    let handshake_json = serde_json::to_string(&handshake)?;
    writer
        .write_all(format!("{}\n", handshake_json).as_bytes())
        .await
        .context("发送握手失败")?;

    // 读取握手响应
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let response: Response = serde_json::from_str(&line)?;
    match response {
        Response::HandshakeOk { hub_version } => {
            tracing::info!("握手成功: hub_version={}", hub_version);
        }
        Response::Error { code, message } => {
            return Err(anyhow::anyhow!("握手失败: {} (code={})", message, code));
        }
        _ => {
            return Err(anyhow::anyhow!("握手响应异常"));
        }
    }

    // 创建读取通道
    let (line_tx, line_rx) = mpsc::channel(100);

    // 启动读取任务
    tokio::spawn(async move {
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break, // 连接关闭
                Ok(_) => {
                    if line_tx.send(line.trim().to_string()).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    Ok(HubClient {
        config,
        writer,
        line_rx,
        pending_pushes: VecDeque::new(),
    })
}
