//! Hub 服务器
//!
//! Unix Socket 服务，处理客户端连接和请求

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::time::interval;

use super::broadcaster::Broadcaster;
use super::handler::Handler;
use crate::protocol::{Request, Response};
use crate::store::current_time_ms;
use crate::{DbConfig, EventStore};

/// HITL 超时清扫间隔（秒）
const HITL_SWEEP_INTERVAL_SECS: u64 = 1;

/// Hub 配置
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// 数据目录（默认 ~/.event-hub）
    pub data_dir: PathBuf,
}

impl Default for HubConfig {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".event-hub");

        Self { data_dir }
    }
}

impl HubConfig {
    /// Socket 路径
    pub fn socket_path(&self) -> PathBuf {
        self.data_dir.join("hub.sock")
    }

    /// PID 文件路径
    pub fn pid_path(&self) -> PathBuf {
        self.data_dir.join("hub.pid")
    }

    /// 数据库路径
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db").join("events.db")
    }
}

/// Hub 服务
pub struct Hub {
    config: HubConfig,
    store: EventStore,
    broadcaster: Arc<Broadcaster>,
    handler: Arc<Handler>,
}

impl Hub {
    /// 创建 Hub
    pub fn new(config: HubConfig) -> Result<Self> {
        // 确保数据目录存在
        fs::create_dir_all(&config.data_dir).context("创建数据目录失败")?;
        fs::create_dir_all(config.data_dir.join("db")).context("创建数据库目录失败")?;

        // 连接数据库
        let db_config = DbConfig::local(&config.db_path());
        let store = EventStore::connect(db_config)?;

        // 创建广播器
        let broadcaster = Broadcaster::new();

        // 创建处理器
        let handler = Arc::new(Handler::new(store.clone(), broadcaster.clone()));

        Ok(Self {
            config,
            store,
            broadcaster,
            handler,
        })
    }

    /// 运行 Hub
    pub async fn run(self: Arc<Self>) -> Result<()> {
        // 写入 PID 文件
        self.write_pid_file()?;

        // 清理旧的 socket 文件
        let socket_path = self.config.socket_path();
        if socket_path.exists() {
            fs::remove_file(&socket_path)?;
        }

        // 创建 Unix Socket 监听器
        let listener = UnixListener::bind(&socket_path).context("绑定 socket 失败")?;

        // 设置 socket 权限为 0600
        fs::set_permissions(&socket_path, fs::Permissions::from_mode(0o600))?;

        tracing::info!("🚀 Hub 启动: {:?}", socket_path);

        // 启动 HITL 超时清扫
        let hub_for_sweep = self.clone();
        tokio::spawn(async move {
            hub_for_sweep.hitl_sweeper().await;
        });

        // 接受连接
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            let hub = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = hub.handle_connection(stream).await {
                                    tracing::error!("处理连接失败: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("接受连接失败: {}", e);
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("收到中断信号，准备退出...");
                    break;
                }
            }
        }

        self.cleanup();
        Ok(())
    }

    /// 处理单个连接
    async fn handle_connection(&self, stream: UnixStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        // 创建消息发送通道
        let (tx, mut rx) = mpsc::channel::<String>(100);

        // 注册连接
        let conn_id = self.broadcaster.register(tx);
        tracing::debug!("📥 新连接: conn_id={}", conn_id);

        // 启动发送任务
        let write_handle = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if writer.write_all(msg.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        // 读取请求
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    // 连接关闭
                    break;
                }
                Ok(_) => {
                    // 解析请求
                    let request: Request = match serde_json::from_str(&line) {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!("解析请求失败: {}", e);
                            let response = Response::Error {
                                code: 400,
                                message: format!("Invalid JSON: {}", e),
                            };
                            let resp_json = serde_json::to_string(&response)?;
                            self.broadcaster.try_send_to(conn_id, format!("{}\n", resp_json));
                            continue;
                        }
                    };

                    // 处理请求
                    let response = self.handler.handle(conn_id, request).await;
                    let resp_json = serde_json::to_string(&response)?;

                    // 发送响应
                    if !self.broadcaster.send_to(conn_id, format!("{}\n", resp_json)).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("读取失败: {}", e);
                    break;
                }
            }
        }

        // 清理
        self.broadcaster.unregister(conn_id);
        write_handle.abort();
        tracing::debug!("📤 连接关闭: conn_id={}", conn_id);

        Ok(())
    }

    /// 定期把超过自身 timeout_secs 仍未响应的 HITL 事件置为 timeout
    async fn hitl_sweeper(&self) {
        let mut sweep_interval = interval(Duration::from_secs(HITL_SWEEP_INTERVAL_SECS));

        loop {
            sweep_interval.tick().await;

            match self.store.expire_pending_hitl(current_time_ms()) {
                Ok(0) => {}
                Ok(n) => {
                    tracing::info!("⏰ HITL 超时: {} 个挂起请求已过期", n);
                }
                Err(e) => {
                    tracing::error!("HITL 超时清扫失败: {}", e);
                }
            }
        }
    }

    /// 写入 PID 文件
    fn write_pid_file(&self) -> Result<()> {
        let pid = std::process::id();
        let pid_path = self.config.pid_path();
        fs::write(&pid_path, pid.to_string())?;
        fs::set_permissions(&pid_path, fs::Permissions::from_mode(0o600))?;
        tracing::debug!("📝 写入 PID 文件: {} (pid={})", pid_path.display(), pid);
        Ok(())
    }

    /// 清理资源
    fn cleanup(&self) {
        // 删除 socket 文件
        let socket_path = self.config.socket_path();
        if socket_path.exists() {
            let _ = fs::remove_file(&socket_path);
        }

        // 删除 PID 文件
        let pid_path = self.config.pid_path();
        if pid_path.exists() {
            let _ = fs::remove_file(&pid_path);
        }

        tracing::info!("🧹 Hub 清理完成");
    }
}

/// 检查 Hub 是否正在运行
pub fn is_hub_running(config: &HubConfig) -> bool {
    let pid_path = config.pid_path();
    if !pid_path.exists() {
        return false;
    }

    // 读取 PID
    let pid_str = match fs::read_to_string(&pid_path) {
        Ok(s) => s,
        Err(_) => return false,
    };

    let pid: i32 = match pid_str.trim().parse() {
        Ok(p) => p,
        Err(_) => return false,
    };

    // 检查进程是否存在
    unsafe { libc::kill(pid, 0) == 0 }
}

/// 清理残留的 Hub 状态
pub fn cleanup_stale_hub(config: &HubConfig) -> Result<()> {
    let socket_path = config.socket_path();
    let pid_path = config.pid_path();

    if socket_path.exists() {
        fs::remove_file(&socket_path)?;
        tracing::debug!("🧹 删除残留 socket: {:?}", socket_path);
    }

    if pid_path.exists() {
        fs::remove_file(&pid_path)?;
        tracing::debug!("🧹 删除残留 PID 文件: {:?}", pid_path);
    }

    Ok(())
}
