//! 数据库配置

use std::path::PathBuf;

/// 数据库连接配置
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// 数据库文件路径
    pub path: PathBuf,
}

impl DbConfig {
    /// 创建本地 SQLite 配置
    pub fn local<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// 从环境变量或默认路径创建配置
    pub fn from_env() -> Self {
        if let Ok(path) = std::env::var("EVENT_HUB_DB_URL") {
            return Self::local(path);
        }

        // 默认路径: ~/.event-hub/db/events.db
        let default_path = dirs::home_dir()
            .map(|h| h.join(".event-hub").join("db").join("events.db"))
            .unwrap_or_else(|| PathBuf::from("events.db"));

        Self::local(default_path)
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
