//! 错误类型定义

use thiserror::Error;

/// 库错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 校验错误（缺少必填字段 / payload 非结构化数据）
    #[error("校验错误: {0}")]
    Validation(String),

    /// 未找到（事件 ID 不存在 / 会话没有任何事件）
    #[error("未找到: {0}")]
    NotFound(String),

    /// 冲突（HITL 状态已终结，拒绝二次响应）
    #[error("状态冲突: {0}")]
    Conflict(String),

    /// HITL 回调投递失败（连接失败 / 发送失败 / 超时）
    #[error("投递失败: {0}")]
    Delivery(String),

    /// 数据库错误
    #[error("数据库错误: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, Error>;
