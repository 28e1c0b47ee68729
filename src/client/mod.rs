//! Hub Client 模块
//!
//! 提供连接 Hub 的客户端功能（hook 脚本、前端、导出工具共用）

mod connect;

pub use connect::{connect_hub, ClientConfig, HubClient};
