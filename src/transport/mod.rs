//! 聊天传输抽象
//!
//! 运行时只依赖 ChatTransport：join / leave / send 都是异步且可能失败的；
//! 入站事件通过 connect 时交给传输层的 mpsc 发送端推送。

pub mod irc;
pub mod mock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::TransportError;

pub use irc::IrcTransport;
pub use mock::{MockTransport, TransportCall};

/// 入站聊天消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub channel: String,
    pub author: String,
    pub content: String,
    /// 传输层消息 ID（可能缺失）
    pub transport_message_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// 机器人自己发出的消息
    pub is_self: bool,
    /// 传输层给出的用户颜色
    pub color: Option<String>,
}

/// 传输层事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(IncomingMessage),
    /// 服务器侧离开了频道（被踢、频道关闭等）
    Parted { channel: String },
    /// 会话重新建立，之前的 join 全部失效
    Reconnected,
    /// 连接永久断开
    Closed { reason: String },
}

/// 聊天传输 trait
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// 建立连接并开始推送事件
    async fn connect(&self, events: mpsc::UnboundedSender<TransportEvent>) -> Result<(), TransportError>;

    /// 加入频道；返回 Ok 表示服务器已确认
    async fn join(&self, channel: &str) -> Result<(), TransportError>;

    async fn leave(&self, channel: &str) -> Result<(), TransportError>;

    async fn send(&self, channel: &str, text: &str) -> Result<(), TransportError>;

    /// 关闭连接
    async fn close(&self) {}
}
